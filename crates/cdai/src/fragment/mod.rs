//! Per-track fragment fetch/cache pipeline.

pub mod abr;
pub mod boxes;
pub mod init_cache;
pub mod pipeline;

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackType {
    Video,
    Audio,
    Subtitle,
}

impl TrackType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitle => "subtitle",
        }
    }
}

/// What a fetched fragment is accounted as. Trick-play remaps video to its
/// I-frame variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
    Iframe,
    InitVideo,
    InitAudio,
    InitSubtitle,
    InitIframe,
}

impl MediaKind {
    pub fn media_for(track: TrackType) -> Self {
        match track {
            TrackType::Video => Self::Video,
            TrackType::Audio => Self::Audio,
            TrackType::Subtitle => Self::Subtitle,
        }
    }

    pub fn init_for(track: TrackType) -> Self {
        match track {
            TrackType::Video => Self::InitVideo,
            TrackType::Audio => Self::InitAudio,
            TrackType::Subtitle => Self::InitSubtitle,
        }
    }

    pub fn is_init(&self) -> bool {
        matches!(
            self,
            Self::InitVideo | Self::InitAudio | Self::InitSubtitle | Self::InitIframe
        )
    }
}

/// Track fetch-slot lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchState {
    #[default]
    Idle,
    Fetching,
    Cached,
    Injected,
    Discarded,
}

/// The single-slot cache a track fills before hand-off to the injector.
#[derive(Debug, Clone, Default)]
pub struct CachedFragment {
    pub data: Vec<u8>,
    pub position: f64,
    pub duration: f64,
    pub discontinuity: bool,
    pub kind: Option<MediaKind>,
    pub presentation_time_offset: f64,
    pub timescale: u32,
}

/// One low-latency chunk, queued until the injector drains it.
#[derive(Debug, Clone)]
pub struct CachedFragmentChunk {
    pub kind: MediaKind,
    pub data: Bytes,
}
