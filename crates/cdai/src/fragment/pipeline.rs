//! Per-track fragment caching.
//!
//! One [`TrackPipeline`] exists per media track. The playback driver builds
//! a [`FragmentRequest`] per fragment and calls
//! [`TrackPipeline::cache_fragment`]; the injector drains the result with
//! [`TrackPipeline::take_cached_fragment`]. A `false` return means the
//! fragment was not cached: either the download failed, or the profile
//! changed underneath the request and the driver must rebuild it (the
//! downloaded bytes are held over and reused on the retry).

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use dash_mpd::Period;

use crate::error::CdaiError;
use crate::fetch::{FetchOutcome, FragmentFetcher};
use crate::sink::{DownloadErrorKind, PlayerEventSink};
use crate::NORMAL_PLAY_RATE;

use super::abr::AbrContext;
use super::boxes;
use super::init_cache::InitSegmentCache;
use super::{CachedFragment, CachedFragmentChunk, FetchState, MediaKind, TrackType};

/// Consecutive media-fragment failures tolerated before the track gives up
/// and reports a fatal download error.
pub const MAX_SEG_DOWNLOAD_FAIL_COUNT: u32 = 10;

/// Low-latency chunks buffered ahead of the injector.
pub const MAX_CACHED_CHUNKS: usize = 20;

/// Everything the pipeline needs to know about one fragment fetch.
#[derive(Debug, Clone)]
pub struct FragmentRequest<'a> {
    pub url: &'a str,
    pub range: Option<&'a str>,
    /// Absolute position on the injected timeline, seconds.
    pub position: f64,
    pub duration: f64,
    pub discontinuity: bool,
    pub init_fragment: bool,
    /// Fragment belongs to an ad; its failures must not tear down the
    /// underlying playback.
    pub playing_ad: bool,
    pub rate: f64,
    /// Bandwidth of the profile the URL was built for.
    pub bandwidth: u64,
}

pub struct TrackPipeline<F> {
    track: TrackType,
    fetcher: F,
    abr: Arc<dyn AbrContext>,
    sink: Arc<dyn PlayerEventSink>,
    init_cache: Arc<InitSegmentCache>,

    /// Rewrite mismatched track ids in ad init fragments to the id the
    /// stream started with.
    overwrite_track_id: bool,
    expected_track_id: Option<u32>,
    /// Sticky until the driver acts on it (usually by retuning).
    track_id_mismatch: bool,

    fetch_state: FetchState,
    cached: Option<CachedFragment>,
    chunks: VecDeque<CachedFragmentChunk>,
    /// Bytes downloaded before an aborted profile switch, reused verbatim
    /// by the next `cache_fragment` call.
    holdover: Option<Bytes>,

    seg_dl_fail_count: u32,
    skip_segment_on_error: bool,

    timescale: u32,
    presentation_time_offset: f64,
}

impl<F: FragmentFetcher> TrackPipeline<F> {
    pub fn new(
        track: TrackType,
        fetcher: F,
        abr: Arc<dyn AbrContext>,
        sink: Arc<dyn PlayerEventSink>,
        init_cache: Arc<InitSegmentCache>,
        overwrite_track_id: bool,
    ) -> Self {
        Self {
            track,
            fetcher,
            abr,
            sink,
            init_cache,
            overwrite_track_id,
            expected_track_id: None,
            track_id_mismatch: false,
            fetch_state: FetchState::Idle,
            cached: None,
            chunks: VecDeque::new(),
            holdover: None,
            seg_dl_fail_count: 0,
            skip_segment_on_error: false,
            timescale: 1,
            presentation_time_offset: 0.0,
        }
    }

    pub fn fetch_state(&self) -> FetchState {
        self.fetch_state
    }

    /// Set when an init fragment carried a different track id than the
    /// stream established and rewriting was not enabled. Cleared by
    /// [`Self::clear_track_id_mismatch`] once the driver has acted on it.
    pub fn track_id_mismatch(&self) -> bool {
        self.track_id_mismatch
    }

    pub fn clear_track_id_mismatch(&mut self) {
        self.track_id_mismatch = false;
    }

    /// After a failed `cache_fragment`, whether the driver should skip to
    /// the next fragment (`true`) or retry the same one at the profile the
    /// ladder just switched to (`false`).
    pub fn skip_segment_on_error(&self) -> bool {
        self.skip_segment_on_error
    }

    /// Download one fragment into the track's cache slot.
    pub async fn cache_fragment(&mut self, req: FragmentRequest<'_>) -> bool {
        if !self.sink.downloads_are_enabled() {
            // Teardown in progress; not an error worth counting.
            self.fetch_state = FetchState::Idle;
            return false;
        }
        self.fetch_state = FetchState::Fetching;
        let kind = self.media_kind(req.init_fragment, req.rate);

        if let Some(data) = self.holdover.take() {
            tracing::debug!(track = self.track.name(), "reusing held-over fragment");
            self.finish_fragment(&req, kind, data.to_vec());
            return true;
        }

        if req.init_fragment {
            if let Some((data, effective_url)) = self.init_cache.retrieve(req.url) {
                tracing::debug!(
                    track = self.track.name(),
                    url = %effective_url,
                    "init fragment served from cache"
                );
                let mut data = data.to_vec();
                self.reconcile_track_id(&mut data);
                self.finish_fragment(&req, kind, data);
                return true;
            }
        }

        match self.fetcher.fetch(req.url, req.range).await {
            Ok(outcome) => self.on_download_success(&req, kind, outcome),
            Err(err) => {
                self.on_download_failure(&req, &err);
                false
            }
        }
    }

    fn on_download_success(
        &mut self,
        req: &FragmentRequest<'_>,
        kind: MediaKind,
        outcome: FetchOutcome,
    ) -> bool {
        if let Some(served) = outcome.bitrate {
            if !req.init_fragment && served != req.bandwidth {
                // The transport served a different profile than requested
                // (a relay ramping down its recording). Keep the bytes, let
                // the driver rebuild the request against the served profile.
                tracing::info!(
                    track = self.track.name(),
                    requested = req.bandwidth,
                    served,
                    "served bitrate differs from requested, holding fragment over"
                );
                self.abr.set_assumed_bandwidth(served);
                self.holdover = Some(outcome.data);
                self.fetch_state = FetchState::Idle;
                return false;
            }
        }

        let mut data = outcome.data.to_vec();
        if req.init_fragment {
            self.reconcile_track_id(&mut data);
            self.init_cache
                .insert(req.url, Bytes::from(data.clone()), outcome.effective_url);
        }
        self.finish_fragment(req, kind, data);
        true
    }

    fn on_download_failure(&mut self, req: &FragmentRequest<'_>, err: &CdaiError) {
        let http_code = match err {
            CdaiError::HttpError(status) => status.as_u16(),
            _ => 0,
        };
        self.fetch_state = FetchState::Idle;

        self.seg_dl_fail_count += 1;
        tracing::warn!(
            track = self.track.name(),
            url = %req.url,
            http_code,
            init = req.init_fragment,
            fail_count = self.seg_dl_fail_count,
            "fragment download failed"
        );
        if self.seg_dl_fail_count < MAX_SEG_DOWNLOAD_FAIL_COUNT {
            // Tolerated by skipping forward; audio in particular never
            // ramps down.
            self.skip_segment_on_error = true;
            return;
        }

        if self.track == TrackType::Video
            && !self.abr.rampdown_limit_reached()
            && self.abr.try_rampdown_profile(http_code)
        {
            // Retry the same fragment at the lower profile.
            self.seg_dl_fail_count = 0;
            self.skip_segment_on_error = false;
        } else if !req.playing_ad {
            let kind = if req.init_fragment {
                DownloadErrorKind::InitFragmentDownloadFailure
            } else {
                DownloadErrorKind::FragmentDownloadFailure
            };
            self.sink.send_download_error(kind, http_code);
        }
    }

    fn media_kind(&self, init_fragment: bool, rate: f64) -> MediaKind {
        let trick_play = rate != NORMAL_PLAY_RATE && self.track == TrackType::Video;
        match (init_fragment, trick_play) {
            (true, true) => MediaKind::InitIframe,
            (true, false) => MediaKind::init_for(self.track),
            (false, true) => MediaKind::Iframe,
            (false, false) => MediaKind::media_for(self.track),
        }
    }

    /// Learn the stream's track id from the first init fragment; rewrite
    /// later mismatches back to it when configured to.
    fn reconcile_track_id(&mut self, data: &mut [u8]) {
        let Some(found) = boxes::parse_track_id(data) else {
            return;
        };
        match self.expected_track_id {
            None => self.expected_track_id = Some(found),
            Some(expected) if expected != found => {
                if self.overwrite_track_id && boxes::rewrite_track_id(data, expected) {
                    tracing::info!(
                        track = self.track.name(),
                        found,
                        expected,
                        "rewrote mismatched track id"
                    );
                } else {
                    // Usually a period boundary where the underlying
                    // content's track numbering changed.
                    self.track_id_mismatch = true;
                    tracing::warn!(
                        track = self.track.name(),
                        found,
                        expected,
                        "track id mismatch in init fragment"
                    );
                }
            }
            _ => {}
        }
    }

    fn finish_fragment(&mut self, req: &FragmentRequest<'_>, kind: MediaKind, data: Vec<u8>) {
        self.seg_dl_fail_count = 0;
        self.skip_segment_on_error = false;
        if self.track == TrackType::Video && !req.init_fragment {
            // Only a successfully cached video media fragment clears the
            // rampdown budget.
            self.abr.reset_rampdown_count();
        }
        self.cached = Some(CachedFragment {
            data,
            position: req.position,
            duration: req.duration,
            discontinuity: req.discontinuity,
            kind: Some(kind),
            presentation_time_offset: self.presentation_time_offset,
            timescale: self.timescale,
        });
        self.fetch_state = FetchState::Cached;
    }

    /// Hand the cached fragment to the injector.
    pub fn take_cached_fragment(&mut self) -> Option<CachedFragment> {
        let fragment = self.cached.take()?;
        self.fetch_state = FetchState::Injected;
        Some(fragment)
    }

    /// Drop the cached fragment without injecting it, e.g. when a seek or
    /// ad transition lands between download and injection.
    pub fn discard_cached_fragment(&mut self) {
        if self.cached.take().is_some() {
            tracing::debug!(track = self.track.name(), "discarding cached fragment");
            self.fetch_state = FetchState::Discarded;
        }
    }

    /// Queue a low-latency chunk. Returns `false` when the queue is full
    /// and the chunk was dropped.
    pub fn cache_fragment_chunk(&mut self, kind: MediaKind, data: Bytes) -> bool {
        if self.chunks.len() >= MAX_CACHED_CHUNKS {
            tracing::warn!(track = self.track.name(), "chunk queue full, dropping chunk");
            return false;
        }
        self.chunks.push_back(CachedFragmentChunk { kind, data });
        true
    }

    pub fn take_cached_chunk(&mut self) -> Option<CachedFragmentChunk> {
        self.chunks.pop_front()
    }

    pub fn clear_chunks(&mut self) {
        self.chunks.clear();
    }

    /// Adopt the timing parameters of a newly selected representation. The
    /// driver calls this on every profile or period switch, before building
    /// the next fragment request.
    pub fn abr_profile_changed(
        &mut self,
        period: &Period,
        adaptation_idx: usize,
        representation_idx: usize,
    ) {
        let Some(adaptation) = period.adaptations.get(adaptation_idx) else {
            return;
        };
        let Some(representation) = adaptation.representations.get(representation_idx) else {
            return;
        };
        let template = representation
            .SegmentTemplate
            .as_ref()
            .or(adaptation.SegmentTemplate.as_ref())
            .or(period.SegmentTemplate.as_ref());
        if let Some(template) = template {
            self.timescale = template.timescale.unwrap_or(1).max(1) as u32;
            self.presentation_time_offset = template.presentationTimeOffset.unwrap_or(0) as f64
                / self.timescale as f64;
        }
        tracing::debug!(
            track = self.track.name(),
            bandwidth = representation.bandwidth,
            timescale = self.timescale,
            "profile changed"
        );
    }

    /// Discard per-period download state on a seek or retune.
    pub fn reset(&mut self) {
        self.fetch_state = FetchState::Idle;
        self.cached = None;
        self.holdover = None;
        self.chunks.clear();
        self.seg_dl_fail_count = 0;
        self.skip_segment_on_error = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CdaiResult;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        errors: Mutex<Vec<(DownloadErrorKind, u16)>>,
    }

    impl PlayerEventSink for RecordingSink {
        fn downloads_are_enabled(&self) -> bool {
            true
        }
        fn send_ad_resolved(&self, _ad_id: &str, _success: bool, _start_ms: u64, _duration_ms: u64) {
        }
        fn send_download_error(&self, kind: DownloadErrorKind, http_code: u16) {
            if let Ok(mut errors) = self.errors.lock() {
                errors.push((kind, http_code));
            }
        }
    }

    struct ScriptedFetcher {
        failures_before_success: Arc<AtomicU32>,
        served_bitrate: Option<u64>,
    }

    impl ScriptedFetcher {
        fn failing(n: u32) -> Self {
            Self {
                failures_before_success: Arc::new(AtomicU32::new(n)),
                served_bitrate: None,
            }
        }
    }

    impl FragmentFetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str, _range: Option<&str>) -> CdaiResult<FetchOutcome> {
            let remaining = self.failures_before_success.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_before_success
                    .store(remaining - 1, Ordering::SeqCst);
                return Err(CdaiError::HttpError(reqwest::StatusCode::NOT_FOUND));
            }
            Ok(FetchOutcome {
                data: Bytes::from_static(b"fragment-bytes"),
                effective_url: url.to_string(),
                http_code: 200,
                download_time: 0.01,
                bitrate: self.served_bitrate,
            })
        }
    }

    fn request(init: bool) -> FragmentRequest<'static> {
        FragmentRequest {
            url: "http://cdn.example.com/seg-1.m4s",
            range: None,
            position: 10.0,
            duration: 2.0,
            discontinuity: false,
            init_fragment: init,
            playing_ad: false,
            rate: NORMAL_PLAY_RATE,
            bandwidth: 3_000_000,
        }
    }

    fn pipeline<F: FragmentFetcher>(
        fetcher: F,
        sink: Arc<RecordingSink>,
        ladder: Arc<super::super::abr::ProfileLadder>,
        overwrite_track_id: bool,
    ) -> TrackPipeline<F> {
        TrackPipeline::new(
            TrackType::Video,
            fetcher,
            ladder,
            sink,
            Arc::new(InitSegmentCache::default()),
            overwrite_track_id,
        )
    }

    /// Fetcher that serves pre-scripted bodies in order; panics when the
    /// script runs dry (an unexpected extra network fetch).
    struct BytesFetcher {
        responses: Mutex<std::collections::VecDeque<Bytes>>,
    }

    impl BytesFetcher {
        fn new(responses: Vec<Bytes>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    impl FragmentFetcher for BytesFetcher {
        async fn fetch(&self, url: &str, _range: Option<&str>) -> CdaiResult<FetchOutcome> {
            let data = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected network fetch");
            Ok(FetchOutcome {
                data,
                effective_url: url.to_string(),
                http_code: 200,
                download_time: 0.01,
                bitrate: None,
            })
        }
    }

    fn boxed(kind: &[u8; 4], content: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + content.len());
        out.extend_from_slice(&((8 + content.len()) as u32).to_be_bytes());
        out.extend_from_slice(kind);
        out.extend_from_slice(content);
        out
    }

    fn init_fragment(track_id: u32) -> Bytes {
        let mut tkhd = vec![0u8; 12];
        tkhd.extend_from_slice(&track_id.to_be_bytes());
        tkhd.extend_from_slice(&[0; 8]);
        let moov = boxed(b"moov", &boxed(b"trak", &boxed(b"tkhd", &tkhd)));
        Bytes::from([boxed(b"ftyp", b"iso6dash"), moov].concat())
    }

    fn init_request(url: &'static str) -> FragmentRequest<'static> {
        FragmentRequest {
            init_fragment: true,
            url,
            ..request(true)
        }
    }

    #[tokio::test]
    async fn failure_threshold_ramps_down_then_succeeds() {
        let sink = Arc::new(RecordingSink::default());
        let ladder = Arc::new(super::super::abr::ProfileLadder::new(vec![
            800_000, 3_000_000,
        ]));
        let mut track = pipeline(
            ScriptedFetcher::failing(MAX_SEG_DOWNLOAD_FAIL_COUNT),
            sink.clone(),
            ladder.clone(),
            true,
        );

        for _ in 0..MAX_SEG_DOWNLOAD_FAIL_COUNT - 1 {
            assert!(!track.cache_fragment(request(false)).await);
            // Below the threshold failures only skip forward.
            assert!(track.skip_segment_on_error());
            assert_eq!(ladder.current_bandwidth(), Some(3_000_000));
        }

        // Threshold reached: video ramps down and retries in place.
        assert!(!track.cache_fragment(request(false)).await);
        assert!(!track.skip_segment_on_error());
        assert_eq!(ladder.current_bandwidth(), Some(800_000));
        assert!(sink.errors.lock().unwrap().is_empty());

        assert!(track.cache_fragment(request(false)).await);
        let cached = track.take_cached_fragment().unwrap();
        assert_eq!(cached.kind, Some(MediaKind::Video));
        assert_eq!(track.fetch_state(), FetchState::Injected);
    }

    #[tokio::test]
    async fn threshold_without_rampdown_path_reports_fatal_error() {
        let sink = Arc::new(RecordingSink::default());
        let ladder = Arc::new(super::super::abr::ProfileLadder::new(vec![800_000]));
        let mut track = pipeline(
            ScriptedFetcher::failing(MAX_SEG_DOWNLOAD_FAIL_COUNT),
            sink.clone(),
            ladder,
            true,
        );

        for _ in 0..MAX_SEG_DOWNLOAD_FAIL_COUNT - 1 {
            assert!(!track.cache_fragment(request(false)).await);
            assert!(sink.errors.lock().unwrap().is_empty());
        }
        assert!(!track.cache_fragment(request(false)).await);
        let errors = sink.errors.lock().unwrap();
        assert_eq!(
            errors.as_slice(),
            &[(DownloadErrorKind::FragmentDownloadFailure, 404)]
        );
    }

    #[tokio::test]
    async fn ad_fragment_failures_do_not_reach_the_player() {
        let sink = Arc::new(RecordingSink::default());
        let ladder = Arc::new(super::super::abr::ProfileLadder::new(vec![800_000]));
        let mut track = pipeline(ScriptedFetcher::failing(u32::MAX), sink.clone(), ladder, true);

        let mut req = request(false);
        req.playing_ad = true;
        for _ in 0..MAX_SEG_DOWNLOAD_FAIL_COUNT + 2 {
            assert!(!track.cache_fragment(req.clone()).await);
        }
        assert!(sink.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn served_bitrate_mismatch_holds_fragment_over() {
        let sink = Arc::new(RecordingSink::default());
        let ladder = Arc::new(super::super::abr::ProfileLadder::new(vec![
            800_000, 3_000_000,
        ]));
        let fetcher = ScriptedFetcher {
            failures_before_success: Arc::new(AtomicU32::new(0)),
            served_bitrate: Some(800_000),
        };
        let mut track = pipeline(fetcher, sink, ladder.clone(), true);

        // Requested 3 Mbps, served 800 kbps: not cached yet.
        assert!(!track.cache_fragment(request(false)).await);
        assert_eq!(ladder.assumed_bandwidth(), 800_000);

        // Retry at the served profile reuses the held-over bytes.
        let mut retry = request(false);
        retry.bandwidth = 800_000;
        assert!(track.cache_fragment(retry).await);
        assert_eq!(
            track.take_cached_fragment().unwrap().data,
            b"fragment-bytes"
        );
    }

    #[tokio::test]
    async fn trick_rate_remaps_to_iframe_kind() {
        let sink = Arc::new(RecordingSink::default());
        let ladder = Arc::new(super::super::abr::ProfileLadder::new(vec![800_000]));
        let mut track = pipeline(ScriptedFetcher::failing(0), sink, ladder, true);

        let mut req = request(false);
        req.rate = 4.0;
        assert!(track.cache_fragment(req).await);
        assert_eq!(
            track.take_cached_fragment().unwrap().kind,
            Some(MediaKind::Iframe)
        );
    }

    #[tokio::test]
    async fn init_fragment_is_served_from_cache_on_repeat() {
        let sink = Arc::new(RecordingSink::default());
        let ladder = Arc::new(super::super::abr::ProfileLadder::new(vec![800_000]));
        // One scripted body only: a second network fetch would panic.
        let fetcher = BytesFetcher::new(vec![init_fragment(1)]);
        let mut track = pipeline(fetcher, sink, ladder, true);

        assert!(track.cache_fragment(init_request("http://cdn/init.mp4")).await);
        assert_eq!(
            track.take_cached_fragment().unwrap().kind,
            Some(MediaKind::InitVideo)
        );
        assert!(track.cache_fragment(init_request("http://cdn/init.mp4")).await);
        assert!(track.take_cached_fragment().is_some());
    }

    #[tokio::test]
    async fn mismatched_track_id_is_rewritten_when_enabled() {
        let sink = Arc::new(RecordingSink::default());
        let ladder = Arc::new(super::super::abr::ProfileLadder::new(vec![800_000]));
        let fetcher = BytesFetcher::new(vec![init_fragment(1), init_fragment(2)]);
        let mut track = pipeline(fetcher, sink, ladder, true);

        assert!(track.cache_fragment(init_request("http://cdn/content-init.mp4")).await);
        track.take_cached_fragment();

        // Ad encoder numbered its track differently; the cached copy is
        // rewritten back to the established id.
        assert!(track.cache_fragment(init_request("http://cdn/ad-init.mp4")).await);
        let cached = track.take_cached_fragment().unwrap();
        assert_eq!(boxes::parse_track_id(&cached.data), Some(1));
        assert!(!track.track_id_mismatch());
    }

    #[tokio::test]
    async fn mismatched_track_id_sets_sticky_flag_when_rewrite_disabled() {
        let sink = Arc::new(RecordingSink::default());
        let ladder = Arc::new(super::super::abr::ProfileLadder::new(vec![800_000]));
        let fetcher = BytesFetcher::new(vec![init_fragment(1), init_fragment(2)]);
        let mut track = pipeline(fetcher, sink, ladder, false);

        assert!(track.cache_fragment(init_request("http://cdn/content-init.mp4")).await);
        track.take_cached_fragment();
        assert!(track.cache_fragment(init_request("http://cdn/ad-init.mp4")).await);
        let cached = track.take_cached_fragment().unwrap();
        assert_eq!(boxes::parse_track_id(&cached.data), Some(2));
        assert!(track.track_id_mismatch());

        track.clear_track_id_mismatch();
        assert!(!track.track_id_mismatch());
    }

    #[tokio::test]
    async fn init_failures_count_toward_rampdown_instead_of_escalating() {
        let sink = Arc::new(RecordingSink::default());
        let ladder = Arc::new(super::super::abr::ProfileLadder::new(vec![
            800_000, 3_000_000,
        ]));
        let mut track = pipeline(
            ScriptedFetcher::failing(MAX_SEG_DOWNLOAD_FAIL_COUNT),
            sink.clone(),
            ladder.clone(),
            true,
        );

        // A failing init fragment is tolerated like any other fragment.
        for _ in 0..MAX_SEG_DOWNLOAD_FAIL_COUNT - 1 {
            assert!(!track.cache_fragment(init_request("http://cdn/init.mp4")).await);
            assert!(sink.errors.lock().unwrap().is_empty());
            assert_eq!(ladder.current_bandwidth(), Some(3_000_000));
        }

        // At the threshold video ramps down rather than tearing playback
        // down, and retries the same init fragment in place.
        assert!(!track.cache_fragment(init_request("http://cdn/init.mp4")).await);
        assert!(!track.skip_segment_on_error());
        assert_eq!(ladder.current_bandwidth(), Some(800_000));
        assert!(sink.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn init_failure_without_rampdown_path_reports_init_error() {
        let sink = Arc::new(RecordingSink::default());
        let ladder = Arc::new(super::super::abr::ProfileLadder::new(vec![800_000]));
        let mut track = pipeline(
            ScriptedFetcher::failing(MAX_SEG_DOWNLOAD_FAIL_COUNT),
            sink.clone(),
            ladder,
            true,
        );

        for _ in 0..MAX_SEG_DOWNLOAD_FAIL_COUNT - 1 {
            assert!(!track.cache_fragment(init_request("http://cdn/init.mp4")).await);
            assert!(sink.errors.lock().unwrap().is_empty());
        }
        assert!(!track.cache_fragment(init_request("http://cdn/init.mp4")).await);
        let errors = sink.errors.lock().unwrap();
        assert_eq!(
            errors.as_slice(),
            &[(DownloadErrorKind::InitFragmentDownloadFailure, 404)]
        );
    }

    #[tokio::test]
    async fn only_media_fragment_success_restores_the_rampdown_budget() {
        let sink = Arc::new(RecordingSink::default());
        let ladder = Arc::new(super::super::abr::ProfileLadder::with_rampdown_limit(
            vec![800_000, 1_500_000, 3_000_000],
            1,
        ));
        let fetcher = BytesFetcher::new(vec![init_fragment(1), Bytes::from_static(b"media")]);
        let mut track = pipeline(fetcher, sink, ladder.clone(), true);

        assert!(ladder.try_rampdown_profile(404));
        assert!(ladder.rampdown_limit_reached());

        // A cached init fragment leaves the spent budget alone.
        assert!(track.cache_fragment(init_request("http://cdn/init.mp4")).await);
        assert!(ladder.rampdown_limit_reached());

        // A cached video media fragment restores it.
        assert!(track.cache_fragment(request(false)).await);
        assert!(!ladder.rampdown_limit_reached());
    }

    #[tokio::test]
    async fn held_over_fragment_reuse_resets_failure_accounting() {
        let sink = Arc::new(RecordingSink::default());
        let ladder = Arc::new(super::super::abr::ProfileLadder::new(vec![
            800_000, 3_000_000,
        ]));
        let failures = Arc::new(AtomicU32::new(MAX_SEG_DOWNLOAD_FAIL_COUNT - 1));
        let fetcher = ScriptedFetcher {
            failures_before_success: failures.clone(),
            served_bitrate: Some(800_000),
        };
        let mut track = pipeline(fetcher, sink.clone(), ladder.clone(), true);

        for _ in 0..MAX_SEG_DOWNLOAD_FAIL_COUNT - 1 {
            assert!(!track.cache_fragment(request(false)).await);
        }

        // One fetch from the threshold the relay serves a lower profile;
        // the retry at that profile caches the held-over bytes.
        assert!(!track.cache_fragment(request(false)).await);
        let mut retry = request(false);
        retry.bandwidth = 800_000;
        assert!(track.cache_fragment(retry).await);
        assert!(!track.skip_segment_on_error());

        // The cached fragment cleared the failure streak: another run of
        // below-threshold failures neither ramps down nor surfaces errors.
        failures.store(MAX_SEG_DOWNLOAD_FAIL_COUNT - 1, Ordering::SeqCst);
        for _ in 0..MAX_SEG_DOWNLOAD_FAIL_COUNT - 1 {
            assert!(!track.cache_fragment(request(false)).await);
        }
        assert_eq!(ladder.current_bandwidth(), Some(3_000_000));
        assert!(sink.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn discarded_fragment_is_not_injected() {
        let sink = Arc::new(RecordingSink::default());
        let ladder = Arc::new(super::super::abr::ProfileLadder::new(vec![800_000]));
        let mut track = pipeline(ScriptedFetcher::failing(0), sink, ladder, true);

        let mut req = request(false);
        req.bandwidth = 800_000;
        assert!(track.cache_fragment(req).await);
        track.discard_cached_fragment();
        assert_eq!(track.fetch_state(), FetchState::Discarded);
        assert!(track.take_cached_fragment().is_none());
    }

    #[tokio::test]
    async fn chunk_queue_is_bounded() {
        let sink = Arc::new(RecordingSink::default());
        let ladder = Arc::new(super::super::abr::ProfileLadder::new(vec![800_000]));
        let mut track = pipeline(ScriptedFetcher::failing(0), sink, ladder, true);

        for _ in 0..MAX_CACHED_CHUNKS {
            assert!(track.cache_fragment_chunk(MediaKind::Video, Bytes::from_static(b"c")));
        }
        assert!(!track.cache_fragment_chunk(MediaKind::Video, Bytes::from_static(b"c")));
        assert!(track.take_cached_chunk().is_some());
        assert!(track.cache_fragment_chunk(MediaKind::Video, Bytes::from_static(b"c")));
    }
}
