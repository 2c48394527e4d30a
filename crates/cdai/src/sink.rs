//! Playback-driver notification seam.
//!
//! The engine never holds a back-pointer into the player. Everything it
//! needs to tell the driver goes through [`PlayerEventSink`], and the only
//! thing it asks back is whether downloads are still enabled (so a teardown
//! mid-fetch does not emit spurious tune-failure events).

/// Escalated download failures, reported only after the per-track failure
/// threshold is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadErrorKind {
    FragmentDownloadFailure,
    InitFragmentDownloadFailure,
}

pub trait PlayerEventSink: Send + Sync {
    /// Whether the player still wants data. `false` during stop/teardown.
    fn downloads_are_enabled(&self) -> bool;

    /// Resolution of an ad fulfillment request, success or failure.
    fn send_ad_resolved(&self, ad_id: &str, success: bool, start_ms: u64, duration_ms: u64);

    /// A fragment download failure that exhausted local retry/rampdown.
    fn send_download_error(&self, kind: DownloadErrorKind, http_code: u16);
}
