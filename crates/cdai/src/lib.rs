pub mod dai;
pub mod error;
pub mod fetch;
pub mod fragment;
pub mod manifest;
pub mod sink;
pub mod util;

pub use dai::{AdInsertionManager, AdStartResult, RelayConfig};
pub use error::{CdaiError, CdaiResult};
pub use fetch::{FetchOutcome, FragmentFetcher, HttpFetcher};
pub use sink::{DownloadErrorKind, PlayerEventSink};
pub use util::http::HttpClient;

/// Playback rate of normal (non-trick) playback.
pub const NORMAL_PLAY_RATE: f64 = 1.0;
