//! Data model for client-side dynamic ad insertion.
//!
//! Every duration and offset in this module is in milliseconds unless the
//! name says otherwise. The playback driver talks in seconds; conversion
//! happens at the query boundary.

use std::collections::{BTreeMap, HashMap, VecDeque};

use dash_mpd::MPD;

/// Ad durations come with minor slack against the underlying period's
/// segmentation. Offsets into a period are floor-aligned to this factor so
/// ad/content boundaries do not drift by fractions of a segment.
pub const OFFSET_ALIGN_FACTOR: u64 = 2000;

/// Playback driver's view of where it stands relative to ad breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdState {
    #[default]
    OutsideAdbreak,
    InAdbreakAdNotPlaying,
    InAdbreakAdPlaying,
}

/// One ad asset within a break.
#[derive(Debug, Default)]
pub struct AdNode {
    /// Failed to play once; the driver skips it on replay.
    pub invalid: bool,
    /// Fully assigned a position over the underlying periods.
    pub placed: bool,
    pub ad_id: String,
    pub url: String,
    pub duration_ms: u64,
    /// Underlying period where this ad starts. Empty until placement
    /// reaches it.
    pub base_period_id: String,
    pub base_period_offset_ms: u64,
    /// Parsed ad manifest. `None` until fulfilled, or when the final
    /// manifest is deferred to the relay cache.
    pub mpd: Option<MPD>,
}

/// One ad break, keyed in the registry by the period id where it starts.
#[derive(Debug, Default)]
pub struct AdBreakObject {
    /// Total time reserved for the break.
    pub brk_duration_ms: u64,
    /// Ordered ads; append-only during fulfillment.
    pub ads: Vec<AdNode>,
    /// Period where underlying content resumes.
    pub end_period_id: String,
    pub end_period_offset_ms: u64,
    /// Filled so far. Invariant: `ads_duration_ms <= brk_duration_ms`.
    pub ads_duration_ms: u64,
    /// Placement consumed the last ad but the end boundary still needs
    /// refinement against real manifest periods.
    pub adjust_end_period_offset: bool,
}

/// Which ad covers a given offset range of a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdOnPeriod {
    pub ad_idx: usize,
    pub ad_start_offset_ms: u64,
}

/// Ad-break bookkeeping for one underlying manifest period.
#[derive(Debug, Default)]
pub struct PeriodAdData {
    /// All of this period's duration has been consumed by placement.
    pub filled: bool,
    /// Owning ad break, empty if the period carries none.
    pub ad_break_id: String,
    /// Content duration seen so far across refreshes.
    pub duration_ms: u64,
    /// Floor-aligned offset into the period -> ad covering it.
    pub offset_to_ad: BTreeMap<u64, AdOnPeriod>,
}

/// Placement cursor for one ad break. At most one is active; the rest wait
/// in a FIFO queue.
#[derive(Debug, Clone)]
pub struct PlacementObj {
    pub pending_adbrk_id: String,
    /// Period currently being filled.
    pub open_period_id: String,
    /// Last fragment number seen in the open period, for incremental
    /// duration deltas.
    pub cur_end_number: u64,
    /// Ad currently being placed.
    pub cur_ad_idx: usize,
    /// Portion of the current ad already consumed.
    pub ad_next_offset_ms: u64,
}

impl PlacementObj {
    pub fn new(break_id: &str) -> Self {
        Self {
            pending_adbrk_id: break_id.to_string(),
            open_period_id: break_id.to_string(),
            cur_end_number: 0,
            cur_ad_idx: 0,
            ad_next_offset_ms: 0,
        }
    }
}

/// A pending fulfillment request.
#[derive(Debug, Clone, Default)]
pub struct AdFulfillRequest {
    pub period_id: String,
    pub ad_id: String,
    pub url: String,
}

/// Everything the DAI engine mutates, guarded by one mutex in
/// [`crate::dai::AdInsertionManager`].
#[derive(Default)]
pub struct DaiState {
    pub ad_breaks: HashMap<String, AdBreakObject>,
    pub period_map: HashMap<String, PeriodAdData>,

    /// Cursor of the break being placed right now, if any.
    pub active_placement: Option<PlacementObj>,
    /// Breaks fulfilled while another was still placing; promoted in order.
    pub pending_placements: VecDeque<PlacementObj>,

    pub cur_playing_break_id: String,
    pub cur_ad_idx: Option<usize>,
    pub content_seek_offset: f64,
    pub ad_state: AdState,
}

impl DaiState {
    pub fn is_ad_break_object_exist(&self, break_id: &str) -> bool {
        self.ad_breaks.contains_key(break_id)
    }

    pub fn is_period_exist(&self, period_id: &str) -> bool {
        self.period_map.contains_key(period_id)
    }

    /// The ad the driver is currently playing, if any.
    pub fn current_ad(&self) -> Option<&AdNode> {
        let brk = self.ad_breaks.get(&self.cur_playing_break_id)?;
        brk.ads.get(self.cur_ad_idx?)
    }
}
