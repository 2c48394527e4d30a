//! Stateless queries the playback driver runs before and during fragment
//! fetches to decide whether a period/offset maps to ad or underlying
//! content.

use crate::NORMAL_PLAY_RATE;

use super::model::{DaiState, OFFSET_ALIGN_FACTOR};

/// Outcome of [`check_for_ad_start`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AdStartResult {
    /// Index into the break's ad list, `None` if the offset carries no ad.
    pub ad_index: Option<usize>,
    /// The break the period belongs to. `None` when the period has no
    /// break, or when playback already moved past the break's end (so the
    /// driver's ad state does not stick).
    pub break_id: Option<String>,
    /// Offset into the matched ad, seconds.
    pub ad_offset_secs: f64,
}

pub(crate) fn check_for_ad_start(
    state: &DaiState,
    rate: f64,
    init: bool,
    period_id: &str,
    offset_secs: f64,
) -> AdStartResult {
    let mut result = AdStartResult::default();
    let Some(p2ad) = state.period_map.get(period_id) else {
        return result;
    };
    if p2ad.ad_break_id.is_empty() {
        return result;
    }
    let Some(ab) = state.ad_breaks.get(&p2ad.ad_break_id) else {
        return result;
    };
    result.break_id = Some(p2ad.ad_break_id.clone());

    let key_ms = (offset_secs * 1000.0) as u64;
    let seamless = !init && rate == NORMAL_PLAY_RATE;
    if seamless {
        let floor_key = key_ms - key_ms % OFFSET_ALIGN_FACTOR;
        let hit = p2ad.offset_to_ad.get(&floor_key).or_else(|| {
            // Content may end just short of the aligned ad start, e.g.
            // current offset 29.5s with the ad starting at 30.0s.
            p2ad.offset_to_ad.get(&(floor_key + OFFSET_ALIGN_FACTOR))
        });
        if let Some(entry) = hit {
            if entry.ad_start_offset_ms == 0 {
                // Only an ad's own start is picked up seamlessly; mid-ad
                // entries are continuation markers.
                result.ad_index = Some(entry.ad_idx);
                result.ad_offset_secs = 0.0;
            }
        }
    } else {
        // Discrete lookup (trick-play or initial tune): greatest entry at or
        // below the requested offset, bounded by the break's terminal offset
        // in its end period.
        let mut end_ms = p2ad.duration_ms;
        if period_id == ab.end_period_id {
            end_ms = ab.end_period_offset_ms;
        }
        if key_ms <= end_ms {
            if let Some((entry_key, entry)) = p2ad.offset_to_ad.range(..=key_ms).next_back() {
                result.ad_index = Some(entry.ad_idx);
                result.ad_offset_secs = ((key_ms - entry_key) / 1000) as f64;
            }
        }
    }

    if rate >= NORMAL_PLAY_RATE
        && result.ad_index.is_none()
        && ab.end_period_id == period_id
        && key_ms >= ab.end_period_offset_ms
    {
        result.break_id = None;
    }
    result
}

/// True once the currently-playing ad has run past its nominal duration
/// plus one alignment factor of slack.
pub(crate) fn check_for_ad_terminate(state: &DaiState, current_offset_secs: f64) -> bool {
    let frag_offset_ms = (current_offset_secs * 1000.0) as u64;
    match state.current_ad() {
        Some(ad) => frag_offset_ms >= ad.duration_ms + OFFSET_ALIGN_FACTOR,
        None => false,
    }
}

/// Whether the period belongs to a registered ad break. A period that was
/// never seen simply answers `false`; no map entry is created.
pub(crate) fn is_period_in_adbreak(state: &DaiState, period_id: &str) -> bool {
    state
        .period_map
        .get(period_id)
        .map(|p| !p.ad_break_id.is_empty())
        .unwrap_or(false)
}
