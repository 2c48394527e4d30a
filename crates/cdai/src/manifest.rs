//! Duration bookkeeping over the `dash-mpd` object model.
//!
//! The placement engine never inspects segment URLs; all it needs from a
//! manifest is how much content time each period has accumulated between
//! refreshes. Live encoders publish that through `SegmentTemplate` +
//! `SegmentTimeline`, where every `S` entry maps to one or more numbered
//! fragments starting at `SegmentTemplate@startNumber`.

use dash_mpd::{AdaptationSet, BaseURL, Period, SegmentTemplate, MPD};

use crate::error::CdaiResult;
use crate::util::url::directory_path;

fn template_of_adaptation(adaptation: &AdaptationSet) -> Option<&SegmentTemplate> {
    adaptation
        .SegmentTemplate
        .as_ref()
        .or_else(|| adaptation.representations.first()?.SegmentTemplate.as_ref())
}

fn template_of_period(period: &Period) -> Option<&SegmentTemplate> {
    period
        .adaptations
        .first()
        .and_then(template_of_adaptation)
        .or(period.SegmentTemplate.as_ref())
}

fn timeline_duration_ms(template: &SegmentTemplate) -> u64 {
    let timescale = template.timescale.unwrap_or(1).max(1);
    let mut duration_ms = 0u64;
    if let Some(timeline) = &template.SegmentTimeline {
        for s in &timeline.segments {
            let repeat = s.r.unwrap_or(0).max(0) as u64;
            let segment_ms = s.d.saturating_mul(1000) / timescale;
            duration_ms += (repeat + 1) * segment_ms;
        }
    }
    duration_ms
}

/// Total duration of the period at `index`, in milliseconds.
///
/// `Period@duration` wins when the manifest declares it; otherwise the
/// duration is reconstructed from the segment timeline. Returns 0 for
/// periods that have published no content yet.
pub fn period_duration_ms(mpd: &MPD, index: usize) -> u64 {
    let Some(period) = mpd.periods.get(index) else {
        return 0;
    };
    if let Some(duration) = period.duration {
        return duration.as_millis() as u64;
    }
    let Some(template) = template_of_period(period) else {
        return 0;
    };
    let timescale = template.timescale.unwrap_or(1).max(1);
    let mut duration_ms = template
        .duration
        .map(|d| (d / timescale as f64 * 1000.0) as u64)
        .unwrap_or(0);
    if duration_ms == 0 {
        duration_ms = timeline_duration_ms(template);
    }
    duration_ms
}

/// Content duration newly published in `period` since the fragment number
/// recorded in `cur_end_number`, in milliseconds.
///
/// Fragment numbers form a continuous sequence starting at
/// `SegmentTemplate@startNumber`; only fragments numbered beyond
/// `cur_end_number` count. `cur_end_number` is advanced to the last number
/// seen, which makes repeated calls against the same manifest return 0.
pub fn period_new_content_duration_ms(period: &Period, cur_end_number: &mut u64) -> u64 {
    let Some(template) = template_of_period(period) else {
        return 0;
    };
    let Some(timeline) = &template.SegmentTimeline else {
        return 0;
    };
    let timescale = template.timescale.unwrap_or(1).max(1);
    let start_number = template.startNumber.unwrap_or(1);

    let mut total_ms = 0u64;
    let mut number = start_number;
    for s in &timeline.segments {
        let repeat = s.r.unwrap_or(0).max(0) as u64;
        let segment_ms = s.d.saturating_mul(1000) / timescale;
        for _ in 0..=repeat {
            if number > *cur_end_number {
                total_ms += segment_ms;
            }
            number += 1;
        }
    }
    if number > start_number {
        *cur_end_number = (*cur_end_number).max(number - 1);
    }
    total_ms
}

/// Total duration of an ad manifest, in milliseconds, summed across all of
/// its periods from the first adaptation's timeline.
pub fn mpd_duration_ms(mpd: &MPD) -> u64 {
    let mut duration_ms = 0u64;
    for period in &mpd.periods {
        let Some(template) = template_of_period(period) else {
            continue;
        };
        let from_timeline = timeline_duration_ms(template);
        if from_timeline > 0 {
            duration_ms += from_timeline;
        } else {
            let timescale = template.timescale.unwrap_or(1).max(1);
            duration_ms += template
                .duration
                .map(|d| (d / timescale as f64 * 1000.0) as u64)
                .unwrap_or(0);
        }
    }
    duration_ms
}

/// Parse an ad manifest and make sure its first period carries a BaseURL.
///
/// Some ad servers publish manifests whose segment URLs are relative to the
/// manifest location but omit the BaseURL element entirely. The MPD-level
/// BaseURL is inherited when present; otherwise one is synthesized from the
/// manifest URL's directory.
pub fn parse_ad_manifest(xml: &str, manifest_url: &str) -> CdaiResult<MPD> {
    let mut mpd = dash_mpd::parse(xml)?;
    let root_base = mpd.base_url.first().cloned();
    if let Some(period) = mpd.periods.first_mut() {
        if period.BaseURL.is_empty() {
            let base = root_base.unwrap_or_else(|| BaseURL {
                base: directory_path(manifest_url),
                ..Default::default()
            });
            tracing::info!(base = %base.base, "ad period missing BaseURL, patching");
            period.BaseURL.push(base);
        }
    }
    Ok(mpd)
}
