//! Incremental ad placement over live-refreshed manifest periods.
//!
//! Called after every manifest refresh, [`place_ads`] advances the single
//! active placement cursor as far as the newly published period data allows.
//! Already-placed ads are never regressed; missing data (a period not yet in
//! the manifest, a zero-duration period) simply defers to the next refresh.

use dash_mpd::MPD;

use crate::manifest;

use super::model::{AdOnPeriod, DaiState, PeriodAdData, OFFSET_ALIGN_FACTOR};

pub(crate) fn place_ads(state: &mut DaiState, mpd: &MPD) {
    let Some(mut placement) = state.active_placement.take() else {
        return;
    };
    let periods = &mpd.periods;
    let Some(ab) = state.ad_breaks.get_mut(&placement.pending_adbrk_id) else {
        // Break vanished while its cursor was active. Drop the cursor and
        // move on to the next queued break, if any.
        tracing::warn!(
            break_id = %placement.pending_adbrk_id,
            "pending ad break no longer registered, dropping placement cursor"
        );
        state.active_placement = state.pending_placements.pop_front();
        return;
    };

    if !ab.adjust_end_period_offset {
        let mut open_prd_found = false;

        for (index, period) in periods.iter().enumerate() {
            if ab.adjust_end_period_offset {
                // All ads placed; no need to scan further periods.
                break;
            }
            let period_id = period.id.clone().unwrap_or_default();

            if placement.open_period_id == period_id {
                open_prd_found = true;
            } else if open_prd_found {
                if manifest::period_duration_ms(mpd, index) > 0 {
                    // Previous open period ended. The next period with real
                    // content becomes the new open period.
                    state
                        .period_map
                        .entry(placement.open_period_id.clone())
                        .or_default()
                        .filled = true;
                    placement.open_period_id = period_id.clone();
                    placement.cur_end_number = 0;
                } else {
                    // Empty periods may be announced early; skip them.
                    continue;
                }
            }

            if open_prd_found {
                let delta =
                    manifest::period_new_content_duration_ms(period, &mut placement.cur_end_number);
                let p2ad = state.period_map.entry(period_id.clone()).or_default();

                if p2ad.ad_break_id.is_empty() {
                    // Period newly opened for this break.
                    p2ad.ad_break_id = placement.pending_adbrk_id.clone();
                    p2ad.offset_to_ad.insert(
                        0,
                        AdOnPeriod {
                            ad_idx: placement.cur_ad_idx,
                            ad_start_offset_ms: placement.ad_next_offset_ms,
                        },
                    );
                }
                p2ad.duration_ms += delta;

                let mut period_delta = delta;
                while period_delta > 0 {
                    let ads_len = ab.ads.len();
                    let Some(cur_ad) = ab.ads.get_mut(placement.cur_ad_idx) else {
                        break;
                    };
                    if cur_ad.base_period_id.is_empty() {
                        // This ad starts here.
                        cur_ad.base_period_id = period_id.clone();
                        cur_ad.base_period_offset_ms = p2ad.duration_ms - period_delta;
                        let offset_key = cur_ad.base_period_offset_ms
                            - cur_ad.base_period_offset_ms % OFFSET_ALIGN_FACTOR;
                        p2ad.offset_to_ad.insert(
                            offset_key,
                            AdOnPeriod {
                                ad_idx: placement.cur_ad_idx,
                                ad_start_offset_ms: 0,
                            },
                        );
                    }

                    let ad_remaining = cur_ad.duration_ms - placement.ad_next_offset_ms;
                    if period_delta < ad_remaining {
                        placement.ad_next_offset_ms += period_delta;
                        period_delta = 0;
                    } else if placement.cur_ad_idx + 1 < ads_len
                        || period_delta >= OFFSET_ALIGN_FACTOR
                    {
                        // Current ad fully placed, and either another ad
                        // follows or the period leaves enough room to fall
                        // back to underlying content.
                        cur_ad.placed = true;
                        period_delta -= ad_remaining;
                        placement.cur_ad_idx += 1;
                        if placement.cur_ad_idx < ads_len {
                            placement.ad_next_offset_ms = 0;
                        } else {
                            // All ads consumed; record the end markers. If
                            // this lands on an exact period boundary the
                            // refinement pass moves it to the next period.
                            ab.end_period_id = period_id.clone();
                            ab.end_period_offset_ms = p2ad.duration_ms - period_delta;
                            ab.adjust_end_period_offset = true;
                            break;
                        }
                    } else {
                        // No more ads and not enough room to finalize the
                        // boundary. Wait for the next refresh.
                        break;
                    }
                }
            }
        }
    }

    if ab.adjust_end_period_offset {
        let end_index = periods
            .iter()
            .position(|p| p.id.as_deref() == Some(ab.end_period_id.as_str()));
        match end_index {
            None => {
                // End period fell out of the manifest. Keep the boundary we
                // already computed; refinement is best effort.
                ab.adjust_end_period_offset = false;
                tracing::warn!(
                    end_period = %ab.end_period_id,
                    "couldn't refine break end, period not in manifest"
                );
            }
            Some(index) => {
                if ab.end_period_offset_ms < 2 * OFFSET_ALIGN_FACTOR {
                    // Ads finish within ~4s of the period start: snap the
                    // play-head to the period's beginning.
                    ab.adjust_end_period_offset = false;
                    ab.end_period_offset_ms = 0;
                    state
                        .period_map
                        .insert(ab.end_period_id.clone(), PeriodAdData::default());
                    tracing::info!(end_period = %ab.end_period_id, "snapped break end to period start");
                } else {
                    let period_duration = manifest::period_duration_ms(mpd, index) as i64;
                    let diff = period_duration - ab.end_period_offset_ms as i64;
                    if diff < OFFSET_ALIGN_FACTOR as i64 {
                        // Ads finish within ~2s of the period end. Either the
                        // next period is already announced and the boundary
                        // snaps to its start, or we wait for it to appear.
                        if let Some(next_period) = periods.get(index + 1) {
                            ab.adjust_end_period_offset = false;
                            ab.end_period_offset_ms = 0;
                            ab.end_period_id = next_period.id.clone().unwrap_or_default();
                            state
                                .period_map
                                .insert(ab.end_period_id.clone(), PeriodAdData::default());
                            tracing::info!(
                                diff,
                                period_duration,
                                end_period = %ab.end_period_id,
                                "break ends close to period end, aligned to next period"
                            );
                        } else {
                            tracing::info!(
                                diff,
                                period_duration,
                                "break ends close to period end, next period not available yet"
                            );
                        }
                    } else {
                        ab.adjust_end_period_offset = false;
                        tracing::info!(diff, "break end boundary stands");
                    }
                }
            }
        }

        if !ab.adjust_end_period_offset {
            // Placement complete for this break.
            let summary: Vec<String> = ab
                .ads
                .iter()
                .enumerate()
                .map(|(idx, ad)| {
                    format!(
                        "{{idx:{idx}, id:{}, duration:{}, basePeriod:{}@{}}}",
                        ad.ad_id, ad.duration_ms, ad.base_period_id, ad.base_period_offset_ms
                    )
                })
                .collect();
            tracing::info!(
                break_id = %placement.pending_adbrk_id,
                ads_duration = ab.ads_duration_ms,
                end_period = %ab.end_period_id,
                end_period_offset = ab.end_period_offset_ms,
                ads = ?summary,
                "placement done"
            );
            state.active_placement = state.pending_placements.pop_front();
            return;
        }
    }

    state.active_placement = Some(placement);
}
