//! Client-side dynamic ad insertion for MPEG-DASH.
//!
//! [`AdInsertionManager`] owns the ad-break registry, the per-period ad
//! lookup tables, and the placement cursor, all guarded by a single mutex.
//! The playback driver registers breaks and ads through
//! [`AdInsertionManager::set_alternate_contents`], feeds every manifest
//! refresh into [`AdInsertionManager::place_ads`], and consults the query
//! methods before each fragment fetch to decide between underlying content
//! and ad content.

pub mod fulfill;
pub mod model;
mod placement;
mod query;

use std::sync::Arc;

use dash_mpd::MPD;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::sink::PlayerEventSink;
use crate::util::http::HttpClient;

pub use fulfill::RelayConfig;
pub use query::AdStartResult;

use model::{AdBreakObject, AdFulfillRequest, AdState, DaiState};

pub struct AdInsertionManager {
    state: Arc<Mutex<DaiState>>,
    sink: Arc<dyn PlayerEventSink>,
    client: HttpClient,
    relay: RelayConfig,
    /// At most one fulfillment runs at a time; a new request joins the
    /// previous task before spawning.
    fulfill_task: Mutex<Option<JoinHandle<()>>>,
}

impl AdInsertionManager {
    pub fn new(client: HttpClient, sink: Arc<dyn PlayerEventSink>, relay: RelayConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(DaiState::default())),
            sink,
            client,
            relay,
            fulfill_task: Mutex::new(None),
        }
    }

    /// Register an ad break or enqueue an ad into one.
    ///
    /// With an empty `ad_id`/`url` this registers a placeholder break of
    /// `break_duration_ms` keyed by the period where it starts (idempotent).
    /// Otherwise a fulfillment task is spawned; if the break has no space
    /// left the request resolves as failed immediately, without a task.
    pub async fn set_alternate_contents(
        &self,
        period_id: &str,
        ad_id: &str,
        url: &str,
        _start_ms: u64,
        break_duration_ms: u64,
    ) {
        if ad_id.is_empty() || url.is_empty() {
            let mut state = self.state.lock().await;
            if !state.is_ad_break_object_exist(period_id) {
                state.ad_breaks.insert(
                    period_id.to_string(),
                    AdBreakObject {
                        brk_duration_ms: break_duration_ms,
                        ..Default::default()
                    },
                );
                let p2ad = state.period_map.entry(period_id.to_string()).or_default();
                p2ad.ad_break_id = period_id.to_string();
                tracing::info!(period_id, break_duration_ms, "registered ad break");
            }
            return;
        }

        let mut task_slot = self.fulfill_task.lock().await;
        if let Some(previous) = task_slot.take() {
            // Fulfillments are serialized across the player instance.
            let _ = previous.await;
        }

        let has_space = {
            let state = self.state.lock().await;
            state
                .ad_breaks
                .get(period_id)
                .map(|brk| brk.ads_duration_ms < brk.brk_duration_ms)
        };
        match has_space {
            Some(true) => {
                let request = AdFulfillRequest {
                    period_id: period_id.to_string(),
                    ad_id: ad_id.to_string(),
                    url: url.to_string(),
                };
                let state = self.state.clone();
                let sink = self.sink.clone();
                let client = self.client.clone();
                let relay = self.relay.clone();
                *task_slot = Some(tokio::spawn(async move {
                    fulfill::fulfill_ad_object(state, sink, client, relay, request).await;
                }));
            }
            Some(false) => {
                tracing::warn!(period_id, "no more space left in the ad break, rejecting");
                self.sink.send_ad_resolved(ad_id, false, 0, 0);
            }
            None => {
                tracing::warn!(period_id, "ad break not registered, ignoring ad");
            }
        }
    }

    /// Wait for an in-flight fulfillment to finish, if any.
    pub async fn join_fulfillment(&self) {
        if let Some(task) = self.fulfill_task.lock().await.take() {
            let _ = task.await;
        }
    }

    /// Advance ad placement against a freshly refreshed manifest.
    pub async fn place_ads(&self, mpd: &MPD) {
        let mut state = self.state.lock().await;
        placement::place_ads(&mut state, mpd);
    }

    /// Whether fetched content at `period_id`/`offset_secs` is the start of
    /// (or inside) an ad.
    pub async fn check_for_ad_start(
        &self,
        rate: f64,
        init: bool,
        period_id: &str,
        offset_secs: f64,
    ) -> AdStartResult {
        let state = self.state.lock().await;
        query::check_for_ad_start(&state, rate, init, period_id, offset_secs)
    }

    /// Whether the currently-playing ad has run past its duration.
    pub async fn check_for_ad_terminate(&self, current_offset_secs: f64) -> bool {
        let state = self.state.lock().await;
        query::check_for_ad_terminate(&state, current_offset_secs)
    }

    pub async fn is_period_in_adbreak(&self, period_id: &str) -> bool {
        let state = self.state.lock().await;
        query::is_period_in_adbreak(&state, period_id)
    }

    /// Record a period seen in the manifest, so later break registrations
    /// can attach to it.
    pub async fn insert_to_period_map(&self, period_id: &str) {
        let mut state = self.state.lock().await;
        state.period_map.entry(period_id.to_string()).or_default();
    }

    /// Drop breaks and period records that fell out of the manifest's
    /// period window. The pending, queued, and currently playing breaks are
    /// never pruned.
    pub async fn prune_period_maps(&self, new_period_ids: &[String]) {
        let mut state = self.state.lock().await;
        let mut keep: Vec<String> = vec![state.cur_playing_break_id.clone()];
        if let Some(p) = &state.active_placement {
            keep.push(p.pending_adbrk_id.clone());
        }
        keep.extend(
            state
                .pending_placements
                .iter()
                .map(|p| p.pending_adbrk_id.clone()),
        );
        state.ad_breaks.retain(|id, _| {
            let retained = keep.iter().any(|k| k == id) || new_period_ids.contains(id);
            if !retained {
                tracing::info!(break_id = %id, "pruning expired ad break");
            }
            retained
        });
        state
            .period_map
            .retain(|id, _| new_period_ids.contains(id));
    }

    /// Reset playback-facing state on tune/stop. Placement bookkeeping is
    /// kept; use [`Self::clear_maps`] to drop it.
    pub async fn reset_state(&self) {
        let mut state = self.state.lock().await;
        state.cur_playing_break_id.clear();
        state.cur_ad_idx = None;
        state.content_seek_offset = 0.0;
        state.ad_state = AdState::OutsideAdbreak;
    }

    /// Drop the ad-break registry and period map entirely.
    pub async fn clear_maps(&self) {
        let mut state = self.state.lock().await;
        state.ad_breaks.clear();
        state.period_map.clear();
    }

    /// Direct access to the guarded DAI state, for the playback driver's
    /// own ad-state bookkeeping and for tests.
    pub async fn lock_state(&self) -> MutexGuard<'_, DaiState> {
        self.state.lock().await
    }
}
