//! Ad fulfillment: downloading and parsing an ad's manifest and appending
//! it to its break, with the optional relay-cache detour.

use std::sync::Arc;

use dash_mpd::MPD;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use url::Url;

use crate::error::CdaiResult;
use crate::manifest;
use crate::sink::PlayerEventSink;
use crate::util::http::HttpClient;

use super::model::{AdFulfillRequest, AdNode, AdOnPeriod, DaiState, PlacementObj};

/// How ad manifests relate to the recording relay the main content may be
/// served from.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    /// Main content is playing from a relay time-shift buffer; ads are
    /// expected to be recorded by the relay too.
    pub from_relay_tsb: bool,
    /// Force ad playback straight from the CDN even when a relay serves
    /// the channel.
    pub play_ad_from_cdn: bool,
    /// The channel URL, used to derive the relay's origin.
    pub channel_url: Option<Url>,
}

pub(crate) struct AdManifest {
    pub mpd: MPD,
    /// `false` when the relay acknowledged the ad (204) but has not finished
    /// recording it; the manifest in hand is the CDN's and must not be kept.
    pub final_manifest: bool,
    /// URL future fragment requests should go through.
    pub url: String,
}

/// Download and parse an ad manifest.
///
/// When the channel is relay-served and CDN ad playback is disabled, the ad
/// manifest is re-requested through the relay's `adrec` endpoint. A 200
/// response replaces the CDN manifest; a 204 keeps it but records the relay
/// URL for later. Relay errors fall back to the CDN manifest silently.
pub(crate) async fn get_ad_mpd(
    client: &HttpClient,
    relay: &RelayConfig,
    url: &str,
    try_relay: bool,
) -> CdaiResult<AdManifest> {
    let response = client.get_data(url, None).await?;
    tracing::trace!(url, "ad manifest download success");

    let mut manifest_url = url.to_string();
    let mut final_manifest = true;
    let mut xml = String::from_utf8_lossy(&response.data).into_owned();

    if try_relay && relay.from_relay_tsb && !relay.play_ad_from_cdn {
        if let Some(relay_url) = relay_record_url(relay, &response.effective_url) {
            match client.get_data(&relay_url, None).await {
                Ok(relay_response) if relay_response.status == StatusCode::OK => {
                    // Relay already recorded the ad; its manifest wins.
                    manifest_url = relay_url;
                    xml = String::from_utf8_lossy(&relay_response.data).into_owned();
                }
                Ok(relay_response) if relay_response.status == StatusCode::NO_CONTENT => {
                    // Relay will record it; keep the CDN manifest for now and
                    // fetch the final one from the relay later.
                    manifest_url = relay_url;
                    final_manifest = false;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(%err, "relay lookup failed, using CDN ad manifest");
                }
            }
        }
    }

    let mpd = manifest::parse_ad_manifest(&xml, &manifest_url)?;
    Ok(AdManifest {
        mpd,
        final_manifest,
        url: manifest_url,
    })
}

fn relay_record_url(relay: &RelayConfig, effective_url: &str) -> Option<String> {
    let channel = relay.channel_url.as_ref()?;
    let host = channel.host_str()?;
    let port = channel
        .port()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    let encoded: String = url::form_urlencoded::byte_serialize(effective_url.as_bytes()).collect();
    Some(format!(
        "{}://{host}{port}/adrec?clientId=cdai&recordedUrl={encoded}",
        channel.scheme()
    ))
}

/// Fulfillment worker body. Holds the DAI mutex for its whole run, manifest
/// download included, so fulfillment is fully serialized against placement.
pub(crate) async fn fulfill_ad_object(
    state: Arc<Mutex<DaiState>>,
    sink: Arc<dyn PlayerEventSink>,
    client: HttpClient,
    relay: RelayConfig,
    request: AdFulfillRequest,
) {
    let mut ad_status = false;
    let mut start_ms = 0u64;
    let mut duration_ms = 0u64;

    let mut guard = state.lock().await;
    match get_ad_mpd(&client, &relay, &request.url, true).await {
        Ok(ad) if !ad.mpd.periods.is_empty() && guard.is_ad_break_object_exist(&request.period_id) => {
            let st = &mut *guard;
            duration_ms = manifest::mpd_duration_ms(&ad.mpd);
            if let Some(brk) = st.ad_breaks.get_mut(&request.period_id) {
                start_ms = brk.ads_duration_ms;
                let avail_space = brk.brk_duration_ms.saturating_sub(start_ms);
                if avail_space < duration_ms {
                    tracing::warn!(
                        avail_space,
                        ad_duration = duration_ms,
                        "ad longer than the break's remaining space, trimming"
                    );
                    duration_ms = avail_space;
                }
                brk.ads_duration_ms += duration_ms;

                let mut base_period_id = String::new();
                if brk.ads.is_empty() {
                    // First ad of the break.
                    if let Some(p2ad) = st.period_map.get_mut(&request.period_id) {
                        p2ad.offset_to_ad.insert(
                            0,
                            AdOnPeriod {
                                ad_idx: 0,
                                ad_start_offset_ms: 0,
                            },
                        );
                    }
                    if st.active_placement.is_none() {
                        // Placement can start right away.
                        st.active_placement = Some(PlacementObj::new(&request.period_id));
                        base_period_id = request.period_id.clone();
                    } else {
                        // Another break is still placing; queue this one.
                        st.pending_placements
                            .push_back(PlacementObj::new(&request.period_id));
                    }
                }

                if !ad.final_manifest {
                    tracing::info!(
                        "final ad manifest to be fetched from the relay later, dropping CDN copy"
                    );
                }
                brk.ads.push(AdNode {
                    invalid: false,
                    placed: false,
                    ad_id: request.ad_id.clone(),
                    url: ad.url.clone(),
                    duration_ms,
                    base_period_id,
                    base_period_offset_ms: 0,
                    mpd: ad.final_manifest.then_some(ad.mpd),
                });
                tracing::info!(ad_id = %request.ad_id, url = %ad.url, "new ad added");
                ad_status = true;
            }
        }
        Ok(_) => {
            tracing::warn!(
                break_id = %request.period_id,
                "ad break no longer exists or ad manifest has no periods, dropping ad"
            );
        }
        Err(err) => {
            tracing::error!(%err, url = %request.url, "failed to fetch ad manifest");
        }
    }
    drop(guard);

    sink.send_ad_resolved(&request.ad_id, ad_status, start_ms, duration_ms);
}
