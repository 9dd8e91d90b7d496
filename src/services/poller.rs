//! Per-zone status refresh.
//!
//! Reproduces the polling request the portal's own dashboard script issues, then flattens the nested
//! `RefreshLatestZoneDetailByIndex` payload into a [`ZoneState`]. No retries here; the collection
//! driver owns that policy.

use crate::client::{PortalTransport, PortalUrls};
use crate::models::icomfort::{LCC_ONLINE, ZoneContext, ZoneDetailResponse, ZoneState};
use crate::session::{HOME_DETAILS_PATH, SessionError, SessionManager};
use crate::utils::cache_buster;
use chrono::Utc;
use log::debug;
use serde_json::Value;
use url::Url;

pub const ZONE_DETAIL_PATH: &str = "Dashboard/RefreshLatestZoneDetailByIndex";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PollError {
    #[error("session problem: {0}")]
    SessionProblem(#[from] SessionError),
    #[error("thermostat not online (status {0})")]
    NotOnline(String),
    #[error("malformed zone detail: {0}")]
    Malformed(String),
    #[error("session context is {active}, expected {expected}")]
    ContextMismatch { expected: ZoneContext, active: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    pub target: Url,
    pub referer: Url,
}

pub fn build_poll_request(urls: &PortalUrls, context: &ZoneContext, cache_token: &str) -> PollRequest {
    let referer = urls.build_url(
        HOME_DETAILS_PATH,
        &[
            ("zoneId", context.zone_id.0.as_str()),
            ("homeId", context.home_id.0.as_str()),
            ("lcc_Id", context.lcc_id.0.as_str()),
            ("refreshZonedetail", "False"),
        ],
    );
    let target = urls.build_url(
        ZONE_DETAIL_PATH,
        &[
            ("zoneId", context.zone_id.0.as_str()),
            ("isPolling", "true"),
            ("lccId", context.lcc_id.0.as_str()),
            ("_", cache_token),
        ],
    );
    PollRequest { target, referer }
}

/// Fetch and flatten the latest status of one zone.
///
/// The session must already be pointed at `context` via [`SessionManager::set_context`].
pub fn fetch_update<T: PortalTransport>(
    session: &SessionManager<T>,
    context: &ZoneContext,
) -> Result<ZoneState, PollError> {
    let active = session.context();
    if active.as_ref() != Some(context) {
        return Err(PollError::ContextMismatch {
            expected: context.clone(),
            active: active.map(|c| c.to_string()).unwrap_or_else(|| "unset".to_string()),
        });
    }

    let token = cache_buster(Utc::now(), &mut rand::rng());
    let req = build_poll_request(session.urls(), context, &token);
    let raw = session.request_json(&req.target, &req.referer)?;
    let state = parse_update(raw)?;
    debug!("Zone {} reported {:?}", context, state);
    Ok(state)
}

/// Status check, then the typed flattening step.
pub fn parse_update(raw: Value) -> Result<ZoneState, PollError> {
    let code = raw
        .get("Code")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PollError::Malformed("missing status field `Code`".to_string()))?;
    if code != LCC_ONLINE {
        return Err(PollError::NotOnline(code));
    }

    let resp: ZoneDetailResponse =
        serde_path_to_error::deserialize(raw).map_err(|e| PollError::Malformed(e.to_string()))?;
    flatten(resp)
}

fn flatten(resp: ZoneDetailResponse) -> Result<ZoneState, PollError> {
    let missing = |field: &str| PollError::Malformed(format!("missing required field `{}`", field));

    let data = resp.data.ok_or_else(|| missing("data"))?;
    let system_name = data
        .system_name
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| missing("data.systemName"))?;
    let detail = data.zone_detail.ok_or_else(|| missing("data.zoneDetail"))?;

    Ok(ZoneState {
        home_name: data.home_name,
        system_name,
        central_mode: data.central_mode.map(|m| m.to_string()),
        is_away_mode: data.is_system_in_away_mode.unwrap_or(false),
        notification_count: data.sys_notification_count.unwrap_or(0),
        ambient_temperature: detail.ambient_temperature.map(|w| w.value.0),
        humidity: detail.humidity.map(|h| h.0),
        cool_set_point: detail.cool_set_point.map(|w| w.value.0),
        heat_set_point: detail.heat_set_point.map(|w| w.value.0),
        single_set_point: detail.single_set_point.map(|w| w.value.0),
    })
}
