use crate::client::PortalTransport;
use crate::db::influx::{PointSink, TimePrecision, WriteError};
use crate::models::icomfort::{ZoneContext, ZoneState};
use crate::services::measurements::{MeasurementPoint, to_points};
use crate::services::poller::{PollError, fetch_update};
use crate::session::{AuthError, SessionError, SessionManager};
use chrono::Utc;
use log::{info, warn};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_RELOGINS: u32 = 1;
pub const DEFAULT_LOCKOUT_BACKOFF: Duration = Duration::from_secs(30 * 60);

/// What to do with the cycle after a mid-run session expiry and a successful re-login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpiryPolicy {
    /// Retry the zone that failed and carry on.
    #[default]
    ResumeZone,
    /// Discard what was collected and start again from the first zone.
    RestartCycle,
}

impl FromStr for ExpiryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resume" => Ok(ExpiryPolicy::ResumeZone),
            "restart" => Ok(ExpiryPolicy::RestartCycle),
            other => Err(format!("unknown session expiry policy `{}` (expected resume|restart)", other)),
        }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CycleOptions {
    pub expiry_policy: ExpiryPolicy,
    /// Re-logins allowed per cycle after a session expiry.
    pub max_relogins: u32,
    /// Reported to the caller on lockout; login is not retried within the run.
    pub lockout_backoff: Duration,
}

impl Default for CycleOptions {
    fn default() -> Self {
        CycleOptions {
            expiry_policy: ExpiryPolicy::default(),
            max_relogins: DEFAULT_MAX_RELOGINS,
            lockout_backoff: DEFAULT_LOCKOUT_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedZone {
    pub context: ZoneContext,
    pub reason: PollError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub zones_polled: usize,
    pub points_written: usize,
    pub relogins: u32,
    pub skipped: Vec<SkippedZone>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CycleError {
    #[error("login failed: {0}")]
    Login(AuthError),
    #[error("account locked out; do not log in again for at least {}s", .retry_after.as_secs())]
    LockedOut { retry_after: Duration },
    #[error("session error: {0}")]
    Session(SessionError),
    #[error("writing points failed: {0}")]
    Persistence(#[from] WriteError),
}

/// A cycle that stopped before its batch was written.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error}")]
pub struct CycleFailure {
    pub error: CycleError,
    /// Progress up to the abort. Zones skipped on their own are listed in `report.skipped`.
    pub report: CycleReport,
    /// Zones whose readings were not written because the cycle aborted, in cycle order.
    /// Empty when the zone list was never fetched.
    pub dropped: Vec<ZoneContext>,
}

impl CycleFailure {
    fn before_discovery(error: CycleError, report: CycleReport) -> Self {
        CycleFailure {
            error,
            report,
            dropped: Vec::new(),
        }
    }

    fn with_zones(error: CycleError, report: CycleReport, contexts: &[ZoneContext]) -> Self {
        let dropped = contexts
            .iter()
            .filter(|ctx| !report.skipped.iter().any(|s| &s.context == *ctx))
            .cloned()
            .collect();
        CycleFailure { error, report, dropped }
    }
}

/// One full poll cycle: login, discover zones, poll each, write one batch, logout.
///
/// Logout is attempted whenever the login succeeded, whatever happens afterwards.
pub fn run_cycle<T, S>(
    session: &SessionManager<T>,
    sink: &mut S,
    credentials: &Credentials,
    options: &CycleOptions,
) -> Result<CycleReport, CycleFailure>
where
    T: PortalTransport,
    S: PointSink + ?Sized,
{
    login(session, credentials, options).map_err(|e| CycleFailure::before_discovery(e, CycleReport::default()))?;
    let result = collect(session, sink, credentials, options);
    if let Err(e) = session.logout() {
        warn!("Logout failed: {}", e);
    }
    result
}

fn collect<T, S>(
    session: &SessionManager<T>,
    sink: &mut S,
    credentials: &Credentials,
    options: &CycleOptions,
) -> Result<CycleReport, CycleFailure>
where
    T: PortalTransport,
    S: PointSink + ?Sized,
{
    let mut report = CycleReport::default();

    let zones = loop {
        match session.fetch_home_zones() {
            Ok(z) => break z,
            Err(SessionError::Expired) => {
                if let Err(e) = relogin(session, credentials, options, &mut report) {
                    return Err(CycleFailure::before_discovery(e, report));
                }
            }
            Err(e) => return Err(CycleFailure::before_discovery(CycleError::Session(e), report)),
        }
    };
    if zones.is_empty() {
        warn!("Portal lists no zones; nothing to collect");
    }
    let contexts = zones.contexts();
    info!("Collecting {} zone(s) across {} home(s)", contexts.len(), zones.home_count());

    let mut points: Vec<MeasurementPoint> = Vec::new();
    let mut idx = 0;
    while let Some(ctx) = contexts.get(idx) {
        match poll_zone(session, ctx) {
            Ok(state) => {
                points.extend(to_points(&state, Utc::now()));
                report.zones_polled += 1;
                idx += 1;
            }
            Err(PollError::SessionProblem(SessionError::Expired)) => {
                if let Err(e) = relogin(session, credentials, options, &mut report) {
                    return Err(CycleFailure::with_zones(e, report, &contexts));
                }
                match options.expiry_policy {
                    ExpiryPolicy::ResumeZone => info!("Resuming at zone {}", ctx),
                    ExpiryPolicy::RestartCycle => {
                        info!("Restarting cycle from the first zone");
                        points.clear();
                        report.skipped.clear();
                        report.zones_polled = 0;
                        idx = 0;
                    }
                }
            }
            Err(e) => {
                warn!("Skipping zone {} this cycle: {}", ctx, e);
                report.skipped.push(SkippedZone {
                    context: ctx.clone(),
                    reason: e,
                });
                idx += 1;
            }
        }
    }

    if let Err(e) = sink.write_points(&points, TimePrecision::Seconds) {
        return Err(CycleFailure::with_zones(e.into(), report, &contexts));
    }
    report.points_written = points.len();
    Ok(report)
}

fn poll_zone<T: PortalTransport>(session: &SessionManager<T>, ctx: &ZoneContext) -> Result<ZoneState, PollError> {
    session.set_context(ctx)?;
    fetch_update(session, ctx)
}

fn login<T: PortalTransport>(
    session: &SessionManager<T>,
    credentials: &Credentials,
    options: &CycleOptions,
) -> Result<(), CycleError> {
    session
        .login(&credentials.username, &credentials.password)
        .map_err(|e| match e {
            AuthError::LockedOut => CycleError::LockedOut {
                retry_after: options.lockout_backoff,
            },
            other => CycleError::Login(other),
        })
}

fn relogin<T: PortalTransport>(
    session: &SessionManager<T>,
    credentials: &Credentials,
    options: &CycleOptions,
    report: &mut CycleReport,
) -> Result<(), CycleError> {
    if report.relogins >= options.max_relogins {
        warn!("Session expired again after {} re-login(s); giving up on this cycle", report.relogins);
        return Err(CycleError::Session(SessionError::Expired));
    }
    report.relogins += 1;
    info!("Session expired; logging in again ({}/{})", report.relogins, options.max_relogins);
    login(session, credentials, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakePortal;
    use crate::client::{PortalResponse, PortalUrls};
    use crate::session::testing::{expired_redirect, login_page, login_refused, portal_accepting_login};
    use serde_json::json;

    const REFRESH: &str = "/Dashboard/RefreshLatestZoneDetailByIndex";
    const DETAILS: &str = "/Dashboard/HomeDetails";

    #[derive(Default)]
    struct RecordingSink {
        batches: Vec<Vec<MeasurementPoint>>,
    }

    impl PointSink for RecordingSink {
        fn write_points(&mut self, points: &[MeasurementPoint], _: TimePrecision) -> Result<(), WriteError> {
            self.batches.push(points.to_vec());
            Ok(())
        }
    }

    struct FailingSink;

    impl PointSink for FailingSink {
        fn write_points(&mut self, _: &[MeasurementPoint], _: TimePrecision) -> Result<(), WriteError> {
            Err(WriteError::Http {
                status: 500,
                message: "database not found".into(),
            })
        }
    }

    fn online(system_name: &str) -> PortalResponse {
        PortalResponse::json(json!({
            "Code": "LCC_ONLINE",
            "data": {
                "HomeName": "home1",
                "systemName": system_name,
                "zoneDetail": {
                    "AmbientTemperature": {"Value": "72"},
                    "Humidity": "45.2",
                    "CoolSetPoint": {"Value": 76},
                    "HeatSetPoint": {"Value": 68},
                    "SingleSetPoint": {"Value": 72}
                }
            }
        }))
    }

    fn portal_with_zones(zone_ids: &[&str]) -> FakePortal {
        let links: String = zone_ids
            .iter()
            .map(|z| format!(r#"<li><a href="/Dashboard/HomeDetails?zoneId={z}&amp;homeId=home1&amp;lccId=lcc1">{z}</a></li>"#))
            .collect();
        let portal = portal_accepting_login();
        portal.on_get("/Dashboard", PortalResponse::html(&format!("<ul>{}</ul>", links)));
        portal
    }

    fn portal_with_two_zones() -> FakePortal {
        portal_with_zones(&["zoneA", "zoneB"])
    }

    fn zone(id: &str) -> ZoneContext {
        ZoneContext::new("home1", "lcc1", id)
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "user@example.com".into(),
            password: "hunter2".into(),
        }
    }

    type Outcome = (SessionManager<FakePortal>, RecordingSink, Result<CycleReport, CycleFailure>);

    fn run(portal: FakePortal, options: &CycleOptions) -> Outcome {
        let session = SessionManager::new(portal, PortalUrls::default());
        let mut sink = RecordingSink::default();
        let result = run_cycle(&session, &mut sink, &credentials(), options);
        (session, sink, result)
    }

    /// (path, zoneId) for every context switch and poll, in order.
    fn zone_requests(portal: &FakePortal) -> Vec<(String, String)> {
        portal
            .requests
            .borrow()
            .iter()
            .filter(|r| r.url.path() == DETAILS || r.url.path() == REFRESH)
            .map(|r| (r.url.path().to_string(), r.query("zoneId").unwrap_or_default()))
            .collect()
    }

    fn entity_ids(points: &[MeasurementPoint]) -> Vec<&str> {
        points.iter().filter_map(|p| p.entity_id()).collect()
    }

    #[test]
    fn polls_every_zone_and_writes_one_batch() {
        let portal = portal_with_two_zones();
        portal.on_get(REFRESH, online("Upstairs")).on_get(REFRESH, online("Downstairs"));
        let (session, sink, result) = run(portal, &CycleOptions::default());

        let report = result.expect("cycle");
        assert_eq!(report.zones_polled, 2);
        assert_eq!(report.points_written, 4);
        assert!(report.skipped.is_empty());

        assert_eq!(sink.batches.len(), 1);
        assert_eq!(
            entity_ids(&sink.batches[0]),
            vec!["Upstairs_humidity", "Upstairs_temp", "Downstairs_humidity", "Downstairs_temp"]
        );

        let portal = session.transport();
        assert_eq!(
            zone_requests(portal),
            vec![
                (DETAILS.to_string(), "zoneA".to_string()),
                (REFRESH.to_string(), "zoneA".to_string()),
                (DETAILS.to_string(), "zoneB".to_string()),
                (REFRESH.to_string(), "zoneB".to_string()),
            ]
        );
        assert_eq!(portal.requests_to("/Account/Logout").len(), 1);
        assert!(!session.is_logged_in());
    }

    #[test]
    fn expiry_mid_cycle_relogs_and_resumes() {
        let portal = portal_with_two_zones();
        portal
            .on_get(REFRESH, online("Upstairs"))
            .on_get(REFRESH, expired_redirect())
            .on_get(REFRESH, online("Downstairs"));
        let (session, sink, result) = run(portal, &CycleOptions::default());

        let report = result.expect("cycle");
        assert_eq!(report.relogins, 1);
        assert_eq!(report.points_written, 4);
        assert_eq!(sink.batches.len(), 1);
        assert_eq!(
            entity_ids(&sink.batches[0]),
            vec!["Upstairs_humidity", "Upstairs_temp", "Downstairs_humidity", "Downstairs_temp"]
        );

        let portal = session.transport();
        let logins = portal
            .requests_to("/Account/Login")
            .into_iter()
            .filter(|r| r.method == "POST")
            .count();
        assert_eq!(logins, 2);
        assert_eq!(
            zone_requests(portal),
            vec![
                (DETAILS.to_string(), "zoneA".to_string()),
                (REFRESH.to_string(), "zoneA".to_string()),
                (DETAILS.to_string(), "zoneB".to_string()),
                (REFRESH.to_string(), "zoneB".to_string()),
                (DETAILS.to_string(), "zoneB".to_string()),
                (REFRESH.to_string(), "zoneB".to_string()),
            ]
        );
    }

    #[test]
    fn restart_policy_repolls_from_first_zone() {
        let portal = portal_with_two_zones();
        portal
            .on_get(REFRESH, online("Upstairs"))
            .on_get(REFRESH, expired_redirect())
            .on_get(REFRESH, online("Upstairs"))
            .on_get(REFRESH, online("Downstairs"));
        let options = CycleOptions {
            expiry_policy: ExpiryPolicy::RestartCycle,
            ..CycleOptions::default()
        };
        let (session, sink, result) = run(portal, &options);

        let report = result.expect("cycle");
        assert_eq!(report.zones_polled, 2);
        assert_eq!(report.points_written, 4);
        assert_eq!(
            entity_ids(&sink.batches[0]),
            vec!["Upstairs_humidity", "Upstairs_temp", "Downstairs_humidity", "Downstairs_temp"]
        );
        assert_eq!(session.transport().requests_to(REFRESH).len(), 4);
    }

    #[test]
    fn repeated_expiry_exhausts_relogin_budget() {
        let portal = portal_with_two_zones();
        portal.on_get(REFRESH, online("Upstairs")).on_get(REFRESH, expired_redirect());
        let (session, sink, result) = run(portal, &CycleOptions::default());

        let failure = result.expect_err("budget exhausted");
        assert_eq!(failure.error, CycleError::Session(SessionError::Expired));
        assert!(sink.batches.is_empty());
        // Already logged out by the expiry; nothing left to send.
        assert!(session.transport().requests_to("/Account/Logout").is_empty());
    }

    #[test]
    fn aborted_cycle_names_every_unwritten_zone() {
        let portal = portal_with_zones(&["zoneA", "zoneB", "zoneC"]);
        portal
            .on_get(REFRESH, online("Upstairs"))
            .on_get(REFRESH, expired_redirect())
            .on_get(REFRESH, expired_redirect());
        let (_, sink, result) = run(portal, &CycleOptions::default());

        let failure = result.expect_err("budget exhausted");
        assert_eq!(failure.error, CycleError::Session(SessionError::Expired));
        assert_eq!(failure.report.relogins, 1);
        assert_eq!(failure.report.zones_polled, 1);
        assert_eq!(failure.report.points_written, 0);
        // zoneA was read but its points were never written.
        assert_eq!(failure.dropped, vec![zone("zoneA"), zone("zoneB"), zone("zoneC")]);
        assert!(sink.batches.is_empty());
    }

    #[test]
    fn aborted_cycle_keeps_skipped_zones_apart_from_dropped() {
        let portal = portal_with_two_zones();
        portal.on_get(REFRESH, PortalResponse::json(json!({"Code": "LCC_OFFLINE"}))).on_get(REFRESH, online("Downstairs"));
        let session = SessionManager::new(portal, PortalUrls::default());

        let failure = run_cycle(&session, &mut FailingSink, &credentials(), &CycleOptions::default())
            .expect_err("write fails");
        assert_eq!(failure.report.skipped.len(), 1);
        assert_eq!(failure.report.skipped[0].context, zone("zoneA"));
        assert_eq!(failure.dropped, vec![zone("zoneB")]);
    }

    #[test]
    fn hierarchy_failure_drops_nothing_known() {
        let portal = portal_accepting_login();
        portal.on_get("/Dashboard", PortalResponse::status(502));
        let (session, _, result) = run(portal, &CycleOptions::default());

        let failure = result.expect_err("dashboard down");
        assert!(matches!(failure.error, CycleError::Session(SessionError::BadResponse(_))));
        assert!(failure.dropped.is_empty());
        assert_eq!(session.transport().requests_to("/Account/Logout").len(), 1);
    }

    #[test]
    fn offline_zone_is_skipped_and_reported() {
        let portal = portal_with_two_zones();
        portal
            .on_get(REFRESH, PortalResponse::json(json!({"Code": "LCC_OFFLINE", "data": null})))
            .on_get(REFRESH, online("Downstairs"));
        let (_, sink, result) = run(portal, &CycleOptions::default());

        let report = result.expect("cycle");
        assert_eq!(report.zones_polled, 1);
        assert_eq!(report.points_written, 2);
        assert_eq!(
            report.skipped,
            vec![SkippedZone {
                context: zone("zoneA"),
                reason: PollError::NotOnline("LCC_OFFLINE".into()),
            }]
        );
        assert_eq!(entity_ids(&sink.batches[0]), vec!["Downstairs_humidity", "Downstairs_temp"]);
    }

    #[test]
    fn malformed_zone_is_skipped() {
        let portal = portal_with_two_zones();
        portal
            .on_get(REFRESH, online("Upstairs"))
            .on_get(REFRESH, PortalResponse::json(json!({"Code": "LCC_ONLINE", "data": {"zoneDetail": {}}})));
        let (_, sink, result) = run(portal, &CycleOptions::default());

        let report = result.expect("cycle");
        assert_eq!(report.points_written, 2);
        assert_eq!(report.skipped.len(), 1);
        assert!(matches!(report.skipped[0].reason, PollError::Malformed(_)));
        assert_eq!(sink.batches.len(), 1);
    }

    #[test]
    fn lockout_is_not_retried() {
        let portal = FakePortal::new();
        portal
            .on_get("/Account/Login", login_page())
            .on_post("/Account/Login", login_refused("You have been locked out for 15 minutes"));
        let options = CycleOptions {
            lockout_backoff: Duration::from_secs(1800),
            ..CycleOptions::default()
        };
        let (session, sink, result) = run(portal, &options);

        assert_eq!(
            result.map_err(|f| f.error),
            Err(CycleError::LockedOut {
                retry_after: Duration::from_secs(1800)
            })
        );
        assert!(sink.batches.is_empty());
        assert_eq!(session.transport().requests_to("/Account/Login").len(), 2);
        assert!(session.transport().requests_to("/Dashboard").is_empty());
    }

    #[test]
    fn invalid_credentials_abort() {
        let portal = FakePortal::new();
        portal
            .on_get("/Account/Login", login_page())
            .on_post("/Account/Login", login_refused("Invalid email or password"));
        let (_, _, result) = run(portal, &CycleOptions::default());

        let failure = result.expect_err("rejected");
        assert_eq!(failure.error, CycleError::Login(AuthError::InvalidCredentials));
        assert!(failure.dropped.is_empty());
    }

    #[test]
    fn persistence_failure_still_logs_out() {
        let portal = portal_with_two_zones();
        portal.on_get(REFRESH, online("Upstairs"));
        let session = SessionManager::new(portal, PortalUrls::default());

        let failure = run_cycle(&session, &mut FailingSink, &credentials(), &CycleOptions::default())
            .expect_err("write fails");
        assert!(matches!(failure.error, CycleError::Persistence(WriteError::Http { status: 500, .. })));
        assert_eq!(failure.report.zones_polled, 2);
        assert_eq!(failure.dropped, vec![zone("zoneA"), zone("zoneB")]);
        assert_eq!(session.transport().requests_to("/Account/Logout").len(), 1);
    }

    #[test]
    fn dashboard_expiry_uses_relogin_budget() {
        let portal = portal_with_two_zones();
        portal
            .clear_route("GET", "/Dashboard")
            .on_get("/Dashboard", expired_redirect())
            .on_get(
                "/Dashboard",
                PortalResponse::html(r#"<a href="/Dashboard/HomeDetails?zoneId=z&amp;homeId=h&amp;lccId=l">z</a>"#),
            )
            .on_get(REFRESH, online("Solo"));
        let (_, sink, result) = run(portal, &CycleOptions::default());

        let report = result.expect("cycle");
        assert_eq!(report.relogins, 1);
        assert_eq!(entity_ids(&sink.batches[0]), vec!["Solo_humidity", "Solo_temp"]);
    }

    #[test]
    fn expiry_policy_parses() {
        assert_eq!("resume".parse::<ExpiryPolicy>(), Ok(ExpiryPolicy::ResumeZone));
        assert_eq!(" Restart ".parse::<ExpiryPolicy>(), Ok(ExpiryPolicy::RestartCycle));
        assert!("later".parse::<ExpiryPolicy>().is_err());
    }

    #[test]
    fn credentials_debug_hides_password() {
        let shown = format!("{:?}", credentials());
        assert!(shown.contains("user@example.com"));
        assert!(!shown.contains("hunter2"));
    }
}
