//! Authenticated session against the iComfort web portal.
//!
//! The portal is a stateful ASP.NET site: a cookie carries the login, and the server keeps a
//! "currently viewed" home/controller/zone per session that some endpoints implicitly apply to.
//! [`SessionManager`] owns both, and is the only place that decides whether polling is allowed.
//!
//! Expiry is signalled either by a 302 to `/Account/Login?_isSessionExpired=True` or by the same
//! marker inside a response body. Both funnel through [`is_session_expired`].

use crate::client::{PortalResponse, PortalTransport, PortalUrls, TransportError};
use crate::models::icomfort::{HomeId, HomeZones, LccId, ZoneContext, ZoneId};
use log::{debug, info, warn};
use std::cell::RefCell;
use url::Url;

pub const LOGIN_PATH: &str = "Account/Login";
pub const LOGOUT_PATH: &str = "Account/Logout";
pub const DASHBOARD_PATH: &str = "Dashboard";
pub const HOME_DETAILS_PATH: &str = "Dashboard/HomeDetails";

const SESSION_EXPIRED_MARKER: &str = "_isSessionExpired=True";
const VERIFICATION_TOKEN_FIELD: &str = "__RequestVerificationToken";
const PASSWORD_FIELD: &str = "name=\"Password\"";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("portal rejected the username or password")]
    InvalidCredentials,
    #[error("account is temporarily locked out; wait before logging in again")]
    LockedOut,
    #[error("portal unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session expired; log in again")]
    Expired,
    #[error("bad response: {0}")]
    BadResponse(String),
}

impl From<TransportError> for SessionError {
    fn from(value: TransportError) -> Self {
        if value.timed_out {
            SessionError::BadResponse(format!("request timed out: {}", value.message))
        } else {
            SessionError::BadResponse(value.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    LoggedOut,
    LoggedIn,
}

#[derive(Debug, Default)]
struct SessionState {
    phase: SessionPhase,
    context: Option<ZoneContext>,
}

/// True when the portal answered with its "log in again" signal.
pub fn is_session_expired(resp: &PortalResponse) -> bool {
    let redirected_to_login = resp.is_redirect()
        && resp
            .location
            .as_deref()
            .is_some_and(|l| l.to_ascii_lowercase().contains(&LOGIN_PATH.to_ascii_lowercase()));
    redirected_to_login || resp.body.contains(SESSION_EXPIRED_MARKER)
}

/// Not safe to share between concurrent pollers: the server-side context is per session.
pub struct SessionManager<T> {
    transport: T,
    urls: PortalUrls,
    state: RefCell<SessionState>,
}

impl<T: PortalTransport> SessionManager<T> {
    pub fn new(transport: T, urls: PortalUrls) -> Self {
        SessionManager {
            transport,
            urls,
            state: RefCell::new(SessionState::default()),
        }
    }

    pub fn urls(&self) -> &PortalUrls {
        &self.urls
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.borrow().phase
    }

    pub fn is_logged_in(&self) -> bool {
        self.phase() == SessionPhase::LoggedIn
    }

    /// The context most recently confirmed with the portal, if the session is still valid.
    pub fn context(&self) -> Option<ZoneContext> {
        self.state.borrow().context.clone()
    }

    pub fn login(&self, username: &str, password: &str) -> Result<(), AuthError> {
        // Never reuse cookies from a previous (possibly expired) session.
        self.invalidate();

        let login_url = self.url(LOGIN_PATH);
        let page = self
            .transport
            .get(&login_url, None)
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;
        if page.status >= 500 {
            return Err(AuthError::Unreachable(format!("login page returned http {}", page.status)));
        }

        let token = extract_verification_token(&page.body);
        if token.is_none() {
            debug!("Login page carries no {}; posting without it", VERIFICATION_TOKEN_FIELD);
        }
        let mut form = vec![("EmailAddress", username), ("Password", password), ("RememberMe", "false")];
        if let Some(t) = token.as_deref() {
            form.push((VERIFICATION_TOKEN_FIELD, t));
        }

        let resp = self
            .transport
            .post_form(&login_url, Some(&login_url), &form)
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;
        classify_login_response(&resp)?;

        self.state.borrow_mut().phase = SessionPhase::LoggedIn;
        info!("Logged in to portal {}", self.urls.origin());
        Ok(())
    }

    /// Point the server-side session at one zone. Must precede every zone-scoped request.
    pub fn set_context(&self, context: &ZoneContext) -> Result<(), SessionError> {
        self.state.borrow_mut().context = None;

        let url = self.urls.build_url(
            HOME_DETAILS_PATH,
            &[
                ("zoneId", context.zone_id.0.as_str()),
                ("homeId", context.home_id.0.as_str()),
                ("lcc_Id", context.lcc_id.0.as_str()),
            ],
        );
        let referer = self.url(DASHBOARD_PATH);
        self.get_checked(&url, Some(&referer))?;

        self.state.borrow_mut().context = Some(context.clone());
        info!("Context set to {}", context);
        Ok(())
    }

    /// Authenticated GET expecting a JSON body.
    pub fn request_json(&self, url: &Url, referer: &Url) -> Result<serde_json::Value, SessionError> {
        let resp = self.get_checked(url, Some(referer))?;
        serde_json::from_str(&resp.body)
            .map_err(|e| SessionError::BadResponse(format!("invalid json from {}: {}", url.path(), e)))
    }

    /// Read the home -> (controller, zone) hierarchy from the dashboard page.
    pub fn fetch_home_zones(&self) -> Result<HomeZones, SessionError> {
        let url = self.url(DASHBOARD_PATH);
        let referer = self.url(LOGIN_PATH);
        let resp = self.get_checked(&url, Some(&referer))?;
        let zones = parse_dashboard_zones(&resp.body);
        debug!("Dashboard lists {} home(s)", zones.home_count());
        Ok(zones)
    }

    /// Best effort: the session is logged out afterwards whatever the portal answers.
    pub fn logout(&self) -> Result<(), SessionError> {
        if !self.is_logged_in() {
            debug!("Logout skipped; session already logged out");
            return Ok(());
        }
        let url = self.url(LOGOUT_PATH);
        let referer = self.url(DASHBOARD_PATH);
        let result = self.transport.get(&url, Some(&referer));
        self.invalidate();

        let resp = result?;
        if resp.is_success() || resp.is_redirect() {
            info!("Logged out of portal");
        } else {
            warn!("Logout answered http {}; session dropped locally", resp.status);
        }
        Ok(())
    }

    fn url(&self, path: &str) -> Url {
        self.urls.build_url::<&str, &str>(path, &[])
    }

    fn invalidate(&self) {
        let mut state = self.state.borrow_mut();
        state.phase = SessionPhase::LoggedOut;
        state.context = None;
        self.transport.clear_cookies();
    }

    fn get_checked(&self, url: &Url, referer: Option<&Url>) -> Result<PortalResponse, SessionError> {
        if !self.is_logged_in() {
            return Err(SessionError::Expired);
        }
        debug!("GET {}", url);
        let resp = self.transport.get(url, referer)?;
        if is_session_expired(&resp) {
            warn!("Portal session expired (GET {})", url.path());
            self.invalidate();
            return Err(SessionError::Expired);
        }
        if !resp.is_success() {
            return Err(SessionError::BadResponse(format!("http {} from {}", resp.status, url.path())));
        }
        Ok(resp)
    }
}

fn classify_login_response(resp: &PortalResponse) -> Result<(), AuthError> {
    if resp.status >= 500 {
        return Err(AuthError::Unreachable(format!("login returned http {}", resp.status)));
    }
    if is_session_expired(resp) {
        return Err(AuthError::InvalidCredentials);
    }
    if resp.is_redirect() {
        return Ok(());
    }
    if mentions_lockout(&resp.body) {
        return Err(AuthError::LockedOut);
    }
    // A rejected login re-renders the form; anything else is the authenticated landing page.
    if resp.is_success() && !shows_login_form(&resp.body) {
        return Ok(());
    }
    Err(AuthError::InvalidCredentials)
}

/// A "locked" notice that is not a warning about a future lockout ("will be locked").
fn mentions_lockout(body: &str) -> bool {
    let body = body.to_ascii_lowercase();
    body.match_indices("locked").any(|(at, _)| {
        let before = &body[..at];
        if before.ends_with(|c: char| c.is_ascii_alphabetic()) {
            return false;
        }
        let previous_word = before
            .trim_end()
            .rsplit(|c: char| !c.is_ascii_alphabetic())
            .next()
            .unwrap_or_default();
        previous_word != "be"
    })
}

fn shows_login_form(body: &str) -> bool {
    body.contains(PASSWORD_FIELD) || body.contains(VERIFICATION_TOKEN_FIELD)
}

/// Value of the anti-forgery hidden input on the login form.
fn extract_verification_token(html: &str) -> Option<String> {
    let name_at = html.find(&format!("name=\"{}\"", VERIFICATION_TOKEN_FIELD))?;
    let tag_start = html[..name_at].rfind('<')?;
    let tag_end = name_at + html[name_at..].find('>')?;
    let tag = &html[tag_start..tag_end];
    let value_at = tag.find("value=\"")? + "value=\"".len();
    let value_len = tag[value_at..].find('"')?;
    Some(tag[value_at..value_at + value_len].to_string())
}

/// Collect every `HomeDetails?...` link on the dashboard into a hierarchy.
pub fn parse_dashboard_zones(html: &str) -> HomeZones {
    const LINK: &str = "HomeDetails?";

    let mut zones = HomeZones::default();
    let mut rest = html;
    while let Some(pos) = rest.find(LINK) {
        let after = &rest[pos + LINK.len()..];
        let end = after
            .find(|c: char| matches!(c, '"' | '\'' | '<' | '>') || c.is_whitespace())
            .unwrap_or(after.len());
        let query = after[..end].replace("&amp;", "&");
        rest = &after[end..];

        let (mut home, mut lcc, mut zone) = (None, None, None);
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            match k.as_ref() {
                "homeId" => home = Some(v.into_owned()),
                "lccId" | "lcc_Id" => lcc = Some(v.into_owned()),
                "zoneId" => zone = Some(v.into_owned()),
                _ => {}
            }
        }
        if let (Some(h), Some(l), Some(z)) = (home, lcc, zone) {
            zones.insert(HomeId(h), LccId(l), ZoneId(z));
        }
    }
    zones
}
