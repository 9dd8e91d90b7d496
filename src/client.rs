//! HTTP boundary for the iComfort web portal.
//!
//! - Blocking client using `ureq` (no async), with a cookie jar for the portal's ASP.NET session.
//! - Redirects are never followed: a 302 to the login page is how the portal signals session expiry,
//!   so callers need to see it.
//! - Non-2xx statuses are returned as responses, not errors.

use http::header::{CONTENT_TYPE, LOCATION, REFERER, USER_AGENT};
use std::cell::RefCell;
use std::time::Duration;
use url::Url;

pub const PORTAL_ORIGIN: &str = "https://www.lennoxicomfort.com/";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:143.0) Gecko/20100101 Firefox/143.0";

/// Builds portal URLs against a fixed origin.
#[derive(Debug, Clone)]
pub struct PortalUrls {
    origin: Url,
}

impl Default for PortalUrls {
    fn default() -> Self {
        PortalUrls::new(PORTAL_ORIGIN).unwrap_or_else(|_| unreachable!("built-in portal origin is a valid URL"))
    }
}

impl PortalUrls {
    pub fn new(origin: &str) -> Result<Self, url::ParseError> {
        let origin = Url::parse(origin)?;
        Ok(PortalUrls { origin })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// `path` is appended to the origin's own path, so a base like `https://host/portal/` keeps its
    /// prefix. Query pairs are form-encoded in the given order.
    pub fn build_url<K, V>(&self, path: &str, query: &[(K, V)]) -> Url
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut url = self.origin.clone();
        let prefix = self.origin.path().trim_end_matches('/');
        url.set_path(&format!("{}/{}", prefix, path.trim_start_matches('/')));
        url.set_fragment(None);
        if query.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut()
                .clear()
                .extend_pairs(query.iter().map(|(k, v)| (k.as_ref(), v.as_ref())));
        }
        url
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transport error: {message}")]
pub struct TransportError {
    pub message: String,
    pub timed_out: bool,
}

impl From<ureq::Error> for TransportError {
    fn from(value: ureq::Error) -> Self {
        TransportError {
            timed_out: matches!(value, ureq::Error::Timeout(_)),
            message: value.to_string(),
        }
    }
}

/// What the session layer needs to know about a portal response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalResponse {
    pub status: u16,
    pub location: Option<String>,
    pub body: String,
}

impl PortalResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }
}

/// The two request shapes the portal needs. Implementations own the cookie jar.
pub trait PortalTransport {
    fn get(&self, url: &Url, referer: Option<&Url>) -> Result<PortalResponse, TransportError>;

    fn post_form(&self, url: &Url, referer: Option<&Url>, form: &[(&str, &str)])
    -> Result<PortalResponse, TransportError>;

    /// Drop every stored cookie.
    fn clear_cookies(&self);
}

pub struct UreqTransport {
    agent: RefCell<ureq::Agent>,
    timeout: Duration,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        UreqTransport {
            agent: RefCell::new(Self::build_agent(timeout)),
            timeout,
        }
    }

    fn build_agent(timeout: Duration) -> ureq::Agent {
        ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .max_redirects(0)
            .max_redirects_will_error(false)
            .build()
            .into()
    }

    fn read_response(mut resp: http::Response<ureq::Body>) -> Result<PortalResponse, TransportError> {
        let status = resp.status().as_u16();
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.body_mut().read_to_string()?;
        Ok(PortalResponse { status, location, body })
    }
}

impl PortalTransport for UreqTransport {
    fn get(&self, url: &Url, referer: Option<&Url>) -> Result<PortalResponse, TransportError> {
        let agent = self.agent.borrow();
        let mut req = agent
            .get(url.as_str())
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .header("X-Requested-With", "XMLHttpRequest");
        if let Some(r) = referer {
            req = req.header(REFERER, r.as_str());
        }
        Self::read_response(req.call()?)
    }

    fn post_form(
        &self,
        url: &Url,
        referer: Option<&Url>,
        form: &[(&str, &str)],
    ) -> Result<PortalResponse, TransportError> {
        let agent = self.agent.borrow();
        let mut req = agent
            .post(url.as_str())
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(r) = referer {
            req = req.header(REFERER, r.as_str());
        }
        Self::read_response(req.send_form(form.iter().copied())?)
    }

    fn clear_cookies(&self) {
        // A fresh agent is the simplest way to start from an empty jar.
        *self.agent.borrow_mut() = Self::build_agent(self.timeout);
    }
}
