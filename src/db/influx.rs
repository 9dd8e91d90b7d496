//! Time-series persistence.
//!
//! [`PointSink`] is the seam the collection driver writes through; [`InfluxWriter`] implements it
//! against the InfluxDB 1.x HTTP `/write` endpoint using line protocol.

use crate::services::measurements::MeasurementPoint;
use chrono::{DateTime, Utc};
use http::header::CONTENT_TYPE;
use log::{debug, info};
use std::time::Duration;
use url::Url;

pub const DEFAULT_INFLUXDB_PORT: u16 = 8086;

const MEASUREMENT_SPECIALS: &[char] = &[',', ' '];
const KEY_SPECIALS: &[char] = &[',', '=', ' '];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePrecision {
    Seconds,
}

impl TimePrecision {
    pub fn as_param(&self) -> &'static str {
        match self {
            TimePrecision::Seconds => "s",
        }
    }

    fn timestamp(&self, time: DateTime<Utc>) -> i64 {
        match self {
            TimePrecision::Seconds => time.timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("influxdb transport error: {0}")]
    Transport(String),
    #[error("influxdb http {status}: {message}")]
    Http { status: u16, message: String },
}

pub trait PointSink {
    /// Persist one batch. The whole batch either succeeds or the error is returned.
    fn write_points(&mut self, points: &[MeasurementPoint], precision: TimePrecision) -> Result<(), WriteError>;
}

pub struct InfluxWriter {
    agent: ureq::Agent,
    write_url: Url,
}

impl InfluxWriter {
    /// `hostname` may be a bare host (combined with `port`) or a full `http(s)://` origin.
    pub fn new(hostname: &str, port: u16, database: &str, timeout: Duration) -> Result<Self, String> {
        let write_url = write_url(hostname, port, database)?;
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Ok(InfluxWriter { agent, write_url })
    }

    pub fn write_url(&self) -> &Url {
        &self.write_url
    }
}

fn write_url(hostname: &str, port: u16, database: &str) -> Result<Url, String> {
    let hostname = hostname.trim().trim_end_matches('/');
    if hostname.is_empty() {
        return Err("InfluxDB hostname is empty".to_string());
    }
    let base = if hostname.starts_with("http://") || hostname.starts_with("https://") {
        hostname.to_string()
    } else {
        format!("http://{}:{}", hostname, port)
    };
    let mut url = Url::parse(&base).map_err(|e| format!("invalid InfluxDB address {}: {}", base, e))?;
    url.set_path("write");
    url.query_pairs_mut().clear().append_pair("db", database);
    Ok(url)
}

impl PointSink for InfluxWriter {
    fn write_points(&mut self, points: &[MeasurementPoint], precision: TimePrecision) -> Result<(), WriteError> {
        if points.is_empty() {
            debug!("No points to write");
            return Ok(());
        }

        let mut url = self.write_url.clone();
        url.query_pairs_mut().append_pair("precision", precision.as_param());
        let body = points
            .iter()
            .map(|p| encode_line(p, precision))
            .collect::<Vec<_>>()
            .join("\n");

        let mut resp = self
            .agent
            .post(url.as_str())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .send(body.as_str())
            .map_err(|e| WriteError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let message = resp
                .body_mut()
                .read_to_string()
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(WriteError::Http { status, message });
        }

        info!("Wrote {} point(s) to {}", points.len(), self.write_url);
        Ok(())
    }
}

/// One line of InfluxDB line protocol.
pub fn encode_line(point: &MeasurementPoint, precision: TimePrecision) -> String {
    let mut line = escape(&point.measurement, MEASUREMENT_SPECIALS);
    for (k, v) in &point.tags {
        line.push(',');
        line.push_str(&escape(k, KEY_SPECIALS));
        line.push('=');
        line.push_str(&escape(v, KEY_SPECIALS));
    }
    let fields = point
        .fields
        .iter()
        .map(|(k, v)| format!("{}={}", escape(k, KEY_SPECIALS), v))
        .collect::<Vec<_>>()
        .join(",");
    line.push(' ');
    line.push_str(&fields);
    line.push(' ');
    line.push_str(&precision.timestamp(point.time).to_string());
    line
}

fn escape(raw: &str, specials: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if specials.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
