//! Runtime configuration from the environment, optionally seeded from a `.env` file.

use crate::client::PORTAL_ORIGIN;
use crate::db::influx::DEFAULT_INFLUXDB_PORT;
use crate::services::collect::{Credentials, CycleOptions, DEFAULT_MAX_RELOGINS, ExpiryPolicy};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
/// Lockout notices mention 15 minutes.
pub const DEFAULT_LOCKOUT_BACKOFF_MINS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: Credentials,
    pub influxdb_hostname: String,
    pub influxdb_port: u16,
    pub influxdb_database: String,
    pub portal_base_url: String,
    /// Applied to every portal and InfluxDB request.
    pub request_timeout: Duration,
    pub expiry_policy: ExpiryPolicy,
    pub max_relogins: u32,
    pub lockout_backoff: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let value = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| value(key).ok_or_else(|| format!("Missing required setting {}", key));

        let credentials = Credentials {
            username: required("ICOMFORT_USERNAME")?,
            password: required("ICOMFORT_PASSWORD")?,
        };

        Ok(Config {
            credentials,
            influxdb_hostname: required("INFLUXDB_HOSTNAME")?,
            influxdb_port: parse_or("INFLUXDB_PORT", value("INFLUXDB_PORT"), DEFAULT_INFLUXDB_PORT)?,
            influxdb_database: required("INFLUXDB_DATABASE")?,
            portal_base_url: value("ICOMFORT_BASE_URL").unwrap_or_else(|| PORTAL_ORIGIN.to_string()),
            request_timeout: Duration::from_secs(parse_or(
                "REQUEST_TIMEOUT_SECS",
                value("REQUEST_TIMEOUT_SECS"),
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
            expiry_policy: parse_or("SESSION_EXPIRY_POLICY", value("SESSION_EXPIRY_POLICY"), ExpiryPolicy::default())?,
            max_relogins: parse_or("MAX_RELOGINS", value("MAX_RELOGINS"), DEFAULT_MAX_RELOGINS)?,
            lockout_backoff: Duration::from_secs(
                60 * parse_or(
                    "LOCKOUT_BACKOFF_MINS",
                    value("LOCKOUT_BACKOFF_MINS"),
                    DEFAULT_LOCKOUT_BACKOFF_MINS,
                )?,
            ),
        })
    }

    pub fn cycle_options(&self) -> CycleOptions {
        CycleOptions {
            expiry_policy: self.expiry_policy,
            max_relogins: self.max_relogins,
            lockout_backoff: self.lockout_backoff,
        }
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(s) => s.parse::<T>().map_err(|e| format!("{} has invalid value {:?}: {}", key, s, e)),
    }
}

/// Merge a `.env` file into the process environment. Variables already set win.
pub fn load_env_file(path: &Path) -> Result<(), String> {
    let content = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (index, line) in content.lines().enumerate() {
        let parsed = parse_env_assignment(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?;
        if let Some((key, value)) = parsed
            && std::env::var_os(&key).is_none()
        {
            // Only called from main before any other thread exists.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

fn parse_env_assignment(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let assignment = trimmed.strip_prefix("export ").map(str::trim_start).unwrap_or(trimmed);
    let (key, raw_value) = assignment
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(format!("invalid variable name {:?}", key));
    }
    Ok(Some((key.to_string(), parse_env_value(raw_value.trim())?)))
}

fn parse_env_value(raw: &str) -> Result<String, String> {
    if let Some(rest) = raw.strip_prefix('"') {
        let mut out = String::new();
        let mut chars = rest.chars();
        while let Some(ch) = chars.next() {
            match ch {
                '\\' => match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(other) => out.push(other),
                    None => return Err("unterminated escape in double-quoted value".to_string()),
                },
                '"' => return closing_quote(chars.as_str(), out),
                other => out.push(other),
            }
        }
        Err("unterminated double-quoted value".to_string())
    } else if let Some(rest) = raw.strip_prefix('\'') {
        let (value, remainder) = rest
            .split_once('\'')
            .ok_or_else(|| "unterminated single-quoted value".to_string())?;
        closing_quote(remainder, value.to_string())
    } else {
        Ok(raw.split('#').next().unwrap_or_default().trim_end().to_string())
    }
}

fn closing_quote(remainder: &str, value: String) -> Result<String, String> {
    let remainder = remainder.trim();
    if remainder.is_empty() || remainder.starts_with('#') {
        Ok(value)
    } else {
        Err("unexpected characters after closing quote".to_string())
    }
}
