pub mod models {
    pub mod icomfort;
}

pub mod client;
pub mod config;
pub mod db {
    pub mod influx;
}
pub mod session;
pub mod utils;
pub mod services {
    pub mod collect;
    pub mod measurements;
    pub mod poller;
}

use crate::client::{PortalUrls, UreqTransport};
use crate::config::{Config, load_env_file};
use crate::db::influx::InfluxWriter;
use crate::services::collect::{self, CycleError};
use crate::session::SessionManager;
use chrono::Utc;
use log::{error, info, warn};
use std::path::PathBuf;

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (portal={}, influxdb={}:{}/{}, timeout={}s, expiry_policy={:?}, max_relogins={}, lockout_backoff={}m)",
        cfg.portal_base_url,
        cfg.influxdb_hostname,
        cfg.influxdb_port,
        cfg.influxdb_database,
        cfg.request_timeout.as_secs(),
        cfg.expiry_policy,
        cfg.max_relogins,
        cfg.lockout_backoff.as_secs() / 60,
    );

    // 2) Portal session and metrics sink
    let urls = PortalUrls::new(&cfg.portal_base_url)
        .map_err(|e| format!("ICOMFORT_BASE_URL is not a valid URL: {}", e))?;
    let session = SessionManager::new(UreqTransport::new(cfg.request_timeout), urls);
    let mut writer = InfluxWriter::new(
        &cfg.influxdb_hostname,
        cfg.influxdb_port,
        &cfg.influxdb_database,
        cfg.request_timeout,
    )?;

    // 3) One collection cycle
    match collect::run_cycle(&session, &mut writer, &cfg.credentials, &cfg.cycle_options()) {
        Ok(report) => {
            for skipped in &report.skipped {
                warn!("Zone {} not collected: {}", skipped.context, skipped.reason);
            }
            info!(
                "Cycle complete: {} zone(s) polled, {} skipped, {} point(s) written, {} re-login(s)",
                report.zones_polled,
                report.skipped.len(),
                report.points_written,
                report.relogins
            );
            Ok(())
        }
        Err(failure) => {
            for skipped in &failure.report.skipped {
                warn!("Zone {} not collected: {}", skipped.context, skipped.reason);
            }
            for zone in &failure.dropped {
                warn!("Zone {} not written: cycle aborted ({})", zone, failure.error);
            }
            match failure.error {
                CycleError::LockedOut { retry_after } => {
                    let not_before = chrono::Duration::from_std(retry_after)
                        .map(|d| Utc::now() + d)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|_| "later".to_string());
                    Err(format!("portal account is locked out; do not run again before {}", not_before))
                }
                e => Err(format!(
                    "{} ({} zone(s) dropped, {} skipped)",
                    e,
                    failure.dropped.len(),
                    failure.report.skipped.len()
                )),
            }
        }
    }
}

fn configure_env_from_cli() -> Result<Option<LoadedEnvFile>, String> {
    let mut args = std::env::args_os();
    args.next(); // skip program name

    let mut env_file: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        let path = match arg.to_str() {
            Some("--env-file") => PathBuf::from(
                args.next()
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?,
            ),
            Some(s) if s.starts_with("--env-file=") => {
                let path_str = &s["--env-file=".len()..];
                if path_str.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                PathBuf::from(path_str)
            }
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        };
        if env_file.replace(path).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }

    if let Some(path) = env_file {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(&path)?;
        return Ok(Some(LoadedEnvFile { path, explicit: true }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if default_path.is_file() {
        load_env_file(&default_path)?;
        Ok(Some(LoadedEnvFile {
            path: default_path,
            explicit: false,
        }))
    } else {
        Ok(None)
    }
}

fn main() {
    let loaded_env = match configure_env_from_cli() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "icomfort-influx {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
