//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if a value is malformed.
//! The database URL is wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::time::Duration;

use crate::error::{Error, Result};
use secrets::SecretString;

#[derive(Debug)]
pub struct Config {
    /// Required for the Postgres store; the in-memory store runs without it.
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Identity written into `worker` on allocation.
    pub worker_id: String,
    pub default_timeout_ms: u64,
    pub poll_interval: Duration,
    pub reaper_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            worker_id: std::env::var("WORKER_ID").unwrap_or_else(|_| default_worker_id()),
            default_timeout_ms: parse_var("WORK_DEFAULT_TIMEOUT_MS", 30 * 60 * 1000)?,
            poll_interval: Duration::from_millis(parse_var("WORK_POLL_INTERVAL_MS", 5_000)?),
            reaper_interval: Duration::from_millis(parse_var("WORK_REAPER_INTERVAL_MS", 60_000)?),
        })
    }

    /// The database URL, or a config error naming the missing variable.
    pub fn database_url(&self) -> Result<&SecretString> {
        self.database_url.as_ref().ok_or_else(|| {
            Error::Config("required environment variable DATABASE_URL is not set".to_string())
        })
    }
}

fn parse_var(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is not a valid number: {e}"))),
        Err(_) => Ok(default),
    }
}

/// `<host>:<pid>`, good enough to tell workers apart in listings.
fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{host}:{}", std::process::id())
}
