//! Environment-based configuration for the metadata client
//!
//! Environment variables:
//! - METASYNC_META_SERVERS: comma-separated `host:port` list (required)
//! - METASYNC_META_TLS: use https for metadata requests (default: false)
//! - METASYNC_RETRY_DELAY_MS: poller backoff after a failed fetch (default: 10)
//! - METASYNC_REQUEST_TIMEOUT_SECS: per-request HTTP timeout (default: 30)
//! - METASYNC_PASSWORD_HASH_COST: bcrypt cost for new passwords (default: bcrypt default)

use crate::{Error, Result};
use std::time::Duration;
use tracing::info;

/// Backoff between failed snapshot fetches.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Client-side HTTP timeout. Must exceed the authority's long-poll window.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Metadata client configuration
#[derive(Debug, Clone)]
pub struct MetaClientConfig {
    /// Metadata servers, tried round-robin for reads and in order for writes
    pub meta_servers: Vec<String>,
    /// Use https
    pub tls: bool,
    /// Sleep between failed snapshot fetches
    pub retry_delay: Duration,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
    /// bcrypt cost used when hashing new passwords
    pub password_hash_cost: u32,
}

impl MetaClientConfig {
    pub fn new(meta_servers: Vec<String>) -> Self {
        Self {
            meta_servers,
            tls: false,
            retry_delay: DEFAULT_RETRY_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            password_hash_cost: bcrypt::DEFAULT_COST,
        }
    }

    /// Build configuration from environment
    pub fn from_env() -> Result<Self> {
        let servers = std::env::var("METASYNC_META_SERVERS").map_err(|_| {
            Error::Config("METASYNC_META_SERVERS is required".to_string())
        })?;
        let meta_servers = parse_server_list(&servers);

        let mut config = Self::new(meta_servers);
        if let Some(tls) = parse_optional_bool("METASYNC_META_TLS")? {
            config.tls = tls;
        }
        if let Some(ms) = parse_optional_u64("METASYNC_RETRY_DELAY_MS")? {
            config.retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_optional_u64("METASYNC_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(cost) = parse_optional_u64("METASYNC_PASSWORD_HASH_COST")? {
            config.password_hash_cost = cost as u32;
        }

        config.validate()?;
        info!(
            servers = ?config.meta_servers,
            tls = config.tls,
            retry_delay_ms = config.retry_delay.as_millis() as u64,
            "Loaded metadata client configuration"
        );
        Ok(config)
    }

    /// Reject configurations the client cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.meta_servers.is_empty() {
            return Err(Error::Config(
                "at least one meta server address is required".to_string(),
            ));
        }
        for server in &self.meta_servers {
            validate_address(server)?;
        }
        if self.retry_delay.is_zero() {
            return Err(Error::Config("retry delay must be non-zero".to_string()));
        }
        if !(4..=31).contains(&self.password_hash_cost) {
            return Err(Error::Config(format!(
                "password hash cost must be in [4,31], got {}",
                self.password_hash_cost
            )));
        }
        Ok(())
    }
}

/// Split a comma-separated address list, dropping blanks.
pub fn parse_server_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Check that `addr` is `host:port`.
pub fn validate_address(addr: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(Error::Config(format!(
            "malformed address {:?}, expected host:port",
            addr
        )));
    };
    if host.is_empty() || host.contains('/') {
        return Err(Error::Config(format!(
            "malformed address {:?}, expected host:port",
            addr
        )));
    }
    port.parse::<u16>()
        .map_err(|_| Error::Config(format!("invalid port in address {:?}", addr)))?;
    Ok(())
}

fn parse_optional_bool(name: &str) -> Result<Option<bool>> {
    let Some(raw) = std::env::var(name).ok() else {
        return Ok(None);
    };
    parse_bool(name, &raw).map(Some)
}

pub(crate) fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "{name} must be a boolean (true/false/1/0), got '{raw}'"
        ))),
    }
}

fn parse_optional_u64(name: &str) -> Result<Option<u64>> {
    let Some(raw) = std::env::var(name).ok() else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|e| Error::Config(format!("{name} must be an unsigned integer: {e}")))
}
