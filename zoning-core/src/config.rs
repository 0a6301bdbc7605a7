//! Zoning configuration
//!
//! Aggregates per-component configuration and loads overrides from `ZONING_*`
//! environment variables.

use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, ZoningError};
use crate::load_balancing::LoadBalancingConfig;
use crate::translation::TranslationManagerConfig;

/// Worker name override
pub const ENV_WORKER_NAME: &str = "ZONING_WORKER_NAME";
/// Roster re-poll interval, milliseconds
pub const ENV_ROSTER_POLL_MS: &str = "ZONING_ROSTER_POLL_MS";
/// Migration cool-down, milliseconds
pub const ENV_MIGRATION_BACKOFF_MS: &str = "ZONING_MIGRATION_BACKOFF_MS";
/// Migration failure log window, seconds
pub const ENV_MIGRATION_LOG_RATE_SECS: &str = "ZONING_MIGRATION_LOG_RATE_SECS";
/// Unanswered migration diagnostic timeout, milliseconds
pub const ENV_DIAGNOSTIC_TIMEOUT_MS: &str = "ZONING_DIAGNOSTIC_TIMEOUT_MS";

/// Configuration for one zoning worker
#[derive(Debug, Clone)]
pub struct ZoningConfig {
    /// Physical worker name this process registers under
    pub worker_name: String,
    /// Translation manager settings
    pub translation: TranslationManagerConfig,
    /// Migration engine settings
    pub load_balancing: LoadBalancingConfig,
}

impl Default for ZoningConfig {
    fn default() -> Self {
        Self {
            worker_name: format!("worker-{}", uuid::Uuid::new_v4()),
            translation: TranslationManagerConfig::default(),
            load_balancing: LoadBalancingConfig::default(),
        }
    }
}

impl ZoningConfig {
    /// Defaults with a fixed worker name
    pub fn for_worker(worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by values from `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup(ENV_WORKER_NAME) {
            if name.trim().is_empty() {
                return Err(ZoningError::InvalidConfig {
                    key: ENV_WORKER_NAME.into(),
                    value: name,
                });
            }
            config.worker_name = name;
        }
        if let Some(ms) = parse(&lookup, ENV_ROSTER_POLL_MS)? {
            config.translation.roster_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, ENV_MIGRATION_BACKOFF_MS)? {
            config.load_balancing.migration_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(&lookup, ENV_MIGRATION_LOG_RATE_SECS)? {
            config.load_balancing.failure_log_rate = Duration::from_secs(secs);
        }
        if let Some(ms) = parse(&lookup, ENV_DIAGNOSTIC_TIMEOUT_MS)? {
            config.load_balancing.diagnostic_timeout = Duration::from_millis(ms);
        }

        debug!("Loaded zoning config for {}", config.worker_name);
        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ZoningError::InvalidConfig {
                key: key.into(),
                value: raw,
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ZoningConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.worker_name.starts_with("worker-"));
        assert_eq!(config.load_balancing.migration_backoff, Duration::from_secs(1));
        assert_eq!(config.load_balancing.failure_log_rate, Duration::from_secs(5));
    }

    #[test]
    fn test_overrides() {
        let config = ZoningConfig::from_lookup(lookup(&[
            (ENV_WORKER_NAME, "server-a"),
            (ENV_MIGRATION_BACKOFF_MS, "250"),
            (ENV_ROSTER_POLL_MS, " 40 "),
            (ENV_DIAGNOSTIC_TIMEOUT_MS, "1500"),
        ]))
        .unwrap();

        assert_eq!(config.worker_name, "server-a");
        assert_eq!(config.load_balancing.migration_backoff, Duration::from_millis(250));
        assert_eq!(config.translation.roster_poll_interval, Duration::from_millis(40));
        assert_eq!(config.load_balancing.diagnostic_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_invalid_value() {
        let err = ZoningConfig::from_lookup(lookup(&[(ENV_MIGRATION_LOG_RATE_SECS, "soon")])).unwrap_err();
        match err {
            ZoningError::InvalidConfig { key, value } => {
                assert_eq!(key, ENV_MIGRATION_LOG_RATE_SECS);
                assert_eq!(value, "soon");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
