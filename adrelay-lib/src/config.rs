//! Configuration for the cache and token resolution layer
//!
//! All values come from the environment (`ADRELAY_*`). Missing values fall
//! back to defaults; a missing cache URL selects passthrough mode instead of
//! failing startup.

use crate::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_FRESH_TTL_SECS: u64 = 300;
pub const DEFAULT_STALE_TTL_SECS: u64 = 3600;
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.facebook.com/v21.0";

/// Cache backend connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Connection URL (e.g. `rediss://cache.example.com:6379`); None disables caching
    #[serde(default)]
    pub url: Option<String>,
    /// Auth token, used as the connection password
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Connection timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_pool_size() -> usize {
    8
}

fn default_timeout_ms() -> u64 {
    2000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            pool_size: default_pool_size(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    /// Freshness window for SWR-cached upstream responses
    pub fresh_ttl_secs: u64,
    /// Stale-retention window for SWR-cached upstream responses
    pub stale_ttl_secs: u64,
    /// Lifetime of a resource -> token binding
    pub token_ttl_secs: u64,
    /// Timeout applied to every validation probe and upstream fetch
    pub probe_timeout_secs: u64,
    pub graph_base_url: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            fresh_ttl_secs: DEFAULT_FRESH_TTL_SECS,
            stale_ttl_secs: DEFAULT_STALE_TTL_SECS,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            graph_base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let number = |name: &str, default: u64| -> Result<u64> {
            match non_empty(name) {
                Some(raw) => raw.trim().parse::<u64>().map_err(|e| {
                    RelayError::config(format!("{} must be a non-negative integer: {}", name, e))
                }),
                None => Ok(default),
            }
        };

        let config = Self {
            cache: CacheConfig {
                url: non_empty("ADRELAY_CACHE_URL"),
                token: non_empty("ADRELAY_CACHE_TOKEN"),
                ..CacheConfig::default()
            },
            fresh_ttl_secs: number("ADRELAY_FRESH_TTL_SECS", defaults.fresh_ttl_secs)?,
            stale_ttl_secs: number("ADRELAY_STALE_TTL_SECS", defaults.stale_ttl_secs)?,
            token_ttl_secs: number("ADRELAY_TOKEN_TTL_SECS", defaults.token_ttl_secs)?,
            probe_timeout_secs: number("ADRELAY_PROBE_TIMEOUT_SECS", defaults.probe_timeout_secs)?,
            graph_base_url: non_empty("ADRELAY_GRAPH_BASE_URL")
                .unwrap_or(defaults.graph_base_url),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> Result<()> {
        if self.fresh_ttl_secs == 0 || self.stale_ttl_secs == 0 || self.token_ttl_secs == 0 {
            return Err(RelayError::config("TTLs must be greater than zero"));
        }
        if self.fresh_ttl_secs > self.stale_ttl_secs {
            return Err(RelayError::config(format!(
                "fresh TTL ({}s) must not exceed stale TTL ({}s)",
                self.fresh_ttl_secs, self.stale_ttl_secs
            )));
        }
        if self.probe_timeout_secs == 0 {
            return Err(RelayError::config("probe timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}
