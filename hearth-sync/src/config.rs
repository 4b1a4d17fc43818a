//! Runtime configuration for the sync core.
//!
//! Every section has a `Default`; a JSON document only needs to name the
//! fields it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::policy::AllowListEntry;

/// Configuration errors. Raised at startup, never at request time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("table {table:?} is allow-listed but has no policy rule")]
    MissingPolicy { table: String },
    #[error("table {table:?} is allow-listed twice")]
    DuplicateTable { table: String },
    #[error("invalid feed url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Reconnect schedule for change streams (and offline mutation resends).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Uninterrupted streaming needed before the attempt counter resets.
    pub reset_window_secs: u64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            reset_window_secs: 60,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn reset_window(&self) -> Duration {
        Duration::from_secs(self.reset_window_secs)
    }
}

/// Access-context cache tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub local_ttl_secs: u64,
    pub local_capacity: usize,
    pub shared_ttl_secs: u64,
    /// Prefix for keys in the shared tier; bump to invalidate old layouts.
    pub namespace: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_ttl_secs: 5,
            local_capacity: 1024,
            shared_ttl_secs: 30,
            namespace: "access:v1".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn local_ttl(&self) -> Duration {
        Duration::from_secs(self.local_ttl_secs)
    }

    pub fn shared_ttl(&self) -> Duration {
        Duration::from_secs(self.shared_ttl_secs)
    }
}

/// Optimistic mutation timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    pub send_timeout_ms: u64,
    pub reconcile_timeout_ms: u64,
    /// Sends that fail as unavailable are retried up to this many times.
    /// `None` keeps retrying until the collection closes.
    pub max_send_attempts: Option<u32>,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 10_000,
            reconcile_timeout_ms: 15_000,
            max_send_attempts: None,
        }
    }
}

impl MutationConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout_ms)
    }
}

/// Local replica housekeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Confirmed rows untouched for this long are dropped by `gc()`.
    pub row_ttl_secs: Option<u64>,
}

impl ReplicaConfig {
    pub fn row_ttl(&self) -> Option<Duration> {
        self.row_ttl_secs.map(Duration::from_secs)
    }
}

/// Top-level sync configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Change feed endpoint (`ws://` or `wss://`).
    pub feed_url: String,
    pub allow_list: Vec<AllowListEntry>,
    pub backoff: BackoffConfig,
    pub cache: CacheConfig,
    pub mutation: MutationConfig,
    pub replica: ReplicaConfig,
    /// Buffered supervisor events per receiver.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            feed_url: "ws://127.0.0.1:7400/v1/feed".to_string(),
            allow_list: crate::policy::AllowList::standard_entries(),
            backoff: BackoffConfig::default(),
            cache: CacheConfig::default(),
            mutation: MutationConfig::default(),
            replica: ReplicaConfig::default(),
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_feed_url(&self.feed_url)?;
        let backoff = &self.backoff;
        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "backoff.multiplier",
                reason: format!("must be a finite value >= 1, got {}", backoff.multiplier),
            });
        }
        if backoff.initial_delay_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "backoff.initial_delay_ms",
                reason: "must be positive".into(),
            });
        }
        if backoff.initial_delay_ms > backoff.max_delay_ms {
            return Err(ConfigError::Invalid {
                field: "backoff.max_delay_ms",
                reason: "must not be below initial_delay_ms".into(),
            });
        }
        if self.cache.local_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.local_capacity",
                reason: "must be positive".into(),
            });
        }
        if self.mutation.send_timeout_ms == 0 || self.mutation.reconcile_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "mutation",
                reason: "timeouts must be positive".into(),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "event_capacity",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Parse a change feed endpoint. Only `ws` and `wss` are accepted.
pub fn parse_feed_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: "scheme must be ws or wss".into(),
        });
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_overrides_named_fields() {
        let config = SyncConfig::from_json(
            r#"{ "backoff": { "initial_delay_ms": 250 }, "cache": { "local_capacity": 8 } }"#,
        )
        .unwrap();

        assert_eq!(config.backoff.initial_delay(), Duration::from_millis(250));
        assert_eq!(config.backoff.max_delay_ms, 30_000);
        assert_eq!(config.cache.local_capacity, 8);
        assert_eq!(config.cache.local_ttl(), Duration::from_secs(5));
        assert_eq!(config.allow_list.len(), 6);
    }

    #[test]
    fn test_rejects_shrinking_multiplier() {
        let result = SyncConfig::from_json(r#"{ "backoff": { "multiplier": 0.5 } }"#);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "backoff.multiplier",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_initial_above_max() {
        let result = SyncConfig::from_json(
            r#"{ "backoff": { "initial_delay_ms": 5000, "max_delay_ms": 100 } }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_non_websocket_feed_url() {
        let result = SyncConfig::from_json(r#"{ "feed_url": "https://sync.example.com/v1/feed" }"#);
        assert!(matches!(result, Err(ConfigError::InvalidUrl { .. })));

        let mut config = SyncConfig::default();
        config.feed_url = "not a url".into();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl { .. })));

        config.feed_url = "wss://sync.example.com/v1/feed".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            SyncConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
