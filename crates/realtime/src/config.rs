use std::time::Duration;

use realtyops_core::env::{flag_or, parse_or};
use realtyops_core::error::CoreError;

/// Pool, eviction, and recovery settings for the realtime manager.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// When `false`, `subscribe` fails with `Disabled` (default: `true`).
    pub enabled: bool,
    /// Upper bound on open push channels (default: `5`).
    pub max_connections: usize,
    /// Idle limit for `page` connections (default: 60 s).
    pub page_idle_timeout: Duration,
    /// Age limit for `page` connections (default: 5 min).
    pub page_max_age: Duration,
    /// Idle limit for `long-term` connections (default: 30 min).
    pub long_term_idle_timeout: Duration,
    /// Age limit for `long-term` connections (default: 2 h).
    pub long_term_max_age: Duration,
    /// How long a connection may sit with zero subscriptions (default: 60 s).
    pub empty_grace: Duration,
    /// Flat wait before a failed subscription is rebuilt (default: 5 s).
    pub reconnect_backoff: Duration,
    /// Cleanup tick (default: 30 s).
    pub cleanup_interval: Duration,
    /// Recent event keys remembered for listener de-duplication (default: `100`).
    pub dedup_capacity: usize,
    /// Subscriptions created longer ago than this are dropped by
    /// `cleanup_expired_subscriptions` (default: 30 min).
    pub subscription_max_age: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_connections: 5,
            page_idle_timeout: Duration::from_secs(60),
            page_max_age: Duration::from_secs(5 * 60),
            long_term_idle_timeout: Duration::from_secs(30 * 60),
            long_term_max_age: Duration::from_secs(2 * 60 * 60),
            empty_grace: Duration::from_secs(60),
            reconnect_backoff: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(30),
            dedup_capacity: 100,
            subscription_max_age: Duration::from_secs(30 * 60),
        }
    }
}

impl RealtimeConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                                 | Default |
    /// |-----------------------------------------|---------|
    /// | `REALTIME_ENABLED`                      | `true`  |
    /// | `REALTIME_MAX_CONNECTIONS`              | `5`     |
    /// | `REALTIME_PAGE_IDLE_TIMEOUT_SECS`       | `60`    |
    /// | `REALTIME_PAGE_MAX_AGE_SECS`            | `300`   |
    /// | `REALTIME_LONG_TERM_IDLE_TIMEOUT_SECS`  | `1800`  |
    /// | `REALTIME_LONG_TERM_MAX_AGE_SECS`       | `7200`  |
    /// | `REALTIME_EMPTY_GRACE_SECS`             | `60`    |
    /// | `REALTIME_RECONNECT_BACKOFF_SECS`       | `5`     |
    /// | `REALTIME_CLEANUP_INTERVAL_SECS`        | `30`    |
    /// | `REALTIME_DEDUP_CAPACITY`               | `100`   |
    /// | `REALTIME_SUBSCRIPTION_MAX_AGE_SECS`    | `1800`  |
    pub fn from_env() -> Result<Self, CoreError> {
        let d = Self::default();
        let secs = |key: &str, default: Duration| -> Result<Duration, CoreError> {
            parse_or(key, default.as_secs()).map(Duration::from_secs)
        };

        let config = Self {
            enabled: flag_or("REALTIME_ENABLED", d.enabled)?,
            max_connections: parse_or("REALTIME_MAX_CONNECTIONS", d.max_connections)?,
            page_idle_timeout: secs("REALTIME_PAGE_IDLE_TIMEOUT_SECS", d.page_idle_timeout)?,
            page_max_age: secs("REALTIME_PAGE_MAX_AGE_SECS", d.page_max_age)?,
            long_term_idle_timeout: secs(
                "REALTIME_LONG_TERM_IDLE_TIMEOUT_SECS",
                d.long_term_idle_timeout,
            )?,
            long_term_max_age: secs("REALTIME_LONG_TERM_MAX_AGE_SECS", d.long_term_max_age)?,
            empty_grace: secs("REALTIME_EMPTY_GRACE_SECS", d.empty_grace)?,
            reconnect_backoff: secs("REALTIME_RECONNECT_BACKOFF_SECS", d.reconnect_backoff)?,
            cleanup_interval: secs("REALTIME_CLEANUP_INTERVAL_SECS", d.cleanup_interval)?,
            dedup_capacity: parse_or("REALTIME_DEDUP_CAPACITY", d.dedup_capacity)?,
            subscription_max_age: secs(
                "REALTIME_SUBSCRIPTION_MAX_AGE_SECS",
                d.subscription_max_age,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_connections == 0 {
            return Err(CoreError::Validation(
                "REALTIME_MAX_CONNECTIONS must be at least 1".into(),
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(CoreError::Validation(
                "REALTIME_CLEANUP_INTERVAL_SECS must be positive".into(),
            ));
        }
        if self.dedup_capacity == 0 {
            return Err(CoreError::Validation(
                "REALTIME_DEDUP_CAPACITY must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RealtimeConfig::default();
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.page_max_age, Duration::from_secs(300));
        assert_eq!(config.long_term_max_age, Duration::from_secs(7200));
        assert_eq!(config.reconnect_backoff, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_pool_rejected() {
        let config = RealtimeConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
