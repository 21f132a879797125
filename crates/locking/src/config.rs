use std::time::Duration;

use realtyops_core::env::{flag_or, parse_or};
use realtyops_core::error::CoreError;
use realtyops_core::schedule::{
    validate_lease_secs, DEFAULT_EXTEND_INTERVAL_SECS, DEFAULT_LEASE_SECS, DEFAULT_POLL_INTERVAL_SECS,
};

/// Lease timing for the edit-lock protocol and its observers.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Length of an edit lease (default: 5 min).
    pub lease: Duration,
    /// How often held leases are extended (default: 60 s).
    pub extend_interval: Duration,
    /// When `false`, leases are only extended by explicit `extend` calls and
    /// lapse once the holder stops calling (default: `true`).
    pub auto_extend: bool,
    /// Fetch interval of the polling observer (default: 5 s).
    pub poll_interval: Duration,
    /// How long an observed row is trusted before it is read again, and how
    /// long a fresh lease is shielded from older observations (default: 15 s).
    pub staleness: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(DEFAULT_LEASE_SECS),
            extend_interval: Duration::from_secs(DEFAULT_EXTEND_INTERVAL_SECS),
            auto_extend: true,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            staleness: Duration::from_secs(15),
        }
    }
}

impl LockConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default |
    /// |-----------------------------|---------|
    /// | `LOCK_LEASE_SECS`           | `300`   |
    /// | `LOCK_EXTEND_INTERVAL_SECS` | `60`    |
    /// | `LOCK_AUTO_EXTEND`          | `true`  |
    /// | `LOCK_POLL_INTERVAL_SECS`   | `5`     |
    /// | `LOCK_STALENESS_SECS`       | `15`    |
    pub fn from_env() -> Result<Self, CoreError> {
        let d = Self::default();
        let config = Self {
            lease: Duration::from_secs(parse_or("LOCK_LEASE_SECS", d.lease.as_secs())?),
            extend_interval: Duration::from_secs(parse_or(
                "LOCK_EXTEND_INTERVAL_SECS",
                d.extend_interval.as_secs(),
            )?),
            auto_extend: flag_or("LOCK_AUTO_EXTEND", d.auto_extend)?,
            poll_interval: Duration::from_secs(parse_or(
                "LOCK_POLL_INTERVAL_SECS",
                d.poll_interval.as_secs(),
            )?),
            staleness: Duration::from_secs(parse_or("LOCK_STALENESS_SECS", d.staleness.as_secs())?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        validate_lease_secs(self.lease.as_secs())?;
        if self.extend_interval.is_zero() || self.extend_interval >= self.lease {
            return Err(CoreError::Validation(format!(
                "LOCK_EXTEND_INTERVAL_SECS must be positive and shorter than the lease ({}s)",
                self.lease.as_secs()
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(CoreError::Validation(
                "LOCK_POLL_INTERVAL_SECS must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Lease length as a chrono duration for deadline arithmetic.
    pub fn lease_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_LEASE_SECS as i64))
    }

    pub fn staleness_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.staleness).unwrap_or_else(|_| chrono::Duration::zero())
    }
}
