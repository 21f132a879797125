use axum::http::HeaderValue;
use realtyops_core::env::{parse_or, string_or};
use realtyops_core::error::CoreError;
use realtyops_locking::LockConfig;

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Upper bound on post-shutdown cleanup in seconds (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// Postgres connection string. Without it the server runs against an
    /// in-process store, which is only useful for demos.
    pub database_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            cors_origins: vec!["http://localhost:5173".into()],
            request_timeout_secs: 30,
            shutdown_timeout_secs: 30,
            database_url: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                 |
    /// |-------------------------|-------------------------|
    /// | `HOST`                  | `0.0.0.0`               |
    /// | `PORT`                  | `3000`                  |
    /// | `CORS_ORIGINS`          | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`  | `30`                    |
    /// | `SHUTDOWN_TIMEOUT_SECS` | `30`                    |
    /// | `DATABASE_URL`          | unset                   |
    pub fn from_env() -> Result<Self, CoreError> {
        let d = Self::default();
        let config = Self {
            host: string_or("HOST", &d.host),
            port: parse_or("PORT", d.port)?,
            cors_origins: string_or("CORS_ORIGINS", &d.cors_origins.join(","))
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            request_timeout_secs: parse_or("REQUEST_TIMEOUT_SECS", d.request_timeout_secs)?,
            shutdown_timeout_secs: parse_or("SHUTDOWN_TIMEOUT_SECS", d.shutdown_timeout_secs)?,
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail once the server is running.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.host.parse::<std::net::IpAddr>().is_err() {
            return Err(CoreError::Validation(format!("HOST is not an IP address: {:?}", self.host)));
        }
        if self.request_timeout_secs == 0 {
            return Err(CoreError::Validation("REQUEST_TIMEOUT_SECS must be positive".into()));
        }
        if let Some(origin) = self
            .cors_origins
            .iter()
            .find(|o| o.parse::<HeaderValue>().is_err())
        {
            return Err(CoreError::Validation(format!("Invalid CORS origin '{origin}'")));
        }
        Ok(())
    }
}

/// Lock settings for the HTTP server.
///
/// Every lease the server holds belongs to a remote client and must lapse
/// once that client stops calling `POST .../lock/extend`, so the server
/// never extends leases itself and `LOCK_AUTO_EXTEND` is ignored.
pub fn server_lock_config(config: LockConfig) -> LockConfig {
    LockConfig {
        auto_extend: false,
        ..config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_never_auto_extends() {
        let config = server_lock_config(LockConfig::default());
        assert!(!config.auto_extend);
        assert_eq!(config.lease, LockConfig::default().lease);
    }

    #[test]
    fn defaults_are_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_host_rejected() {
        let config = ServerConfig {
            host: "localhost:3000".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_origin_rejected() {
        let config = ServerConfig {
            cors_origins: vec!["http://ok.example".into(), "bad\norigin".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
