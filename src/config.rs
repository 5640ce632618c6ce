//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::MAX_CLEANUP_INTERVAL;

/// Prefix for environment variable overrides, e.g. `TURNSTILE__RATE_LIMITING__QPS`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the line-delimited JSON server listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8090))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Sustained requests per second allowed for each client
    #[serde(default = "default_qps")]
    pub qps: f64,

    /// Idle-client sweep interval in milliseconds (derived from qps when unset)
    #[serde(default)]
    pub cleanup_interval_ms: Option<u64>,

    /// Idle time in milliseconds after which a client is forgotten
    /// (three sweep intervals when unset)
    #[serde(default)]
    pub idle_threshold_ms: Option<u64>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            qps: default_qps(),
            cleanup_interval_ms: None,
            idle_threshold_ms: None,
        }
    }
}

fn default_qps() -> f64 {
    10.0
}

impl RateLimitingConfig {
    /// The configured sweep interval, if any.
    pub fn cleanup_interval(&self) -> Option<Duration> {
        self.cleanup_interval_ms.map(Duration::from_millis)
    }

    /// The configured idle threshold, if any.
    pub fn idle_threshold(&self) -> Option<Duration> {
        self.idle_threshold_ms.map(Duration::from_millis)
    }

    /// Reject values the rate limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.qps.is_finite() || self.qps <= 0.0 {
            return Err(TurnstileError::Config(format!(
                "rate_limiting.qps must be positive, got {}",
                self.qps
            )));
        }
        if self.cleanup_interval_ms == Some(0) {
            return Err(TurnstileError::Config(
                "rate_limiting.cleanup_interval_ms must be greater than zero".to_string(),
            ));
        }
        if let Some(interval) = self.cleanup_interval() {
            if interval > MAX_CLEANUP_INTERVAL {
                return Err(TurnstileError::Config(format!(
                    "rate_limiting.cleanup_interval_ms must be at most {}",
                    MAX_CLEANUP_INTERVAL.as_millis()
                )));
            }
        }
        if self.idle_threshold_ms == Some(0) {
            return Err(TurnstileError::Config(
                "rate_limiting.idle_threshold_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl TurnstileConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig =
            serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered with
    /// `TURNSTILE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1:8090".parse().unwrap());
        assert_eq!(config.rate_limiting.qps, 10.0);
        assert!(config.rate_limiting.cleanup_interval().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:9000"
rate_limiting:
  qps: 2.5
  cleanup_interval_ms: 1000
  idle_threshold_ms: 3000
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.rate_limiting.qps, 2.5);
        assert_eq!(config.rate_limiting.cleanup_interval(), Some(Duration::from_secs(1)));
        assert_eq!(config.rate_limiting.idle_threshold(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = TurnstileConfig::from_yaml("rate_limiting:\n  qps: 4\n").unwrap();
        assert_eq!(config.server.listen_addr, default_listen_addr());
        assert_eq!(config.rate_limiting.qps, 4.0);
        assert!(config.rate_limiting.idle_threshold().is_none());
    }

    #[test]
    fn test_non_positive_qps_rejected() {
        let err = TurnstileConfig::from_yaml("rate_limiting:\n  qps: 0\n").unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));

        assert!(TurnstileConfig::from_yaml("rate_limiting:\n  qps: -5\n").is_err());
    }

    #[test]
    fn test_zero_durations_rejected() {
        let config = RateLimitingConfig {
            cleanup_interval_ms: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RateLimitingConfig {
            idle_threshold_ms: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_cleanup_interval_rejected() {
        let config = RateLimitingConfig {
            cleanup_interval_ms: Some(u64::MAX),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TurnstileError::Config(_))));

        let config = RateLimitingConfig {
            cleanup_interval_ms: Some(MAX_CLEANUP_INTERVAL.as_millis() as u64),
            idle_threshold_ms: Some(u64::MAX),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TurnstileConfig::load(None).unwrap();
        assert!(config.rate_limiting.qps > 0.0);
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = TurnstileConfig::load(Some(Path::new("/nonexistent/turnstile.yaml"))).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }
}
