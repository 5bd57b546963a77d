use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the tally service.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Aggregation cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Durable event store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Periodic flush job configuration.
    #[serde(default)]
    pub flush: FlushConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Aggregation cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379").
    #[serde(default)]
    pub endpoint: String,

    /// Expiry applied to every aggregation cell and dirty-set refresh.
    /// Bounds how long unflushed data survives. Default: 24h.
    #[serde(default = "default_key_ttl", with = "humantime_serde")]
    pub key_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            key_ttl: default_key_ttl(),
        }
    }
}

/// Durable event store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Counter-increment endpoint URL.
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_store_timeout(),
        }
    }
}

/// Periodic flush job configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FlushConfig {
    /// Delay before the first flush pass. Default: 2s.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Interval between flush passes. Default: 5s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Forward the notification flag to the durable store on flush.
    /// Default: true.
    #[serde(default = "default_true")]
    pub send_notifications: bool,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            interval: default_flush_interval(),
            send_notifications: true,
        }
    }
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Enable the health metrics server. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. ":port" binds all interfaces. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.cache.endpoint.is_empty() {
            bail!("cache.endpoint is required");
        }

        if self.cache.key_ttl.is_zero() {
            bail!("cache.key_ttl must be positive");
        }

        if self.store.endpoint.is_empty() {
            bail!("store.endpoint is required");
        }

        if self.store.timeout.is_zero() {
            bail!("store.timeout must be positive");
        }

        if self.flush.interval.is_zero() {
            bail!("flush.interval must be positive");
        }

        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_key_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        "cache:\n  endpoint: redis://localhost:6379\nstore:\n  endpoint: http://localhost:8080/api/v2/usage\n"
    }

    #[test]
    fn test_minimal_config_defaults() {
        let cfg: Config = serde_yaml::from_str(minimal_yaml()).expect("should parse");
        cfg.validate().expect("should validate");

        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.cache.key_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.flush.initial_delay, Duration::from_secs(2));
        assert_eq!(cfg.flush.interval, Duration::from_secs(5));
        assert!(cfg.flush.send_notifications);
        assert!(cfg.health.enabled);
        assert_eq!(cfg.health.addr, ":9090");
    }

    #[test]
    fn test_humantime_durations() {
        let yaml = "cache:\n  endpoint: redis://localhost:6379\n  key_ttl: 12h\nstore:\n  endpoint: http://localhost:8080\nflush:\n  initial_delay: 500ms\n  interval: 30s\n";
        let cfg: Config = serde_yaml::from_str(yaml).expect("should parse");

        assert_eq!(cfg.cache.key_ttl, Duration::from_secs(12 * 60 * 60));
        assert_eq!(cfg.flush.initial_delay, Duration::from_millis(500));
        assert_eq!(cfg.flush.interval, Duration::from_secs(30));
    }

    #[test]
    fn test_validate_missing_cache_endpoint() {
        let cfg: Config = serde_yaml::from_str("store:\n  endpoint: http://localhost:8080\n")
            .expect("should parse");
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("cache.endpoint"));
    }

    #[test]
    fn test_validate_missing_store_endpoint() {
        let cfg: Config = serde_yaml::from_str("cache:\n  endpoint: redis://localhost:6379\n")
            .expect("should parse");
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("store.endpoint"));
    }

    #[test]
    fn test_validate_zero_interval() {
        let yaml = "cache:\n  endpoint: redis://localhost:6379\nstore:\n  endpoint: http://localhost:8080\nflush:\n  interval: 0s\n";
        let cfg: Config = serde_yaml::from_str(yaml).expect("should parse");
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("flush.interval"));
    }
}
