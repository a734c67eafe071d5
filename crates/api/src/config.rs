//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::{EngineConfig, RetryPolicy};

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Server and engine configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `pretty` or `json` (default: `pretty`)
/// - `DATABASE_URL`: Postgres connection string; in-memory stores when unset
/// - `STEP_MAX_ATTEMPTS`: tries per step for transient failures (default: `3`)
/// - `STEP_BACKOFF_BASE_MS`: first retry delay (default: `200`)
/// - `STEP_BACKOFF_MAX_MS`: cap on any retry delay (default: `10000`)
/// - `SWEEPER_INTERVAL_MS`: timeout sweeper period (default: `1000`)
/// - `SWEEPER_BATCH_SIZE`: max waits fired per sweep (default: `100`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub step_max_attempts: u32,
    pub step_backoff_base: Duration,
    pub step_backoff_max: Duration,
    pub sweeper_interval: Duration,
    pub sweeper_batch_size: usize,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`. Unparseable values fall back to
    /// the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            step_max_attempts: parsed("STEP_MAX_ATTEMPTS")
                .map(|n| n.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(defaults.step_max_attempts),
            step_backoff_base: parsed("STEP_BACKOFF_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.step_backoff_base),
            step_backoff_max: parsed("STEP_BACKOFF_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.step_backoff_max),
            sweeper_interval: parsed("SWEEPER_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweeper_interval),
            sweeper_batch_size: parsed("SWEEPER_BATCH_SIZE")
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .unwrap_or(defaults.sweeper_batch_size),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Engine settings derived from this configuration. Compensations use the
    /// same bounded policy as forward steps.
    pub fn engine_config(&self) -> EngineConfig {
        let retry = RetryPolicy::new(
            self.step_max_attempts,
            self.step_backoff_base,
            self.step_backoff_max,
        );
        EngineConfig {
            retry,
            compensation_retry: retry,
            sweeper_interval: self.sweeper_interval,
            sweeper_batch_size: self.sweeper_batch_size,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            step_max_attempts: 3,
            step_backoff_base: Duration::from_millis(200),
            step_backoff_max: Duration::from_millis(10_000),
            sweeper_interval: Duration::from_millis(1_000),
            sweeper_batch_size: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = from_pairs(&[]);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.database_url.is_none());
        assert_eq!(config.step_max_attempts, 3);
        assert_eq!(config.sweeper_batch_size, 100);
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("PORT", "8080"),
            ("LOG_FORMAT", "json"),
            ("DATABASE_URL", "postgres://localhost/workflows"),
            ("STEP_MAX_ATTEMPTS", "5"),
            ("STEP_BACKOFF_BASE_MS", "50"),
            ("SWEEPER_INTERVAL_MS", "250"),
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/workflows"));
        assert_eq!(config.step_max_attempts, 5);
        assert_eq!(config.step_backoff_base, Duration::from_millis(50));
        assert_eq!(config.sweeper_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_pairs(&[
            ("PORT", "http"),
            ("STEP_MAX_ATTEMPTS", "-1"),
            ("SWEEPER_BATCH_SIZE", "0"),
            ("DATABASE_URL", ""),
        ]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.step_max_attempts, 3);
        assert_eq!(config.sweeper_batch_size, 100);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_engine_config() {
        let engine = from_pairs(&[("STEP_MAX_ATTEMPTS", "4")]).engine_config();
        assert_eq!(engine.retry.max_attempts, 4);
        assert_eq!(engine.retry.initial_delay, Duration::from_millis(200));
        assert_eq!(engine.compensation_retry, engine.retry);
        assert_eq!(engine.sweeper_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }
}
