//! Node configuration.
//!
//! Values are layered: built-in defaults, then an optional YAML or TOML
//! file, then `FLOCK__*` environment variables (`__` separates sections,
//! e.g. `FLOCK__COALESCE__HEADER_VALUE`). Command-line flags are applied on
//! top by the binary.

use flock_core::{CoalescePolicy, CoalescerConfig, PoolConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the Flock node.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Request coalescing settings.
    pub coalesce: CoalesceConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Demo endpoint settings.
    pub demo: DemoConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub listen_addr: SocketAddr,
    /// Time allowed to receive a request body.
    pub read_timeout_ms: u64,
    /// Time allowed to produce a response.
    pub write_timeout_ms: u64,
    /// Time open connections get to drain on shutdown.
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9091)),
            read_timeout_ms: 3_000,
            write_timeout_ms: 3_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl ServerConfig {
    /// Request body read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Whole-request timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Request coalescing settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoalesceConfig {
    /// Header a request must carry to be coalesced. Empty disables coalescing.
    pub header_name: String,
    /// Required value of `header_name`. Empty disables coalescing.
    pub header_value: String,
    /// Maximum time a duplicate request waits for the original.
    pub follower_timeout_ms: u64,
    /// Maximum number of distinct in-flight requests tracked.
    pub max_in_flight: usize,
    /// Largest request body buffered for fingerprinting.
    pub max_body_bytes: usize,
    /// Largest response buffered for replay.
    pub max_response_bytes: usize,
    /// Idle call records kept for reuse.
    pub call_pool_idle: usize,
    /// Idle body buffers kept for reuse.
    pub buffer_pool_idle: usize,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        let core = CoalescerConfig::default();
        Self {
            header_name: "x-fly".to_string(),
            header_value: "abc".to_string(),
            follower_timeout_ms: core.follower_timeout.as_millis() as u64,
            max_in_flight: core.max_in_flight,
            max_body_bytes: core.max_body_bytes,
            max_response_bytes: core.max_response_bytes,
            call_pool_idle: core.call_pool.max_idle,
            buffer_pool_idle: core.buffer_pool.max_idle,
        }
    }
}

impl CoalesceConfig {
    /// The admission policy.
    pub fn policy(&self) -> CoalescePolicy {
        CoalescePolicy::header(&self.header_name, &self.header_value)
    }

    /// Settings for the coalescing group.
    pub fn coalescer_config(&self) -> CoalescerConfig {
        CoalescerConfig {
            follower_timeout: Duration::from_millis(self.follower_timeout_ms),
            max_in_flight: self.max_in_flight,
            max_body_bytes: self.max_body_bytes,
            max_response_bytes: self.max_response_bytes,
            call_pool: PoolConfig {
                max_idle: self.call_pool_idle,
            },
            buffer_pool: PoolConfig {
                max_idle: self.buffer_pool_idle,
            },
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Output format (`pretty` or `json`).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Demo endpoint settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Simulated work done by the greet handler.
    pub greet_delay_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self { greet_delay_ms: 20 }
    }
}

impl Config {
    /// Loads configuration from defaults, `path` (if it exists) and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("FLOCK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make the node misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.write_timeout_ms must be positive".into(),
            ));
        }
        if self.server.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.read_timeout_ms must be positive".into(),
            ));
        }
        if self.coalesce.follower_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "coalesce.follower_timeout_ms must be positive".into(),
            ));
        }
        if self.coalesce.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "coalesce.max_in_flight must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.write_timeout(), Duration::from_secs(3));
        assert_eq!(config.server.shutdown_grace(), Duration::from_secs(5));
        assert!(config.coalesce.policy().is_enabled());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let path = std::env::temp_dir().join(format!("flock-config-{}.yaml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "server:\n  listen_addr: \"0.0.0.0:8080\"\ncoalesce:\n  header_name: abc\n  header_value: abcabc\n  follower_timeout_ms: 250"
        )
        .unwrap();
        drop(file);

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.coalesce.policy(), CoalescePolicy::header("abc", "abcabc"));
        assert_eq!(
            config.coalesce.coalescer_config().follower_timeout,
            Duration::from_millis(250)
        );
        // Untouched sections keep their defaults.
        assert_eq!(config.demo.greet_delay_ms, 20);
        assert_eq!(config.server.read_timeout_ms, 3_000);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/flock.yaml"))).unwrap();
        assert_eq!(config.server.listen_addr, ServerConfig::default().listen_addr);
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let mut config = Config::default();
        config.coalesce.follower_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
