//! Hub configuration for development and production environments
//!
//! Pre-configured profiles plus a builder for custom settings. Every tunable
//! is a validated domain type; `validate` checks the cross-field constraints
//! the types cannot express alone.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::domain_types::{
    BackoffBaseMs, BackoffMaxMs, DispatchConcurrency, HeartbeatIntervalMs, MaxRetries,
    MissedHeartbeats, QueueCapacity, ReassignmentGraceMs, TaskTimeoutMs,
};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    #[error("I/O error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    #[error("serialization error: {source}")]
    SerializationError {
        #[from]
        source: serde_json::Error,
    },
}

/// Destination for the structured event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    /// Re-emit every event through `tracing` with structured fields
    Tracing,
    /// Persist every event to a SQLite database
    Sqlite { path: PathBuf },
}

/// Complete hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Address the agent/API listener binds to
    pub listen_address: String,

    // Dispatch
    pub max_concurrent_dispatches: DispatchConcurrency,
    pub default_task_timeout_ms: TaskTimeoutMs,
    pub default_max_retries: MaxRetries,
    pub retry_base_backoff_ms: BackoffBaseMs,
    pub retry_max_backoff_ms: BackoffMaxMs,

    // Agent liveness
    pub heartbeat_interval_ms: HeartbeatIntervalMs,
    pub missed_heartbeats_before_disconnect: MissedHeartbeats,
    pub agent_outbound_queue_size: QueueCapacity,
    pub reassignment_grace_ms: ReassignmentGraceMs,

    // Observability
    pub event_log_sinks: Vec<SinkConfig>,
}

impl HubConfig {
    /// Development profile: short timeouts, quick liveness feedback
    ///
    /// # Panics
    /// Panics if any of the hardcoded values are out of range for their
    /// domain types.
    #[must_use]
    pub fn development() -> Self {
        Self {
            listen_address: "127.0.0.1:7430".to_string(),
            max_concurrent_dispatches: DispatchConcurrency::try_new(4).unwrap(),
            default_task_timeout_ms: TaskTimeoutMs::try_new(30_000).unwrap(),
            default_max_retries: MaxRetries::try_new(2).unwrap(),
            retry_base_backoff_ms: BackoffBaseMs::try_new(100).unwrap(),
            retry_max_backoff_ms: BackoffMaxMs::try_new(5_000).unwrap(),
            heartbeat_interval_ms: HeartbeatIntervalMs::try_new(5_000).unwrap(),
            missed_heartbeats_before_disconnect: MissedHeartbeats::try_new(2).unwrap(),
            agent_outbound_queue_size: QueueCapacity::try_new(64).unwrap(),
            reassignment_grace_ms: ReassignmentGraceMs::try_new(2_000).unwrap(),
            event_log_sinks: vec![SinkConfig::Tracing],
        }
    }

    /// Production profile: patient timeouts, dispatch concurrency scaled to
    /// the host
    ///
    /// # Panics
    /// Panics if any of the hardcoded values are out of range for their
    /// domain types.
    #[must_use]
    pub fn production() -> Self {
        let dispatchers = (num_cpus::get() * 4).clamp(8, 128);
        Self {
            listen_address: "0.0.0.0:7430".to_string(),
            max_concurrent_dispatches: DispatchConcurrency::try_new(dispatchers).unwrap(),
            default_task_timeout_ms: TaskTimeoutMs::try_new(120_000).unwrap(),
            default_max_retries: MaxRetries::try_new(3).unwrap(),
            retry_base_backoff_ms: BackoffBaseMs::try_new(500).unwrap(),
            retry_max_backoff_ms: BackoffMaxMs::try_new(60_000).unwrap(),
            heartbeat_interval_ms: HeartbeatIntervalMs::try_new(15_000).unwrap(),
            missed_heartbeats_before_disconnect: MissedHeartbeats::try_new(2).unwrap(),
            agent_outbound_queue_size: QueueCapacity::try_new(512).unwrap(),
            reassignment_grace_ms: ReassignmentGraceMs::try_new(10_000).unwrap(),
            event_log_sinks: vec![SinkConfig::Tracing],
        }
    }

    /// Minimal profile for tests: tiny backoffs, near-instant liveness
    ///
    /// # Panics
    /// Panics if any of the hardcoded values are out of range for their
    /// domain types.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            listen_address: "127.0.0.1:0".to_string(),
            max_concurrent_dispatches: DispatchConcurrency::try_new(4).unwrap(),
            default_task_timeout_ms: TaskTimeoutMs::try_new(2_000).unwrap(),
            default_max_retries: MaxRetries::try_new(1).unwrap(),
            retry_base_backoff_ms: BackoffBaseMs::try_new(10).unwrap(),
            retry_max_backoff_ms: BackoffMaxMs::try_new(100).unwrap(),
            heartbeat_interval_ms: HeartbeatIntervalMs::try_new(200).unwrap(),
            missed_heartbeats_before_disconnect: MissedHeartbeats::try_new(2).unwrap(),
            agent_outbound_queue_size: QueueCapacity::try_new(16).unwrap(),
            reassignment_grace_ms: ReassignmentGraceMs::try_new(100).unwrap(),
            event_log_sinks: Vec::new(),
        }
    }

    /// Creates a configuration builder for custom settings
    #[must_use]
    pub fn builder() -> HubConfigBuilder {
        HubConfigBuilder::new()
    }

    /// Parses the configured listen address
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if the address is not a valid
    /// socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_address
            .parse()
            .map_err(|_| ConfigError::ValidationError {
                field: "listen_address".to_string(),
                reason: format!("not a socket address: {}", self.listen_address),
            })
    }

    /// Validates cross-field constraints
    ///
    /// # Errors
    /// Returns `ConfigError` if any configuration values are inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;

        if self.retry_base_backoff_ms.as_u64() > self.retry_max_backoff_ms.as_u64() {
            return Err(ConfigError::ValidationError {
                field: "retry_base_backoff_ms".to_string(),
                reason: "must not exceed retry_max_backoff_ms".to_string(),
            });
        }

        if self.retry_base_backoff_ms.as_u64() >= self.default_task_timeout_ms.as_u64() {
            return Err(ConfigError::ValidationError {
                field: "retry_base_backoff_ms".to_string(),
                reason: "must be shorter than default_task_timeout_ms".to_string(),
            });
        }

        let mut seen_sqlite: Option<&PathBuf> = None;
        for sink in &self.event_log_sinks {
            if let SinkConfig::Sqlite { path } = sink {
                if let Some(prev) = seen_sqlite {
                    if prev == path {
                        return Err(ConfigError::ValidationError {
                            field: "event_log_sinks".to_string(),
                            reason: format!("duplicate sqlite sink: {}", path.display()),
                        });
                    }
                }
                seen_sqlite = Some(path);
            }
        }

        Ok(())
    }

    /// Saves configuration to a JSON file
    ///
    /// # Errors
    /// Returns `ConfigError` on serialization or I/O failure.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Loads and validates configuration from a JSON file
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O failure, malformed JSON, or an invalid
    /// configuration.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::development()
    }
}

/// Builder for custom hub configurations
pub struct HubConfigBuilder {
    config: HubConfig,
}

impl HubConfigBuilder {
    /// Creates a new builder starting with development defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: HubConfig::development(),
        }
    }

    /// Sets the listen address
    #[must_use]
    pub fn listen_address(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_address = addr.into();
        self
    }

    /// Sets the dispatcher worker count
    #[must_use]
    pub fn max_concurrent_dispatches(mut self, count: DispatchConcurrency) -> Self {
        self.config.max_concurrent_dispatches = count;
        self
    }

    /// Sets the default task timeout
    #[must_use]
    pub fn default_task_timeout_ms(mut self, timeout: TaskTimeoutMs) -> Self {
        self.config.default_task_timeout_ms = timeout;
        self
    }

    /// Sets the default retry limit
    #[must_use]
    pub fn default_max_retries(mut self, retries: MaxRetries) -> Self {
        self.config.default_max_retries = retries;
        self
    }

    /// Sets the base retry backoff
    #[must_use]
    pub fn retry_base_backoff_ms(mut self, backoff: BackoffBaseMs) -> Self {
        self.config.retry_base_backoff_ms = backoff;
        self
    }

    /// Sets the retry backoff cap
    #[must_use]
    pub fn retry_max_backoff_ms(mut self, backoff: BackoffMaxMs) -> Self {
        self.config.retry_max_backoff_ms = backoff;
        self
    }

    /// Sets the heartbeat interval
    #[must_use]
    pub fn heartbeat_interval_ms(mut self, interval: HeartbeatIntervalMs) -> Self {
        self.config.heartbeat_interval_ms = interval;
        self
    }

    /// Sets the silent-interval tolerance before a liveness ping
    #[must_use]
    pub fn missed_heartbeats_before_disconnect(mut self, missed: MissedHeartbeats) -> Self {
        self.config.missed_heartbeats_before_disconnect = missed;
        self
    }

    /// Sets the per-agent outbound queue capacity
    #[must_use]
    pub fn agent_outbound_queue_size(mut self, capacity: QueueCapacity) -> Self {
        self.config.agent_outbound_queue_size = capacity;
        self
    }

    /// Sets the grace period for disconnected agent registrations
    #[must_use]
    pub fn reassignment_grace_ms(mut self, grace: ReassignmentGraceMs) -> Self {
        self.config.reassignment_grace_ms = grace;
        self
    }

    /// Replaces the configured event sinks
    #[must_use]
    pub fn event_log_sinks(mut self, sinks: Vec<SinkConfig>) -> Self {
        self.config.event_log_sinks = sinks;
        self
    }

    /// Builds and validates the configuration
    ///
    /// # Errors
    /// Returns `ConfigError` if the assembled configuration is inconsistent.
    pub fn build(self) -> Result<HubConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for HubConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn development_config_is_valid() {
        assert!(HubConfig::development().validate().is_ok());
    }

    #[test]
    fn production_config_is_valid() {
        assert!(HubConfig::production().validate().is_ok());
    }

    #[test]
    fn testing_config_is_valid() {
        assert!(HubConfig::testing().validate().is_ok());
    }

    #[test]
    fn builder_overrides_fields() {
        let config = HubConfig::builder()
            .listen_address("127.0.0.1:9999")
            .default_max_retries(MaxRetries::try_new(5).unwrap())
            .build()
            .unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:9999");
        assert_eq!(config.default_max_retries.as_u32(), 5);
    }

    #[test]
    fn backoff_base_above_cap_is_rejected() {
        let result = HubConfig::builder()
            .retry_base_backoff_ms(BackoffBaseMs::try_new(5_000).unwrap())
            .retry_max_backoff_ms(BackoffMaxMs::try_new(1_000).unwrap())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn bad_listen_address_is_rejected() {
        let result = HubConfig::builder().listen_address("not-an-address").build();
        assert!(result.is_err());
    }

    #[test]
    fn config_file_round_trip() {
        let config = HubConfig::development();
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();
        let loaded = HubConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.listen_address, loaded.listen_address);
        assert_eq!(
            config.default_task_timeout_ms,
            loaded.default_task_timeout_ms
        );
        assert_eq!(config.event_log_sinks, loaded.event_log_sinks);
    }
}
