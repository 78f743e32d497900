//! Broker and agent configuration.
//!
//! Bounded numerics are nutype-validated so an out-of-range value is
//! unrepresentable once configuration is constructed. `development()` and
//! `production()` presets cover the two deployment shapes.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} - {reason}")]
    Validation { field: String, reason: String },
}

/// Gateway heartbeat period in seconds. Two consecutive misses mark an
/// agent offline.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 300),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 15
)]
pub struct HeartbeatIntervalSecs(u64);

impl HeartbeatIntervalSecs {
    /// Converts to a `Duration`.
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.into_inner())
    }
}

/// Stream-accumulator flush period in milliseconds.
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 60_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 1_500
)]
pub struct FlushIntervalMs(u64);

impl FlushIntervalMs {
    /// Converts to a `Duration`.
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Offline-queue entry time-to-live in seconds.
#[nutype(
    validate(greater_or_equal = 60, less_or_equal = 604_800),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 86_400
)]
pub struct OfflineTtlSecs(u64);

impl OfflineTtlSecs {
    /// Converts to a `Duration`.
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.into_inner())
    }
}

/// Circuit-breaker failure percentage that opens the circuit.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 50
)]
pub struct FailurePercentageThreshold(u8);

/// Upper bound on live progress trackers before LRU eviction.
#[nutype(
    validate(greater_or_equal = 8, less_or_equal = 100_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 1_000
)]
pub struct MaxProgressTrackers(usize);

impl MaxProgressTrackers {
    /// The bound as a plain usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Notifier retry attempt ceiling.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 5
)]
pub struct MaxSendAttempts(u32);

impl MaxSendAttempts {
    /// The bound as a plain u32.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Circuit-breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_percentage_threshold: FailurePercentageThreshold,
    pub minimum_request_count: usize,
    pub window_size_ms: u64,
    pub recovery_timeout_ms: u64,
    pub success_threshold_count: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_percentage_threshold: FailurePercentageThreshold::default(),
            minimum_request_count: 10,
            window_size_ms: 600_000,
            recovery_timeout_ms: 60_000,
            success_threshold_count: 3,
        }
    }
}

/// Everything the broker process needs to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Gateway (agent WebSocket) bind address.
    pub gateway_addr: String,
    /// Admin HTTP bind address.
    pub admin_addr: String,
    /// SQLite database file path.
    pub database_path: String,

    pub heartbeat_interval: HeartbeatIntervalSecs,
    pub flush_interval: FlushIntervalMs,

    pub offline_ttl: OfflineTtlSecs,
    /// Seconds between offline-queue drain ticks.
    pub drain_interval_secs: u64,
    /// Audit retention for delivered offline-queue rows, seconds.
    pub delivered_retention_secs: u64,

    pub breaker: BreakerConfig,

    pub max_progress_trackers: MaxProgressTrackers,
    /// Progress tracker TTL, seconds.
    pub progress_ttl_secs: u64,
    /// Seconds between progress/workflow TTL sweeps.
    pub sweep_interval_secs: u64,

    pub notifier_max_attempts: MaxSendAttempts,
    /// Base delay for notifier backoff, milliseconds.
    pub notifier_base_delay_ms: u64,
    /// Cap on the in-memory failed-notification queue.
    pub failed_notification_cap: usize,

    /// Default requests-per-minute per chat user (overridable per user).
    pub rate_limit_per_minute: u32,

    /// How long the sync orchestrator waits for the restart edge pair.
    pub restart_timeout_secs: u64,
    /// Safety timeout for a deploy result.
    pub deploy_timeout_secs: u64,
    /// Retention of terminal workflows before sweep, seconds.
    pub workflow_retention_secs: u64,

    /// Session row lifetime, seconds.
    pub session_ttl_secs: u64,

    /// Hard force-exit budget for graceful shutdown, seconds.
    pub shutdown_grace_secs: u64,
}

impl BrokerConfig {
    /// Development preset: short intervals, throwaway database.
    #[must_use]
    pub fn development() -> Self {
        Self {
            gateway_addr: "127.0.0.1:7800".to_string(),
            admin_addr: "127.0.0.1:7801".to_string(),
            database_path: "./data/foreman-dev.db".to_string(),
            heartbeat_interval: HeartbeatIntervalSecs::try_new(5).unwrap(),
            flush_interval: FlushIntervalMs::try_new(500).unwrap(),
            offline_ttl: OfflineTtlSecs::try_new(3_600).unwrap(),
            drain_interval_secs: 5,
            delivered_retention_secs: 3_600,
            breaker: BreakerConfig {
                minimum_request_count: 4,
                window_size_ms: 60_000,
                recovery_timeout_ms: 10_000,
                ..BreakerConfig::default()
            },
            max_progress_trackers: MaxProgressTrackers::try_new(100).unwrap(),
            progress_ttl_secs: 600,
            sweep_interval_secs: 30,
            notifier_max_attempts: MaxSendAttempts::try_new(3).unwrap(),
            notifier_base_delay_ms: 100,
            failed_notification_cap: 100,
            rate_limit_per_minute: 60,
            restart_timeout_secs: 30,
            deploy_timeout_secs: 60,
            workflow_retention_secs: 600,
            session_ttl_secs: 3_600,
            shutdown_grace_secs: 10,
        }
    }

    /// Production preset.
    #[must_use]
    pub fn production() -> Self {
        Self {
            gateway_addr: "0.0.0.0:7800".to_string(),
            admin_addr: "127.0.0.1:7801".to_string(),
            database_path: "./data/foreman.db".to_string(),
            heartbeat_interval: HeartbeatIntervalSecs::default(),
            flush_interval: FlushIntervalMs::default(),
            offline_ttl: OfflineTtlSecs::default(),
            drain_interval_secs: 30,
            delivered_retention_secs: 7 * 86_400,
            breaker: BreakerConfig::default(),
            max_progress_trackers: MaxProgressTrackers::default(),
            progress_ttl_secs: 3_600,
            sweep_interval_secs: 300,
            notifier_max_attempts: MaxSendAttempts::default(),
            notifier_base_delay_ms: 500,
            failed_notification_cap: 500,
            rate_limit_per_minute: 10,
            restart_timeout_secs: 120,
            deploy_timeout_secs: 300,
            workflow_retention_secs: 3_600,
            session_ttl_secs: 24 * 3_600,
            shutdown_grace_secs: 30,
        }
    }

    /// Cross-field validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway_addr == self.admin_addr {
            return Err(ConfigError::Validation {
                field: "admin_addr".to_string(),
                reason: "gateway and admin surfaces must bind distinct addresses".to_string(),
            });
        }
        if self.database_path.trim().is_empty() {
            return Err(ConfigError::Validation {
                field: "database_path".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.drain_interval_secs == 0 {
            return Err(ConfigError::Validation {
                field: "drain_interval_secs".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.breaker.minimum_request_count == 0 {
            return Err(ConfigError::Validation {
                field: "breaker.minimum_request_count".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Everything the worker process needs to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Broker gateway URL, e.g. `ws://broker:7800`.
    pub broker_url: String,
    /// Bearer api-key presented at handshake.
    pub api_key: String,
    /// Turn ceiling per SDK invocation.
    pub max_turns_per_invocation: u32,
    /// Default continuation budget when the submit frame omits one.
    pub default_max_continuations: u32,
    /// Global wall-clock budget per task, seconds.
    pub invocation_timeout_secs: u64,
    /// Attachment write retry ceiling.
    pub attachment_retry_attempts: u32,
    /// Directory for task-scoped attachment files.
    pub attachment_dir: String,
    /// Seconds between agent-status reports.
    pub status_interval_secs: u64,
    /// Shell command the deploy runner executes in the project directory.
    pub deploy_command: String,
}

impl AgentConfig {
    /// Reasonable worker defaults; `broker_url` and `api_key` always come
    /// from flags or environment.
    #[must_use]
    pub fn new(broker_url: String, api_key: String) -> Self {
        Self {
            broker_url,
            api_key,
            max_turns_per_invocation: 50,
            default_max_continuations: 3,
            invocation_timeout_secs: 3_600,
            attachment_retry_attempts: 3,
            attachment_dir: std::env::temp_dir()
                .join("foreman-attachments")
                .to_string_lossy()
                .into_owned(),
            status_interval_secs: 30,
            deploy_command: "npm run deploy".to_string(),
        }
    }
}
