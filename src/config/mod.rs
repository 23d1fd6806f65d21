//! # Queue Configuration
//!
//! Settings for the transport, the session lifecycle manager, the dispatcher and
//! the sweeper, plus the queue route table.
//!
//! ## Sources
//!
//! Merged in order, later sources winning:
//!
//! 1. Built-in defaults
//! 2. TOML file (`TASKER_CONFIG_PATH`, else `config/tasker-queue.toml` when present)
//! 3. Environment overrides `TASKER__<SECTION>__<KEY>`, e.g. `TASKER__DISPATCHER__MAX_CONCURRENT_WORKERS=8`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_session_queue::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let workers = manager.config().dispatcher.max_concurrent_workers;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

use crate::constants::{defaults, transport as limits};

/// Root configuration structure mirroring tasker-queue.toml
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TaskerQueueConfig {
    pub transport: TransportConfig,
    pub lifecycle: LifecycleConfig,
    pub dispatcher: DispatcherConfig,
    pub sweeper: SweeperConfig,
    pub routes: Vec<QueueRoute>,
}

/// Which transport implementation backs the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportBackend {
    #[default]
    Postgres,
    InMemory,
}

impl fmt::Display for TransportBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::InMemory => write!(f, "in_memory"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub backend: TransportBackend,
    /// Required for the postgres backend; `DATABASE_URL` is used when unset
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Poll interval of a waiting receive on backends without push notification
    pub poll_interval_ms: u64,
    pub max_body_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: TransportBackend::default(),
            database_url: None,
            max_connections: defaults::MAX_CONNECTIONS,
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
            max_body_bytes: limits::MAX_MESSAGE_BODY_BYTES,
        }
    }
}

impl TransportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn database_url(&self) -> Option<String> {
        self.database_url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
    }
}

/// Session strategy named in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    TimeBoxed,
    PersistentReuse,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub default_strategy: StrategyKind,
    pub session_lifetime_seconds: u64,
    /// Passed through to `open`
    pub encryption: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_strategy: StrategyKind::default(),
            session_lifetime_seconds: defaults::SESSION_LIFETIME_SECONDS,
            encryption: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Activation switch; a disabled dispatcher starts no workers
    pub enabled: bool,
    pub max_concurrent_workers: usize,
    pub receive_wait_ms: u64,
    pub error_backoff_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_workers: defaults::MAX_CONCURRENT_WORKERS,
            receive_wait_ms: defaults::RECEIVE_WAIT_MS,
            error_backoff_ms: defaults::ERROR_BACKOFF_MS,
        }
    }
}

impl DispatcherConfig {
    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::SWEEP_BATCH_SIZE,
        }
    }
}

/// Conversation route for one logical queue
///
/// Producers open conversations from `initiator_service` to `target_service`;
/// the transport binds `target_service` to the queue workers read.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct QueueRoute {
    pub queue_name: String,
    pub initiator_service: String,
    pub target_service: String,
    pub contract: String,
}

impl QueueRoute {
    pub fn new(
        queue_name: impl Into<String>,
        initiator_service: impl Into<String>,
        target_service: impl Into<String>,
        contract: impl Into<String>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            initiator_service: initiator_service.into(),
            target_service: target_service.into(),
            contract: contract.into(),
        }
    }

    /// Queue the initiator side receives system messages on
    pub fn reply_queue(&self) -> String {
        format!("{}_replies", self.queue_name)
    }
}

impl TaskerQueueConfig {
    /// Fail fast on values no deployment can run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.dispatcher.max_concurrent_workers == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.max_concurrent_workers",
                "0",
                "at least one worker is required",
            ));
        }
        if self.lifecycle.session_lifetime_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "lifecycle.session_lifetime_seconds",
                "0",
                "time-boxed sessions need a positive lifetime",
            ));
        }
        if self.transport.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "transport.max_connections",
                "0",
                "the pool needs at least one connection",
            ));
        }
        if self.transport.max_body_bytes == 0 {
            return Err(ConfigurationError::invalid_value(
                "transport.max_body_bytes",
                "0",
                "message bodies must be allowed to carry a claim-check",
            ));
        }
        if self.sweeper.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "sweeper.batch_size",
                "0",
                "sweep batches must be positive",
            ));
        }
        if self.transport.backend == TransportBackend::Postgres && self.transport.database_url().is_none() {
            return Err(ConfigurationError::missing_required_field(
                "transport.database_url",
                "postgres transport (or set DATABASE_URL)",
            ));
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            for (field, value) in [
                ("queue_name", &route.queue_name),
                ("initiator_service", &route.initiator_service),
                ("target_service", &route.target_service),
                ("contract", &route.contract),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigurationError::missing_required_field(
                        format!("routes.{field}"),
                        format!("route for queue '{}'", route.queue_name),
                    ));
                }
            }
            if route.initiator_service == route.target_service {
                return Err(ConfigurationError::validation_error(format!(
                    "route '{}' uses service '{}' on both sides",
                    route.queue_name, route.target_service
                )));
            }
            if !seen.insert(route.queue_name.as_str()) {
                return Err(ConfigurationError::validation_error(format!(
                    "queue '{}' is routed more than once",
                    route.queue_name
                )));
            }
        }

        Ok(())
    }

    /// Route for a queue name
    pub fn route(&self, queue_name: &str) -> Option<&QueueRoute> {
        self.routes.iter().find(|r| r.queue_name == queue_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_memory_config() -> TaskerQueueConfig {
        let mut config = TaskerQueueConfig::default();
        config.transport.backend = TransportBackend::InMemory;
        config.routes.push(QueueRoute::new(
            "orders",
            "orders_producer",
            "orders_worker",
            "task_contract",
        ));
        config
    }

    #[test]
    fn test_defaults_validate() {
        let config = in_memory_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatcher.max_concurrent_workers, 4);
        assert_eq!(config.lifecycle.session_lifetime_seconds, 60);
        assert_eq!(config.lifecycle.default_strategy, StrategyKind::TimeBoxed);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = in_memory_config();
        config.dispatcher.max_concurrent_workers = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_workers"));
    }

    #[test]
    fn test_zero_lifetime_rejected() {
        let mut config = in_memory_config();
        config.lifecycle.session_lifetime_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let mut config = in_memory_config();
        config.routes.push(QueueRoute::new("orders", "a", "b", "c"));
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_self_route_rejected() {
        let mut config = in_memory_config();
        config.routes = vec![QueueRoute::new("orders", "svc", "svc", "contract")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_route_lookup() {
        let config = in_memory_config();
        assert_eq!(config.route("orders").unwrap().target_service, "orders_worker");
        assert!(config.route("missing").is_none());
        assert_eq!(config.route("orders").unwrap().reply_queue(), "orders_replies");
    }
}
