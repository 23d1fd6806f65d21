//! # Queue System Bootstrap
//!
//! Builds the transport named in configuration, binds every route's services,
//! and hands out the producer, dispatcher and sweeper components wired to it.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tasker_session_queue::bootstrap::QueueSystem;
//! use tasker_session_queue::config::ConfigManager;
//! use tasker_session_queue::dispatch::TaskHandlerRegistry;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let system = QueueSystem::from_config(manager.config().clone()).await?;
//!
//! let dispatcher = system.dispatcher("orders", Arc::new(TaskHandlerRegistry::new()))?;
//! dispatcher.start();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{TaskerQueueConfig, TransportBackend};
use crate::dispatch::{CleanupSweeper, Dispatcher, SessionClosePolicy, TaskHandlerRegistry};
use crate::error::{TaskerError, TaskerResult};
use crate::session::{RouteTable, SessionLifecycleManager, SessionRecord, SessionStrategy};
use crate::transport::{BrokerTransaction, InMemoryBroker, Transport, TransportTransaction};

/// Upper bound on endpoints counted by [`QueueSystem::status`]
const STATUS_ENDPOINT_LIMIT: usize = 10_000;

/// Snapshot of transport-side state for operators
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub transport: String,
    pub routes: Vec<String>,
    pub open_endpoints: usize,
    pub session_records: Vec<SessionRecord>,
}

/// Configured transport plus the components built on it
pub struct QueueSystem {
    config: Arc<TaskerQueueConfig>,
    transport: Arc<dyn Transport>,
    lifecycle: Arc<SessionLifecycleManager>,
}

impl std::fmt::Debug for QueueSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSystem")
            .field("transport", &self.transport.transport_type())
            .field("routes", &self.config.routes.len())
            .finish()
    }
}

impl QueueSystem {
    /// Validate configuration, connect the transport and register routes
    pub async fn from_config(config: TaskerQueueConfig) -> TaskerResult<Self> {
        config.validate()?;
        info!(
            backend = %config.transport.backend,
            routes = config.routes.len(),
            "🚀 BOOTSTRAP: Starting queue system"
        );

        let transport = build_transport(&config).await?;
        let system = Self::with_transport(config, transport);

        info!(
            transport = system.transport.transport_type(),
            "✅ BOOTSTRAP: Queue system ready"
        );
        Ok(system)
    }

    /// Wire components over an already prepared transport
    ///
    /// Route services must already be bound on `transport`.
    pub fn with_transport(config: TaskerQueueConfig, transport: Arc<dyn Transport>) -> Self {
        let routes = Arc::new(RouteTable::new(config.routes.iter().cloned()));
        let lifecycle = Arc::new(SessionLifecycleManager::new(
            transport.clone(),
            routes,
            config.lifecycle.encryption,
            config.transport.max_body_bytes,
        ));
        Self {
            config: Arc::new(config),
            transport,
            lifecycle,
        }
    }

    pub fn config(&self) -> &TaskerQueueConfig {
        &self.config
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Producer entry point
    pub fn lifecycle(&self) -> Arc<SessionLifecycleManager> {
        self.lifecycle.clone()
    }

    /// Strategy producers use unless they pick one explicitly
    pub fn default_strategy(&self) -> SessionStrategy {
        SessionStrategy::from_config(&self.config.lifecycle)
    }

    /// Worker pool for a routed queue. Time-boxed sessions are closed once
    /// drained; persistent ones stay open for reuse.
    pub fn dispatcher(
        &self,
        queue_name: &str,
        registry: Arc<TaskHandlerRegistry>,
    ) -> TaskerResult<Arc<Dispatcher>> {
        let route = self.lifecycle.routes().get(queue_name)?;
        Ok(Arc::new(Dispatcher::new(
            self.transport.clone(),
            registry,
            route.queue_name.clone(),
            SessionClosePolicy::CloseWhenDrained,
            self.config.dispatcher.clone(),
        )))
    }

    /// Worker pool for a routed queue's reply queue, where producers receive
    /// end-of-conversation and expiry notices
    pub fn reply_dispatcher(&self, queue_name: &str) -> TaskerResult<Arc<Dispatcher>> {
        let route = self.lifecycle.routes().get(queue_name)?;
        Ok(Arc::new(Dispatcher::for_replies(
            self.transport.clone(),
            route.reply_queue(),
            self.config.dispatcher.clone(),
        )))
    }

    pub fn sweeper(&self) -> CleanupSweeper {
        CleanupSweeper::new(self.transport.clone(), self.config.sweeper.batch_size)
    }

    /// Open endpoints and registry rows as currently committed
    pub async fn status(&self) -> TaskerResult<SystemStatus> {
        let mut tx = self
            .transport
            .begin()
            .await
            .map_err(|e| TaskerError::transport("begin", e))?;
        let result = self.read_status(&mut *tx).await;
        if let Err(e) = tx.rollback().await {
            warn!(error = %e, "⚠️ BOOTSTRAP: Status rollback failed");
        }
        result
    }

    async fn read_status(&self, tx: &mut dyn BrokerTransaction) -> TaskerResult<SystemStatus> {
        let now = tx
            .current_time()
            .await
            .map_err(|e| TaskerError::transport("current_time", e))?;
        let open_endpoints = tx
            .list_endpoints(now, STATUS_ENDPOINT_LIMIT)
            .await
            .map_err(|e| TaskerError::transport("list_endpoints", e))?
            .len();

        let queues = SessionRecord::list_queue_names(&mut *tx)
            .await
            .map_err(|e| TaskerError::transport("list_session_queues", e))?;
        let mut session_records = Vec::with_capacity(queues.len());
        for queue_name in queues {
            if let Some(record) = SessionRecord::find_for_update(&mut *tx, &queue_name)
                .await
                .map_err(|e| TaskerError::transport("lock_session_record", e))?
            {
                session_records.push(record);
            }
        }

        Ok(SystemStatus {
            transport: self.transport.transport_type().to_string(),
            routes: self.config.routes.iter().map(|r| r.queue_name.clone()).collect(),
            open_endpoints,
            session_records,
        })
    }
}

async fn build_transport(config: &TaskerQueueConfig) -> TaskerResult<Arc<dyn Transport>> {
    match config.transport.backend {
        TransportBackend::InMemory => {
            let broker = InMemoryBroker::with_max_body_bytes(config.transport.max_body_bytes);
            for route in &config.routes {
                broker.ensure_route(route);
            }
            Ok(Arc::new(broker))
        }
        #[cfg(feature = "postgres")]
        TransportBackend::Postgres => {
            let broker = crate::transport::PgBroker::connect(&config.transport)
                .await
                .map_err(|e| TaskerError::transport("connect", e))?;
            broker
                .migrate()
                .await
                .map_err(|e| TaskerError::transport("migrate", e))?;
            for route in &config.routes {
                broker
                    .ensure_route(route)
                    .await
                    .map_err(|e| TaskerError::transport("ensure_route", e))?;
            }
            Ok(Arc::new(broker))
        }
        #[cfg(not(feature = "postgres"))]
        TransportBackend::Postgres => Err(crate::config::ConfigurationError::invalid_value(
            "transport.backend",
            "postgres",
            "built without the `postgres` feature",
        )
        .into()),
    }
}
