//! # Session Lifecycle Manager
//!
//! Hands producers a conversation handle to send on, choosing between two
//! strategies:
//!
//! - **Time-boxed**: a fresh conversation per enqueue, bounded by a lifetime
//!   so the transport retires it even if nobody closes it. Nothing persisted.
//! - **Persistent reuse**: one long-lived conversation per queue name, recorded
//!   in the session registry and shared by every producer of that queue.
//!
//! Every registry read/write and the sends that follow share the caller's
//! transaction. A first send therefore creates the conversation, the registry
//! row and the resolved peer handle atomically, or none of them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use super::registry::SessionRecord;
use crate::config::{LifecycleConfig, QueueRoute, StrategyKind};
use crate::error::{TaskerError, TaskerResult};
use crate::logging::log_session_operation;
use crate::messaging::TaskEnvelope;
use crate::transport::{
    BrokerTransaction, CloseMode, EndpointHandle, OpenRequest, SessionLifetime, Transport,
    TransportError, TransportTransaction,
};

/// How a producer obtains its conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStrategy {
    /// New conversation per enqueue, retired by the transport after `lifetime`
    TimeBoxed { lifetime: Duration },
    /// One registry-tracked conversation per queue name
    PersistentReuse,
}

impl SessionStrategy {
    pub fn time_boxed_seconds(seconds: u64) -> Self {
        Self::TimeBoxed {
            lifetime: Duration::from_secs(seconds),
        }
    }

    pub fn from_config(config: &LifecycleConfig) -> Self {
        match config.default_strategy {
            StrategyKind::TimeBoxed => Self::time_boxed_seconds(config.session_lifetime_seconds),
            StrategyKind::PersistentReuse => Self::PersistentReuse,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::TimeBoxed { .. } => "time_boxed",
            Self::PersistentReuse => "persistent_reuse",
        }
    }
}

/// Ephemeral time-boxed conversation, discarded once the enqueue completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLease {
    pub local_handle: EndpointHandle,
    pub expires_at: DateTime<Utc>,
}

/// Conversation a producer sends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendHandle {
    Lease(SessionLease),
    /// Registry-backed conversation; the record is resolved after the first send
    Persistent(SessionRecord),
}

impl SendHandle {
    pub fn local_handle(&self) -> EndpointHandle {
        match self {
            Self::Lease(lease) => lease.local_handle,
            Self::Persistent(record) => record.local_handle,
        }
    }
}

/// Queue name to conversation route lookup
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, QueueRoute>,
}

impl RouteTable {
    pub fn new(routes: impl IntoIterator<Item = QueueRoute>) -> Self {
        Self {
            routes: routes
                .into_iter()
                .map(|r| (r.queue_name.clone(), r))
                .collect(),
        }
    }

    pub fn get(&self, queue_name: &str) -> TaskerResult<&QueueRoute> {
        self.routes
            .get(queue_name)
            .ok_or_else(|| TaskerError::UnknownRoute {
                queue_name: queue_name.to_string(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueRoute> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Producer-side session management
pub struct SessionLifecycleManager {
    transport: Arc<dyn Transport>,
    routes: Arc<RouteTable>,
    encryption: bool,
    max_body_bytes: usize,
}

impl std::fmt::Debug for SessionLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLifecycleManager")
            .field("transport", &self.transport.transport_type())
            .field("routes", &self.routes.len())
            .field("encryption", &self.encryption)
            .finish()
    }
}

impl SessionLifecycleManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        routes: Arc<RouteTable>,
        encryption: bool,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            transport,
            routes,
            encryption,
            max_body_bytes,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Obtain the conversation to send on for `queue_name`
    ///
    /// Under persistent reuse this takes the registry row lock for
    /// `queue_name`; concurrent first-sends serialize here and the later one
    /// observes the row the earlier one committed.
    #[instrument(skip(self, tx, strategy), fields(strategy = strategy.name()))]
    pub async fn acquire_send_handle(
        &self,
        tx: &mut dyn BrokerTransaction,
        queue_name: &str,
        strategy: SessionStrategy,
    ) -> TaskerResult<SendHandle> {
        let route = self.routes.get(queue_name)?;

        match strategy {
            SessionStrategy::TimeBoxed { lifetime } => {
                let opened_at = Utc::now();
                let local_handle = self
                    .open(tx, route, SessionLifetime::Bounded(lifetime))
                    .await?;
                let expires_at = SessionLifetime::Bounded(lifetime)
                    .deadline_from(opened_at)
                    .unwrap_or(opened_at);

                debug!(
                    queue_name = %queue_name,
                    handle = %local_handle,
                    expires_at = %expires_at,
                    "🔗 SESSION_LIFECYCLE: Opened time-boxed session"
                );
                Ok(SendHandle::Lease(SessionLease {
                    local_handle,
                    expires_at,
                }))
            }
            SessionStrategy::PersistentReuse => {
                if let Some(record) = SessionRecord::find_for_update(&mut *tx, queue_name)
                    .await
                    .map_err(|e| TaskerError::transport("lock_session_record", e))?
                {
                    if self.is_reusable(tx, &record).await? {
                        debug!(
                            queue_name = %queue_name,
                            handle = %record.local_handle,
                            "🔗 SESSION_LIFECYCLE: Reusing registered session"
                        );
                        return Ok(SendHandle::Persistent(record));
                    }
                    self.retire_stale(tx, &record).await?;
                }

                let local_handle = self.open(tx, route, SessionLifetime::Unbounded).await?;
                let record = SessionRecord::create(&mut *tx, queue_name, local_handle)
                    .await
                    .map_err(|e| match e {
                        TransportError::RecordExists { queue_name } => {
                            TaskerError::RegistryConflict { queue_name }
                        }
                        other => TaskerError::transport("insert_session_record", other),
                    })?;

                log_session_operation(
                    "open_persistent",
                    queue_name,
                    strategy.name(),
                    Some(&local_handle.to_string()),
                    "registered",
                    None,
                );
                Ok(SendHandle::Persistent(record))
            }
        }
    }

    /// Send one envelope on `handle`, resolving the registry row's peer after
    /// the first send of a new persistent session
    pub async fn send(
        &self,
        tx: &mut dyn BrokerTransaction,
        handle: &mut SendHandle,
        envelope: &TaskEnvelope,
    ) -> TaskerResult<()> {
        let encoded = envelope.encode(self.max_body_bytes)?;
        let local = handle.local_handle();

        tx.send(local, &encoded.message_type, &encoded.body)
            .await
            .map_err(|e| TaskerError::transport("send", e))?;

        if let SendHandle::Persistent(record) = handle {
            if !record.is_resolved() {
                let info = tx
                    .endpoint_info(local)
                    .await
                    .map_err(|e| TaskerError::transport("endpoint_info", e))?
                    .ok_or_else(|| {
                        TaskerError::transport("endpoint_info", TransportError::endpoint_not_found(local))
                    })?;
                let peer = tx
                    .resolve_peer_handle(info.session_id, local)
                    .await
                    .map_err(|e| TaskerError::transport("resolve_peer_handle", e))?
                    .ok_or_else(|| {
                        TaskerError::transport(
                            "resolve_peer_handle",
                            TransportError::internal("peer endpoint missing after first send"),
                        )
                    })?;
                record
                    .attach_peer(&mut *tx, peer, info.session_id)
                    .await
                    .map_err(|e| TaskerError::transport("update_session_record", e))?;

                debug!(
                    queue_name = %record.queue_name,
                    session_id = %info.session_id,
                    peer_handle = %peer,
                    "🔗 SESSION_LIFECYCLE: Resolved peer endpoint after first send"
                );
            }
        }

        Ok(())
    }

    /// Enqueue envelopes on `queue_name` in one transaction
    ///
    /// Either every envelope is sent (and any new session registered) or the
    /// transaction is rolled back and nothing is observable.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        strategy: SessionStrategy,
        envelopes: &[TaskEnvelope],
    ) -> TaskerResult<()> {
        if envelopes.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .transport
            .begin()
            .await
            .map_err(|e| TaskerError::transport("begin", e))?;

        match self
            .enqueue_in(&mut *tx, queue_name, strategy, envelopes)
            .await
        {
            Ok(handle) => {
                tx.commit()
                    .await
                    .map_err(|e| TaskerError::transport("commit", e))?;
                log_session_operation(
                    "enqueue",
                    queue_name,
                    strategy.name(),
                    Some(&handle.local_handle().to_string()),
                    "committed",
                    Some(&format!("{} envelope(s)", envelopes.len())),
                );
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        queue_name = %queue_name,
                        error = %rollback_err,
                        "⚠️ SESSION_LIFECYCLE: Rollback after failed enqueue also failed"
                    );
                }
                Err(err)
            }
        }
    }

    async fn enqueue_in(
        &self,
        tx: &mut dyn BrokerTransaction,
        queue_name: &str,
        strategy: SessionStrategy,
        envelopes: &[TaskEnvelope],
    ) -> TaskerResult<SendHandle> {
        let mut handle = self.acquire_send_handle(&mut *tx, queue_name, strategy).await?;
        for envelope in envelopes {
            self.send(&mut *tx, &mut handle, envelope).await?;
        }
        Ok(handle)
    }

    async fn open(
        &self,
        tx: &mut dyn BrokerTransaction,
        route: &QueueRoute,
        lifetime: SessionLifetime,
    ) -> TaskerResult<EndpointHandle> {
        let request = OpenRequest {
            from_service: route.initiator_service.clone(),
            to_service: route.target_service.clone(),
            contract: route.contract.clone(),
            lifetime,
            encryption: self.encryption,
        };
        tx.open(&request)
            .await
            .map_err(|e| TaskerError::transport("open", e))
    }

    /// Whether both ends of a registered conversation can still carry messages
    async fn is_reusable(
        &self,
        tx: &mut dyn BrokerTransaction,
        record: &SessionRecord,
    ) -> TaskerResult<bool> {
        let local = tx
            .endpoint_info(record.local_handle)
            .await
            .map_err(|e| TaskerError::transport("endpoint_info", e))?;
        if !local.map(|info| info.state.can_send()).unwrap_or(false) {
            return Ok(false);
        }

        match record.peer_handle {
            Some(peer_handle) => {
                let peer = tx
                    .endpoint_info(peer_handle)
                    .await
                    .map_err(|e| TaskerError::transport("endpoint_info", e))?;
                Ok(peer.map(|info| info.state.can_send()).unwrap_or(false))
            }
            None => Ok(true),
        }
    }

    /// Drop a registry row whose conversation was closed externally, closing
    /// whatever is left of our side
    async fn retire_stale(
        &self,
        tx: &mut dyn BrokerTransaction,
        record: &SessionRecord,
    ) -> TaskerResult<()> {
        let local = tx
            .endpoint_info(record.local_handle)
            .await
            .map_err(|e| TaskerError::transport("endpoint_info", e))?;
        if local.map(|info| info.state.can_send()).unwrap_or(false) {
            tx.close(record.local_handle, CloseMode::Graceful)
                .await
                .map_err(|e| TaskerError::transport("close", e))?;
        }

        SessionRecord::delete(&mut *tx, &record.queue_name)
            .await
            .map_err(|e| TaskerError::transport("delete_session_record", e))?;

        log_session_operation(
            "retire_stale",
            &record.queue_name,
            SessionStrategy::PersistentReuse.name(),
            Some(&record.local_handle.to_string()),
            "deleted",
            Some("registered session was closed externally"),
        );
        Ok(())
    }
}
