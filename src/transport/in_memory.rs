//! # In-Memory Dialog Transport
//!
//! Thread-safe in-memory broker for testing and development.
//!
//! ## Features
//!
//! - **Transactional**: sends, receives, closes and registry writes are staged
//!   under the transaction id and become visible only on commit; rollback (or
//!   dropping an unfinished transaction) restores the previous state
//! - **Conversation locks**: receiving a message locks its conversation until
//!   the transaction ends, so each conversation is consumed in order
//! - **Row locks**: session records are locked per queue name with async
//!   mutexes held for the life of the transaction
//! - **Lifetimes**: bounded conversations expire and notify their peer; ended
//!   endpoints are reclaimed when the peer closes or the grace period elapses
//!
//! The clock can be advanced with [`InMemoryBroker::advance_clock`] to exercise
//! expiry and reclamation without sleeping.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::errors::{TransportError, TransportResult};
use super::traits::{BrokerTransaction, SessionRecordStore, Transport, TransportTransaction};
use super::types::{
    CloseMode, EndpointHandle, EndpointInfo, OpenRequest, ReceivedMessage, SessionId,
};
use crate::config::QueueRoute;
use crate::constants::{message_types, transport as limits};
use crate::session::SessionRecord;
use crate::state_machine::{EndpointRole, EndpointState};

type TxnId = u64;

#[derive(Debug, Clone)]
struct StoredEndpoint {
    info: EndpointInfo,
    /// Uncommitted creator
    written_by: Option<TxnId>,
    /// Transaction holding the conversation lock
    locked_by: Option<TxnId>,
    reclaim_at: Option<DateTime<Utc>>,
}

impl StoredEndpoint {
    fn visible_to(&self, txn: TxnId) -> bool {
        self.written_by.map(|w| w == txn).unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    endpoint: EndpointHandle,
    queue_name: String,
    message_type: String,
    body: Vec<u8>,
    enqueued_at: DateTime<Utc>,
    written_by: Option<TxnId>,
    claimed_by: Option<TxnId>,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    record: SessionRecord,
    written_by: Option<TxnId>,
}

#[derive(Debug, Default)]
struct BrokerState {
    /// service name -> queue name
    services: HashMap<String, String>,
    endpoints: HashMap<EndpointHandle, StoredEndpoint>,
    /// Keyed by message id, which is arrival order
    messages: BTreeMap<u64, StoredMessage>,
    records: HashMap<String, StoredRecord>,
    next_message_id: u64,
}

impl BrokerState {
    fn push_message(
        &mut self,
        endpoint: &StoredEndpoint,
        message_type: &str,
        body: Vec<u8>,
        now: DateTime<Utc>,
        written_by: Option<TxnId>,
    ) {
        self.next_message_id += 1;
        let id = self.next_message_id;
        self.messages.insert(
            id,
            StoredMessage {
                id,
                endpoint: endpoint.info.handle,
                queue_name: endpoint.info.queue_name.clone(),
                message_type: message_type.to_string(),
                body,
                enqueued_at: now,
                written_by,
                claimed_by: None,
            },
        );
    }

    /// Whether a transaction other than `txn` holds either end of the
    /// conversation `handle` belongs to
    fn conversation_locked_by_other(&self, handle: EndpointHandle, txn: TxnId) -> bool {
        let held_by_other = |h: &EndpointHandle| {
            self.endpoints
                .get(h)
                .and_then(|e| e.locked_by)
                .map(|holder| holder != txn)
                .unwrap_or(false)
        };
        match self.endpoints.get(&handle) {
            Some(local) => {
                held_by_other(&handle) || local.info.peer_handle.as_ref().map(held_by_other).unwrap_or(false)
            }
            None => false,
        }
    }

    fn remove_endpoint(&mut self, handle: EndpointHandle) {
        self.endpoints.remove(&handle);
        self.messages.retain(|_, m| m.endpoint != handle);
    }

    /// Expire lapsed lifetimes and reclaim endpoints whose grace period ended.
    /// Returns true when messages were produced.
    fn reap(&mut self, now: DateTime<Utc>) -> bool {
        let mut expired = Vec::new();
        let mut reclaimable = Vec::new();

        for endpoint in self.endpoints.values() {
            if endpoint.written_by.is_some() || endpoint.locked_by.is_some() {
                continue;
            }
            let state = endpoint.info.state;
            let lapsed = endpoint.info.expires_at.map(|at| at <= now).unwrap_or(false);
            if lapsed && state.can_transition_to(EndpointState::Expired) {
                expired.push((endpoint.info.handle, endpoint.info.peer_handle));
            } else if state == EndpointState::Ending
                && endpoint.reclaim_at.map(|at| at <= now).unwrap_or(false)
            {
                reclaimable.push(endpoint.info.handle);
            }
        }

        let mut produced = false;
        for (handle, peer) in expired {
            debug!(handle = %handle, "⏳ IN_MEMORY_BROKER: Conversation lifetime expired");
            self.remove_endpoint(handle);
            if let Some(peer) = peer.and_then(|p| self.endpoints.get(&p).cloned()) {
                if peer.info.state == EndpointState::Ending && peer.locked_by.is_none() {
                    // The peer was only waiting for this side's close
                    self.remove_endpoint(peer.info.handle);
                } else if peer.info.state.can_send() && peer.written_by.is_none() {
                    let body = serde_json::json!({
                        "code": limits::LIFETIME_EXPIRED_ERROR_CODE,
                        "description": "conversation lifetime expired",
                    })
                    .to_string()
                    .into_bytes();
                    self.push_message(&peer, message_types::ERROR, body, now, None);
                    produced = true;
                }
            }
        }

        for handle in reclaimable {
            debug!(handle = %handle, "♻️ IN_MEMORY_BROKER: Grace period elapsed, reclaiming endpoint");
            self.remove_endpoint(handle);
        }

        produced
    }
}

#[derive(Debug)]
enum UndoEntry {
    /// Restore an endpoint to a prior snapshot (re-inserting it if removed)
    Endpoint(StoredEndpoint),
    /// Re-insert a message removed by a forced close
    Message(StoredMessage),
    /// Restore a registry row to its prior value
    Record {
        queue_name: String,
        previous: Option<StoredRecord>,
    },
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    /// Signalled whenever a transaction finishes or messages appear
    changes: Notify,
    record_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    next_txn: AtomicU64,
    clock_offset: Mutex<chrono::Duration>,
    max_body_bytes: usize,
}

impl BrokerInner {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + *self.clock_offset.lock()
    }

    /// Lock the broker state after expiring lapsed conversations
    fn locked_state(&self) -> parking_lot::MutexGuard<'_, BrokerState> {
        let now = self.now();
        let mut state = self.state.lock();
        if state.reap(now) {
            self.changes.notify_waiters();
        }
        state
    }
}

/// In-memory dialog transport
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tasker_session_queue::transport::{
///     InMemoryBroker, OpenRequest, SessionLifetime, Transport, TransportTransaction,
/// };
///
/// # tokio_test::block_on(async {
/// let broker = InMemoryBroker::new();
/// broker.ensure_service("orders_producer", "orders_producer_queue");
/// broker.ensure_service("orders_worker", "orders");
///
/// let mut tx = broker.begin().await.unwrap();
/// let handle = tx
///     .open(&OpenRequest {
///         from_service: "orders_producer".to_string(),
///         to_service: "orders_worker".to_string(),
///         contract: "task_contract".to_string(),
///         lifetime: SessionLifetime::from_seconds(60),
///         encryption: false,
///     })
///     .await
///     .unwrap();
/// tx.send(handle, "ship", b"{}").await.unwrap();
/// tx.commit().await.unwrap();
///
/// let mut tx = broker.begin().await.unwrap();
/// let message = tx.receive("orders", Duration::ZERO).await.unwrap().unwrap();
/// assert_eq!(message.message_type, "ship");
/// tx.commit().await.unwrap();
/// # });
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("InMemoryBroker")
            .field("services", &state.services.len())
            .field("endpoints", &state.endpoints.len())
            .field("messages", &state.messages.len())
            .field("records", &state.records.len())
            .finish()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_max_body_bytes(limits::MAX_MESSAGE_BODY_BYTES)
    }

    pub fn with_max_body_bytes(max_body_bytes: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                changes: Notify::new(),
                record_locks: DashMap::new(),
                next_txn: AtomicU64::new(1),
                clock_offset: Mutex::new(chrono::Duration::zero()),
                max_body_bytes,
            }),
        }
    }

    /// Bind a service to the queue its inbound messages land on (idempotent)
    pub fn ensure_service(&self, service_name: &str, queue_name: &str) {
        self.inner
            .state
            .lock()
            .services
            .insert(service_name.to_string(), queue_name.to_string());
    }

    /// Bind both services of a queue route
    pub fn ensure_route(&self, route: &QueueRoute) {
        self.ensure_service(&route.initiator_service, &route.reply_queue());
        self.ensure_service(&route.target_service, &route.queue_name);
    }

    /// Move the broker clock forward, then expire and reclaim accordingly
    pub fn advance_clock(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        {
            let mut offset = self.inner.clock_offset.lock();
            *offset += by;
        }
        let now = self.inner.now();
        self.inner.state.lock().reap(now);
        self.inner.changes.notify_waiters();
    }

    /// Committed messages waiting on a queue (for testing)
    pub fn queue_depth(&self, queue_name: &str) -> usize {
        let state = self.inner.state.lock();
        state
            .messages
            .values()
            .filter(|m| m.queue_name == queue_name && m.written_by.is_none())
            .count()
    }

    /// Endpoints still holding resources (for testing)
    pub fn open_endpoints(&self) -> Vec<EndpointInfo> {
        let state = self.inner.state.lock();
        let mut endpoints: Vec<EndpointInfo> = state
            .endpoints
            .values()
            .filter(|e| e.written_by.is_none() && e.info.state.is_open())
            .map(|e| e.info.clone())
            .collect();
        endpoints.sort_by_key(|e| e.created_at);
        endpoints
    }

    /// Committed session registry rows (for testing)
    pub fn session_records(&self) -> Vec<SessionRecord> {
        let state = self.inner.state.lock();
        let mut records: Vec<SessionRecord> = state
            .records
            .values()
            .filter(|r| r.written_by.is_none())
            .map(|r| r.record.clone())
            .collect();
        records.sort_by(|a, b| a.queue_name.cmp(&b.queue_name));
        records
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn begin(&self) -> TransportResult<Box<dyn BrokerTransaction>> {
        let id = self.inner.next_txn.fetch_add(1, Ordering::Relaxed);
        trace!(txn = id, "IN_MEMORY_BROKER: Transaction started");
        Ok(Box::new(InMemoryTransaction {
            id,
            inner: self.inner.clone(),
            undo: Vec::new(),
            row_locks: Vec::new(),
            locked_rows: HashSet::new(),
            finished: false,
        }))
    }

    fn transport_type(&self) -> &'static str {
        "in_memory"
    }
}

/// Transaction over an [`InMemoryBroker`]
pub struct InMemoryTransaction {
    id: TxnId,
    inner: Arc<BrokerInner>,
    undo: Vec<UndoEntry>,
    row_locks: Vec<OwnedMutexGuard<()>>,
    locked_rows: HashSet<String>,
    finished: bool,
}

impl InMemoryTransaction {
    fn ensure_active(&self) -> TransportResult<()> {
        if self.finished {
            Err(TransportError::TransactionFinished)
        } else {
            Ok(())
        }
    }

    fn ensure_row_lock(&self, queue_name: &str) -> TransportResult<()> {
        if self.locked_rows.contains(queue_name) {
            Ok(())
        } else {
            Err(TransportError::internal(format!(
                "row lock for '{queue_name}' not held by this transaction"
            )))
        }
    }

    fn try_receive(&mut self, queue_name: &str) -> TransportResult<Option<ReceivedMessage>> {
        let id = self.id;
        let inner = self.inner.clone();
        let mut state = inner.locked_state();

        let candidate = state.messages.values().find(|m| {
            m.queue_name == queue_name
                && m.written_by.is_none()
                && m.claimed_by.is_none()
                && state
                    .endpoints
                    .get(&m.endpoint)
                    .map(|e| e.written_by.is_none() && e.locked_by.map(|l| l == id).unwrap_or(true))
                    .unwrap_or(false)
        });

        let Some(message_id) = candidate.map(|m| m.id) else {
            return Ok(None);
        };

        let message = {
            let message = state
                .messages
                .get_mut(&message_id)
                .ok_or_else(|| TransportError::internal("claimed message vanished"))?;
            message.claimed_by = Some(id);
            message.clone()
        };
        let endpoint = state
            .endpoints
            .get_mut(&message.endpoint)
            .ok_or_else(|| TransportError::endpoint_not_found(message.endpoint))?;
        endpoint.locked_by = Some(id);

        Ok(Some(ReceivedMessage {
            message_id: message.id,
            handle: message.endpoint,
            session_id: endpoint.info.session_id,
            queue_name: message.queue_name,
            message_type: message.message_type,
            body: message.body,
            enqueued_at: message.enqueued_at,
        }))
    }

    /// Stage a message on the conversation `handle` belongs to. The caller
    /// holds the state lock and has checked that no other transaction holds
    /// the conversation.
    fn write_message(
        &mut self,
        state: &mut BrokerState,
        handle: EndpointHandle,
        message_type: &str,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> TransportResult<()> {
        let id = self.id;
        let local = state
            .endpoints
            .get(&handle)
            .filter(|e| e.visible_to(id))
            .cloned()
            .ok_or_else(|| TransportError::endpoint_not_found(handle))?;
        if !local.info.state.can_send() {
            return Err(TransportError::dialog_closed(handle, local.info.state));
        }

        let target = match local.info.peer_handle {
            Some(peer_handle) => {
                let peer = state
                    .endpoints
                    .get(&peer_handle)
                    .filter(|e| e.visible_to(id))
                    .cloned()
                    .ok_or_else(|| TransportError::dialog_closed(handle, EndpointState::Reclaimed))?;
                if !peer.info.state.can_send() {
                    return Err(TransportError::dialog_closed(handle, peer.info.state));
                }
                peer
            }
            None => {
                // First send: the target endpoint comes into existence
                let queue_name = state
                    .services
                    .get(&local.info.far_service)
                    .cloned()
                    .ok_or_else(|| TransportError::service_not_found(&local.info.far_service))?;
                let peer_handle = EndpointHandle::new();
                let peer = StoredEndpoint {
                    info: EndpointInfo {
                        handle: peer_handle,
                        session_id: local.info.session_id,
                        role: EndpointRole::Target,
                        state: EndpointState::Active,
                        service_name: local.info.far_service.clone(),
                        far_service: local.info.service_name.clone(),
                        queue_name,
                        contract: local.info.contract.clone(),
                        peer_handle: Some(handle),
                        created_at: now,
                        expires_at: None,
                    },
                    written_by: Some(id),
                    locked_by: None,
                    reclaim_at: None,
                };
                state.endpoints.insert(peer_handle, peer.clone());

                self.undo.push(UndoEntry::Endpoint(local.clone()));
                if let Some(endpoint) = state.endpoints.get_mut(&handle) {
                    endpoint.info.peer_handle = Some(peer_handle);
                    endpoint.info.state = EndpointState::Active;
                }
                peer
            }
        };

        state.push_message(&target, message_type, body.to_vec(), now, Some(id));
        Ok(())
    }

    fn finish(&mut self, commit: bool) {
        if self.finished {
            return;
        }
        let id = self.id;
        {
            let mut state = self.inner.state.lock();
            if commit {
                state.messages.retain(|_, m| m.claimed_by != Some(id));
                for message in state.messages.values_mut() {
                    if message.written_by == Some(id) {
                        message.written_by = None;
                    }
                }
                for record in state.records.values_mut() {
                    if record.written_by == Some(id) {
                        record.written_by = None;
                    }
                }
                let mut reclaimed = Vec::new();
                for endpoint in state.endpoints.values_mut() {
                    if endpoint.written_by == Some(id) {
                        endpoint.written_by = None;
                    }
                    if endpoint.locked_by == Some(id) {
                        endpoint.locked_by = None;
                    }
                    if endpoint.info.state == EndpointState::Reclaimed {
                        reclaimed.push(endpoint.info.handle);
                    }
                }
                for handle in reclaimed {
                    state.remove_endpoint(handle);
                }
            } else {
                while let Some(entry) = self.undo.pop() {
                    match entry {
                        UndoEntry::Endpoint(snapshot) => {
                            state.endpoints.insert(snapshot.info.handle, snapshot);
                        }
                        UndoEntry::Message(message) => {
                            state.messages.insert(message.id, message);
                        }
                        UndoEntry::Record {
                            queue_name,
                            previous,
                        } => match previous {
                            Some(record) => {
                                state.records.insert(queue_name, record);
                            }
                            None => {
                                state.records.remove(&queue_name);
                            }
                        },
                    }
                }
                state.endpoints.retain(|_, e| e.written_by != Some(id));
                state.messages.retain(|_, m| m.written_by != Some(id));
                state.records.retain(|_, r| r.written_by != Some(id));
                for message in state.messages.values_mut() {
                    if message.claimed_by == Some(id) {
                        message.claimed_by = None;
                    }
                }
                for endpoint in state.endpoints.values_mut() {
                    if endpoint.locked_by == Some(id) {
                        endpoint.locked_by = None;
                    }
                }
            }
        }
        self.undo.clear();
        self.row_locks.clear();
        self.locked_rows.clear();
        self.finished = true;
        self.inner.changes.notify_waiters();
        trace!(txn = id, commit, "IN_MEMORY_BROKER: Transaction finished");
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        self.finish(false);
    }
}

#[async_trait]
impl TransportTransaction for InMemoryTransaction {
    async fn open(&mut self, request: &OpenRequest) -> TransportResult<EndpointHandle> {
        self.ensure_active()?;
        let now = self.inner.now();
        let inner = self.inner.clone();
        let mut state = inner.locked_state();

        let queue_name = state
            .services
            .get(&request.from_service)
            .cloned()
            .ok_or_else(|| TransportError::service_not_found(&request.from_service))?;
        if !state.services.contains_key(&request.to_service) {
            return Err(TransportError::service_not_found(&request.to_service));
        }

        let handle = EndpointHandle::new();
        let endpoint = StoredEndpoint {
            info: EndpointInfo {
                handle,
                session_id: SessionId::new(),
                role: EndpointRole::Initiator,
                state: EndpointState::Created,
                service_name: request.from_service.clone(),
                far_service: request.to_service.clone(),
                queue_name,
                contract: request.contract.clone(),
                peer_handle: None,
                created_at: now,
                expires_at: request.lifetime.deadline_from(now),
            },
            written_by: Some(self.id),
            locked_by: None,
            reclaim_at: None,
        };
        state.endpoints.insert(handle, endpoint);
        Ok(handle)
    }

    async fn send(
        &mut self,
        handle: EndpointHandle,
        message_type: &str,
        body: &[u8],
    ) -> TransportResult<()> {
        self.ensure_active()?;
        if message_type.is_empty() || message_type.len() > limits::MAX_TYPE_TAG_LENGTH {
            return Err(TransportError::invalid_message_type(
                message_type,
                "message type must be 1..=128 characters",
            ));
        }
        if body.len() > self.inner.max_body_bytes {
            return Err(TransportError::MessageTooLarge {
                size_bytes: body.len(),
                limit_bytes: self.inner.max_body_bytes,
            });
        }

        let id = self.id;
        let inner = self.inner.clone();

        // A receiver holding either end may be about to close the conversation
        loop {
            let notified = inner.changes.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = inner.locked_state();
                if !state.conversation_locked_by_other(handle, id) {
                    let now = inner.now();
                    return self.write_message(&mut state, handle, message_type, body, now);
                }
            }
            trace!(txn = id, handle = %handle, "IN_MEMORY_BROKER: Send waiting on conversation lock");
            notified.await;
        }
    }

    async fn receive(
        &mut self,
        queue_name: &str,
        wait: Duration,
    ) -> TransportResult<Option<ReceivedMessage>> {
        self.ensure_active()?;
        let deadline = Instant::now() + wait;
        let inner = self.inner.clone();

        loop {
            let notified = inner.changes.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_receive(queue_name)? {
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn pending_messages(&mut self, handle: EndpointHandle) -> TransportResult<u64> {
        self.ensure_active()?;
        let id = self.id;
        let inner = self.inner.clone();
        let state = inner.locked_state();
        let count = state
            .messages
            .values()
            .filter(|m| m.endpoint == handle && m.claimed_by != Some(id))
            .count();
        Ok(count as u64)
    }

    async fn close(&mut self, handle: EndpointHandle, mode: CloseMode) -> TransportResult<()> {
        self.ensure_active()?;
        let id = self.id;
        let inner = self.inner.clone();

        // Wait out any other transaction holding the conversation lock
        loop {
            let notified = inner.changes.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = inner.locked_state();
                match state.endpoints.get(&handle).filter(|e| e.visible_to(id)) {
                    None => return Ok(()),
                    Some(endpoint) if endpoint.locked_by.map(|l| l != id).unwrap_or(false) => {}
                    Some(_) => break,
                }
            }
            notified.await;
        }

        let now = inner.now();
        let mut state = inner.locked_state();
        let Some(local) = state.endpoints.get(&handle).cloned() else {
            return Ok(());
        };
        if local.info.state.is_terminal() {
            return Ok(());
        }

        match mode {
            CloseMode::Forced => {
                let orphaned: Vec<StoredMessage> = state
                    .messages
                    .values()
                    .filter(|m| m.endpoint == handle)
                    .cloned()
                    .collect();
                self.undo.push(UndoEntry::Endpoint(local));
                for message in orphaned {
                    state.messages.remove(&message.id);
                    self.undo.push(UndoEntry::Message(message));
                }
                state.endpoints.remove(&handle);
            }
            CloseMode::Graceful => {
                if local.info.state == EndpointState::Ending {
                    return Ok(());
                }
                let peer = local
                    .info
                    .peer_handle
                    .and_then(|p| state.endpoints.get(&p).filter(|e| e.visible_to(id)).cloned());

                self.undo.push(UndoEntry::Endpoint(local.clone()));
                match peer {
                    Some(peer) if peer.info.state.can_send() => {
                        if let Some(endpoint) = state.endpoints.get_mut(&handle) {
                            endpoint.info.state = EndpointState::Ending;
                            endpoint.reclaim_at = chrono::Duration::from_std(
                                limits::RECLAIM_GRACE_PERIOD,
                            )
                            .ok()
                            .map(|grace| now + grace);
                            endpoint.locked_by = Some(id);
                        }
                        state.push_message(&peer, message_types::END_DIALOG, Vec::new(), now, Some(id));
                    }
                    Some(peer) => {
                        // Peer already ended its side: both ends are released
                        self.undo.push(UndoEntry::Endpoint(peer.clone()));
                        for h in [handle, peer.info.handle] {
                            if let Some(endpoint) = state.endpoints.get_mut(&h) {
                                endpoint.info.state = EndpointState::Reclaimed;
                                endpoint.locked_by = Some(id);
                            }
                        }
                    }
                    None => {
                        if let Some(endpoint) = state.endpoints.get_mut(&handle) {
                            endpoint.info.state = EndpointState::Reclaimed;
                            endpoint.locked_by = Some(id);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn endpoint_info(
        &mut self,
        handle: EndpointHandle,
    ) -> TransportResult<Option<EndpointInfo>> {
        self.ensure_active()?;
        let id = self.id;
        let inner = self.inner.clone();
        let state = inner.locked_state();
        Ok(state
            .endpoints
            .get(&handle)
            .filter(|e| e.visible_to(id))
            .map(|e| e.info.clone()))
    }

    async fn resolve_peer_handle(
        &mut self,
        session_id: SessionId,
        local: EndpointHandle,
    ) -> TransportResult<Option<EndpointHandle>> {
        self.ensure_active()?;
        let id = self.id;
        let inner = self.inner.clone();
        let state = inner.locked_state();
        Ok(state
            .endpoints
            .values()
            .find(|e| {
                e.visible_to(id) && e.info.session_id == session_id && e.info.handle != local
            })
            .map(|e| e.info.handle))
    }

    async fn list_endpoints(
        &mut self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> TransportResult<Vec<EndpointInfo>> {
        self.ensure_active()?;
        let inner = self.inner.clone();
        let state = inner.locked_state();
        let mut endpoints: Vec<EndpointInfo> = state
            .endpoints
            .values()
            .filter(|e| {
                e.written_by.is_none()
                    && e.info.state.is_open()
                    && e.info.created_at <= created_before
            })
            .map(|e| e.info.clone())
            .collect();
        endpoints.sort_by_key(|e| e.created_at);
        endpoints.truncate(limit);
        Ok(endpoints)
    }

    async fn current_time(&mut self) -> TransportResult<DateTime<Utc>> {
        self.ensure_active()?;
        Ok(self.inner.now())
    }

    async fn commit(&mut self) -> TransportResult<()> {
        self.ensure_active()?;
        self.finish(true);
        Ok(())
    }

    async fn rollback(&mut self) -> TransportResult<()> {
        self.ensure_active()?;
        self.finish(false);
        Ok(())
    }
}

#[async_trait]
impl SessionRecordStore for InMemoryTransaction {
    async fn lock_session_record(
        &mut self,
        queue_name: &str,
    ) -> TransportResult<Option<SessionRecord>> {
        self.ensure_active()?;
        if !self.locked_rows.contains(queue_name) {
            let lock = self
                .inner
                .record_locks
                .entry(queue_name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            let guard = lock.lock_owned().await;
            self.row_locks.push(guard);
            self.locked_rows.insert(queue_name.to_string());
        }

        let id = self.id;
        let inner = self.inner.clone();
        let state = inner.locked_state();
        Ok(state
            .records
            .get(queue_name)
            .filter(|r| r.written_by.map(|w| w == id).unwrap_or(true))
            .map(|r| r.record.clone()))
    }

    async fn insert_session_record(&mut self, record: &SessionRecord) -> TransportResult<()> {
        self.ensure_active()?;
        self.ensure_row_lock(&record.queue_name)?;
        let id = self.id;
        let inner = self.inner.clone();
        let mut state = inner.locked_state();
        if state.records.contains_key(&record.queue_name) {
            return Err(TransportError::record_exists(&record.queue_name));
        }
        self.undo.push(UndoEntry::Record {
            queue_name: record.queue_name.clone(),
            previous: None,
        });
        state.records.insert(
            record.queue_name.clone(),
            StoredRecord {
                record: record.clone(),
                written_by: Some(id),
            },
        );
        Ok(())
    }

    async fn update_session_record(&mut self, record: &SessionRecord) -> TransportResult<()> {
        self.ensure_active()?;
        self.ensure_row_lock(&record.queue_name)?;
        let inner = self.inner.clone();
        let mut state = inner.locked_state();
        let previous = state
            .records
            .get(&record.queue_name)
            .cloned()
            .ok_or_else(|| TransportError::record_not_found(&record.queue_name))?;
        let written_by = previous.written_by;
        self.undo.push(UndoEntry::Record {
            queue_name: record.queue_name.clone(),
            previous: Some(previous),
        });
        state.records.insert(
            record.queue_name.clone(),
            StoredRecord {
                record: record.clone(),
                written_by,
            },
        );
        Ok(())
    }

    async fn delete_session_record(&mut self, queue_name: &str) -> TransportResult<bool> {
        self.ensure_active()?;
        self.ensure_row_lock(queue_name)?;
        let inner = self.inner.clone();
        let mut state = inner.locked_state();
        match state.records.remove(queue_name) {
            Some(previous) => {
                self.undo.push(UndoEntry::Record {
                    queue_name: queue_name.to_string(),
                    previous: Some(previous),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_session_queues(&mut self) -> TransportResult<Vec<String>> {
        self.ensure_active()?;
        let inner = self.inner.clone();
        let state = inner.locked_state();
        let mut queues: Vec<String> = state
            .records
            .iter()
            .filter(|(_, r)| r.written_by.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        queues.sort();
        Ok(queues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::types::SessionLifetime;

    const PRODUCER: &str = "orders_producer";
    const WORKER: &str = "orders_worker";

    fn broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.ensure_service(PRODUCER, "orders_producer_queue");
        broker.ensure_service(WORKER, "orders");
        broker
    }

    fn open_request(lifetime: SessionLifetime) -> OpenRequest {
        OpenRequest {
            from_service: PRODUCER.to_string(),
            to_service: WORKER.to_string(),
            contract: "task_contract".to_string(),
            lifetime,
            encryption: false,
        }
    }

    async fn send_committed(broker: &InMemoryBroker, bodies: &[&str]) -> EndpointHandle {
        let mut tx = broker.begin().await.unwrap();
        let handle = tx
            .open(&open_request(SessionLifetime::Unbounded))
            .await
            .unwrap();
        for body in bodies {
            tx.send(handle, "work", body.as_bytes()).await.unwrap();
        }
        tx.commit().await.unwrap();
        handle
    }

    #[tokio::test]
    async fn test_uncommitted_sends_are_invisible() {
        let broker = broker();
        let mut producer = broker.begin().await.unwrap();
        let handle = producer
            .open(&open_request(SessionLifetime::Unbounded))
            .await
            .unwrap();
        producer.send(handle, "work", b"a").await.unwrap();

        let mut consumer = broker.begin().await.unwrap();
        let received = consumer
            .receive("orders", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(received.is_none());
        assert_eq!(broker.queue_depth("orders"), 0);

        producer.commit().await.unwrap();
        let received = consumer
            .receive("orders", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(received.unwrap().body, b"a".to_vec());
    }

    #[tokio::test]
    async fn test_rollback_redelivers_message() {
        let broker = broker();
        send_committed(&broker, &["a"]).await;

        let mut tx = broker.begin().await.unwrap();
        let first = tx.receive("orders", Duration::ZERO).await.unwrap().unwrap();
        tx.rollback().await.unwrap();

        let mut tx = broker.begin().await.unwrap();
        let again = tx.receive("orders", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.message_id, again.message_id);
        tx.commit().await.unwrap();
        assert_eq!(broker.queue_depth("orders"), 0);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let broker = broker();
        {
            let mut tx = broker.begin().await.unwrap();
            let handle = tx
                .open(&open_request(SessionLifetime::Unbounded))
                .await
                .unwrap();
            tx.send(handle, "work", b"lost").await.unwrap();
        }
        assert!(broker.open_endpoints().is_empty());
        assert_eq!(broker.queue_depth("orders"), 0);
    }

    #[tokio::test]
    async fn test_conversation_lock_preserves_order() {
        let broker = broker();
        send_committed(&broker, &["first", "second"]).await;

        let mut holder = broker.begin().await.unwrap();
        let first = holder.receive("orders", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.body, b"first".to_vec());

        // Another worker cannot jump ahead inside the locked conversation
        let mut other = broker.begin().await.unwrap();
        assert!(other.receive("orders", Duration::ZERO).await.unwrap().is_none());

        holder.commit().await.unwrap();
        let second = other.receive("orders", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.body, b"second".to_vec());
    }

    #[tokio::test]
    async fn test_peer_resolvable_inside_first_send_transaction() {
        let broker = broker();
        let mut tx = broker.begin().await.unwrap();
        let handle = tx
            .open(&open_request(SessionLifetime::Unbounded))
            .await
            .unwrap();
        let info = tx.endpoint_info(handle).await.unwrap().unwrap();
        assert_eq!(info.state, EndpointState::Created);
        assert!(tx
            .resolve_peer_handle(info.session_id, handle)
            .await
            .unwrap()
            .is_none());

        tx.send(handle, "work", b"x").await.unwrap();
        let peer = tx
            .resolve_peer_handle(info.session_id, handle)
            .await
            .unwrap();
        assert!(peer.is_some());
        let info = tx.endpoint_info(handle).await.unwrap().unwrap();
        assert_eq!(info.state, EndpointState::Active);
        assert_eq!(info.peer_handle, peer);
    }

    #[tokio::test]
    async fn test_graceful_close_sends_end_dialog_and_reclaims_both_sides() {
        let broker = broker();
        let initiator = send_committed(&broker, &["a"]).await;

        let mut tx = broker.begin().await.unwrap();
        let message = tx.receive("orders", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(tx.pending_messages(message.handle).await.unwrap(), 0);
        tx.close(message.handle, CloseMode::Graceful).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = broker.begin().await.unwrap();
        let end = tx
            .receive("orders_producer_queue", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end.message_type, message_types::END_DIALOG);
        assert_eq!(end.handle, initiator);
        tx.close(initiator, CloseMode::Graceful).await.unwrap();
        tx.commit().await.unwrap();

        assert!(broker.open_endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_send_waits_for_receiver_and_fails_once_closed() {
        let broker = broker();
        let initiator = send_committed(&broker, &["a"]).await;

        let mut worker = broker.begin().await.unwrap();
        let message = worker.receive("orders", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(worker.pending_messages(message.handle).await.unwrap(), 0);

        let producer_broker = broker.clone();
        let late_send = tokio::spawn(async move {
            let mut producer = producer_broker.begin().await.unwrap();
            let result = producer.send(initiator, "work", b"b").await;
            if result.is_ok() {
                producer.commit().await.unwrap();
            }
            result
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!late_send.is_finished());

        worker.close(message.handle, CloseMode::Graceful).await.unwrap();
        worker.commit().await.unwrap();

        let err = late_send.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            TransportError::DialogClosed {
                state: EndpointState::Ending,
                ..
            }
        ));
        assert_eq!(broker.queue_depth("orders"), 0);
    }

    #[tokio::test]
    async fn test_send_proceeds_after_receiver_commits_without_closing() {
        let broker = broker();
        let initiator = send_committed(&broker, &["a"]).await;

        let mut worker = broker.begin().await.unwrap();
        worker.receive("orders", Duration::ZERO).await.unwrap().unwrap();

        let producer_broker = broker.clone();
        let late_send = tokio::spawn(async move {
            let mut producer = producer_broker.begin().await.unwrap();
            producer.send(initiator, "work", b"b").await?;
            producer.commit().await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.commit().await.unwrap();

        late_send.await.unwrap().unwrap();
        assert_eq!(broker.queue_depth("orders"), 1);
    }

    #[tokio::test]
    async fn test_ending_endpoint_reclaimed_after_grace_period() {
        let broker = broker();
        send_committed(&broker, &["a"]).await;

        let mut tx = broker.begin().await.unwrap();
        let message = tx.receive("orders", Duration::ZERO).await.unwrap().unwrap();
        tx.close(message.handle, CloseMode::Graceful).await.unwrap();
        tx.commit().await.unwrap();

        // Initiator never answers; the target lingers until the grace period elapses
        assert_eq!(broker.open_endpoints().len(), 2);
        broker.advance_clock(limits::RECLAIM_GRACE_PERIOD + Duration::from_secs(1));
        let remaining = broker.open_endpoints();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].role, EndpointRole::Initiator);
    }

    #[tokio::test]
    async fn test_lifetime_expiry_notifies_peer() {
        let broker = broker();
        let mut tx = broker.begin().await.unwrap();
        let handle = tx
            .open(&open_request(
                SessionLifetime::from_seconds(60),
            ))
            .await
            .unwrap();
        tx.send(handle, "work", b"a").await.unwrap();
        tx.commit().await.unwrap();

        broker.advance_clock(Duration::from_secs(61));

        let open = broker.open_endpoints();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].role, EndpointRole::Target);

        let mut tx = broker.begin().await.unwrap();
        let work = tx.receive("orders", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(work.message_type, "work");
        tx.commit().await.unwrap();

        let mut tx = broker.begin().await.unwrap();
        let error = tx.receive("orders", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(error.message_type, message_types::ERROR);
    }

    #[tokio::test]
    async fn test_forced_close_drops_pending_messages() {
        let broker = broker();
        let initiator = send_committed(&broker, &["a", "b"]).await;

        let mut tx = broker.begin().await.unwrap();
        for endpoint in tx.list_endpoints(Utc::now(), 10).await.unwrap() {
            tx.close(endpoint.handle, CloseMode::Forced).await.unwrap();
        }
        tx.commit().await.unwrap();

        assert!(broker.open_endpoints().is_empty());
        assert_eq!(broker.queue_depth("orders"), 0);

        let mut tx = broker.begin().await.unwrap();
        let err = tx.send(initiator, "work", b"c").await.unwrap_err();
        assert!(matches!(err, TransportError::EndpointNotFound { .. }));
    }

    #[tokio::test]
    async fn test_record_requires_row_lock() {
        let broker = broker();
        let mut tx = broker.begin().await.unwrap();
        let record = SessionRecord::new("orders", EndpointHandle::new());
        let err = tx.insert_session_record(&record).await.unwrap_err();
        assert!(matches!(err, TransportError::Internal { .. }));

        assert!(tx.lock_session_record("orders").await.unwrap().is_none());
        tx.insert_session_record(&record).await.unwrap();
        let err = tx.insert_session_record(&record).await.unwrap_err();
        assert!(matches!(err, TransportError::RecordExists { .. }));
        tx.commit().await.unwrap();

        assert_eq!(broker.session_records(), vec![record]);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let broker = InMemoryBroker::with_max_body_bytes(4);
        broker.ensure_service(PRODUCER, "orders_producer_queue");
        broker.ensure_service(WORKER, "orders");
        let mut tx = broker.begin().await.unwrap();
        let handle = tx
            .open(&open_request(SessionLifetime::Unbounded))
            .await
            .unwrap();
        let err = tx.send(handle, "work", b"too long").await.unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_finished_transaction_rejects_operations() {
        let broker = broker();
        let mut tx = broker.begin().await.unwrap();
        tx.commit().await.unwrap();
        let err = tx.receive("orders", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, TransportError::TransactionFinished));
    }
}
