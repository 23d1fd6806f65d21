//! # Transport Traits
//!
//! The dialog transport is consumed only through these traits. A transaction
//! covers both the conversation operations and the session registry rows, so a
//! first send and its registry bookkeeping commit or vanish together.
//!
//! Implementations must provide:
//!
//! - Exactly-once receive: a message taken by one transaction is invisible to
//!   every other transaction until that transaction rolls back.
//! - Per-conversation FIFO: while a transaction holds a message from a
//!   conversation, other transactions receive nothing from that conversation.
//! - Read-your-writes inside a transaction: a peer endpoint created by a send
//!   is resolvable before commit.
//! - Row locking on session records: `lock_session_record` blocks while another
//!   transaction holds the same queue name, then observes its committed state.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::errors::TransportResult;
use super::types::{
    CloseMode, EndpointHandle, EndpointInfo, OpenRequest, ReceivedMessage, SessionId,
};
use crate::session::SessionRecord;

/// Entry point to a dialog transport
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Begin a transaction
    async fn begin(&self) -> TransportResult<Box<dyn BrokerTransaction>>;

    /// Transport type for logging
    fn transport_type(&self) -> &'static str;
}

/// Conversation operations available inside a transaction
#[async_trait]
pub trait TransportTransaction: Send {
    /// Open a conversation from `from_service` to `to_service`, returning the
    /// initiator handle. The target endpoint appears on first send.
    async fn open(&mut self, request: &OpenRequest) -> TransportResult<EndpointHandle>;

    /// Send one message on the conversation `handle` belongs to
    async fn send(
        &mut self,
        handle: EndpointHandle,
        message_type: &str,
        body: &[u8],
    ) -> TransportResult<()>;

    /// Take the next message from `queue_name`, waiting up to `wait` for one to
    /// arrive. `None` when the wait elapsed with nothing available.
    async fn receive(
        &mut self,
        queue_name: &str,
        wait: Duration,
    ) -> TransportResult<Option<ReceivedMessage>>;

    /// Messages still queued for the endpoint `handle`, excluding what this
    /// transaction already received. A send another transaction has not
    /// committed yet must either be counted here or be unable to commit onto a
    /// conversation this transaction closes.
    async fn pending_messages(&mut self, handle: EndpointHandle) -> TransportResult<u64>;

    /// End this side of a conversation
    async fn close(&mut self, handle: EndpointHandle, mode: CloseMode) -> TransportResult<()>;

    /// Endpoint metadata, `None` once the endpoint has been reclaimed
    async fn endpoint_info(&mut self, handle: EndpointHandle)
        -> TransportResult<Option<EndpointInfo>>;

    /// The endpoint on the other side of `session_id` from `local`. Resolvable
    /// only after at least one send on the conversation.
    async fn resolve_peer_handle(
        &mut self,
        session_id: SessionId,
        local: EndpointHandle,
    ) -> TransportResult<Option<EndpointHandle>>;

    /// Open endpoints created at or before `created_before`, oldest first
    async fn list_endpoints(
        &mut self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> TransportResult<Vec<EndpointInfo>>;

    /// The transport's clock, which stamps `created_at` and drives expiry
    async fn current_time(&mut self) -> TransportResult<DateTime<Utc>>;

    /// Make every operation of this transaction durable and visible
    async fn commit(&mut self) -> TransportResult<()>;

    /// Discard every operation of this transaction
    async fn rollback(&mut self) -> TransportResult<()>;
}

/// Session registry rows, stored alongside the transport
#[async_trait]
pub trait SessionRecordStore: Send {
    /// Acquire the row lock for `queue_name` (held until commit/rollback) and
    /// read the row if it exists
    async fn lock_session_record(&mut self, queue_name: &str)
        -> TransportResult<Option<SessionRecord>>;

    /// Insert a new row. Requires the row lock.
    async fn insert_session_record(&mut self, record: &SessionRecord) -> TransportResult<()>;

    /// Replace an existing row. Requires the row lock.
    async fn update_session_record(&mut self, record: &SessionRecord) -> TransportResult<()>;

    /// Delete a row, returning whether one existed. Requires the row lock.
    async fn delete_session_record(&mut self, queue_name: &str) -> TransportResult<bool>;

    /// Queue names that currently have a committed row
    async fn list_session_queues(&mut self) -> TransportResult<Vec<String>>;
}

/// A transaction spanning conversations and session records
pub trait BrokerTransaction: TransportTransaction + SessionRecordStore {}

impl<T> BrokerTransaction for T where T: TransportTransaction + SessionRecordStore {}
