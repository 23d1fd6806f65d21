//! # PostgreSQL Dialog Transport
//!
//! Conversations, messages and session registry rows stored in PostgreSQL
//! tables (see `migrations/`). Every [`PgTransaction`] is one database
//! transaction, so the registry bookkeeping of a first send commits or rolls
//! back with the send itself.
//!
//! ## Locking
//!
//! - `receive` takes `FOR UPDATE SKIP LOCKED` on the receiving endpoint row and
//!   deletes the message. The row lock is the conversation lock: other
//!   receivers skip the conversation until this transaction ends.
//! - `send` holds `FOR SHARE` on both endpoints, so a send waits while a
//!   receiver holds the conversation and then observes a close made by it.
//! - Session records are guarded by transaction-scoped advisory locks keyed on
//!   the queue name, which also cover rows that do not exist yet.
//!
//! Expiry and grace-period reclamation run in [`PgBroker::reap`], which
//! `begin` invokes at most once per [`REAP_INTERVAL`](limits::REAP_INTERVAL).

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Postgres, Row};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::errors::{TransportError, TransportResult};
use super::traits::{BrokerTransaction, SessionRecordStore, Transport, TransportTransaction};
use super::types::{
    CloseMode, EndpointHandle, EndpointInfo, OpenRequest, ReceivedMessage, SessionId,
};
use crate::config::{QueueRoute, TransportConfig};
use crate::constants::{message_types, transport as limits};
use crate::session::SessionRecord;
use crate::state_machine::{EndpointRole, EndpointState};

/// Schema migrations for the dialog transport tables
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Advisory lock namespace for session registry rows
const RECORD_LOCK_NAMESPACE: i32 = 8489;

const ENDPOINT_COLUMNS: &str = "handle, session_id, role, state, service_name, far_service, \
     queue_name, contract, peer_handle, created_at, expires_at";

/// Counts from one expiry/reclaim pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub expired: u64,
    pub peers_notified: u64,
    pub reclaimed: u64,
}

/// PostgreSQL-backed dialog transport
#[derive(Debug)]
pub struct PgBroker {
    pool: PgPool,
    poll_interval: Duration,
    max_body_bytes: usize,
    last_reap: Mutex<Option<Instant>>,
}

impl PgBroker {
    /// Wrap an existing pool
    pub fn new(pool: PgPool, poll_interval: Duration, max_body_bytes: usize) -> Self {
        Self {
            pool,
            poll_interval,
            max_body_bytes,
            last_reap: Mutex::new(None),
        }
    }

    /// Connect using the transport section of the configuration
    pub async fn connect(config: &TransportConfig) -> TransportResult<Self> {
        let database_url = config.database_url().ok_or_else(|| {
            TransportError::unavailable("no database_url configured and DATABASE_URL is unset")
        })?;

        info!(
            max_connections = config.max_connections,
            "🚀 PG_BROKER: Connecting to database"
        );
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&database_url)
            .await?;
        info!("✅ PG_BROKER: Connected");

        Ok(Self::new(pool, config.poll_interval(), config.max_body_bytes))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create or upgrade the transport tables
    pub async fn migrate(&self) -> TransportResult<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| TransportError::unavailable(format!("migration failed: {e}")))?;
        debug!("📋 PG_BROKER: Migrations applied");
        Ok(())
    }

    /// Bind a service to the queue its inbound messages land on (idempotent)
    pub async fn ensure_service(&self, service_name: &str, queue_name: &str) -> TransportResult<()> {
        sqlx::query(
            "INSERT INTO tasker_services (service_name, queue_name) VALUES ($1, $2)
             ON CONFLICT (service_name) DO UPDATE SET queue_name = EXCLUDED.queue_name",
        )
        .bind(service_name)
        .bind(queue_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bind both services of a queue route
    pub async fn ensure_route(&self, route: &QueueRoute) -> TransportResult<()> {
        self.ensure_service(&route.initiator_service, &route.reply_queue())
            .await?;
        self.ensure_service(&route.target_service, &route.queue_name)
            .await
    }

    /// Expire lapsed conversations and reclaim ended endpoints whose grace
    /// period has passed. Rows locked by live transactions are left for a
    /// later pass.
    pub async fn reap(&self) -> TransportResult<ReapReport> {
        let mut tx = self.pool.begin().await?;
        let mut report = ReapReport::default();

        let lapsed = sqlx::query(
            "SELECT handle, peer_handle FROM tasker_endpoints
             WHERE expires_at <= clock_timestamp() AND state IN ('created', 'active')
             ORDER BY expires_at
             LIMIT $1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(limits::REAP_BATCH_SIZE)
        .fetch_all(&mut *tx)
        .await?;

        for row in lapsed {
            let handle: Uuid = row.try_get("handle")?;
            let peer_handle: Option<Uuid> = row.try_get("peer_handle")?;

            if let Some(peer_handle) = peer_handle {
                let peer = sqlx::query(
                    "SELECT state, queue_name FROM tasker_endpoints
                     WHERE handle = $1 FOR UPDATE SKIP LOCKED",
                )
                .bind(peer_handle)
                .fetch_optional(&mut *tx)
                .await?;

                match peer {
                    Some(peer) => {
                        let state = parse_state(peer.try_get("state")?)?;
                        if state == EndpointState::Ending {
                            delete_endpoint(&mut tx, peer_handle).await?;
                        } else if state.can_send() {
                            let queue_name: String = peer.try_get("queue_name")?;
                            let body = serde_json::json!({
                                "code": limits::LIFETIME_EXPIRED_ERROR_CODE,
                                "description": "conversation lifetime expired",
                            })
                            .to_string()
                            .into_bytes();
                            insert_message(&mut tx, peer_handle, &queue_name, message_types::ERROR, &body)
                                .await?;
                            report.peers_notified += 1;
                        }
                    }
                    None => {
                        let exists: bool = sqlx::query_scalar(
                            "SELECT EXISTS (SELECT 1 FROM tasker_endpoints WHERE handle = $1)",
                        )
                        .bind(peer_handle)
                        .fetch_one(&mut *tx)
                        .await?;
                        if exists {
                            // Peer is busy; retry on the next pass
                            continue;
                        }
                    }
                }
            }

            debug!(handle = %handle, "⏳ PG_BROKER: Conversation lifetime expired");
            delete_endpoint(&mut tx, handle).await?;
            report.expired += 1;
        }

        report.reclaimed = sqlx::query(
            "DELETE FROM tasker_endpoints WHERE handle IN (
                 SELECT handle FROM tasker_endpoints
                 WHERE state = 'ending' AND reclaim_at <= clock_timestamp()
                 FOR UPDATE SKIP LOCKED
             )",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if report != ReapReport::default() {
            debug!(
                expired = report.expired,
                peers_notified = report.peers_notified,
                reclaimed = report.reclaimed,
                "♻️ PG_BROKER: Reap pass complete"
            );
        }
        Ok(report)
    }

    async fn maybe_reap(&self) {
        {
            let mut last = self.last_reap.lock();
            if last.map(|at| at.elapsed() < limits::REAP_INTERVAL).unwrap_or(false) {
                return;
            }
            *last = Some(Instant::now());
        }
        if let Err(e) = self.reap().await {
            warn!(error = %e, "⚠️ PG_BROKER: Reap pass failed");
        }
    }
}

#[async_trait]
impl Transport for PgBroker {
    async fn begin(&self) -> TransportResult<Box<dyn BrokerTransaction>> {
        self.maybe_reap().await;
        let tx = self.pool.begin().await?;
        trace!("PG_BROKER: Transaction started");
        Ok(Box::new(PgTransaction {
            tx: Some(tx),
            poll_interval: self.poll_interval,
            max_body_bytes: self.max_body_bytes,
            locked_rows: HashSet::new(),
        }))
    }

    fn transport_type(&self) -> &'static str {
        "postgres"
    }
}

/// Transaction over a [`PgBroker`]; dropping it unfinished rolls back
pub struct PgTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
    poll_interval: Duration,
    max_body_bytes: usize,
    locked_rows: HashSet<String>,
}

impl std::fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTransaction")
            .field("active", &self.tx.is_some())
            .field("locked_rows", &self.locked_rows)
            .finish()
    }
}

impl PgTransaction {
    fn conn(&mut self) -> TransportResult<&mut PgConnection> {
        self.tx
            .as_deref_mut()
            .ok_or(TransportError::TransactionFinished)
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

    async fn try_receive(&mut self, queue_name: &str) -> TransportResult<Option<ReceivedMessage>> {
        let row = sqlx::query(
            "WITH candidate AS (
                 SELECT m.message_id
                 FROM tasker_messages m
                 JOIN tasker_endpoints e ON e.handle = m.handle
                 WHERE m.queue_name = $1
                 ORDER BY m.message_id
                 LIMIT 1
                 FOR UPDATE OF e SKIP LOCKED
             )
             DELETE FROM tasker_messages m
             USING candidate c, tasker_endpoints e
             WHERE m.message_id = c.message_id AND e.handle = m.handle
             RETURNING m.message_id, m.handle, e.session_id, m.queue_name,
                       m.message_type, m.body, m.enqueued_at",
        )
        .bind(queue_name)
        .fetch_optional(self.conn()?)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let message_id: i64 = row.try_get("message_id")?;
        let handle: Uuid = row.try_get("handle")?;
        let session_id: Uuid = row.try_get("session_id")?;
        Ok(Some(ReceivedMessage {
            message_id: message_id as u64,
            handle: handle.into(),
            session_id: session_id.into(),
            queue_name: row.try_get("queue_name")?,
            message_type: row.try_get("message_type")?,
            body: row.try_get("body")?,
            enqueued_at: row.try_get("enqueued_at")?,
        }))
    }

    async fn fetch_endpoint(
        &mut self,
        handle: EndpointHandle,
        lock: &str,
    ) -> TransportResult<Option<EndpointInfo>> {
        let sql = format!("SELECT {ENDPOINT_COLUMNS} FROM tasker_endpoints WHERE handle = $1 {lock}");
        let row = sqlx::query(&sql)
            .bind(handle.as_uuid())
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(endpoint_from_row).transpose()
    }

    async fn service_queue(&mut self, service_name: &str) -> TransportResult<String> {
        sqlx::query_scalar("SELECT queue_name FROM tasker_services WHERE service_name = $1")
            .bind(service_name)
            .fetch_optional(self.conn()?)
            .await?
            .ok_or_else(|| TransportError::service_not_found(service_name))
    }
}

#[async_trait]
impl TransportTransaction for PgTransaction {
    async fn open(&mut self, request: &OpenRequest) -> TransportResult<EndpointHandle> {
        let queue_name = self.service_queue(&request.from_service).await?;
        self.service_queue(&request.to_service).await?;

        let handle = EndpointHandle::new();
        let lifetime_ms = request
            .lifetime
            .as_duration()
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        sqlx::query(
            "INSERT INTO tasker_endpoints
                 (handle, session_id, role, state, service_name, far_service,
                  queue_name, contract, encryption, expires_at)
             VALUES ($1, $2, 'initiator', 'created', $3, $4, $5, $6, $7,
                     clock_timestamp() + ($8::bigint * interval '1 millisecond'))",
        )
        .bind(handle.as_uuid())
        .bind(SessionId::new().as_uuid())
        .bind(&request.from_service)
        .bind(&request.to_service)
        .bind(&queue_name)
        .bind(&request.contract)
        .bind(request.encryption)
        .bind(lifetime_ms)
        .execute(self.conn()?)
        .await?;
        Ok(handle)
    }

    async fn send(
        &mut self,
        handle: EndpointHandle,
        message_type: &str,
        body: &[u8],
    ) -> TransportResult<()> {
        self.conn()?;
        if message_type.is_empty() || message_type.len() > limits::MAX_TYPE_TAG_LENGTH {
            return Err(TransportError::invalid_message_type(
                message_type,
                "message type must be 1..=128 characters",
            ));
        }
        if body.len() > self.max_body_bytes {
            return Err(TransportError::MessageTooLarge {
                size_bytes: body.len(),
                limit_bytes: self.max_body_bytes,
            });
        }

        let local = self
            .fetch_endpoint(handle, "FOR SHARE")
            .await?
            .ok_or_else(|| TransportError::endpoint_not_found(handle))?;
        if !local.state.can_send() {
            return Err(TransportError::dialog_closed(handle, local.state));
        }

        let (target_handle, target_queue) = match local.peer_handle {
            Some(peer_handle) => {
                let peer = self
                    .fetch_endpoint(peer_handle, "FOR SHARE")
                    .await?
                    .ok_or_else(|| TransportError::dialog_closed(handle, EndpointState::Reclaimed))?;
                if !peer.state.can_send() {
                    return Err(TransportError::dialog_closed(handle, peer.state));
                }
                (peer_handle, peer.queue_name)
            }
            None => {
                // First send: the target endpoint comes into existence
                let queue_name = self.service_queue(&local.far_service).await?;
                let peer_handle = EndpointHandle::new();
                sqlx::query(
                    "INSERT INTO tasker_endpoints
                         (handle, session_id, role, state, service_name, far_service,
                          queue_name, contract, encryption, peer_handle)
                     SELECT $1, session_id, 'target', 'active', far_service, service_name,
                            $2, contract, encryption, handle
                     FROM tasker_endpoints WHERE handle = $3",
                )
                .bind(peer_handle.as_uuid())
                .bind(&queue_name)
                .bind(handle.as_uuid())
                .execute(self.conn()?)
                .await?;
                sqlx::query(
                    "UPDATE tasker_endpoints SET state = 'active', peer_handle = $2
                     WHERE handle = $1",
                )
                .bind(handle.as_uuid())
                .bind(peer_handle.as_uuid())
                .execute(self.conn()?)
                .await?;
                (peer_handle, queue_name)
            }
        };

        let conn = self.conn()?;
        insert_message(conn, target_handle.as_uuid(), &target_queue, message_type, body).await
    }

    async fn receive(
        &mut self,
        queue_name: &str,
        wait: Duration,
    ) -> TransportResult<Option<ReceivedMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(message) = self.try_receive(queue_name).await? {
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn pending_messages(&mut self, handle: EndpointHandle) -> TransportResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM tasker_messages WHERE handle = $1")
            .bind(handle.as_uuid())
            .fetch_one(self.conn()?)
            .await?;
        Ok(count as u64)
    }

    async fn close(&mut self, handle: EndpointHandle, mode: CloseMode) -> TransportResult<()> {
        match mode {
            CloseMode::Forced => {
                // Messages go with the endpoint (ON DELETE CASCADE)
                delete_endpoint(self.conn()?, handle.as_uuid()).await?;
                Ok(())
            }
            CloseMode::Graceful => {
                let Some(local) = self.fetch_endpoint(handle, "FOR UPDATE").await? else {
                    return Ok(());
                };
                if local.state == EndpointState::Ending {
                    return Ok(());
                }
                let peer = match local.peer_handle {
                    Some(peer_handle) => self.fetch_endpoint(peer_handle, "FOR SHARE").await?,
                    None => None,
                };

                match peer {
                    Some(peer) if peer.state.can_send() => {
                        let grace_ms =
                            i64::try_from(limits::RECLAIM_GRACE_PERIOD.as_millis()).unwrap_or(i64::MAX);
                        sqlx::query(
                            "UPDATE tasker_endpoints
                             SET state = 'ending',
                                 reclaim_at = clock_timestamp() + ($2::bigint * interval '1 millisecond')
                             WHERE handle = $1",
                        )
                        .bind(handle.as_uuid())
                        .bind(grace_ms)
                        .execute(self.conn()?)
                        .await?;
                        let conn = self.conn()?;
                        insert_message(
                            conn,
                            peer.handle.as_uuid(),
                            &peer.queue_name,
                            message_types::END_DIALOG,
                            &[],
                        )
                        .await
                    }
                    Some(peer) => {
                        // Peer already ended its side: both ends are released
                        sqlx::query("DELETE FROM tasker_endpoints WHERE handle = ANY($1)")
                            .bind(vec![handle.as_uuid(), peer.handle.as_uuid()])
                            .execute(self.conn()?)
                            .await?;
                        Ok(())
                    }
                    None => {
                        delete_endpoint(self.conn()?, handle.as_uuid()).await?;
                        Ok(())
                    }
                }
            }
        }
    }

    async fn endpoint_info(
        &mut self,
        handle: EndpointHandle,
    ) -> TransportResult<Option<EndpointInfo>> {
        self.fetch_endpoint(handle, "").await
    }

    async fn resolve_peer_handle(
        &mut self,
        session_id: SessionId,
        local: EndpointHandle,
    ) -> TransportResult<Option<EndpointHandle>> {
        let peer: Option<Uuid> = sqlx::query_scalar(
            "SELECT handle FROM tasker_endpoints WHERE session_id = $1 AND handle <> $2 LIMIT 1",
        )
        .bind(session_id.as_uuid())
        .bind(local.as_uuid())
        .fetch_optional(self.conn()?)
        .await?;
        Ok(peer.map(EndpointHandle::from))
    }

    async fn list_endpoints(
        &mut self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> TransportResult<Vec<EndpointInfo>> {
        let sql = format!(
            "SELECT {ENDPOINT_COLUMNS} FROM tasker_endpoints
             WHERE created_at <= $1
             ORDER BY created_at, handle
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(created_before)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(self.conn()?)
            .await?;
        rows.iter().map(endpoint_from_row).collect()
    }

    async fn current_time(&mut self) -> TransportResult<DateTime<Utc>> {
        let now: DateTime<Utc> = sqlx::query_scalar("SELECT clock_timestamp()")
            .fetch_one(self.conn()?)
            .await?;
        Ok(now)
    }

    async fn commit(&mut self) -> TransportResult<()> {
        let tx = self.tx.take().ok_or(TransportError::TransactionFinished)?;
        tx.commit().await?;
        self.locked_rows.clear();
        trace!("PG_BROKER: Transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> TransportResult<()> {
        let tx = self.tx.take().ok_or(TransportError::TransactionFinished)?;
        tx.rollback().await?;
        self.locked_rows.clear();
        trace!("PG_BROKER: Transaction rolled back");
        Ok(())
    }
}

#[async_trait]
impl SessionRecordStore for PgTransaction {
    async fn lock_session_record(
        &mut self,
        queue_name: &str,
    ) -> TransportResult<Option<SessionRecord>> {
        if !self.locked_rows.contains(queue_name) {
            sqlx::query("SELECT pg_advisory_xact_lock($1, hashtext($2))")
                .bind(RECORD_LOCK_NAMESPACE)
                .bind(queue_name)
                .execute(self.conn()?)
                .await?;
            self.locked_rows.insert(queue_name.to_string());
        }

        let row = sqlx::query(
            "SELECT queue_name, local_handle, peer_handle, session_id
             FROM tasker_session_registry WHERE queue_name = $1",
        )
        .bind(queue_name)
        .fetch_optional(self.conn()?)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn insert_session_record(&mut self, record: &SessionRecord) -> TransportResult<()> {
        self.ensure_row_lock(&record.queue_name)?;
        let inserted = sqlx::query(
            "INSERT INTO tasker_session_registry (queue_name, local_handle, peer_handle, session_id)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (queue_name) DO NOTHING",
        )
        .bind(&record.queue_name)
        .bind(record.local_handle.as_uuid())
        .bind(record.peer_handle.map(|h| h.as_uuid()))
        .bind(record.session_id.map(|s| s.as_uuid()))
        .execute(self.conn()?)
        .await?
        .rows_affected();
        if inserted == 0 {
            return Err(TransportError::record_exists(&record.queue_name));
        }
        Ok(())
    }

    async fn update_session_record(&mut self, record: &SessionRecord) -> TransportResult<()> {
        self.ensure_row_lock(&record.queue_name)?;
        let updated = sqlx::query(
            "UPDATE tasker_session_registry
             SET local_handle = $2, peer_handle = $3, session_id = $4, updated_at = clock_timestamp()
             WHERE queue_name = $1",
        )
        .bind(&record.queue_name)
        .bind(record.local_handle.as_uuid())
        .bind(record.peer_handle.map(|h| h.as_uuid()))
        .bind(record.session_id.map(|s| s.as_uuid()))
        .execute(self.conn()?)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(TransportError::record_not_found(&record.queue_name));
        }
        Ok(())
    }

    async fn delete_session_record(&mut self, queue_name: &str) -> TransportResult<bool> {
        self.ensure_row_lock(queue_name)?;
        let deleted = sqlx::query("DELETE FROM tasker_session_registry WHERE queue_name = $1")
            .bind(queue_name)
            .execute(self.conn()?)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn list_session_queues(&mut self) -> TransportResult<Vec<String>> {
        let queues = sqlx::query_scalar(
            "SELECT queue_name FROM tasker_session_registry ORDER BY queue_name",
        )
        .fetch_all(self.conn()?)
        .await?;
        Ok(queues)
    }
}

async fn insert_message(
    conn: &mut PgConnection,
    handle: Uuid,
    queue_name: &str,
    message_type: &str,
    body: &[u8],
) -> TransportResult<()> {
    sqlx::query(
        "INSERT INTO tasker_messages (handle, queue_name, message_type, body)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(handle)
    .bind(queue_name)
    .bind(message_type)
    .bind(body)
    .execute(conn)
    .await?;
    Ok(())
}

async fn delete_endpoint(conn: &mut PgConnection, handle: Uuid) -> TransportResult<bool> {
    let deleted = sqlx::query("DELETE FROM tasker_endpoints WHERE handle = $1")
        .bind(handle)
        .execute(conn)
        .await?
        .rows_affected();
    Ok(deleted > 0)
}

fn parse_state(value: String) -> TransportResult<EndpointState> {
    value.parse().map_err(TransportError::internal)
}

fn endpoint_from_row(row: &PgRow) -> TransportResult<EndpointInfo> {
    let role: String = row.try_get("role")?;
    let handle: Uuid = row.try_get("handle")?;
    let session_id: Uuid = row.try_get("session_id")?;
    let peer_handle: Option<Uuid> = row.try_get("peer_handle")?;
    Ok(EndpointInfo {
        handle: handle.into(),
        session_id: session_id.into(),
        role: role
            .parse::<EndpointRole>()
            .map_err(TransportError::internal)?,
        state: parse_state(row.try_get("state")?)?,
        service_name: row.try_get("service_name")?,
        far_service: row.try_get("far_service")?,
        queue_name: row.try_get("queue_name")?,
        contract: row.try_get("contract")?,
        peer_handle: peer_handle.map(EndpointHandle::from),
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn record_from_row(row: &PgRow) -> TransportResult<SessionRecord> {
    let local_handle: Uuid = row.try_get("local_handle")?;
    let peer_handle: Option<Uuid> = row.try_get("peer_handle")?;
    let session_id: Option<Uuid> = row.try_get("session_id")?;
    Ok(SessionRecord {
        queue_name: row.try_get("queue_name")?,
        local_handle: local_handle.into(),
        peer_handle: peer_handle.map(EndpointHandle::from),
        session_id: session_id.map(SessionId::from),
    })
}

/// Run with `cargo test -- --ignored` against the database in `DATABASE_URL`.
/// Each test uses its own service and queue names.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::types::SessionLifetime;

    async fn broker() -> Option<(PgBroker, QueueRoute)> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL not set, skipping postgres transport test");
            return None;
        };
        let config = TransportConfig {
            database_url: Some(url),
            poll_interval_ms: 20,
            ..TransportConfig::default()
        };
        let broker = PgBroker::connect(&config).await.unwrap();
        broker.migrate().await.unwrap();

        let suffix = Uuid::new_v4().simple().to_string();
        let route = QueueRoute::new(
            format!("orders_{suffix}"),
            format!("producer_{suffix}"),
            format!("worker_{suffix}"),
            "task_contract",
        );
        broker.ensure_route(&route).await.unwrap();
        Some((broker, route))
    }

    fn open_request(route: &QueueRoute, lifetime: SessionLifetime) -> OpenRequest {
        OpenRequest {
            from_service: route.initiator_service.clone(),
            to_service: route.target_service.clone(),
            contract: route.contract.clone(),
            lifetime,
            encryption: false,
        }
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL DATABASE_URL"]
    async fn test_send_receive_commit() {
        let Some((broker, route)) = broker().await else {
            return;
        };

        let mut producer = broker.begin().await.unwrap();
        let handle = producer
            .open(&open_request(&route, SessionLifetime::Unbounded))
            .await
            .unwrap();
        producer.send(handle, "work", b"first").await.unwrap();
        producer.send(handle, "work", b"second").await.unwrap();

        // Peer resolvable before commit
        let info = producer.endpoint_info(handle).await.unwrap().unwrap();
        assert_eq!(info.state, EndpointState::Active);
        let peer = producer
            .resolve_peer_handle(info.session_id, handle)
            .await
            .unwrap();
        assert_eq!(peer, info.peer_handle);
        producer.commit().await.unwrap();

        let mut worker = broker.begin().await.unwrap();
        let first = worker
            .receive(&route.queue_name, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.body, b"first");
        assert_eq!(Some(first.handle), info.peer_handle);

        // The conversation is locked for everyone else
        let mut other = broker.begin().await.unwrap();
        assert!(other
            .receive(&route.queue_name, Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());
        other.rollback().await.unwrap();

        assert_eq!(worker.pending_messages(first.handle).await.unwrap(), 1);
        worker.commit().await.unwrap();

        let mut worker = broker.begin().await.unwrap();
        let second = worker
            .receive(&route.queue_name, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.body, b"second");
        worker.close(second.handle, CloseMode::Forced).await.unwrap();
        worker.close(handle, CloseMode::Forced).await.unwrap();
        worker.commit().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL DATABASE_URL"]
    async fn test_rollback_redelivers() {
        let Some((broker, route)) = broker().await else {
            return;
        };
        let mut producer = broker.begin().await.unwrap();
        let handle = producer
            .open(&open_request(&route, SessionLifetime::Unbounded))
            .await
            .unwrap();
        producer.send(handle, "work", b"again").await.unwrap();
        producer.commit().await.unwrap();

        let mut worker = broker.begin().await.unwrap();
        let taken = worker
            .receive(&route.queue_name, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        worker.rollback().await.unwrap();

        let mut worker = broker.begin().await.unwrap();
        let again = worker
            .receive(&route.queue_name, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.message_id, taken.message_id);
        worker.close(again.handle, CloseMode::Forced).await.unwrap();
        worker.close(handle, CloseMode::Forced).await.unwrap();
        worker.commit().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL DATABASE_URL"]
    async fn test_graceful_close_handshake() {
        let Some((broker, route)) = broker().await else {
            return;
        };
        let mut producer = broker.begin().await.unwrap();
        let handle = producer
            .open(&open_request(&route, SessionLifetime::from_seconds(60)))
            .await
            .unwrap();
        producer.send(handle, "work", b"only").await.unwrap();
        producer.commit().await.unwrap();

        let mut worker = broker.begin().await.unwrap();
        let message = worker
            .receive(&route.queue_name, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(worker.pending_messages(message.handle).await.unwrap(), 0);
        worker.close(message.handle, CloseMode::Graceful).await.unwrap();
        worker.commit().await.unwrap();

        // The producer side receives end-of-dialog and closes in turn
        let mut replies = broker.begin().await.unwrap();
        let end = replies
            .receive(&route.reply_queue(), Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end.message_type, message_types::END_DIALOG);
        assert_eq!(end.handle, handle);
        replies.close(handle, CloseMode::Graceful).await.unwrap();
        replies.commit().await.unwrap();

        let mut check = broker.begin().await.unwrap();
        assert!(check.endpoint_info(handle).await.unwrap().is_none());
        assert!(check.endpoint_info(message.handle).await.unwrap().is_none());
        check.rollback().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL DATABASE_URL"]
    async fn test_record_insert_conflict_and_lock_requirement() {
        let Some((broker, route)) = broker().await else {
            return;
        };
        let mut tx = broker.begin().await.unwrap();
        let record = SessionRecord::new(&route.queue_name, EndpointHandle::new());
        let err = tx.insert_session_record(&record).await.unwrap_err();
        assert!(matches!(err, TransportError::Internal { .. }));

        assert!(tx.lock_session_record(&route.queue_name).await.unwrap().is_none());
        tx.insert_session_record(&record).await.unwrap();
        let err = tx.insert_session_record(&record).await.unwrap_err();
        assert!(matches!(err, TransportError::RecordExists { .. }));
        assert!(tx.delete_session_record(&route.queue_name).await.unwrap());
        tx.commit().await.unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, TransportError::TransactionFinished));
    }
}
