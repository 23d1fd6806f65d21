//! # Dispatcher
//!
//! Activation facade over one queue: a fixed pool of worker loops, each taking
//! one message per transaction and routing it to the handler registry.
//!
//! ## Per-message transaction
//!
//! ```text
//! begin → receive(wait) → decode ─┬─ task ──→ handler ──┬─ ok ───→ close decision → commit
//!                                 │                     └─ error → rollback (redelivered)
//!                                 ├─ poison ─→ log ───────────────→ close decision → commit
//!                                 └─ end/error system message → close own side → commit
//! ```
//!
//! The close decision runs only under [`SessionClosePolicy::CloseWhenDrained`]
//! and only for conversations opened with a bounded lifetime. Persistent-reuse
//! producers open unbounded conversations and keep sending on them, so those
//! stay open. Inside the receive transaction the dispatcher asks the transport
//! how many messages the conversation still has pending and ends its side when
//! none remain. Because the check and the close commit
//! together with the receive, a concurrent send either counts as pending or
//! finds the conversation already ending.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handler_registry::{HandlerContext, HandlerError, TaskHandlerRegistry};
use crate::config::DispatcherConfig;
use crate::error::{TaskerError, TaskerResult};
use crate::logging::{log_dispatch_operation, log_error};
use crate::messaging::{EnvelopeError, MessageKind};
use crate::state_machine::EndpointRole;
use crate::transport::{
    BrokerTransaction, CloseMode, ReceivedMessage, Transport, TransportTransaction,
};

/// Whether workers end conversations once they drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionClosePolicy {
    /// Close the receiving side of a time-boxed conversation when nothing is
    /// pending. Unbounded conversations are left for their producer to reuse.
    CloseWhenDrained,
    /// Never close on drain; reply queues only answer system messages
    KeepOpen,
}

/// Result of one `process_next` iteration that committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing arrived within the receive wait
    Idle,
    Processed {
        type_tag: String,
        session_closed: bool,
    },
    /// Undecodable or unroutable message removed from the queue
    Poison {
        reason: String,
        session_closed: bool,
    },
    /// The peer ended or the transport failed the conversation; this side closed
    ConversationEnded { message_type: String },
}

/// Counters shared by all workers of a dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    processed: AtomicU64,
    poison: AtomicU64,
    handler_failures: AtomicU64,
    sessions_closed: AtomicU64,
    system_messages: AtomicU64,
    transport_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub processed: u64,
    pub poison: u64,
    pub handler_failures: u64,
    pub sessions_closed: u64,
    pub system_messages: u64,
    pub transport_errors: u64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            system_messages: self.system_messages.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

/// Worker pool bound to one queue
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    registry: Arc<TaskHandlerRegistry>,
    queue_name: String,
    close_policy: SessionClosePolicy,
    config: DispatcherConfig,
    stats: Arc<DispatcherStats>,
    shutdown_tx: broadcast::Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue_name", &self.queue_name)
            .field("close_policy", &self.close_policy)
            .field("max_concurrent_workers", &self.config.max_concurrent_workers)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<TaskHandlerRegistry>,
        queue_name: impl Into<String>,
        close_policy: SessionClosePolicy,
        config: DispatcherConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            transport,
            registry,
            queue_name: queue_name.into(),
            close_policy,
            config,
            stats: Arc::new(DispatcherStats::default()),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Dispatcher for a producer's reply queue: no handlers, only answers the
    /// end-of-conversation and error messages the transport delivers there
    pub fn for_replies(
        transport: Arc<dyn Transport>,
        reply_queue: impl Into<String>,
        config: DispatcherConfig,
    ) -> Self {
        Self::new(
            transport,
            Arc::new(TaskHandlerRegistry::new()),
            reply_queue,
            SessionClosePolicy::KeepOpen,
            config,
        )
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of running worker loops
    pub fn active_workers(&self) -> usize {
        self.workers.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Spawn `max_concurrent_workers` worker loops
    ///
    /// No-op when the dispatcher is disabled in configuration or already started.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!(queue_name = %self.queue_name, "⏸️ DISPATCHER: Activation disabled, no workers started");
            return;
        }

        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            warn!(queue_name = %self.queue_name, "⚠️ DISPATCHER: Already started");
            return;
        }

        for worker_id in 0..self.config.max_concurrent_workers {
            let dispatcher = Arc::clone(self);
            let shutdown_rx = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                dispatcher.worker_loop(worker_id, shutdown_rx).await;
            }));
        }

        info!(
            queue_name = %self.queue_name,
            workers = self.config.max_concurrent_workers,
            close_policy = ?self.close_policy,
            "🚀 DISPATCHER: Workers started"
        );
    }

    /// Signal every worker to stop and wait for them
    ///
    /// A worker interrupted mid-message drops its transaction, which rolls back;
    /// the message is redelivered to the next dispatcher.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    error!(queue_name = %self.queue_name, error = %e, "❌ DISPATCHER: Worker terminated abnormally");
                }
            }
        }
        info!(queue_name = %self.queue_name, stats = ?self.stats.snapshot(), "🛑 DISPATCHER: Shutdown complete");
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!(queue_name = %self.queue_name, worker_id, "👷 DISPATCHER: Worker loop running");

        loop {
            let outcome = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                outcome = self.process_next(worker_id) => outcome,
            };

            if let Err(err) = outcome {
                log_error(
                    "dispatcher",
                    "process_next",
                    &err.to_string(),
                    Some(&format!("queue={} worker={}", self.queue_name, worker_id)),
                );
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(self.config.error_backoff()) => {}
                }
            }
        }

        debug!(queue_name = %self.queue_name, worker_id, "👷 DISPATCHER: Worker loop stopped");
    }

    /// Receive and handle at most one message in its own transaction
    pub async fn process_next(&self, worker_id: usize) -> TaskerResult<DispatchOutcome> {
        let mut tx = self.transport.begin().await.map_err(|e| {
            self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
            TaskerError::transport("begin", e)
        })?;

        let result = self.process_in(&mut *tx, worker_id).await;
        match result {
            Ok(outcome) => {
                tx.commit().await.map_err(|e| {
                    self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
                    TaskerError::transport("commit", e)
                })?;
                self.record(&outcome, worker_id);
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        queue_name = %self.queue_name,
                        worker_id,
                        error = %rollback_err,
                        "⚠️ DISPATCHER: Rollback failed"
                    );
                }
                match &err {
                    TaskerError::HandlerFailure { .. } => {
                        self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    TaskerError::TransportUnavailable { .. } => {
                        self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                Err(err)
            }
        }
    }

    async fn process_in(
        &self,
        tx: &mut dyn BrokerTransaction,
        worker_id: usize,
    ) -> TaskerResult<DispatchOutcome> {
        let Some(message) = tx
            .receive(&self.queue_name, self.config.receive_wait())
            .await
            .map_err(|e| TaskerError::transport("receive", e))?
        else {
            return Ok(DispatchOutcome::Idle);
        };

        match MessageKind::decode(&message.message_type, &message.body) {
            Ok(MessageKind::Task(envelope)) => {
                let type_tag = envelope.type_tag().to_string();
                if !self.registry.contains(envelope.type_tag().as_str()) {
                    return self
                        .swallow_poison(tx, &message, format!("no handler registered for task type '{type_tag}'"))
                        .await;
                }

                let mut ctx = HandlerContext {
                    tx: &mut *tx,
                    queue_name: &self.queue_name,
                    session_id: message.session_id,
                    message_id: message.message_id,
                    worker_id,
                };

                let handled = AssertUnwindSafe(self.registry.dispatch(&envelope, &mut ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(HandlerError::Panicked {
                            message: panic_message(panic.as_ref()),
                        })
                    });

                match handled {
                    Ok(()) => {
                        let session_closed = self.close_if_drained(tx, &message).await?;
                        Ok(DispatchOutcome::Processed {
                            type_tag,
                            session_closed,
                        })
                    }
                    Err(source) => {
                        warn!(
                            queue_name = %self.queue_name,
                            worker_id,
                            type_tag = %type_tag,
                            message_id = message.message_id,
                            error = %source,
                            "🔁 DISPATCHER: Handler failed, rolling back for redelivery"
                        );
                        Err(TaskerError::HandlerFailure { type_tag, source })
                    }
                }
            }
            Ok(MessageKind::EndDialog) => self.end_conversation(tx, message).await,
            Ok(MessageKind::Error(dialog_error)) => {
                warn!(
                    queue_name = %self.queue_name,
                    handle = %message.handle,
                    code = dialog_error.code,
                    description = %dialog_error.description,
                    "⚠️ DISPATCHER: Conversation failed in transport"
                );
                self.end_conversation(tx, message).await
            }
            Err(decode_error) => self.swallow_poison(tx, &message, poison_reason(&decode_error)).await,
        }
    }

    /// Answer an end-of-conversation or error message by closing our side
    async fn end_conversation(
        &self,
        tx: &mut dyn BrokerTransaction,
        message: ReceivedMessage,
    ) -> TaskerResult<DispatchOutcome> {
        tx.close(message.handle, CloseMode::Graceful)
            .await
            .map_err(|e| TaskerError::transport("close", e))?;
        Ok(DispatchOutcome::ConversationEnded {
            message_type: message.message_type,
        })
    }

    /// Commit a poison message away; it must never block the conversation
    async fn swallow_poison(
        &self,
        tx: &mut dyn BrokerTransaction,
        message: &ReceivedMessage,
        reason: String,
    ) -> TaskerResult<DispatchOutcome> {
        let poison = TaskerError::poison(&message.queue_name, &reason);
        warn!(
            queue_name = %self.queue_name,
            message_id = message.message_id,
            message_type = %message.message_type,
            session_id = %message.session_id,
            error = %poison,
            "☠️ DISPATCHER: Poison message removed from queue"
        );
        let session_closed = self.close_if_drained(tx, message).await?;
        Ok(DispatchOutcome::Poison {
            reason,
            session_closed,
        })
    }

    async fn close_if_drained(
        &self,
        tx: &mut dyn BrokerTransaction,
        message: &ReceivedMessage,
    ) -> TaskerResult<bool> {
        if self.close_policy != SessionClosePolicy::CloseWhenDrained {
            return Ok(false);
        }
        if self.producer_reuses_conversation(tx, message).await? {
            return Ok(false);
        }
        let pending = tx
            .pending_messages(message.handle)
            .await
            .map_err(|e| TaskerError::transport("pending_messages", e))?;
        if pending > 0 {
            return Ok(false);
        }
        tx.close(message.handle, CloseMode::Graceful)
            .await
            .map_err(|e| TaskerError::transport("close", e))?;
        Ok(true)
    }

    /// Whether the initiating side was opened without a lifetime, which is how
    /// persistent-reuse producers open the conversation they keep sending on
    async fn producer_reuses_conversation(
        &self,
        tx: &mut dyn BrokerTransaction,
        message: &ReceivedMessage,
    ) -> TaskerResult<bool> {
        let Some(peer) = tx
            .resolve_peer_handle(message.session_id, message.handle)
            .await
            .map_err(|e| TaskerError::transport("resolve_peer_handle", e))?
        else {
            return Ok(false);
        };
        let initiator = tx
            .endpoint_info(peer)
            .await
            .map_err(|e| TaskerError::transport("endpoint_info", e))?;
        Ok(initiator
            .map(|info| info.role == EndpointRole::Initiator && info.expires_at.is_none())
            .unwrap_or(false))
    }

    fn record(&self, outcome: &DispatchOutcome, worker_id: usize) {
        match outcome {
            DispatchOutcome::Idle => {}
            DispatchOutcome::Processed {
                type_tag,
                session_closed,
            } => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                if *session_closed {
                    self.stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
                }
                log_dispatch_operation(
                    "process",
                    &self.queue_name,
                    Some(worker_id),
                    Some(type_tag),
                    "committed",
                    session_closed.then_some("session closed"),
                );
            }
            DispatchOutcome::Poison { session_closed, .. } => {
                self.stats.poison.fetch_add(1, Ordering::Relaxed);
                if *session_closed {
                    self.stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
                }
            }
            DispatchOutcome::ConversationEnded { message_type } => {
                self.stats.system_messages.fetch_add(1, Ordering::Relaxed);
                debug!(
                    queue_name = %self.queue_name,
                    worker_id,
                    message_type = %message_type,
                    "👋 DISPATCHER: Closed our side of an ended conversation"
                );
            }
        }
    }
}

fn poison_reason(error: &EnvelopeError) -> String {
    format!("undecodable envelope: {error}")
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
