//! # Cleanup Sweeper
//!
//! Operator tool that force-closes every conversation that existed when the
//! sweep started and clears the session registry rows pointing at them.
//! Conversations opened after the sweep started are left alone, so the sweeper
//! may run next to live producers. Pending messages of swept conversations are
//! discarded with them.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{TaskerError, TaskerResult};
use crate::session::SessionRecord;
use crate::transport::{
    BrokerTransaction, CloseMode, EndpointHandle, Transport, TransportTransaction,
};

/// What a sweep did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub endpoints_closed: usize,
    pub records_deleted: usize,
    pub batches: usize,
}

pub struct CleanupSweeper {
    transport: Arc<dyn Transport>,
    batch_size: usize,
}

impl std::fmt::Debug for CleanupSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupSweeper")
            .field("transport", &self.transport.transport_type())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl CleanupSweeper {
    pub fn new(transport: Arc<dyn Transport>, batch_size: usize) -> Self {
        Self {
            transport,
            batch_size: batch_size.max(1),
        }
    }

    /// Close every pre-existing conversation endpoint and drop the registry
    /// rows that pointed at them. Safe to repeat.
    pub async fn sweep_all(&self) -> TaskerResult<SweepReport> {
        let started_at = {
            let mut tx = self.begin().await?;
            let now = tx
                .current_time()
                .await
                .map_err(|e| TaskerError::transport("current_time", e))?;
            self.finish(tx, false).await?;
            now
        };
        info!(started_at = %started_at, "🧹 SWEEPER: Sweep started");

        let mut report = SweepReport {
            started_at,
            endpoints_closed: 0,
            records_deleted: 0,
            batches: 0,
        };
        let mut closed = HashSet::new();

        loop {
            let mut tx = self.begin().await?;
            let batch = match tx.list_endpoints(started_at, self.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    self.finish(tx, false).await?;
                    return Err(TaskerError::transport("list_endpoints", e));
                }
            };
            if batch.is_empty() {
                self.finish(tx, false).await?;
                break;
            }

            match self.close_batch(&mut *tx, batch.iter().map(|e| e.handle)).await {
                Ok(()) => {
                    self.finish(tx, true).await?;
                }
                Err(e) => {
                    self.finish(tx, false).await?;
                    return Err(e);
                }
            }
            report.batches += 1;
            report.endpoints_closed += batch.len();
            closed.extend(batch.iter().map(|e| e.handle));
            debug!(
                batch = report.batches,
                closed = batch.len(),
                "🧹 SWEEPER: Batch force-closed"
            );
        }

        let mut tx = self.begin().await?;
        match self.clear_registry(&mut *tx, &closed).await {
            Ok(deleted) => {
                self.finish(tx, true).await?;
                report.records_deleted = deleted;
            }
            Err(e) => {
                self.finish(tx, false).await?;
                return Err(e);
            }
        }

        info!(
            endpoints_closed = report.endpoints_closed,
            records_deleted = report.records_deleted,
            batches = report.batches,
            "✅ SWEEPER: Sweep complete"
        );
        Ok(report)
    }

    async fn close_batch(
        &self,
        tx: &mut dyn BrokerTransaction,
        handles: impl Iterator<Item = EndpointHandle>,
    ) -> TaskerResult<()> {
        for handle in handles {
            tx.close(handle, CloseMode::Forced)
                .await
                .map_err(|e| TaskerError::transport("close", e))?;
        }
        Ok(())
    }

    async fn clear_registry(
        &self,
        tx: &mut dyn BrokerTransaction,
        closed: &HashSet<EndpointHandle>,
    ) -> TaskerResult<usize> {
        let queues = SessionRecord::list_queue_names(&mut *tx)
            .await
            .map_err(|e| TaskerError::transport("list_session_queues", e))?;

        let mut deleted = 0;
        for queue_name in queues {
            let Some(record) = SessionRecord::find_for_update(&mut *tx, &queue_name)
                .await
                .map_err(|e| TaskerError::transport("lock_session_record", e))?
            else {
                continue;
            };

            let gone = closed.contains(&record.local_handle)
                || tx
                    .endpoint_info(record.local_handle)
                    .await
                    .map_err(|e| TaskerError::transport("endpoint_info", e))?
                    .is_none();
            if !gone {
                continue;
            }

            if SessionRecord::delete(&mut *tx, &queue_name)
                .await
                .map_err(|e| TaskerError::transport("delete_session_record", e))?
            {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn begin(&self) -> TaskerResult<Box<dyn BrokerTransaction>> {
        self.transport
            .begin()
            .await
            .map_err(|e| TaskerError::transport("begin", e))
    }

    async fn finish(&self, mut tx: Box<dyn BrokerTransaction>, commit: bool) -> TaskerResult<()> {
        if commit {
            tx.commit()
                .await
                .map_err(|e| TaskerError::transport("commit", e))
        } else {
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "⚠️ SWEEPER: Rollback failed");
            }
            Ok(())
        }
    }
}
