//! # Session Registry
//!
//! One persisted row per logical queue name recording the conversation reused
//! by the persistent-reuse strategy. Rows live in the transport's store and are
//! only touched inside a transaction holding the queue's row lock.

use serde::{Deserialize, Serialize};

use crate::transport::{EndpointHandle, SessionId, SessionRecordStore, TransportError, TransportResult};

/// SessionRecord maps a queue name to its long-lived conversation
/// Maps to the `tasker_session_registry` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub queue_name: String,
    pub local_handle: EndpointHandle,
    /// Populated once, in the transaction of the first send
    pub peer_handle: Option<EndpointHandle>,
    pub session_id: Option<SessionId>,
}

impl SessionRecord {
    pub fn new(queue_name: impl Into<String>, local_handle: EndpointHandle) -> Self {
        Self {
            queue_name: queue_name.into(),
            local_handle,
            peer_handle: None,
            session_id: None,
        }
    }

    /// Whether the paired endpoint has been recorded
    pub fn is_resolved(&self) -> bool {
        self.peer_handle.is_some() && self.session_id.is_some()
    }

    /// Lock and read the row for a queue name
    ///
    /// Blocks while another transaction holds the row; the lock is then held
    /// until this transaction ends.
    pub async fn find_for_update<S>(store: &mut S, queue_name: &str) -> TransportResult<Option<Self>>
    where
        S: SessionRecordStore + ?Sized,
    {
        store.lock_session_record(queue_name).await
    }

    /// Insert a row for a freshly opened conversation
    pub async fn create<S>(
        store: &mut S,
        queue_name: &str,
        local_handle: EndpointHandle,
    ) -> TransportResult<Self>
    where
        S: SessionRecordStore + ?Sized,
    {
        let record = Self::new(queue_name, local_handle);
        store.insert_session_record(&record).await?;
        Ok(record)
    }

    /// Record the paired endpoint. A row is resolved exactly once; resolving
    /// again with the same values is a no-op.
    pub async fn attach_peer<S>(
        &mut self,
        store: &mut S,
        peer_handle: EndpointHandle,
        session_id: SessionId,
    ) -> TransportResult<()>
    where
        S: SessionRecordStore + ?Sized,
    {
        match (self.peer_handle, self.session_id) {
            (Some(peer), Some(session)) if peer == peer_handle && session == session_id => {
                return Ok(())
            }
            (None, None) => {}
            _ => {
                return Err(TransportError::internal(format!(
                    "session record for '{}' already resolved to a different peer",
                    self.queue_name
                )))
            }
        }

        let mut updated = self.clone();
        updated.peer_handle = Some(peer_handle);
        updated.session_id = Some(session_id);
        store.update_session_record(&updated).await?;
        *self = updated;
        Ok(())
    }

    /// Delete the row for a queue name. Requires the row lock.
    pub async fn delete<S>(store: &mut S, queue_name: &str) -> TransportResult<bool>
    where
        S: SessionRecordStore + ?Sized,
    {
        store.delete_session_record(queue_name).await
    }

    /// Queue names with a committed row
    pub async fn list_queue_names<S>(store: &mut S) -> TransportResult<Vec<String>>
    where
        S: SessionRecordStore + ?Sized,
    {
        store.list_session_queues().await
    }
}
