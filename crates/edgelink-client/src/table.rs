//! Connection table
//!
//! The single mutation surface over the id → connection mapping. Error,
//! close, and channel-disconnect paths can legitimately race on the same
//! id, so every operation goes through the table's lock and removal is
//! idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use edgelink_proto::ConnectionId;

/// Errors surfaced by table mutations
#[derive(Debug, Error)]
pub enum TableError {
    /// The id is already mapped. Policy is to reject the second insert
    /// rather than silently replace the first, which would orphan the
    /// first local handle.
    #[error("connection {connection_id} already exists")]
    DuplicateConnection { connection_id: ConnectionId },
}

/// Lifecycle state of one table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Cheap-to-clone control surface of one local connection task.
///
/// Payload chunks queue through an ordered, unbounded channel consumed by
/// the task that owns the local socket; an empty chunk is the
/// graceful-close signal, so it flushes behind every chunk queued before
/// it. The cancellation token terminates the task without waiting for
/// in-flight writes.
#[derive(Debug, Clone)]
pub struct LocalHandle {
    data_tx: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

impl LocalHandle {
    pub fn new(data_tx: mpsc::UnboundedSender<Bytes>, cancel: CancellationToken) -> Self {
        Self { data_tx, cancel }
    }

    /// Queue one inbound payload chunk. Returns `false` if the connection
    /// task is already gone.
    pub fn deliver(&self, payload: Bytes) -> bool {
        self.data_tx.send(payload).is_ok()
    }

    /// Ask the connection task to flush queued chunks and close.
    pub fn close_graceful(&self) {
        let _ = self.data_tx.send(Bytes::new());
    }

    /// Terminate the connection task immediately.
    pub fn force_terminate(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    handle: LocalHandle,
    state: ConnectionState,
}

/// Owns the mapping from connection id to local connection state.
///
/// No other component holds a reference to the map itself; all mutations
/// funnel through these operations.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTable {
    connections: Arc<RwLock<HashMap<ConnectionId, ConnectionEntry>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new entry in state `Connecting`.
    ///
    /// Fails with [`TableError::DuplicateConnection`] if the id is already
    /// mapped; the existing entry is left untouched.
    pub async fn insert(&self, id: ConnectionId, handle: LocalHandle) -> Result<(), TableError> {
        let mut connections = self.connections.write().await;

        if connections.contains_key(&id) {
            return Err(TableError::DuplicateConnection { connection_id: id });
        }

        connections.insert(
            id.clone(),
            ConnectionEntry {
                handle,
                state: ConnectionState::Connecting,
            },
        );

        tracing::debug!(
            connection_id = %id,
            active_connections = connections.len(),
            "Connection registered"
        );

        Ok(())
    }

    /// Transition `Connecting` → `Open` once the local connect succeeded.
    pub async fn mark_open(&self, id: &ConnectionId) {
        let mut connections = self.connections.write().await;

        match connections.get_mut(id) {
            Some(entry) if entry.state == ConnectionState::Connecting => {
                entry.state = ConnectionState::Open;
            }
            Some(entry) => {
                tracing::debug!(
                    connection_id = %id,
                    state = ?entry.state,
                    "Ignoring open transition outside Connecting"
                );
            }
            None => {
                tracing::warn!(connection_id = %id, "Cannot mark unknown connection open");
            }
        }
    }

    /// Return the handle for `id`, if mapped. Never creates.
    pub async fn lookup(&self, id: &ConnectionId) -> Option<LocalHandle> {
        let connections = self.connections.read().await;
        connections.get(id).map(|entry| entry.handle.clone())
    }

    /// Current state of `id`, if mapped.
    pub async fn state(&self, id: &ConnectionId) -> Option<ConnectionState> {
        let connections = self.connections.read().await;
        connections.get(id).map(|entry| entry.state)
    }

    /// Remove `id` and issue a graceful close on its handle.
    ///
    /// Idempotent: racing callers observe exactly one removal and one
    /// close effect; every later call is a no-op. Returns whether this
    /// call performed the removal.
    pub async fn remove_and_close(&self, id: &ConnectionId) -> bool {
        let removed = {
            let mut connections = self.connections.write().await;
            let mut entry = match connections.remove(id) {
                Some(entry) => entry,
                None => return false,
            };
            entry.state = ConnectionState::Closing;
            tracing::debug!(
                connection_id = %id,
                active_connections = connections.len(),
                "Connection removed"
            );
            entry
        };

        removed.handle.close_graceful();
        true
    }

    /// Remove and return every entry, for bulk teardown. Each returned
    /// handle is closed by the caller, by its own identity.
    pub async fn drain_all(&self) -> Vec<(ConnectionId, LocalHandle)> {
        let mut connections = self.connections.write().await;
        let drained: Vec<_> = connections
            .drain()
            .map(|(id, mut entry)| {
                entry.state = ConnectionState::Closed;
                (id, entry.handle)
            })
            .collect();

        if !drained.is_empty() {
            tracing::info!(drained_connections = drained.len(), "Drained all connections");
        }

        drained
    }

    /// Number of mapped connections.
    pub async fn count(&self) -> usize {
        let connections = self.connections.read().await;
        connections.len()
    }
}
