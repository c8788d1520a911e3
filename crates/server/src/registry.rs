use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use shared::{domain::UserId, protocol::ServerEnvelope};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Notify, RwLock,
};
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Envelope(ServerEnvelope),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    Closed,
    QueueFull,
}

struct HandleInner {
    id: ConnectionId,
    user_id: UserId,
    outbound: mpsc::Sender<Outbound>,
    alive: AtomicBool,
    closed: Notify,
}

/// Sending half of one live connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn user_id(&self) -> UserId {
        self.inner.user_id
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Queues one envelope. A full queue means the peer stopped reading; the
    /// connection is closed rather than letting it grow.
    pub fn send(&self, envelope: ServerEnvelope) -> Result<(), DeliveryError> {
        if !self.is_alive() {
            return Err(DeliveryError::Closed);
        }
        match self.inner.outbound.try_send(Outbound::Envelope(envelope)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(
                    user_id = self.inner.user_id.0,
                    connection_id = self.inner.id,
                    "outbound queue full; closing connection"
                );
                self.close();
                Err(DeliveryError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.inner.alive.store(false, Ordering::Release);
                self.inner.closed.notify_one();
                Err(DeliveryError::Closed)
            }
        }
    }

    /// Marks the connection dead and asks the writer to send a close frame.
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if !self.inner.alive.swap(false, Ordering::AcqRel) {
            return false;
        }
        let _ = self.inner.outbound.try_send(Outbound::Close);
        self.inner.closed.notify_one();
        true
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        if !self.is_alive() {
            return;
        }
        self.inner.closed.notified().await;
    }
}

/// Maps each identity to its single live connection.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<UserId, ConnectionHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an unbound handle and the receiver its writer task drains.
    pub fn open(
        &self,
        user_id: UserId,
        queue_capacity: usize,
    ) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(queue_capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = ConnectionHandle {
            inner: Arc::new(HandleInner {
                id,
                user_id,
                outbound,
                alive: AtomicBool::new(true),
                closed: Notify::new(),
            }),
        };
        (handle, rx)
    }

    /// Registers `handle` for its identity, closing whatever was bound before.
    pub async fn bind(&self, handle: ConnectionHandle) -> ConnectionHandle {
        let user_id = handle.user_id();
        let previous = {
            let mut connections = self.connections.write().await;
            connections.insert(user_id, handle.clone())
        };
        if let Some(previous) = previous.filter(|p| p.id() != handle.id()) {
            previous.close();
            info!(
                user_id = user_id.0,
                superseded = previous.id(),
                connection_id = handle.id(),
                "connection superseded"
            );
        } else {
            info!(
                user_id = user_id.0,
                connection_id = handle.id(),
                "connection bound"
            );
        }
        handle
    }

    pub async fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.connections.read().await.get(&user_id).cloned()
    }

    /// Removes the entry only if it still refers to `connection_id`.
    pub async fn unbind(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(&user_id) {
            Some(current) if current.id() == connection_id => {
                connections.remove(&user_id);
                info!(user_id = user_id.0, connection_id, "connection unbound");
                true
            }
            _ => {
                debug!(
                    user_id = user_id.0,
                    connection_id, "stale unbind ignored"
                );
                false
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
