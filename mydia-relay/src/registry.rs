//! In-memory registry of live instance control channels.
//!
//! One entry per instance; a reconnect always wins and hands the displaced
//! connection back to the caller so its pending requests can be failed and
//! its socket closed. Lookup misses are a normal, frequent result. The lock
//! is never held across an await point.

use std::collections::HashMap;
use std::sync::Arc;

use mydia_tunnel_proto::Frame;
use time::OffsetDateTime;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

/// Handle to one registered control channel.
#[derive(Clone)]
pub struct ConnectionHandle {
    /// Distinguishes this registration from a replacement for the same
    /// instance, so a stale connection cannot evict its successor.
    pub connection_id: Uuid,
    /// Outbound frames for the connection task to write to the socket.
    pub frame_tx: mpsc::UnboundedSender<Frame>,
    /// Fired when the registration is displaced; the connection task closes.
    pub notify_close: Arc<Notify>,
    pub negotiated_version: String,
    pub registered_at: OffsetDateTime,
}

impl ConnectionHandle {
    pub fn new(negotiated_version: String) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        let handle = Self {
            connection_id: Uuid::new_v4(),
            frame_tx,
            notify_close: Arc::new(Notify::new()),
            negotiated_version,
            registered_at: OffsetDateTime::now_utc(),
        };

        (handle, frame_rx)
    }
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<parking_lot::RwLock<HashMap<Uuid, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection, returning the displaced one if any.
    pub fn register(&self, instance_id: Uuid, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.inner.write().insert(instance_id, handle)
    }

    pub fn lookup(&self, instance_id: Uuid) -> Option<ConnectionHandle> {
        self.inner.read().get(&instance_id).cloned()
    }

    /// Removes the entry only if it still belongs to `connection_id`.
    ///
    /// Returns true when this call actually removed the active registration;
    /// a connection that was already displaced gets false and must not touch
    /// the instance's presence.
    pub fn unregister(&self, instance_id: Uuid, connection_id: Uuid) -> bool {
        let mut connections = self.inner.write();

        match connections.get(&instance_id) {
            Some(current) if current.connection_id == connection_id => {
                connections.remove(&instance_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_online(&self, instance_id: Uuid) -> bool {
        self.inner.read().contains_key(&instance_id)
    }

    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    pub fn list(&self) -> Vec<Uuid> {
        self.inner.read().keys().copied().collect()
    }
}
