//! Waiters for in-flight forwarded requests.
//!
//! A waiter is registered *before* the `forward_request` frame is written to
//! the instance channel, so a fast response can never race past it. Each
//! waiter receives at most one terminal event: the first `response` wins and
//! later duplicates are dropped silently. When an instance disconnects, every
//! waiter bound to it is failed synchronously, before the registry entry is
//! gone, so callers observe `tunnel_disconnected` rather than a timeout.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-waiter buffer; a handful of stream chunks plus the terminal event.
const WAITER_CAPACITY: usize = 64;

/// What a waiter may observe from the tunnel.
#[derive(Debug)]
pub enum TunnelReply {
    /// Terminal: the instance answered.
    Response {
        payload: Option<serde_json::Value>,
        error: Option<String>,
    },
    /// Non-terminal: one chunk of a streamed reply.
    StreamChunk { seq: u64, data: Vec<u8> },
    /// Terminal: end of a streamed reply.
    StreamEnd,
    /// Terminal: the tunnel went away while the request was in flight.
    TunnelDisconnected,
}

impl TunnelReply {
    fn is_terminal(&self) -> bool {
        !matches!(self, TunnelReply::StreamChunk { .. })
    }
}

struct PendingEntry {
    instance_id: Uuid,
    reply_tx: mpsc::Sender<TunnelReply>,
    registered_at: OffsetDateTime,
}

#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<Uuid, PendingEntry>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter; `None` if the request id is already in flight
    /// (ids are globally unique, a duplicate is a caller error).
    pub fn register(&self, instance_id: Uuid, request_id: Uuid) -> Option<mpsc::Receiver<TunnelReply>> {
        let (reply_tx, reply_rx) = mpsc::channel(WAITER_CAPACITY);

        let mut pendings = self.inner.lock();

        if pendings.contains_key(&request_id) {
            return None;
        }

        pendings.insert(
            request_id,
            PendingEntry {
                instance_id,
                reply_tx,
                registered_at: OffsetDateTime::now_utc(),
            },
        );

        Some(reply_rx)
    }

    /// Routes one tunnel event to its waiter.
    ///
    /// Returns false when no waiter exists (late or duplicate response; the
    /// event is dropped). Terminal events remove the entry so a second
    /// `response` for the same id finds nothing.
    pub fn resolve(&self, request_id: Uuid, reply: TunnelReply) -> bool {
        let terminal = reply.is_terminal();

        let reply_tx = {
            let mut pendings = self.inner.lock();

            if terminal {
                match pendings.remove(&request_id) {
                    Some(entry) => entry.reply_tx,
                    None => return false,
                }
            } else {
                match pendings.get(&request_id) {
                    Some(entry) => entry.reply_tx.clone(),
                    None => return false,
                }
            }
        };

        // try_send keeps the tunnel task from blocking on a slow waiter; a
        // full buffer means the waiter is not draining and will time out.
        match reply_tx.try_send(reply) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(reply)) => {
                warn!(%request_id, ?reply, "Waiter buffer full, dropping tunnel reply");
                if !terminal {
                    self.remove(request_id);
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Fails every waiter bound to `instance_id`; returns how many.
    pub fn fail_all(&self, instance_id: Uuid) -> usize {
        let failed = {
            let mut pendings = self.inner.lock();

            let request_ids: Vec<Uuid> = pendings
                .iter()
                .filter(|(_, entry)| entry.instance_id == instance_id)
                .map(|(request_id, _)| *request_id)
                .collect();

            request_ids
                .into_iter()
                .filter_map(|request_id| pendings.remove(&request_id))
                .collect::<Vec<_>>()
        };

        let count = failed.len();

        for entry in failed {
            let _ = entry.reply_tx.try_send(TunnelReply::TunnelDisconnected);
        }

        count
    }

    /// Drops a waiter that gave up (timeout or cancelled client).
    pub fn remove(&self, request_id: Uuid) {
        self.inner.lock().remove(&request_id);
    }

    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Age of the oldest in-flight request, for diagnostics.
    pub fn oldest_registered_at(&self) -> Option<OffsetDateTime> {
        self.inner.lock().values().map(|entry| entry.registered_at).min()
    }
}
