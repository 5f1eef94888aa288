//! Fan-out of committed changes to per-client outbound queues.
//!
//! Each connected client has a bounded queue (`Outbox`) drained by its own
//! writer task. Publishing never waits on a queue: a full or closed queue
//! drops the event for that client only (drop-newest). A client that misses
//! events recovers by reconnecting and taking a fresh snapshot.
//!
//! The engine pre-encodes each event once and shares the frame across
//! every recipient.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{HubMessage, ProtocolError, StateChanged};
use crate::registry::SubscriptionRegistry;

/// An encoded text frame, shared between every queue it was offered to.
pub type Frame = Arc<str>;

/// Sending half of a client's outbound queue.
pub type Outbox = mpsc::Sender<Frame>;

/// A committed change waiting to be delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEvent {
    pub key: String,
    pub value: Value,
    pub version: u64,
    /// Client whose update produced this event; `None` for hub-owned keys.
    pub origin: Option<Uuid>,
}

impl BroadcastEvent {
    fn to_message(&self) -> HubMessage {
        HubMessage::StateChanged(StateChanged {
            key: self.key.clone(),
            value: self.value.clone(),
            version: self.version,
        })
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub attached_clients: usize,
}

/// Lock-free counters touched on the publish path.
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Routes committed changes to interested clients.
pub struct BroadcastEngine {
    registry: Arc<SubscriptionRegistry>,
    outboxes: RwLock<HashMap<Uuid, Outbox>>,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastEngine {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            registry,
            outboxes: RwLock::new(HashMap::new()),
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Make a client's queue reachable for fan-out.
    pub async fn attach(&self, client_id: Uuid, outbox: Outbox) {
        self.outboxes.write().await.insert(client_id, outbox);
    }

    /// Stop delivering to a client. Returns whether it was attached.
    pub async fn detach(&self, client_id: &Uuid) -> bool {
        self.outboxes.write().await.remove(client_id).is_some()
    }

    /// Deliver `event` to every subscriber of its key except the origin.
    ///
    /// Returns how many queues accepted the event. Callers that need
    /// per-key ordering must serialize calls to `publish` with their
    /// commits.
    pub async fn publish(&self, event: &BroadcastEvent) -> Result<usize, ProtocolError> {
        let frame: Frame = event.to_message().encode()?.into();
        let targets = self.registry.subscribers_for(&event.key).await;
        if targets.is_empty() {
            log::trace!("no subscribers for '{}'", event.key);
            return Ok(0);
        }

        let outboxes = self.outboxes.read().await;
        let mut delivered = 0;
        for client_id in targets {
            if event.origin == Some(client_id) {
                continue;
            }
            let Some(outbox) = outboxes.get(&client_id) else {
                continue;
            };
            if self.offer(&client_id, outbox, frame.clone()) {
                delivered += 1;
            }
        }

        Ok(delivered)
    }

    /// Non-blocking enqueue onto one client's queue, counting drops.
    pub fn offer(&self, client_id: &Uuid, outbox: &Outbox, frame: Frame) -> bool {
        match outbox.try_send(frame) {
            Ok(()) => {
                self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("outbound queue full for client {client_id}, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("client {client_id} is closing, dropping message");
                false
            }
        }
    }

    pub async fn attached_count(&self) -> usize {
        self.outboxes.read().await.len()
    }

    /// Snapshot of the broadcast counters.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            attached_clients: self.attached_count().await,
        }
    }
}
