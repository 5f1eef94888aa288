//! WebSocket hub server: accept loop and per-connection lifecycles.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── outbox A ── writer A ──► Client A
//!            ├── reader ── commit ──────┤
//! Client B ──┘      │      (StateStore) ├── outbox B ── writer B ──► Client B
//!                   │          │        │
//!                   │          ▼        └── outbox C ── writer C ──► Client C
//!                   │   BroadcastEngine ──┘
//!                   ▼
//!          SubscriptionRegistry
//! ```
//!
//! Each connection runs two tasks. The reader decodes frames and applies
//! them; the writer drains the connection's bounded outbox and sends
//! heartbeats. A slow client therefore only ever fills its own queue.
//!
//! Commits, their fan-out, and the snapshot handed to a new client are
//! sequenced by one commit lock, so every queue sees a key's changes in
//! commit order and a new client neither misses nor pre-receives a write.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::broadcast::{BroadcastEngine, BroadcastEvent, Frame, Outbox};
use crate::config::HubConfig;
use crate::protocol::{
    ClientMessage, HubMessage, KeySet, PeerAddress, ProtocolError, UpdateAck, UpdateMessage,
    UpdateRejected,
};
use crate::registry::SubscriptionRegistry;
use crate::store::{Snapshot, StateStore, StoreError, VersionedValue};

/// Hub-owned key tracking which identified subsystems are online.
pub const SUBSYSTEM_STATS_KEY: &str = "subsystem_stats";

/// Fatal hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub updates_applied: u64,
    pub updates_rejected: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub keys: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    updates_applied: AtomicU64,
    updates_rejected: AtomicU64,
}

/// Why a connection ended.
#[derive(Debug)]
enum Disconnect {
    PeerClosed,
    ConnectionLost(String),
    IdleTimeout,
    Protocol(String),
    WriterGone,
    Shutdown,
}

impl Disconnect {
    fn close_notice(&self) -> CloseNotice {
        match self {
            Self::Protocol(reason) => CloseNotice {
                code: CloseCode::Protocol,
                reason: "protocol error".into(),
                error_frame: HubMessage::error(reason.clone())
                    .encode()
                    .ok()
                    .map(Frame::from),
            },
            Self::IdleTimeout => CloseNotice::new(CloseCode::Away, "idle timeout"),
            Self::Shutdown => CloseNotice::new(CloseCode::Away, "hub shutting down"),
            Self::PeerClosed | Self::ConnectionLost(_) | Self::WriterGone => {
                CloseNotice::new(CloseCode::Normal, "")
            }
        }
    }
}

/// Final instructions for a connection's writer.
#[derive(Debug)]
struct CloseNotice {
    code: CloseCode,
    reason: String,
    /// `error` frame to send before closing.
    error_frame: Option<Frame>,
}

impl CloseNotice {
    fn new(code: CloseCode, reason: &str) -> Self {
        Self {
            code,
            reason: reason.to_string(),
            error_frame: None,
        }
    }
}

/// Owns every live connection and the shared state they act on.
struct ConnectionManager {
    config: HubConfig,
    store: StateStore,
    registry: Arc<SubscriptionRegistry>,
    engine: BroadcastEngine,
    /// Sequences commits with their fan-out.
    commit: Mutex<()>,
    counters: Counters,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ConnectionManager {
    fn new(config: HubConfig) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        Self {
            config,
            store: StateStore::new(),
            engine: BroadcastEngine::new(registry.clone()),
            registry,
            commit: Mutex::new(()),
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Make a new client reachable (subscribed to ALL) and queue its snapshot.
    async fn register(&self, client_id: Uuid, outbox: &Outbox) -> Result<(), ProtocolError> {
        let _commit = self.commit.lock().await;
        let snapshot = self.store.read_all().await;
        let frame: Frame = HubMessage::Snapshot(snapshot).encode()?.into();

        self.engine.attach(client_id, outbox.clone()).await;
        self.registry.subscribe(client_id, &KeySet::All).await;
        self.engine.offer(&client_id, outbox, frame);
        Ok(())
    }

    async fn unregister(&self, client_id: &Uuid, identity: Option<&str>) {
        self.registry.remove(client_id).await;
        self.engine.detach(client_id).await;
        if let Some(name) = identity {
            self.set_online(name, false).await;
        }
    }

    /// Apply an update and fan it out.
    ///
    /// When `origin` is given, its acknowledgement or rejection is queued
    /// before the commit lock is released, so the originator's queue also
    /// follows commit order.
    async fn commit(
        &self,
        origin: Option<(Uuid, &Outbox)>,
        update: UpdateMessage,
    ) -> Result<u64, StoreError> {
        let UpdateMessage {
            key,
            value,
            expected_version,
        } = update;

        let _commit = self.commit.lock().await;
        let result = self.store.write(&key, value.clone(), expected_version).await;

        let reply = match &result {
            Ok(version) => {
                self.counters.updates_applied.fetch_add(1, Ordering::Relaxed);
                let event = BroadcastEvent {
                    key: key.clone(),
                    value,
                    version: *version,
                    origin: origin.map(|(id, _)| id),
                };
                if let Err(e) = self.engine.publish(&event).await {
                    log::error!("failed to publish change to '{key}': {e}");
                }
                HubMessage::UpdateAck(UpdateAck {
                    key,
                    version: *version,
                })
            }
            Err(err) => {
                self.counters.updates_rejected.fetch_add(1, Ordering::Relaxed);
                log::debug!("rejected update: {err}");
                let StoreError::VersionConflict {
                    key,
                    current_value,
                    current_version,
                    ..
                } = err;
                HubMessage::UpdateRejected(UpdateRejected {
                    key: key.clone(),
                    current_value: current_value.clone(),
                    current_version: *current_version,
                    reason: err.to_string(),
                })
            }
        };

        if let Some((client_id, outbox)) = origin {
            self.send_to(&client_id, outbox, &reply);
        }
        result
    }

    /// Mark an identified subsystem online or offline in `subsystem_stats`.
    async fn set_online(&self, subsystem: &str, online: bool) {
        let _commit = self.commit.lock().await;
        let status = u8::from(online);
        let current = self.store.read(SUBSYSTEM_STATS_KEY).await;
        let expected = current.as_ref().map_or(0, |c| c.version);

        let mut stats = current
            .and_then(|c| match c.value {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();
        let entry = stats
            .entry(subsystem.to_string())
            .or_insert_with(|| json!({}));
        match entry.as_object_mut() {
            Some(fields) => {
                fields.insert("online".into(), json!(status));
            }
            None => *entry = json!({ "online": status }),
        }
        let value = Value::Object(stats);

        // Every writer holds the commit lock, so the expected version holds.
        let version = match self
            .store
            .write(SUBSYSTEM_STATS_KEY, value.clone(), Some(expected))
            .await
        {
            Ok(version) => version,
            Err(e) => {
                log::error!("failed to update {SUBSYSTEM_STATS_KEY}: {e}");
                return;
            }
        };

        let event = BroadcastEvent {
            key: SUBSYSTEM_STATS_KEY.to_string(),
            value,
            version,
            origin: None,
        };
        if let Err(e) = self.engine.publish(&event).await {
            log::error!("failed to publish {SUBSYSTEM_STATS_KEY}: {e}");
        }
    }

    fn send_to(&self, client_id: &Uuid, outbox: &Outbox, msg: &HubMessage) {
        match msg.encode() {
            Ok(text) => {
                self.engine.offer(client_id, outbox, text.into());
            }
            Err(e) => log::error!("failed to encode reply for client {client_id}: {e}"),
        }
    }

    async fn stats(&self) -> HubStats {
        let broadcast = self.engine.stats().await;
        HubStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            updates_applied: self.counters.updates_applied.load(Ordering::Relaxed),
            updates_rejected: self.counters.updates_rejected.load(Ordering::Relaxed),
            messages_sent: broadcast.messages_sent,
            messages_dropped: broadcast.messages_dropped,
            keys: self.store.len().await,
        }
    }
}

/// One live client connection, owned by its reader task.
struct Connection {
    id: Uuid,
    addr: SocketAddr,
    /// Subsystem name announced via `identity`
    identity: Option<String>,
    outbox: Outbox,
    manager: Arc<ConnectionManager>,
}

impl Connection {
    async fn read_loop<S>(&mut self, mut stream: S, cancel: &CancellationToken) -> Disconnect
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let idle_timeout = self.manager.config.idle_timeout;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    return if self.manager.shutdown.is_cancelled() {
                        Disconnect::Shutdown
                    } else {
                        Disconnect::WriterGone
                    };
                }
                next = tokio::time::timeout(idle_timeout, stream.next()) => next,
            };

            let message = match next {
                Err(_) => return Disconnect::IdleTimeout,
                Ok(None) => return Disconnect::PeerClosed,
                Ok(Some(Err(e))) => return Disconnect::ConnectionLost(e.to_string()),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => match ClientMessage::decode(&text) {
                    Ok(msg) => {
                        self.log_inbound(&msg, &text);
                        self.dispatch(msg).await;
                    }
                    Err(e) => return Disconnect::Protocol(e.to_string()),
                },
                Message::Binary(_) => {
                    return Disconnect::Protocol(
                        ProtocolError::UnsupportedFrame("binary frames are not accepted")
                            .to_string(),
                    );
                }
                Message::Close(_) => return Disconnect::PeerClosed,
                // Ping, pong and raw frames only prove liveness.
                _ => {}
            }
        }
    }

    async fn dispatch(&mut self, msg: ClientMessage) {
        let manager = self.manager.clone();
        match msg {
            ClientMessage::Update(update) => {
                let _ = manager.commit(Some((self.id, &self.outbox)), update).await;
            }
            ClientMessage::Subscribe(keys) => {
                log::debug!("client {} subscribing to {keys:?}", self.id);
                manager.registry.subscribe(self.id, &keys).await;
            }
            ClientMessage::Unsubscribe(keys) => {
                log::debug!("client {} unsubscribing from {keys:?}", self.id);
                manager.registry.unsubscribe(self.id, &keys).await;
            }
            ClientMessage::GetState(keys) => {
                let snapshot = match keys {
                    Some(keys) => manager.store.read_keys(&keys).await,
                    None => manager.store.read_all().await,
                };
                self.reply(&HubMessage::Snapshot(snapshot));
            }
            ClientMessage::Identity(name) => {
                log::info!("client {} ({}) identified as '{name}'", self.id, self.addr);
                if let Some(previous) = self.identity.replace(name.clone()) {
                    if previous != name {
                        manager.set_online(&previous, false).await;
                    }
                }
                manager.set_online(&name, true).await;
                self.reply(&HubMessage::Iseeu(PeerAddress {
                    ip: self.addr.ip().to_string(),
                    port: self.addr.port(),
                }));
            }
            ClientMessage::Ping => self.reply(&HubMessage::Pong),
            ClientMessage::Pong => {}
        }
    }

    fn reply(&self, msg: &HubMessage) {
        self.manager.send_to(&self.id, &self.outbox, msg);
    }

    fn log_inbound(&self, msg: &ClientMessage, text: &str) {
        if self.manager.config.log_all_messages && !msg.is_heartbeat() {
            log::info!("received {text} from {}", self.addr);
        } else {
            log::trace!("received {text} from {}", self.addr);
        }
    }
}

/// Longest the writer spends on the final drain and close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Drain a connection's outbox onto the socket until told to close.
///
/// A send that makes no progress for `send_timeout`, or that is still
/// pending when `cancel` fires, is abandoned. The sink is then dropped,
/// which closes the socket under a peer that stopped reading.
async fn write_loop<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<Frame>,
    mut close: oneshot::Receiver<CloseNotice>,
    cancel: CancellationToken,
    heartbeat: Duration,
    send_timeout: Duration,
    log_all_messages: bool,
) where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);

    let notice = loop {
        let outgoing = tokio::select! {
            biased;
            notice = &mut close => break notice.ok(),
            frame = queue.recv() => {
                let Some(frame) = frame else { break None };
                log_outbound(&frame, log_all_messages);
                Message::text(frame.to_string())
            }
            _ = ticker.tick() => Message::Ping(Default::default()),
        };

        let sent = tokio::select! {
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(send_timeout, sink.send(outgoing)) => Some(result),
        };
        match sent {
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(e))) => {
                log::debug!("write failed: {e}");
                cancel.cancel();
                return;
            }
            Some(Err(_)) => {
                log::warn!("client stalled for {send_timeout:?}, dropping connection");
                cancel.cancel();
                return;
            }
            // The reader is tearing the connection down; its notice follows.
            None => break (&mut close).await.ok(),
        }
    };

    let Some(notice) = notice else {
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
        return;
    };

    let closing = async move {
        while let Ok(frame) = queue.try_recv() {
            sink.send(Message::text(frame.to_string())).await?;
        }
        if let Some(frame) = notice.error_frame {
            sink.send(Message::text(frame.to_string())).await?;
        }
        sink.send(Message::Close(Some(CloseFrame {
            code: notice.code,
            reason: notice.reason.into(),
        })))
        .await?;
        sink.close().await
    };
    match tokio::time::timeout(CLOSE_TIMEOUT, closing).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!("close sequence failed: {e}"),
        Err(_) => log::debug!("client did not take its close frame within {CLOSE_TIMEOUT:?}"),
    }
}

fn log_outbound(frame: &str, log_all_messages: bool) {
    if log_all_messages && frame != r#"{"type":"pong"}"# {
        log::info!("sending {frame}");
    } else {
        log::trace!("sending {frame}");
    }
}

async fn handle_connection(
    manager: Arc<ConnectionManager>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), ProtocolError> {
    let handshake = tokio::time::timeout(
        manager.config.idle_timeout,
        tokio_tungstenite::accept_async(stream),
    );
    let ws_stream = tokio::select! {
        _ = manager.shutdown.cancelled() => return Ok(()),
        result = handshake => result.map_err(|_| ProtocolError::Timeout)??,
    };
    let (ws_sender, ws_receiver) = ws_stream.split();

    let client_id = Uuid::new_v4();
    manager.counters.total_connections.fetch_add(1, Ordering::Relaxed);
    manager.counters.active_connections.fetch_add(1, Ordering::Relaxed);
    log::info!("client {client_id} connected from {addr}");

    let (outbox, queue) = mpsc::channel(manager.config.queue_capacity);
    let (close_tx, close_rx) = oneshot::channel();
    let cancel = manager.shutdown.child_token();
    let writer = tokio::spawn(write_loop(
        ws_sender,
        queue,
        close_rx,
        cancel.clone(),
        manager.config.heartbeat_interval,
        manager.config.idle_timeout,
        manager.config.log_all_messages,
    ));

    let mut connection = Connection {
        id: client_id,
        addr,
        identity: None,
        outbox,
        manager: manager.clone(),
    };

    let reason = match manager.register(client_id, &connection.outbox).await {
        Ok(()) => connection.read_loop(ws_receiver, &cancel).await,
        Err(e) => Disconnect::ConnectionLost(e.to_string()),
    };

    manager
        .unregister(&client_id, connection.identity.as_deref())
        .await;
    manager.counters.active_connections.fetch_sub(1, Ordering::Relaxed);

    match &reason {
        Disconnect::PeerClosed | Disconnect::Shutdown => {
            log::info!("client {client_id} ({addr}) disconnected: {reason:?}")
        }
        Disconnect::Protocol(e) => log::warn!("closing client {client_id} ({addr}): {e}"),
        _ => log::info!("lost client {client_id} ({addr}): {reason:?}"),
    }

    let _ = close_tx.send(reason.close_notice());
    // Unblocks a writer stuck on a peer that stopped reading.
    cancel.cancel();
    drop(connection);
    if let Err(e) = writer.await {
        log::error!("writer task for client {client_id} failed: {e}");
    }
    Ok(())
}

async fn accept_loop(manager: Arc<ConnectionManager>, listener: TcpListener) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = manager.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        log::debug!("new TCP connection from {addr}");
        let connection_manager = manager.clone();
        manager.tracker.spawn(async move {
            if let Err(e) = handle_connection(connection_manager, stream, addr).await {
                log::error!("connection error from {addr}: {e}");
            }
        });
    }
    log::debug!("accept loop stopped");
}

/// A running hub.
///
/// Dropping the hub cancels it without waiting; call [`Hub::stop`] for a
/// graceful shutdown.
pub struct Hub {
    manager: Arc<ConnectionManager>,
    local_addr: SocketAddr,
    accept_task: Option<JoinHandle<()>>,
}

impl Hub {
    /// Bind and start accepting connections.
    ///
    /// A configured port of 0 binds any free port; read it back with
    /// [`Hub::port`].
    pub async fn start(config: HubConfig) -> Result<Self, HubError> {
        config.validate()?;

        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| HubError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        log::info!("central hub listening on {local_addr}");

        let manager = Arc::new(ConnectionManager::new(config));
        let accept_task = tokio::spawn(accept_loop(manager.clone(), listener));

        Ok(Self {
            manager,
            local_addr,
            accept_task: Some(accept_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The port actually bound.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// WebSocket URL clients can connect to.
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    pub fn config(&self) -> &HubConfig {
        &self.manager.config
    }

    /// Write a key from inside the hub process, broadcast like any update.
    pub async fn write(
        &self,
        key: impl Into<String>,
        value: Value,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let update = UpdateMessage {
            key: key.into(),
            value,
            expected_version,
        };
        self.manager.commit(None, update).await
    }

    pub async fn read(&self, key: &str) -> Option<VersionedValue> {
        self.manager.store.read(key).await
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.manager.store.read_all().await
    }

    pub async fn stats(&self) -> HubStats {
        self.manager.stats().await
    }

    /// Number of clients currently registered for broadcasts.
    pub async fn client_count(&self) -> usize {
        self.manager.registry.client_count().await
    }

    /// Stop accepting, close every connection, and wait for their cleanup.
    pub async fn stop(mut self) {
        log::info!("central hub on {} stopping", self.local_addr);
        self.manager.shutdown.cancel();
        if let Some(accept_task) = self.accept_task.take() {
            if let Err(e) = accept_task.await {
                log::error!("accept loop failed: {e}");
            }
        }
        self.manager.tracker.close();
        self.manager.tracker.wait().await;
        log::info!("central hub stopped");
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.manager.shutdown.cancel();
    }
}
