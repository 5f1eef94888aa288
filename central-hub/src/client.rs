//! WebSocket client for the central hub.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - Typed senders for every client→hub message
//! - A local mirror of subscribed state, kept current from snapshots and
//!   `state_changed` events (stale versions are ignored)
//! - An event stream of everything the hub sends
//!
//! [`send_update`] is the one-shot form used by scripts and test harnesses.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    ClientMessage, ErrorReport, HubMessage, KeySet, PeerAddress, ProtocolError, StateChanged,
    UpdateAck, UpdateMessage, UpdateRejected,
};
use crate::store::{Snapshot, VersionedValue};

/// How long [`send_update`] waits for the hub's answer.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Events emitted by the hub client.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Snapshot(Snapshot),
    StateChanged(StateChanged),
    UpdateAck(UpdateAck),
    UpdateRejected(UpdateRejected),
    Iseeu(PeerAddress),
    /// The hub reported an error; the connection is about to close
    Error(ErrorReport),
    Pong,
    /// Connection lost
    Disconnected,
}

/// Outcome of an update request.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied { version: u64 },
    Rejected(UpdateRejected),
}

/// A connection to the hub.
pub struct HubClient {
    /// Channel to the WebSocket writer task
    outgoing_tx: mpsc::Sender<Message>,
    events: mpsc::Receiver<HubEvent>,
    mirror: Arc<RwLock<Snapshot>>,
    state: Arc<RwLock<ConnectionState>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl HubClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:5100/ws`).
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(url: &str) -> Result<Self, ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(256);
        let (event_tx, events) = mpsc::channel(1024);
        let mirror = Arc::new(RwLock::new(Snapshot::new()));
        let state = Arc::new(RwLock::new(ConnectionState::Connected));

        // Writer task: forward outgoing channel to WebSocket
        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: decode hub messages, keep the mirror current
        let reader_mirror = mirror.clone();
        let reader_state = state.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let hub_msg = match HubMessage::decode(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        log::warn!("ignoring undecodable hub frame: {e}");
                        continue;
                    }
                };

                let event = match hub_msg {
                    HubMessage::Snapshot(snapshot) => {
                        merge_snapshot(&mut *reader_mirror.write().await, &snapshot);
                        HubEvent::Snapshot(snapshot)
                    }
                    HubMessage::StateChanged(change) => {
                        apply_change(&mut *reader_mirror.write().await, &change);
                        HubEvent::StateChanged(change)
                    }
                    HubMessage::UpdateAck(ack) => HubEvent::UpdateAck(ack),
                    HubMessage::UpdateRejected(rejected) => {
                        apply_change(
                            &mut *reader_mirror.write().await,
                            &StateChanged {
                                key: rejected.key.clone(),
                                value: rejected.current_value.clone(),
                                version: rejected.current_version,
                            },
                        );
                        HubEvent::UpdateRejected(rejected)
                    }
                    HubMessage::Iseeu(addr) => HubEvent::Iseeu(addr),
                    HubMessage::Error(report) => HubEvent::Error(report),
                    HubMessage::Pong => HubEvent::Pong,
                };

                if event_tx.send(event).await.is_err() {
                    break;
                }
            }

            // Connection lost
            *reader_state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(HubEvent::Disconnected).await;
        });

        Ok(Self {
            outgoing_tx,
            events,
            mirror,
            state,
            reader,
            writer,
        })
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let text = msg.encode()?;
        self.outgoing_tx
            .send(Message::text(text))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Send a raw text frame, bypassing the codec.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        let text: String = text.into();
        self.outgoing_tx
            .send(Message::text(text))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn subscribe(&self, keys: KeySet) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Subscribe(keys)).await
    }

    pub async fn unsubscribe(&self, keys: KeySet) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Unsubscribe(keys)).await
    }

    /// Ask for a snapshot of all keys (`None`) or of the listed keys.
    pub async fn get_state(&self, keys: Option<Vec<String>>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::GetState(keys)).await
    }

    /// Announce this process' subsystem name.
    pub async fn identify(&self, name: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Identity(name.into())).await
    }

    /// Request an unconditional write.
    pub async fn update(&self, key: impl Into<String>, value: Value) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Update(UpdateMessage {
            key: key.into(),
            value,
            expected_version: None,
        }))
        .await
    }

    /// Request a write that only applies if `key` is still at `expected_version`.
    pub async fn update_if(
        &self,
        key: impl Into<String>,
        value: Value,
        expected_version: u64,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Update(UpdateMessage {
            key: key.into(),
            value,
            expected_version: Some(expected_version),
        }))
        .await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping).await
    }

    /// Next event from the hub, or `None` once the event stream has ended.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.events.recv().await
    }

    /// Next event within `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<HubEvent, ProtocolError> {
        match tokio::time::timeout(timeout, self.events.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(ProtocolError::ConnectionClosed),
            Err(_) => Err(ProtocolError::Timeout),
        }
    }

    /// Skip events until one matches `pred`, failing after `timeout`.
    pub async fn wait_for<F>(
        &mut self,
        timeout: Duration,
        mut pred: F,
    ) -> Result<HubEvent, ProtocolError>
    where
        F: FnMut(&HubEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = self.recv_timeout(remaining).await?;
            if pred(&event) {
                return Ok(event);
            }
            if event == HubEvent::Disconnected {
                return Err(ProtocolError::ConnectionClosed);
            }
        }
    }

    /// Send an update and wait for its acknowledgement or rejection.
    ///
    /// Other events received meanwhile are consumed.
    pub async fn update_and_wait(
        &mut self,
        key: impl Into<String>,
        value: Value,
        expected_version: Option<u64>,
        timeout: Duration,
    ) -> Result<UpdateOutcome, ProtocolError> {
        let key = key.into();
        self.send(&ClientMessage::Update(UpdateMessage {
            key: key.clone(),
            value,
            expected_version,
        }))
        .await?;

        let event = self
            .wait_for(timeout, |event| match event {
                HubEvent::UpdateAck(ack) => ack.key == key,
                HubEvent::UpdateRejected(rejected) => rejected.key == key,
                HubEvent::Error(_) => true,
                _ => false,
            })
            .await?;

        match event {
            HubEvent::UpdateAck(ack) => Ok(UpdateOutcome::Applied {
                version: ack.version,
            }),
            HubEvent::UpdateRejected(rejected) => Ok(UpdateOutcome::Rejected(rejected)),
            HubEvent::Error(report) => Err(ProtocolError::Hub(report.reason)),
            _ => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Local copy of every key seen so far.
    pub async fn mirror(&self) -> Snapshot {
        self.mirror.read().await.clone()
    }

    /// Local copy of one key.
    pub async fn value(&self, key: &str) -> Option<VersionedValue> {
        self.mirror.read().await.get(key).cloned()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Close the connection and wait for the background tasks to finish.
    pub async fn close(self) {
        let _ = self.outgoing_tx.send(Message::Close(None)).await;
        drop(self.outgoing_tx);
        let _ = self.writer.await;
        // The hub answers our close frame, which ends the reader.
        if tokio::time::timeout(Duration::from_secs(1), self.reader)
            .await
            .is_err()
        {
            log::debug!("hub did not answer close in time");
        }
    }
}

/// Connect, write one key, wait for the acknowledgement, disconnect.
///
/// Returns the committed version.
pub async fn send_update(
    url: &str,
    key: impl Into<String>,
    value: Value,
) -> Result<u64, ProtocolError> {
    let mut client = HubClient::connect(url).await?;
    let outcome = client
        .update_and_wait(key, value, None, DEFAULT_REPLY_TIMEOUT)
        .await;
    client.close().await;

    match outcome? {
        UpdateOutcome::Applied { version } => Ok(version),
        UpdateOutcome::Rejected(rejected) => Err(ProtocolError::Hub(rejected.reason)),
    }
}

fn merge_snapshot(mirror: &mut Snapshot, snapshot: &Snapshot) {
    for (key, entry) in snapshot {
        apply_change(
            mirror,
            &StateChanged {
                key: key.clone(),
                value: entry.value.clone(),
                version: entry.version,
            },
        );
    }
}

/// Apply a change unless the mirror already holds the same or a newer version.
fn apply_change(mirror: &mut Snapshot, change: &StateChanged) {
    let stale = mirror
        .get(&change.key)
        .is_some_and(|current| current.version >= change.version);
    if stale {
        return;
    }
    mirror.insert(
        change.key.clone(),
        VersionedValue {
            value: change.value.clone(),
            version: change.version,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(key: &str, value: Value, version: u64) -> StateChanged {
        StateChanged {
            key: key.into(),
            value,
            version,
        }
    }

    #[test]
    fn test_apply_change_inserts_new_key() {
        let mut mirror = Snapshot::new();
        apply_change(&mut mirror, &change("x", json!(1), 1));
        assert_eq!(mirror["x"].value, json!(1));
    }

    #[test]
    fn test_apply_change_ignores_stale_versions() {
        let mut mirror = Snapshot::new();
        apply_change(&mut mirror, &change("x", json!("new"), 3));
        apply_change(&mut mirror, &change("x", json!("old"), 2));
        apply_change(&mut mirror, &change("x", json!("dup"), 3));

        assert_eq!(mirror["x"].value, json!("new"));
        assert_eq!(mirror["x"].version, 3);
    }

    #[test]
    fn test_merge_snapshot_keeps_newer_local_values() {
        let mut mirror = Snapshot::new();
        apply_change(&mut mirror, &change("a", json!(5), 5));

        let mut snapshot = Snapshot::new();
        snapshot.insert(
            "a".into(),
            VersionedValue {
                value: json!(4),
                version: 4,
            },
        );
        snapshot.insert(
            "b".into(),
            VersionedValue {
                value: json!(true),
                version: 1,
            },
        );
        merge_snapshot(&mut mirror, &snapshot);

        assert_eq!(mirror["a"].version, 5);
        assert_eq!(mirror["b"].value, json!(true));
    }

    #[tokio::test]
    async fn test_connect_to_nothing_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = HubClient::connect(&format!("ws://127.0.0.1:{port}/ws")).await;
        assert!(matches!(result, Err(ProtocolError::WebSocket(_))));
    }
}
