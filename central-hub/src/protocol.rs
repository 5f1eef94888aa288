//! JSON wire protocol spoken over WebSocket text frames.
//!
//! Every frame is an envelope:
//! ```text
//! { "type": "<message name>", "data": <payload> }
//! ```
//! `data` is omitted for payload-less messages (`ping`, `pong`).
//!
//! Key selections (`subscribe`, `unsubscribe`) are either a list of key
//! names or the marker `"*"` meaning every key.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::Snapshot;

/// Marker used on the wire for "all keys".
pub const ALL_KEYS_MARKER: &str = "*";

/// A set of keys, or every key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawKeySet", into = "RawKeySet")]
pub enum KeySet {
    All,
    Keys(Vec<String>),
}

impl KeySet {
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Keys(keys.into_iter().map(Into::into).collect())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawKeySet {
    Marker(String),
    Keys(Vec<String>),
}

impl TryFrom<RawKeySet> for KeySet {
    type Error = String;

    fn try_from(raw: RawKeySet) -> Result<Self, Self::Error> {
        match raw {
            RawKeySet::Marker(m) if m == ALL_KEYS_MARKER => Ok(KeySet::All),
            RawKeySet::Marker(m) => Err(format!(
                "expected \"{ALL_KEYS_MARKER}\" or a list of keys, got \"{m}\""
            )),
            RawKeySet::Keys(keys) => Ok(KeySet::Keys(keys)),
        }
    }
}

impl From<KeySet> for RawKeySet {
    fn from(set: KeySet) -> Self {
        match set {
            KeySet::All => RawKeySet::Marker(ALL_KEYS_MARKER.to_string()),
            KeySet::Keys(keys) => RawKeySet::Keys(keys),
        }
    }
}

/// A requested write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessage {
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateAck {
    pub key: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRejected {
    pub key: String,
    pub current_value: Value,
    pub current_version: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChanged {
    pub key: String,
    pub value: Value,
    pub version: u64,
}

/// Remote address of a client as the hub sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub reason: String,
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe(KeySet),
    Unsubscribe(KeySet),
    /// Request a snapshot of all keys (`None`) or of the listed keys.
    GetState(Option<Vec<String>>),
    /// Announce the subsystem name of this connection.
    Identity(String),
    Update(UpdateMessage),
    Ping,
    Pong,
}

/// Messages sent by the hub.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum HubMessage {
    Snapshot(Snapshot),
    UpdateAck(UpdateAck),
    UpdateRejected(UpdateRejected),
    StateChanged(StateChanged),
    Iseeu(PeerAddress),
    Error(ErrorReport),
    /// Reply to a client `ping`. Hub heartbeats are WebSocket ping frames.
    Pong,
}

/// Protocol and transport errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("unsupported frame: {0}")]
    UnsupportedFrame(&'static str),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("hub reported an error: {0}")]
    Hub(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for the hub")]
    Timeout,
}

/// The frame envelope, before the payload is interpreted.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    fn payload<T: serde::de::DeserializeOwned>(self) -> Result<T, ProtocolError> {
        let kind = self.kind;
        serde_json::from_value(self.data)
            .map_err(|e| ProtocolError::Malformed(format!("bad '{kind}' payload: {e}")))
    }
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope = Envelope::parse(text)?;
        let msg = match envelope.kind.as_str() {
            "subscribe" => Self::Subscribe(envelope.payload()?),
            "unsubscribe" => Self::Unsubscribe(envelope.payload()?),
            "get_state" => Self::GetState(envelope.payload()?),
            "identity" => Self::Identity(envelope.payload()?),
            "update" => Self::Update(envelope.payload()?),
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            _ => return Err(ProtocolError::UnknownType(envelope.kind)),
        };
        Ok(msg)
    }

    /// Heartbeat traffic is excluded from message logging.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Ping | Self::Pong)
    }
}

impl HubMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope = Envelope::parse(text)?;
        let msg = match envelope.kind.as_str() {
            "snapshot" => Self::Snapshot(envelope.payload()?),
            "update_ack" => Self::UpdateAck(envelope.payload()?),
            "update_rejected" => Self::UpdateRejected(envelope.payload()?),
            "state_changed" => Self::StateChanged(envelope.payload()?),
            "iseeu" => Self::Iseeu(envelope.payload()?),
            "error" => Self::Error(envelope.payload()?),
            "pong" => Self::Pong,
            _ => return Err(ProtocolError::UnknownType(envelope.kind)),
        };
        Ok(msg)
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error(ErrorReport {
            reason: reason.into(),
        })
    }
}
