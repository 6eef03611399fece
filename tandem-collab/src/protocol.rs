//! Wire protocol between editors and the sync server.
//!
//! Every frame carries exactly one message. Binary frames are bincode
//! (serde, standard config); text frames are JSON. The server answers in
//! the codec the client last used.
//!
//! ```text
//! Client                                   Server
//!   │── Join{doc, resume_from: None} ──────►│
//!   │◄───────────── Joined{client_id, …} ───│
//!   │◄──────────── Snapshot{content, v} ────│
//!   │── Edit{op@v} ────────────────────────►│  transform, apply, log
//!   │◄──────────────── EditAck{v+1, seq} ───│  (others get Edit{v+1, op'})
//!   │── Cursor{pos} ───────────────────────►│
//!   │◄────── Presence{client, Cursor{pos}} ─│  (to everyone attached)
//! ```

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::auth::UserId;
use crate::notify::{NotificationEvent, Topic};
use crate::oplog::LoggedOp;
use crate::operation::{ClientId, DocumentId, Operation};
use crate::presence::PresenceState;

/// Frame encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Binary,
    Json,
}

/// An encoded message ready to be wrapped in a WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Attach to a document. `resume_from` is the last acknowledged
    /// version when reconnecting.
    Join {
        document_id: DocumentId,
        resume_from: Option<u64>,
    },
    Edit { op: Operation },
    Cursor { position: usize },
    ResyncRequest { last_acked_version: u64 },
    Subscribe { topic: Topic },
    Unsubscribe { topic: Topic },
    /// Relay a free-form alert to the other subscribers of `topic`.
    Notify { topic: Topic, message: String },
    Leave,
    Ping,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Joined {
        client_id: ClientId,
        user_id: UserId,
        document_id: DocumentId,
    },
    Snapshot { content: String, version: u64 },
    /// Someone else's edit, already transformed; apply at `version - 1`.
    Edit { version: u64, op: Operation },
    /// Your edit `seq` was accepted as `version`.
    EditAck { version: u64, seq: u64 },
    Replay { from_version: u64, ops: Vec<LoggedOp> },
    Presence {
        client_id: ClientId,
        user_id: UserId,
        state: PresenceState,
    },
    Notification { topic: Topic, event: NotificationEvent },
    Error { code: ErrorCode, message: String },
    Pong,
}

/// Error categories surfaced to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Undecodable frame, out-of-range edit, or message in the wrong state
    Malformed,
    RateLimited,
    /// The document already has `max_clients_per_document` clients
    DocumentFull,
    Internal,
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("connection closed")]
    ConnectionClosed,
}

pub fn encode<T: Serialize>(msg: &T, codec: Codec) -> Result<Frame, ProtocolError> {
    match codec {
        Codec::Binary => bincode::serde::encode_to_vec(msg, bincode::config::standard())
            .map(Frame::Binary)
            .map_err(|e| ProtocolError::Serialization(e.to_string())),
        Codec::Json => serde_json::to_string(msg)
            .map(Frame::Text)
            .map_err(|e| ProtocolError::Serialization(e.to_string())),
    }
}

pub fn decode_binary<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

impl ClientMessage {
    pub fn encode(&self, codec: Codec) -> Result<Frame, ProtocolError> {
        encode(self, codec)
    }
}

impl ServerMessage {
    pub fn encode(&self, codec: Codec) -> Result<Frame, ProtocolError> {
        encode(self, codec)
    }
}
