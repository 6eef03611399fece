//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, resume, disconnect, close)
//! - A [`Replica`] that mirrors the server's canonical text
//! - Pending edits that survive disconnects and are resent on resume
//! - Presence (remote cursors) via [`PresenceRoom`]
//!
//! The replica only ever holds server-confirmed text. Local edits are
//! authored against the confirmed version and applied once the server
//! orders them; the acknowledgement is turned back into the transformed
//! operation with the same rules the server used, so every replica walks
//! through the same sequence of versions.
//!
//! ```text
//!   Connecting ──► Joined ──► Disconnected ──► Resyncing ──► Joined
//!        │                                                     │
//!        └────────────────────► Closed ◄───────────────────────┘
//! ```

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;

use crate::auth::UserId;
use crate::notify::{NotificationEvent, Topic};
use crate::oplog::LoggedOp;
use crate::operation::{ClientId, DocumentId, OutOfBounds, Operation};
use crate::presence::{PresenceRoom, PresenceState};
use crate::protocol::{self, ClientMessage, Codec, ErrorCode, Frame, ProtocolError, ServerMessage};
use crate::transform::transform;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Joined,
    /// Waiting for a replay or snapshot after a gap or a resume
    Resyncing,
    /// Closed by the application; terminal
    Closed,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Joined {
        client_id: ClientId,
        document_id: DocumentId,
    },
    /// Replica replaced by a server snapshot; `discarded` pending edits dropped
    Snapshot { version: u64, discarded: usize },
    /// Missed operations replayed after a resume or resync
    Replayed { from_version: u64, count: usize },
    /// Another client's edit, applied to the replica
    RemoteEdit { version: u64, op: Operation },
    /// One of our edits was accepted as `version`
    Acked { version: u64, seq: u64 },
    Presence {
        client_id: ClientId,
        user_id: UserId,
        state: PresenceState,
    },
    Notification { topic: Topic, event: NotificationEvent },
    ServerError { code: ErrorCode, message: String },
    Pong,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    OutOfBounds(#[from] OutOfBounds),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("server refused the credentials")]
    Unauthorized,
    #[error("server rejected join ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },
    /// Missed versions between the replica and an incoming message
    #[error("expected version {expected}, got {got}")]
    Gap { expected: u64, got: u64 },
    #[error("acknowledgement for unknown edit {seq}")]
    UnknownAck { seq: u64 },
    #[error("client is closed")]
    Closed,
}

// ───────────────────────────────────────────────────────────────────
// Replica
// ───────────────────────────────────────────────────────────────────

/// Server-consistent copy of one document plus the edits still in flight.
#[derive(Debug, Default)]
pub struct Replica {
    content: String,
    version: u64,
    client_id: ClientId,
    /// Sent but not yet ordered by the server, oldest first
    pending: VecDeque<Operation>,
    /// Ordered ops newer than the oldest pending base
    history: Vec<LoggedOp>,
    next_seq: u64,
    /// Whether a snapshot or replay has ever been applied
    synced: bool,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Version to resume from when rejoining, None before the first sync.
    pub fn resume_point(&self) -> Option<u64> {
        self.synced.then_some(self.version)
    }

    pub fn set_client(&mut self, client_id: ClientId) {
        self.client_id = client_id;
    }

    /// Author an insert against the confirmed text.
    pub fn insert(&mut self, position: usize, text: impl Into<String>) -> Result<Operation, ClientError> {
        let op = Operation::insert(position, text, self.version);
        self.author(op)
    }

    /// Author a delete against the confirmed text.
    pub fn delete(&mut self, position: usize, len: usize) -> Result<Operation, ClientError> {
        let op = Operation::delete(position, len, self.version);
        self.author(op)
    }

    fn author(&mut self, op: Operation) -> Result<Operation, ClientError> {
        // Validate against the base text; rebasing keeps a valid op valid
        op.apply_to(&mut self.content.clone())?;
        self.next_seq += 1;
        let op = op.with_origin(self.client_id).with_seq(self.next_seq);
        self.pending.push_back(op.clone());
        Ok(op)
    }

    /// Apply an ordered operation from the server.
    ///
    /// Returns None for versions already applied. An op matching one of
    /// our pending edits (same origin and seq) settles that edit.
    pub fn apply_remote(&mut self, version: u64, op: Operation) -> Result<Option<Operation>, ClientError> {
        if version <= self.version {
            return Ok(None);
        }
        self.expect_next(version)?;
        if let Some(index) = self
            .pending
            .iter()
            .position(|p| p.seq == op.seq && p.origin == op.origin)
        {
            self.pending.remove(index);
        }
        self.commit(version, op.clone())?;
        Ok(Some(op))
    }

    /// Settle pending edit `seq` as `version`, transformed exactly as the
    /// server transformed it.
    pub fn acknowledge(&mut self, version: u64, seq: u64) -> Result<Option<Operation>, ClientError> {
        if version <= self.version {
            return Ok(None);
        }
        self.expect_next(version)?;
        let index = self
            .pending
            .iter()
            .position(|p| p.seq == seq)
            .ok_or(ClientError::UnknownAck { seq })?;

        let base = self.pending[index].base_version;
        let start = self.history.partition_point(|entry| entry.version <= base);
        let missing = self.version - base;
        if (self.history.len() - start) as u64 != missing {
            return Err(ClientError::Gap {
                expected: base + 1,
                got: self.history.get(start).map_or(version, |entry| entry.version),
            });
        }
        let op = self.pending.remove(index).ok_or(ClientError::UnknownAck { seq })?;
        let rebased = transform(&op, &self.history[start..]);
        self.commit(version, rebased.clone())?;
        Ok(Some(rebased))
    }

    /// Replace the replica with a snapshot, dropping every pending edit
    /// not authored against exactly this version. A snapshot below the
    /// pending base means the server rolled back, and that text is gone.
    /// Returns how many were dropped.
    pub fn apply_snapshot(&mut self, content: String, version: u64) -> usize {
        self.content = content;
        self.version = version;
        self.synced = true;
        let before = self.pending.len();
        self.pending.retain(|op| op.base_version == version);
        self.history.clear();
        before - self.pending.len()
    }

    /// Apply a replay in version order. Returns the ops actually applied.
    pub fn apply_replay(&mut self, ops: Vec<LoggedOp>) -> Result<Vec<Operation>, ClientError> {
        self.synced = true;
        let mut applied = Vec::with_capacity(ops.len());
        for entry in ops {
            if let Some(op) = self.apply_remote(entry.version, entry.op)? {
                applied.push(op);
            }
        }
        Ok(applied)
    }

    /// Pending edits restamped with a new connection identity, ready to resend.
    pub fn restamp_pending(&mut self) -> Vec<Operation> {
        let origin = self.client_id;
        self.pending
            .iter_mut()
            .map(|op| {
                op.origin = origin;
                op.clone()
            })
            .collect()
    }

    fn expect_next(&self, version: u64) -> Result<(), ClientError> {
        if version != self.version + 1 {
            return Err(ClientError::Gap {
                expected: self.version + 1,
                got: version,
            });
        }
        Ok(())
    }

    fn commit(&mut self, version: u64, op: Operation) -> Result<(), ClientError> {
        op.apply_to(&mut self.content)?;
        self.version = version;
        self.history.push(LoggedOp { version, op });
        self.trim_history();
        Ok(())
    }

    fn trim_history(&mut self) {
        match self.pending.iter().map(|op| op.base_version).min() {
            Some(oldest) => {
                let stale = self.history.partition_point(|entry| entry.version <= oldest);
                self.history.drain(..stale);
            }
            None => self.history.clear(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Sync client
// ───────────────────────────────────────────────────────────────────

/// The sync client.
///
/// Manages one WebSocket connection to one document. Edits made while
/// disconnected stay pending and are resent after the next resume.
pub struct SyncClient {
    server_url: String,
    token: Option<String>,
    document_id: DocumentId,
    codec: Codec,

    replica: Arc<Mutex<Replica>>,
    presence: Arc<Mutex<PresenceRoom>>,
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<ClientMessage>>,
    reader: Option<JoinHandle<()>>,

    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>, document_id: impl Into<DocumentId>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            server_url: server_url.into(),
            token: None,
            document_id: document_id.into(),
            codec: Codec::Binary,
            replica: Arc::new(Mutex::new(Replica::new())),
            presence: Arc::new(Mutex::new(PresenceRoom::new())),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            reader: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Bearer token sent with the upgrade request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the document.
    ///
    /// Returns once the server has sent the initial snapshot (or, when
    /// resuming, the replay) and any pending edits have been resent.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if *self.state.read().await == ConnectionState::Closed {
            return Err(ClientError::Closed);
        }
        self.teardown();
        let resume_from = self.replica.lock().await.resume_point();
        *self.state.write().await = match resume_from {
            Some(_) => ConnectionState::Resyncing,
            None => ConnectionState::Connecting,
        };

        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ClientError::Connection(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(match e {
                    tokio_tungstenite::tungstenite::Error::Http(response)
                        if response.status() == StatusCode::UNAUTHORIZED =>
                    {
                        ClientError::Unauthorized
                    }
                    other => ClientError::Connection(other.to_string()),
                });
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(256);
        let codec = self.codec;
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let frame = match msg.encode(codec) {
                    Ok(Frame::Binary(bytes)) => Message::Binary(bytes.into()),
                    Ok(Frame::Text(text)) => Message::Text(text.into()),
                    Err(e) => {
                        log::error!("Failed to encode outgoing message: {e}");
                        continue;
                    }
                };
                if ws_writer.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        out_tx
            .send(ClientMessage::Join {
                document_id: self.document_id.clone(),
                resume_from,
            })
            .await
            .map_err(|_| ClientError::Closed)?;

        // Reader task: apply incoming messages to the replica
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut reader = Reader {
            document_id: self.document_id.clone(),
            replica: self.replica.clone(),
            presence: self.presence.clone(),
            state: self.state.clone(),
            outgoing: out_tx.clone(),
            events: self.event_tx.clone(),
            ready: Some(ready_tx),
        };
        self.reader = Some(tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let decoded = match frame {
                    Ok(Message::Binary(data)) => protocol::decode_binary::<ServerMessage>(&data),
                    Ok(Message::Text(text)) => protocol::decode_json::<ServerMessage>(text.as_str()),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match decoded {
                    Ok(msg) => reader.handle(msg).await,
                    Err(e) => log::warn!("Undecodable server message: {e}"),
                }
            }
            reader.disconnected().await;
        }));
        self.outgoing_tx = Some(out_tx);

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Connection("closed before join completed".into())),
        }
    }

    /// Drop the connection, keeping the replica and pending edits.
    pub async fn disconnect(&mut self) {
        self.teardown();
        let mut state = self.state.write().await;
        if *state != ConnectionState::Closed {
            *state = ConnectionState::Disconnected;
        }
    }

    /// Leave the document and close for good.
    pub async fn close(&mut self) {
        let _ = self.send(ClientMessage::Leave).await;
        self.teardown();
        *self.state.write().await = ConnectionState::Closed;
    }

    fn teardown(&mut self) {
        self.outgoing_tx = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    /// Insert `text` at a character offset of the confirmed text.
    /// Returns the edit's sequence number.
    pub async fn insert(&self, position: usize, text: impl Into<String>) -> Result<u64, ClientError> {
        let op = self.replica.lock().await.insert(position, text)?;
        self.submit(op).await
    }

    /// Delete `len` characters at a character offset of the confirmed text.
    pub async fn delete(&self, position: usize, len: usize) -> Result<u64, ClientError> {
        let op = self.replica.lock().await.delete(position, len)?;
        self.submit(op).await
    }

    async fn submit(&self, op: Operation) -> Result<u64, ClientError> {
        let seq = op.seq;
        if self.is_joined().await {
            self.send(ClientMessage::Edit { op }).await?;
        } else {
            log::debug!("Queued edit {seq} while offline");
        }
        Ok(seq)
    }

    /// Move the local cursor. Throttled; returns whether an update was sent.
    pub async fn set_cursor(&self, position: usize) -> Result<bool, ClientError> {
        let due = self.presence.lock().await.set_local_cursor(position);
        match due {
            Some(position) if self.is_joined().await => {
                self.send(ClientMessage::Cursor { position }).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn subscribe(&self, topic: Topic) -> Result<(), ClientError> {
        self.send(ClientMessage::Subscribe { topic }).await
    }

    pub async fn unsubscribe(&self, topic: Topic) -> Result<(), ClientError> {
        self.send(ClientMessage::Unsubscribe { topic }).await
    }

    /// Relay an alert to the other subscribers of `topic`.
    pub async fn notify(&self, topic: Topic, message: impl Into<String>) -> Result<(), ClientError> {
        self.send(ClientMessage::Notify {
            topic,
            message: message.into(),
        })
        .await
    }

    /// Ask for everything after the replica's version.
    pub async fn resync(&self) -> Result<(), ClientError> {
        let last_acked_version = self.replica.lock().await.version();
        *self.state.write().await = ConnectionState::Resyncing;
        self.send(ClientMessage::ResyncRequest { last_acked_version }).await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::Ping).await
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(msg).await.map_err(|_| ProtocolError::ConnectionClosed)?;
        Ok(())
    }

    async fn is_joined(&self) -> bool {
        self.outgoing_tx.is_some()
            && matches!(
                *self.state.read().await,
                ConnectionState::Joined | ConnectionState::Resyncing
            )
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn content(&self) -> String {
        self.replica.lock().await.content().to_string()
    }

    pub async fn version(&self) -> u64 {
        self.replica.lock().await.version()
    }

    pub async fn client_id(&self) -> ClientId {
        self.replica.lock().await.client_id()
    }

    pub async fn pending_len(&self) -> usize {
        self.replica.lock().await.pending_len()
    }

    /// Remote cursors as (client, character offset) pairs.
    pub async fn peer_cursors(&self) -> Vec<(ClientId, Option<usize>)> {
        let presence = self.presence.lock().await;
        let mut cursors: Vec<_> = presence.peers().map(|p| (p.client_id, p.cursor)).collect();
        cursors.sort_by_key(|(id, _)| *id);
        cursors
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// State shared with the reader task of one connection.
struct Reader {
    document_id: DocumentId,
    replica: Arc<Mutex<Replica>>,
    presence: Arc<Mutex<PresenceRoom>>,
    state: Arc<RwLock<ConnectionState>>,
    outgoing: mpsc::Sender<ClientMessage>,
    events: mpsc::Sender<SyncEvent>,
    /// Completes `connect` once the catch-up message arrived
    ready: Option<oneshot::Sender<Result<(), ClientError>>>,
}

impl Reader {
    async fn handle(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Joined {
                client_id,
                document_id,
                ..
            } => {
                self.replica.lock().await.set_client(client_id);
                self.presence.lock().await.reset(client_id);
                log::info!("Joined {document_id} as {client_id}");
                self.emit(SyncEvent::Joined {
                    client_id,
                    document_id,
                })
                .await;
            }

            ServerMessage::Snapshot { content, version } => {
                let discarded = self.replica.lock().await.apply_snapshot(content, version);
                if discarded > 0 {
                    log::info!("{}: snapshot v{version} dropped {discarded} pending edits", self.document_id);
                }
                self.emit(SyncEvent::Snapshot { version, discarded }).await;
                self.caught_up().await;
            }

            ServerMessage::Replay { from_version, ops } => {
                let result = self.replica.lock().await.apply_replay(ops);
                match result {
                    Ok(applied) => {
                        self.follow_cursors(&applied).await;
                        self.emit(SyncEvent::Replayed {
                            from_version,
                            count: applied.len(),
                        })
                        .await;
                        self.caught_up().await;
                    }
                    Err(e) => self.request_resync(e).await,
                }
            }

            ServerMessage::Edit { version, op } => {
                let result = self.replica.lock().await.apply_remote(version, op);
                match result {
                    Ok(Some(op)) => {
                        self.follow_cursors(std::slice::from_ref(&op)).await;
                        self.emit(SyncEvent::RemoteEdit { version, op }).await;
                    }
                    Ok(None) => {}
                    Err(e) => self.request_resync(e).await,
                }
            }

            ServerMessage::EditAck { version, seq } => {
                let result = self.replica.lock().await.acknowledge(version, seq);
                match result {
                    Ok(Some(op)) => {
                        self.follow_cursors(std::slice::from_ref(&op)).await;
                        self.emit(SyncEvent::Acked { version, seq }).await;
                    }
                    Ok(None) => {}
                    Err(e) => self.request_resync(e).await,
                }
            }

            ServerMessage::Presence {
                client_id,
                user_id,
                state,
            } => {
                let changed = self
                    .presence
                    .lock()
                    .await
                    .handle_presence(client_id, &user_id, &state);
                if changed {
                    self.emit(SyncEvent::Presence {
                        client_id,
                        user_id,
                        state,
                    })
                    .await;
                }
            }

            ServerMessage::Notification { topic, event } => {
                self.emit(SyncEvent::Notification { topic, event }).await;
            }

            ServerMessage::Error { code, message } => {
                log::warn!("Server error ({code:?}): {message}");
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Err(ClientError::Rejected { code, message }));
                    return;
                }
                self.emit(SyncEvent::ServerError { code, message }).await;
            }

            ServerMessage::Pong => self.emit(SyncEvent::Pong).await,
        }
    }

    /// After a snapshot or replay: mark joined. The first catch-up on a
    /// connection also resends whatever is still pending.
    async fn caught_up(&mut self) {
        let ready = self.ready.take();
        if ready.is_some() {
            let resend = self.replica.lock().await.restamp_pending();
            if !resend.is_empty() {
                log::info!("Resending {} pending edits", resend.len());
            }
            for op in resend {
                if self.outgoing.send(ClientMessage::Edit { op }).await.is_err() {
                    break;
                }
            }
        }
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Joined;
            }
        }
        if let Some(ready) = ready {
            let _ = ready.send(Ok(()));
        }
    }

    async fn request_resync(&mut self, err: ClientError) {
        log::warn!("{}: replica out of step ({err}), requesting resync", self.document_id);
        let last_acked_version = self.replica.lock().await.version();
        *self.state.write().await = ConnectionState::Resyncing;
        let _ = self
            .outgoing
            .send(ClientMessage::ResyncRequest { last_acked_version })
            .await;
    }

    async fn follow_cursors(&self, ops: &[Operation]) {
        let mut presence = self.presence.lock().await;
        for op in ops {
            presence.apply_operation(op);
        }
    }

    async fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event).await;
    }

    async fn disconnected(&mut self) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(ClientError::Connection(
                "connection closed before join completed".into(),
            )));
        }
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Disconnected;
            }
        }
        log::info!("{}: connection lost", self.document_id);
        self.emit(SyncEvent::Disconnected).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(n: u128) -> ClientId {
        ClientId::from_uuid(uuid::Uuid::from_u128(n))
    }

    fn joined(content: &str, version: u64, id: u128) -> Replica {
        let mut replica = Replica::new();
        replica.set_client(client(id));
        replica.apply_snapshot(content.to_string(), version);
        replica
    }

    #[test]
    fn test_author_validates_against_confirmed_text() {
        let mut replica = joined("abc", 3, 1);
        assert!(replica.insert(4, "x").is_err());
        assert!(replica.delete(2, 2).is_err());

        let op = replica.insert(3, "d").unwrap();
        assert_eq!((op.base_version, op.seq, op.origin), (3, 1, client(1)));
        assert_eq!(replica.pending_len(), 1);
        // Not applied until the server orders it
        assert_eq!(replica.content(), "abc");
    }

    #[test]
    fn test_ack_replays_server_transform() {
        // Server order: remote "bar"@0 becomes v1, our "foo"@0 becomes v2
        let mut replica = joined("", 0, 1);
        let ours = replica.insert(0, "foo").unwrap();

        let theirs = Operation::insert(0, "bar", 0).with_origin(client(2)).with_seq(1);
        replica.apply_remote(1, theirs).unwrap();
        assert_eq!(replica.content(), "bar");

        let rebased = replica.acknowledge(2, ours.seq).unwrap().unwrap();
        assert_eq!(rebased.position, 0);
        assert_eq!(replica.content(), "foobar");
        assert_eq!(replica.version(), 2);
        assert_eq!(replica.pending_len(), 0);
    }

    #[test]
    fn test_ack_with_clamp() {
        let mut replica = joined("abcdefg", 5, 1);
        let ours = replica.insert(3, "X").unwrap();
        replica
            .apply_remote(6, Operation::delete(2, 3, 5).with_origin(client(2)))
            .unwrap();
        let rebased = replica.acknowledge(7, ours.seq).unwrap().unwrap();
        assert!(rebased.clamped);
        assert_eq!(replica.content(), "abXfg");
    }

    #[test]
    fn test_gap_and_duplicates() {
        let mut replica = joined("ab", 4, 1);
        let op = Operation::insert(0, "x", 4).with_origin(client(2));
        assert!(matches!(
            replica.apply_remote(6, op.clone()),
            Err(ClientError::Gap { expected: 5, got: 6 })
        ));
        assert_eq!(replica.apply_remote(4, op).unwrap(), None);
        assert!(matches!(
            replica.acknowledge(5, 99),
            Err(ClientError::UnknownAck { seq: 99 })
        ));
    }

    #[test]
    fn test_replay_settles_pending_by_origin_and_seq() {
        let mut replica = joined("", 0, 1);
        let first = replica.insert(0, "a").unwrap();
        let second = replica.insert(0, "b").unwrap();

        // Server accepted only the first before the connection dropped
        let applied = replica
            .apply_replay(vec![LoggedOp { version: 1, op: first }])
            .unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(replica.content(), "a");
        assert_eq!(replica.pending_len(), 1);

        replica.set_client(client(7));
        let resend = replica.restamp_pending();
        assert_eq!(resend.len(), 1);
        assert_eq!(resend[0].seq, second.seq);
        assert_eq!(resend[0].origin, client(7));
        assert_eq!(resend[0].base_version, 0);

        // Tie at 0: the lower origin stays left
        replica.acknowledge(2, second.seq).unwrap();
        assert_eq!(replica.content(), "ab");
    }

    #[test]
    fn test_snapshot_discards_older_pending() {
        let mut replica = joined("hello", 10, 1);
        replica.insert(0, "x").unwrap();
        replica.insert(5, "!").unwrap();

        let discarded = replica.apply_snapshot("fresh".into(), 20);
        assert_eq!(discarded, 2);
        assert_eq!(replica.pending_len(), 0);
        assert_eq!((replica.content(), replica.version()), ("fresh", 20));
        assert_eq!(replica.resume_point(), Some(20));
    }

    #[test]
    fn test_snapshot_after_rollback_discards_newer_pending() {
        // Server restarted from an older checkpoint
        let mut replica = joined("abcdefgh", 8, 1);
        replica.insert(8, "!").unwrap();

        let discarded = replica.apply_snapshot("abcde".into(), 5);
        assert_eq!(discarded, 1);
        assert_eq!(replica.pending_len(), 0);
        assert!(replica.restamp_pending().is_empty());
        assert_eq!((replica.content(), replica.version()), ("abcde", 5));
    }

    #[test]
    fn test_snapshot_at_pending_base_keeps_it() {
        let mut replica = joined("abc", 3, 1);
        replica.insert(3, "d").unwrap();

        assert_eq!(replica.apply_snapshot("abc".into(), 3), 0);
        assert_eq!(replica.pending_len(), 1);
    }

    #[test]
    fn test_resume_point_before_sync() {
        assert_eq!(Replica::new().resume_point(), None);
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let mut client = SyncClient::new("ws://localhost:9090", "notes");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.document_id().as_str(), "notes");
        assert_eq!(client.server_url(), "ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_offline_edits_stay_pending() {
        let client = SyncClient::new("ws://localhost:9090", "notes");
        assert_eq!(client.insert(0, "a").await.unwrap(), 1);
        assert_eq!(client.insert(0, "b").await.unwrap(), 2);
        assert_eq!(client.pending_len().await, 2);
        assert!(client.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_closed_client_refuses_connect() {
        let mut client = SyncClient::new("ws://127.0.0.1:1", "notes");
        client.close().await;
        assert!(matches!(client.connect().await, Err(ClientError::Closed)));
    }
}
