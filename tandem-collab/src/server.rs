//! WebSocket sync server: the per-connection lifecycle.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── Session("notes") ── DocumentState
//!            ├── Connection task ──────┤        │               OperationLog
//! Client B ──┘   (one per socket)      │        └── broadcast ──► every Connection
//!                     │                │
//!                     ├── ClientDirectory (mailboxes)
//!                     └── NotificationHub (topics)
//! ```
//!
//! Each connection task `select!`s over:
//! - inbound frames (rate limited, any frame resets the idle timer)
//! - its session's event stream (edits, presence, resets; version ordered)
//! - its mailbox (notifications, best effort)
//! - the heartbeat ticker and the idle deadline
//! - server shutdown
//!
//! Authentication happens during the HTTP upgrade. A rejected client gets
//! a 401 and never touches a session.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{AllowAnonymous, Authenticator, UserId};
use crate::config::ServerConfig;
use crate::directory::{ClientDirectory, ClientHandle};
use crate::notify::{NotificationEvent, NotificationHub};
use crate::operation::{ClientId, DocumentId};
use crate::protocol::{self, ClientMessage, Codec, ErrorCode, Frame, ServerMessage};
use crate::ratelimit::RateLimiter;
use crate::registry::{SessionError, SessionEvent, SessionRegistry};
use crate::resync::ResyncPlan;
use crate::storage::{MemoryStore, Persistence};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Upgrades refused by the authenticator
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rate_limited: u64,
    /// Replays or snapshots sent after join (lag, resync requests, stale edits)
    pub resyncs: u64,
    pub active_sessions: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    rate_limited: AtomicU64,
    resyncs: AtomicU64,
}

struct ServerContext {
    config: ServerConfig,
    registry: SessionRegistry,
    directory: Arc<ClientDirectory>,
    hub: Arc<NotificationHub>,
    auth: Arc<dyn Authenticator>,
    stats: AtomicServerStats,
}

/// Collaborative editing server.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncServer {
    ctx: Arc<ServerContext>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SyncServer {
    pub fn new(
        config: ServerConfig,
        auth: Arc<dyn Authenticator>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let directory = Arc::new(ClientDirectory::new());
        let hub = Arc::new(NotificationHub::new(directory.clone()));
        let registry = SessionRegistry::new(config.clone(), persistence).with_hub(hub.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            ctx: Arc::new(ServerContext {
                config,
                registry,
                directory,
                hub,
                auth,
                stats: AtomicServerStats::default(),
            }),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Anonymous access, in-memory storage.
    pub fn with_defaults() -> Self {
        Self::new(
            ServerConfig::default(),
            Arc::new(AllowAnonymous),
            Arc::new(MemoryStore::new()),
        )
    }

    /// Bind `config.bind_addr` and serve until `shutdown`.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until `shutdown`.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let ctx = self.ctx.clone();
                    let shutdown = self.shutdown.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(ctx, stream, addr, shutdown).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    log::info!("Sync server stopped accepting connections");
                    return Ok(());
                }
            }
        }
    }

    /// Stop accepting, close connections and persist every live session.
    pub async fn shutdown(&self) -> Result<usize, SessionError> {
        let _ = self.shutdown.send(true);
        let persisted = self.ctx.registry.persist_all().await?;
        log::info!("Persisted {persisted} sessions on shutdown");
        Ok(persisted)
    }

    pub async fn stats(&self) -> ServerStats {
        let s = &self.ctx.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            rejected_connections: s.rejected_connections.load(Ordering::Relaxed),
            total_messages: s.total_messages.load(Ordering::Relaxed),
            total_bytes: s.total_bytes.load(Ordering::Relaxed),
            rate_limited: s.rate_limited.load(Ordering::Relaxed),
            resyncs: s.resyncs.load(Ordering::Relaxed),
            active_sessions: self.ctx.registry.session_count().await,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.ctx.registry
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.ctx.hub
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }
}

/// Pull a bearer token from `Authorization` or the `token` query parameter.
fn bearer_token(req: &Request) -> Option<String> {
    let from_header = req
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());
    from_header.or_else(|| {
        req.uri().query().and_then(|query| {
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == "token")
                .map(|(_, value)| value.to_string())
        })
    })
}

async fn handle_connection(
    ctx: Arc<ServerContext>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> Result<(), BoxError> {
    let mut user: Option<UserId> = None;
    let auth = ctx.auth.clone();
    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match auth.authenticate(bearer_token(req).as_deref()) {
            Ok(user_id) => {
                user = Some(user_id);
                Ok(response)
            }
            Err(e) => {
                let mut rejection = ErrorResponse::new(Some(e.to_string()));
                *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                Err(rejection)
            }
        }
    };

    let handshake = tokio_tungstenite::accept_hdr_async(stream, callback).await;
    let (ws_stream, user_id) = match (handshake, user) {
        (Ok(ws), Some(user_id)) => (ws, user_id),
        (Err(e), None) => {
            ctx.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
            log::warn!("Rejected connection from {addr}: {e}");
            return Ok(());
        }
        (Err(e), Some(_)) => return Err(e.into()),
        (Ok(_), None) => return Err("handshake completed without a user".into()),
    };

    ctx.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    ctx.stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let client_id = ClientId::new();
    let (mailbox, inbox) = mpsc::channel(ctx.config.notify_capacity.max(1));
    ctx.directory
        .register(
            client_id,
            ClientHandle {
                user_id: user_id.clone(),
                mailbox,
            },
        )
        .await;
    log::info!("WebSocket connection established from {addr} as {user_id} ({client_id})");

    let (sink, frames) = ws_stream.split();
    let mut connection = Connection {
        limiter: RateLimiter::new(ctx.config.rate_limit),
        ctx: ctx.clone(),
        client_id,
        user_id,
        addr,
        codec: Codec::Binary,
        attached: None,
        sink,
    };
    let result = connection.run(frames, inbox, shutdown).await;
    connection.cleanup().await;
    ctx.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}

/// The session a connection is attached to.
struct Attached {
    document_id: DocumentId,
    events: tokio::sync::broadcast::Receiver<SessionEvent>,
    /// Highest version sent to the client
    delivered: u64,
}

/// Receive from the session channel, or wait forever when not attached.
async fn next_event(attached: &mut Option<Attached>) -> Result<SessionEvent, RecvError> {
    match attached {
        Some(attached) => attached.events.recv().await,
        None => std::future::pending().await,
    }
}

/// Whether the connection loop keeps going.
enum Flow {
    Continue,
    Close,
}

struct Connection {
    ctx: Arc<ServerContext>,
    client_id: ClientId,
    user_id: UserId,
    addr: SocketAddr,
    /// Codec of the most recent inbound frame
    codec: Codec,
    attached: Option<Attached>,
    limiter: RateLimiter,
    sink: WsSink,
}

impl Connection {
    async fn run(
        &mut self,
        mut frames: futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
        mut inbox: mpsc::Receiver<ServerMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let idle = self.ctx.config.idle_timeout();
        let period = self.ctx.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        let mut deadline = Instant::now() + idle;

        loop {
            let flow = tokio::select! {
                frame = frames.next() => {
                    deadline = Instant::now() + idle;
                    match frame {
                        Some(Ok(Message::Binary(data))) => {
                            self.codec = Codec::Binary;
                            self.on_frame(data.len(), protocol::decode_binary(&data)).await?
                        }
                        Some(Ok(Message::Text(text))) => {
                            self.codec = Codec::Json;
                            self.on_frame(text.len(), protocol::decode_json(text.as_str())).await?
                        }
                        Some(Ok(Message::Ping(data))) => {
                            self.sink.send(Message::Pong(data)).await?;
                            Flow::Continue
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {}", self.addr);
                            Flow::Close
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {}: {e}", self.addr);
                            Flow::Close
                        }
                        Some(Ok(_)) => Flow::Continue,
                    }
                }

                event = next_event(&mut self.attached) => {
                    self.on_event(event).await?;
                    Flow::Continue
                }

                Some(msg) = inbox.recv() => {
                    self.send(&msg).await?;
                    Flow::Continue
                }

                _ = heartbeat.tick() => {
                    self.sink.send(Message::Ping(Vec::new().into())).await?;
                    Flow::Continue
                }

                _ = sleep_until(deadline) => {
                    log::info!("Closing idle connection from {} ({})", self.addr, self.client_id);
                    Flow::Close
                }

                _ = shutdown.changed() => {
                    let _ = self.sink.send(Message::Close(None)).await;
                    Flow::Close
                }
            };
            if let Flow::Close = flow {
                return Ok(());
            }
        }
    }

    // ─── Inbound ──────────────────────────────────────────────────────

    async fn on_frame(
        &mut self,
        size: usize,
        decoded: Result<ClientMessage, protocol::ProtocolError>,
    ) -> Result<Flow, BoxError> {
        let stats = &self.ctx.stats;
        stats.total_messages.fetch_add(1, Ordering::Relaxed);
        stats.total_bytes.fetch_add(size as u64, Ordering::Relaxed);

        if !self.limiter.check() {
            stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            log::debug!("Rate limited {} ({})", self.client_id, self.addr);
            self.send_error(ErrorCode::RateLimited, "rate limit exceeded, please slow down")
                .await?;
            return Ok(Flow::Continue);
        }

        match decoded {
            Ok(msg) => self.on_message(msg).await,
            Err(e) => {
                log::warn!("Failed to decode message from {}: {e}", self.addr);
                self.send_error(ErrorCode::Malformed, e.to_string()).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_message(&mut self, msg: ClientMessage) -> Result<Flow, BoxError> {
        match msg {
            ClientMessage::Join {
                document_id,
                resume_from,
            } => self.join(document_id, resume_from).await?,

            ClientMessage::Edit { mut op } => {
                let Some(document_id) = self.document_id() else {
                    return self.not_joined().await;
                };
                op.origin = self.client_id;
                let base = op.base_version;
                match self.ctx.registry.submit_edit(&document_id, op).await {
                    // The acknowledgement arrives through the session stream
                    Ok(_) => {}
                    Err(SessionError::ResyncRequired { base, floor }) => {
                        log::info!(
                            "{}: edit from {} at v{base} predates floor v{floor}",
                            document_id,
                            self.client_id
                        );
                        self.resync(&document_id, base).await?;
                    }
                    Err(SessionError::Malformed(reason)) => {
                        log::debug!("Malformed edit from {} at v{base}: {reason}", self.client_id);
                        self.send_error(ErrorCode::Malformed, reason).await?;
                    }
                    // Everyone, sender included, gets the reset snapshot
                    Err(SessionError::Reset { .. }) => {}
                    Err(e) => self.send_session_error(e).await?,
                }
            }

            ClientMessage::Cursor { position } => {
                let Some(document_id) = self.document_id() else {
                    return self.not_joined().await;
                };
                if let Err(e) = self
                    .ctx
                    .registry
                    .update_cursor(&document_id, &self.client_id, position)
                    .await
                {
                    self.send_session_error(e).await?;
                }
            }

            ClientMessage::ResyncRequest { last_acked_version } => {
                let Some(document_id) = self.document_id() else {
                    return self.not_joined().await;
                };
                self.resync(&document_id, last_acked_version).await?;
            }

            ClientMessage::Subscribe { topic } => {
                self.ctx.hub.subscribe(self.client_id, topic).await;
            }

            ClientMessage::Unsubscribe { topic } => {
                self.ctx.hub.unsubscribe(&self.client_id, &topic).await;
            }

            ClientMessage::Notify { topic, message } => {
                let event = NotificationEvent::Alert {
                    from: self.user_id.clone(),
                    message,
                };
                self.ctx.hub.publish_from(&self.client_id, topic, event).await;
            }

            ClientMessage::Leave => self.detach().await,

            ClientMessage::Ping => self.send(&ServerMessage::Pong).await?,
        }
        Ok(Flow::Continue)
    }

    async fn join(&mut self, document_id: DocumentId, resume_from: Option<u64>) -> Result<(), BoxError> {
        if self.document_id().as_ref() == Some(&document_id) {
            return self
                .send_error(ErrorCode::Malformed, format!("already joined {document_id}"))
                .await;
        }
        self.detach().await;

        let attachment = self
            .ctx
            .registry
            .join(&document_id, self.client_id, self.user_id.clone(), resume_from)
            .await;
        match attachment {
            Ok(attachment) => {
                let delivered = attachment.catch_up.version();
                let catch_up = attachment.catch_up.into_message();
                // Recorded before sending so cleanup detaches if the socket fails
                self.attached = Some(Attached {
                    document_id: document_id.clone(),
                    events: attachment.events,
                    delivered,
                });
                self.send(&ServerMessage::Joined {
                    client_id: self.client_id,
                    user_id: self.user_id.clone(),
                    document_id,
                })
                .await?;
                self.send(&catch_up).await
            }
            Err(e) => self.send_session_error(e).await,
        }
    }

    async fn detach(&mut self) {
        if let Some(attached) = self.attached.take() {
            self.ctx
                .registry
                .leave(&attached.document_id, &self.client_id)
                .await;
        }
    }

    // ─── Session events ───────────────────────────────────────────────

    async fn on_event(&mut self, event: Result<SessionEvent, RecvError>) -> Result<(), BoxError> {
        let Some(attached) = self.attached.as_mut() else {
            return Ok(());
        };
        match event {
            Ok(SessionEvent::Applied(entry)) => {
                if entry.version <= attached.delivered {
                    return Ok(());
                }
                if entry.version != attached.delivered + 1 {
                    let (document_id, from) = (attached.document_id.clone(), attached.delivered);
                    log::warn!("{}: gap before v{}, resyncing {}", document_id, entry.version, self.client_id);
                    return self.resync(&document_id, from).await;
                }
                attached.delivered = entry.version;
                let document_id = attached.document_id.clone();
                let msg = if entry.op.origin == self.client_id {
                    ServerMessage::EditAck {
                        version: entry.version,
                        seq: entry.op.seq,
                    }
                } else {
                    ServerMessage::Edit {
                        version: entry.version,
                        op: entry.op.clone(),
                    }
                };
                self.send(&msg).await?;
                let _ = self
                    .ctx
                    .registry
                    .acknowledge(&document_id, &self.client_id, entry.version)
                    .await;
            }
            Ok(SessionEvent::Presence {
                client_id,
                user_id,
                state,
            }) => {
                if client_id != self.client_id {
                    self.send(&ServerMessage::Presence {
                        client_id,
                        user_id,
                        state,
                    })
                    .await?;
                }
            }
            Ok(SessionEvent::Reset { content, version }) => {
                attached.delivered = version;
                self.send(&ServerMessage::Snapshot { content, version }).await?;
            }
            Err(RecvError::Lagged(missed)) => {
                let (document_id, from) = (attached.document_id.clone(), attached.delivered);
                log::warn!("{} lagged by {missed} events on {document_id}", self.client_id);
                self.resync(&document_id, from).await?;
            }
            Err(RecvError::Closed) => {
                log::debug!("{}: session channel closed", self.client_id);
                self.attached = None;
            }
        }
        Ok(())
    }

    /// Send a replay or snapshot bringing the client from `last_acked` to head.
    async fn resync(&mut self, document_id: &DocumentId, last_acked: u64) -> Result<(), BoxError> {
        let plan = match self
            .ctx
            .registry
            .resync(document_id, &self.client_id, last_acked)
            .await
        {
            Ok(plan) => plan,
            Err(e) => return self.send_session_error(e).await,
        };
        self.ctx.stats.resyncs.fetch_add(1, Ordering::Relaxed);
        if let Some(attached) = self.attached.as_mut() {
            attached.delivered = plan.version();
        }
        self.send_plan(plan).await
    }

    async fn send_plan(&mut self, plan: ResyncPlan) -> Result<(), BoxError> {
        self.send(&plan.into_message()).await
    }

    // ─── Outbound ─────────────────────────────────────────────────────

    async fn send(&mut self, msg: &ServerMessage) -> Result<(), BoxError> {
        let frame = match msg.encode(self.codec)? {
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
            Frame::Text(text) => Message::Text(text.into()),
        };
        self.sink.send(frame).await?;
        Ok(())
    }

    async fn send_error(&mut self, code: ErrorCode, message: impl Into<String>) -> Result<(), BoxError> {
        self.send(&ServerMessage::error(code, message)).await
    }

    async fn send_session_error(&mut self, err: SessionError) -> Result<(), BoxError> {
        let code = match &err {
            SessionError::DocumentFull { .. } => ErrorCode::DocumentFull,
            SessionError::Malformed(_) | SessionError::NotAttached(_) | SessionError::NotFound(_) => {
                ErrorCode::Malformed
            }
            SessionError::ResyncRequired { .. } | SessionError::Reset { .. } | SessionError::Persist(_) => {
                ErrorCode::Internal
            }
        };
        log::debug!("Session error for {}: {err}", self.client_id);
        self.send_error(code, err.to_string()).await
    }

    async fn not_joined(&mut self) -> Result<Flow, BoxError> {
        self.send_error(ErrorCode::Malformed, "join a document first").await?;
        Ok(Flow::Continue)
    }

    fn document_id(&self) -> Option<DocumentId> {
        self.attached.as_ref().map(|a| a.document_id.clone())
    }

    async fn cleanup(&mut self) {
        self.detach().await;
        self.ctx.hub.unsubscribe_all(&self.client_id).await;
        self.ctx.directory.unregister(&self.client_id).await;
        log::info!("{} ({}) disconnected from {}", self.user_id, self.client_id, self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokens;

    fn request(uri: &str, auth_header: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = auth_header {
            builder = builder.header("Authorization", value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_bearer_token_sources() {
        assert_eq!(
            bearer_token(&request("/ws", Some("Bearer abc"))),
            Some("abc".to_string())
        );
        assert_eq!(
            bearer_token(&request("/ws?doc=x&token=xyz", None)),
            Some("xyz".to_string())
        );
        assert_eq!(bearer_token(&request("/ws", Some("Basic abc"))), None);
        assert_eq!(bearer_token(&request("/ws", None)), None);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats, ServerStats::default());
        assert_eq!(server.config().bind_addr, "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_shutdown_persists_sessions() {
        let store = Arc::new(MemoryStore::new());
        let server = SyncServer::new(
            ServerConfig::default(),
            Arc::new(StaticTokens::new()),
            store.clone(),
        );
        let doc = DocumentId::from("draft");
        let client = ClientId::new();
        server
            .registry()
            .join(&doc, client, UserId::from("a"), None)
            .await
            .unwrap();
        server
            .registry()
            .submit_edit(&doc, crate::operation::Operation::insert(0, "hi", 0).with_origin(client))
            .await
            .unwrap();

        assert_eq!(server.shutdown().await.unwrap(), 1);
        assert_eq!(store.load(&doc).unwrap().unwrap().content, "hi");
    }
}
