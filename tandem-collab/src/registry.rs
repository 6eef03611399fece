//! Session registry: one serialized editing session per live document.
//!
//! ```text
//! SessionRegistry
//!   sessions: RwLock<HashMap<DocumentId, Arc<Session>>>
//!        │
//!        ▼
//!   Session ── RwLock<SessionState> ─┬─ DocumentState (content, version)
//!      │                             ├─ OperationLog  (bounded tail)
//!      │                             └─ clients       (acked version, cursor)
//!      │
//!      └── broadcast::Sender<SessionEvent> ──► one receiver per connection
//! ```
//!
//! Edits to one document are serialized by the session's write lock;
//! different documents never contend. Accepted operations are published
//! while the lock is still held, so every receiver observes them in
//! version order. Persistence always happens after the locks are released.
//! A torn-down session's final snapshot stays in `retiring` until it is
//! written, so a join arriving meanwhile loads it instead of a stale one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::auth::UserId;
use crate::config::ServerConfig;
use crate::document::{DocumentState, StoreError};
use crate::notify::{NotificationEvent, NotificationHub, Topic};
use crate::operation::{ClientId, DocumentId, Operation};
use crate::oplog::{LogStats, LoggedOp, OperationLog};
use crate::presence::PresenceState;
use crate::resync::ResyncPlan;
use crate::storage::{PersistError, Persistence, StoredDocument};
use crate::transform::{self, TransformError};

/// Registry failures surfaced to the Connection Manager.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no live session for document {0}")]
    NotFound(DocumentId),
    #[error("client {0} is not attached to this document")]
    NotAttached(ClientId),
    #[error("document {document_id} already has {limit} clients")]
    DocumentFull { document_id: DocumentId, limit: usize },
    /// The client's base version is older than the retained log.
    #[error("resync required: base {base} predates floor {floor}")]
    ResyncRequired { base: u64, floor: u64 },
    #[error("malformed edit: {0}")]
    Malformed(String),
    /// Store corruption was detected; the session was reloaded at `version`.
    #[error("session reset to version {version}")]
    Reset { version: u64 },
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// What every attached connection hears, in order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Applied(Arc<LoggedOp>),
    Presence {
        client_id: ClientId,
        user_id: UserId,
        state: PresenceState,
    },
    /// The session was reloaded; treat as a snapshot.
    Reset { content: String, version: u64 },
}

/// Public view of an attached client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub user_id: UserId,
    pub cursor: Option<usize>,
    pub last_acked_version: u64,
}

/// Result of a successful join.
pub struct Attachment {
    pub events: broadcast::Receiver<SessionEvent>,
    /// Snapshot for a fresh join, replay-or-snapshot for a resume
    pub catch_up: ResyncPlan,
}

/// An accepted edit as it was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub version: u64,
    pub op: Operation,
}

struct ClientSlot {
    user_id: UserId,
    cursor: Option<usize>,
    /// Last version delivered to (and therefore held by) the client
    acked: AtomicU64,
}

struct SessionState {
    document: DocumentState,
    log: OperationLog,
    clients: HashMap<ClientId, ClientSlot>,
    since_checkpoint: u64,
    /// Set at teardown; a joiner that sees it retries
    closed: bool,
}

impl SessionState {
    fn slowest_acked(&self) -> Option<u64> {
        self.clients
            .values()
            .map(|slot| slot.acked.load(Ordering::Acquire))
            .min()
    }

    fn client_info(client_id: ClientId, slot: &ClientSlot) -> ClientInfo {
        ClientInfo {
            client_id,
            user_id: slot.user_id.clone(),
            cursor: slot.cursor,
            last_acked_version: slot.acked.load(Ordering::Acquire),
        }
    }
}

pub struct Session {
    document_id: DocumentId,
    state: RwLock<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

/// Internal outcome of an edit attempt inside the critical section.
enum Rejection {
    Error(SessionError),
    Corrupted(String),
}

impl Session {
    fn new(document_id: DocumentId, document: DocumentState, config: &ServerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let log = OperationLog::new(document.version(), config.log_retention, config.max_log_len);
        Self {
            document_id,
            state: RwLock::new(SessionState {
                document,
                log,
                clients: HashMap::new(),
                since_checkpoint: 0,
                closed: false,
            }),
            events,
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    async fn submit(&self, op: Operation, checkpoint_every: u64) -> Result<(Accepted, Option<(String, u64)>), Rejection> {
        let mut state = self.state.write().await;
        if !state.clients.contains_key(&op.origin) {
            return Err(Rejection::Error(SessionError::NotAttached(op.origin)));
        }
        if state.log.head() != state.document.version() {
            return Err(Rejection::Corrupted(format!(
                "log head {} disagrees with document version {}",
                state.log.head(),
                state.document.version()
            )));
        }

        let rebased = transform::rebase(&op, &state.log).map_err(|err| match err {
            TransformError::ResyncRequired { base, floor } => {
                Rejection::Error(SessionError::ResyncRequired { base, floor })
            }
            TransformError::FutureVersion { .. } => {
                Rejection::Error(SessionError::Malformed(err.to_string()))
            }
        })?;
        if rebased.clamped {
            log::debug!(
                "{}: edit from {} clamped to {} by a concurrent delete",
                self.document_id,
                op.origin,
                rebased.position
            );
        }

        let (version, applied) = state.document.apply(rebased).map_err(|err| match err {
            StoreError::OutOfBounds(e) => Rejection::Error(SessionError::Malformed(e.to_string())),
            StoreError::StaleVersion { .. } => Rejection::Corrupted(err.to_string()),
        })?;
        if let Err(err) = state.log.append(version, applied.clone()) {
            return Err(Rejection::Corrupted(err.to_string()));
        }
        let slowest = state.slowest_acked();
        state.log.retain(slowest);

        let entry = Arc::new(LoggedOp {
            version,
            op: applied.clone(),
        });
        // No receivers is fine: the log still has it
        let _ = self.events.send(SessionEvent::Applied(entry));

        state.since_checkpoint += 1;
        let checkpoint = if checkpoint_every > 0 && state.since_checkpoint >= checkpoint_every {
            state.since_checkpoint = 0;
            Some(state.document.snapshot())
        } else {
            None
        };

        Ok((Accepted { version, op: applied }, checkpoint))
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<DocumentId, Arc<Session>>>,
    /// Final snapshots of torn-down sessions not yet persisted
    retiring: RwLock<HashMap<DocumentId, StoredDocument>>,
    persistence: Arc<dyn Persistence>,
    hub: Option<Arc<NotificationHub>>,
    config: ServerConfig,
}

impl SessionRegistry {
    pub fn new(config: ServerConfig, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            retiring: RwLock::new(HashMap::new()),
            persistence,
            hub: None,
            config,
        }
    }

    /// Publish join/leave notifications through `hub`.
    pub fn with_hub(mut self, hub: Arc<NotificationHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Attach a client, creating the session on first join.
    ///
    /// The returned receiver is subscribed under the same lock that
    /// produced `catch_up`, so the stream continues exactly where the
    /// catch-up payload ends.
    pub async fn join(
        &self,
        document_id: &DocumentId,
        client_id: ClientId,
        user_id: UserId,
        resume_from: Option<u64>,
    ) -> Result<Attachment, SessionError> {
        loop {
            let session = self.get_or_load(document_id).await?;
            let mut state = session.state.write().await;
            if state.closed {
                // Torn down between lookup and lock; the registry entry is gone now
                drop(state);
                tokio::task::yield_now().await;
                continue;
            }
            if state.clients.len() >= self.config.max_clients_per_document {
                return Err(SessionError::DocumentFull {
                    document_id: document_id.clone(),
                    limit: self.config.max_clients_per_document,
                });
            }

            let events = session.events.subscribe();
            let catch_up = match resume_from {
                Some(last_acked) => ResyncPlan::plan(&state.document, &state.log, last_acked),
                None => {
                    let (content, version) = state.document.snapshot();
                    ResyncPlan::Snapshot { content, version }
                }
            };
            state.clients.insert(
                client_id,
                ClientSlot {
                    user_id: user_id.clone(),
                    cursor: None,
                    acked: AtomicU64::new(catch_up.version()),
                },
            );
            let _ = session.events.send(SessionEvent::Presence {
                client_id,
                user_id: user_id.clone(),
                state: PresenceState::Joined,
            });
            let attached = state.clients.len();
            drop(state);

            log::info!(
                "{user_id} ({client_id}) joined {document_id} at v{} ({attached} attached)",
                catch_up.version()
            );
            self.notify(document_id, NotificationEvent::UserJoined {
                user_id,
                document_id: document_id.clone(),
            })
            .await;
            return Ok(Attachment { events, catch_up });
        }
    }

    /// Detach a client. The last one out persists and tears down the session.
    pub async fn leave(&self, document_id: &DocumentId, client_id: &ClientId) -> Option<ClientInfo> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get(document_id)?.clone();
        let mut state = session.state.write().await;

        let slot = state.clients.remove(client_id)?;
        let info = SessionState::client_info(*client_id, &slot);
        let _ = session.events.send(SessionEvent::Presence {
            client_id: *client_id,
            user_id: slot.user_id.clone(),
            state: PresenceState::Left,
        });

        let retired = if state.clients.is_empty() {
            state.closed = true;
            let (content, version) = state.document.snapshot();
            drop(state);
            sessions.remove(document_id);
            let stored = StoredDocument { content, version };
            self.retiring
                .write()
                .await
                .insert(document_id.clone(), stored.clone());
            Some(stored)
        } else {
            drop(state);
            None
        };
        drop(sessions);

        if let Some(stored) = retired {
            self.flush_retired(document_id, stored).await;
        }

        log::info!("{} ({client_id}) left {document_id}", info.user_id);
        self.notify(document_id, NotificationEvent::UserLeft {
            user_id: info.user_id.clone(),
            document_id: document_id.clone(),
        })
        .await;
        Some(info)
    }

    // ─── Edits and presence ───────────────────────────────────────────

    /// Transform, apply, log and broadcast one edit. `op.origin` must be
    /// an attached client.
    pub async fn submit_edit(&self, document_id: &DocumentId, op: Operation) -> Result<Accepted, SessionError> {
        let session = self.require(document_id).await?;
        match session.submit(op, self.config.checkpoint_every).await {
            Ok((accepted, checkpoint)) => {
                if let Some((content, version)) = checkpoint {
                    if let Err(e) = self.persistence.persist(document_id, &content, version) {
                        log::warn!("checkpoint of {document_id}@{version} failed: {e}");
                    } else {
                        log::debug!("checkpointed {document_id}@{version}");
                    }
                }
                Ok(accepted)
            }
            Err(Rejection::Error(err)) => Err(err),
            Err(Rejection::Corrupted(reason)) => {
                log::error!("{document_id}: store corruption detected ({reason}), resetting session");
                let version = self.reset(document_id).await?;
                Err(SessionError::Reset { version })
            }
        }
    }

    /// Record a client's cursor and broadcast it. Positions past the end
    /// of the document are clamped.
    pub async fn update_cursor(&self, document_id: &DocumentId, client_id: &ClientId, position: usize) -> Result<usize, SessionError> {
        let session = self.require(document_id).await?;
        let mut state = session.state.write().await;
        let position = position.min(state.document.char_len());
        let slot = state
            .clients
            .get_mut(client_id)
            .ok_or(SessionError::NotAttached(*client_id))?;
        slot.cursor = Some(position);
        let user_id = slot.user_id.clone();
        let _ = session.events.send(SessionEvent::Presence {
            client_id: *client_id,
            user_id,
            state: PresenceState::Cursor { position },
        });
        Ok(position)
    }

    /// Note that `client_id` now holds everything up to `version`.
    pub async fn acknowledge(&self, document_id: &DocumentId, client_id: &ClientId, version: u64) -> Result<(), SessionError> {
        let session = self.require(document_id).await?;
        let state = session.state.read().await;
        let slot = state
            .clients
            .get(client_id)
            .ok_or(SessionError::NotAttached(*client_id))?;
        slot.acked.fetch_max(version, Ordering::AcqRel);
        Ok(())
    }

    /// Catch-up payload for an attached client that reports `last_acked`.
    pub async fn resync(&self, document_id: &DocumentId, client_id: &ClientId, last_acked: u64) -> Result<ResyncPlan, SessionError> {
        let session = self.require(document_id).await?;
        let state = session.state.read().await;
        let slot = state
            .clients
            .get(client_id)
            .ok_or(SessionError::NotAttached(*client_id))?;
        let plan = ResyncPlan::plan(&state.document, &state.log, last_acked);
        slot.acked.store(plan.version(), Ordering::Release);
        if plan.is_snapshot() {
            log::info!("{document_id}: {client_id} at v{last_acked} resyncs from snapshot v{}", plan.version());
        }
        Ok(plan)
    }

    // ─── Maintenance ──────────────────────────────────────────────────

    /// Drop logged operations older than `keep_from`. Clients behind the
    /// new floor will be sent snapshots.
    pub async fn compact(&self, document_id: &DocumentId, keep_from: u64) -> Result<usize, SessionError> {
        let session = self.require(document_id).await?;
        let mut state = session.state.write().await;
        let dropped = state.log.compact_to(keep_from);
        log::info!("{document_id}: compacted {dropped} ops, floor now v{}", state.log.floor());
        Ok(dropped)
    }

    /// Reload the session from persistence and force every attached
    /// client onto the reloaded state. Returns the new version, which is
    /// higher than anything clients may have seen.
    pub async fn reset(&self, document_id: &DocumentId) -> Result<u64, SessionError> {
        let session = self.require(document_id).await?;
        let mut state = session.state.write().await;

        let current = state.document.version().max(state.log.head());
        let content = match self.persistence.load(document_id) {
            Ok(Some(stored)) => stored.content,
            Ok(None) => String::new(),
            Err(e) => {
                log::error!("{document_id}: reload failed ({e}), keeping in-memory text");
                state.document.content().to_string()
            }
        };
        let version = current + 1;
        state.document = DocumentState::new(content.clone(), version);
        state.log.reset(version);
        state.since_checkpoint = 0;
        for slot in state.clients.values() {
            slot.acked.store(version, Ordering::Release);
        }
        let _ = session.events.send(SessionEvent::Reset { content, version });
        log::warn!("{document_id}: session reset to v{version}");
        Ok(version)
    }

    /// Persist every live session. Returns how many were written.
    pub async fn persist_all(&self) -> Result<usize, SessionError> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut written = 0;
        for session in sessions {
            let (content, version) = session.state.read().await.document.snapshot();
            self.persistence.persist(&session.document_id, &content, version)?;
            written += 1;
        }
        Ok(written)
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub async fn snapshot(&self, document_id: &DocumentId) -> Option<(String, u64)> {
        let session = self.sessions.read().await.get(document_id).cloned()?;
        let state = session.state.read().await;
        Some(state.document.snapshot())
    }

    pub async fn client_count(&self, document_id: &DocumentId) -> usize {
        let Some(session) = self.sessions.read().await.get(document_id).cloned() else {
            return 0;
        };
        let count = session.state.read().await.clients.len();
        count
    }

    pub async fn log_stats(&self, document_id: &DocumentId) -> Option<LogStats> {
        let session = self.sessions.read().await.get(document_id).cloned()?;
        let stats = session.state.read().await.log.stats();
        Some(stats)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn documents(&self) -> Vec<DocumentId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    async fn require(&self, document_id: &DocumentId) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .read()
            .await
            .get(document_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(document_id.clone()))
    }

    async fn get_or_load(&self, document_id: &DocumentId) -> Result<Arc<Session>, SessionError> {
        // Fast path: read lock
        if let Some(session) = self.sessions.read().await.get(document_id) {
            return Ok(session.clone());
        }

        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring write lock
        if let Some(session) = sessions.get(document_id) {
            return Ok(session.clone());
        }

        let retired = self.retiring.read().await.get(document_id).cloned();
        let stored = match retired {
            Some(stored) => Some(stored),
            None => self.persistence.load(document_id)?,
        };
        let document = match stored {
            Some(stored) => {
                log::info!("loaded {document_id}@{} from storage", stored.version);
                DocumentState::new(stored.content, stored.version)
            }
            None => DocumentState::empty(),
        };
        let session = Arc::new(Session::new(document_id.clone(), document, &self.config));
        sessions.insert(document_id.clone(), session.clone());
        Ok(session)
    }

    /// Write a torn-down session's snapshot without holding any registry lock.
    async fn flush_retired(&self, document_id: &DocumentId, stored: StoredDocument) {
        let version = stored.version;
        let persistence = self.persistence.clone();
        let id = document_id.clone();
        let written =
            tokio::task::spawn_blocking(move || persistence.persist(&id, &stored.content, stored.version)).await;
        match written {
            Ok(Ok(())) => log::info!("session {document_id} closed at v{version}"),
            Ok(Err(e)) => log::error!("failed to persist {document_id}@{version} on teardown: {e}"),
            Err(e) => log::error!("teardown persist task for {document_id} failed: {e}"),
        }

        let mut retiring = self.retiring.write().await;
        // A later teardown of the same document may have replaced the entry
        if retiring.get(document_id).is_some_and(|s| s.version == version) {
            retiring.remove(document_id);
        }
    }

    async fn notify(&self, document_id: &DocumentId, event: NotificationEvent) {
        if let Some(hub) = &self.hub {
            hub.publish(Topic::Document(document_id.clone()), event).await;
        }
    }
}
