//! # tandem-collab: Real-time collaborative text editing
//!
//! A central server keeps one canonical copy of each document. Clients
//! send character-offset inserts and deletes authored against the version
//! they last saw; the server transforms each edit past everything accepted
//! since, applies it, and fans it out in version order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────────────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer                  │
//! │ (Replica)   │  bincode / JSON    │  Connection task per socket │
//! └─────────────┘                    └──────────────┬──────────────┘
//!                                                   │
//!                              ┌────────────────────┼──────────────────┐
//!                              ▼                    ▼                  ▼
//!                     ┌────────────────┐   ┌────────────────┐  ┌──────────────┐
//!                     │SessionRegistry │   │NotificationHub │  │ClientDirectory│
//!                     │ per document:  │   │ topic → subs   │  │ mailboxes     │
//!                     │ DocumentState  │   └────────────────┘  └──────────────┘
//!                     │ OperationLog   │
//!                     │ event channel  │──► Persistence (memory / RocksDB)
//!                     └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`]: insert/delete operations and identifiers
//! - [`document`]: canonical text and version counter
//! - [`oplog`]: bounded log of accepted operations
//! - [`transform`]: operational transform against the log
//! - [`resync`]: replay or snapshot for lagging clients
//! - [`registry`]: per-document sessions
//! - [`directory`] / [`notify`]: client mailboxes and topic pub/sub
//! - [`protocol`]: wire messages
//! - [`server`] / [`client`]: WebSocket endpoints
//! - [`auth`], [`storage`], [`config`], [`ratelimit`], [`presence`]

pub mod auth;
pub mod client;
pub mod config;
pub mod directory;
pub mod document;
pub mod notify;
pub mod operation;
pub mod oplog;
pub mod presence;
pub mod protocol;
pub mod ratelimit;
pub mod registry;
pub mod resync;
pub mod server;
pub mod storage;
pub mod transform;

// Re-exports for convenience
pub use auth::{AllowAnonymous, AuthError, Authenticator, StaticTokens, UserId};
pub use client::{ClientError, ConnectionState, Replica, SyncClient, SyncEvent};
pub use config::{ConfigError, RateLimit, ServerConfig};
pub use document::{DocumentState, StoreError};
pub use notify::{NotificationEvent, NotificationHub, Topic};
pub use operation::{ClientId, DocumentId, OpKind, Operation};
pub use oplog::{LogStats, LoggedOp, OperationLog};
pub use presence::{PresenceRoom, PresenceState};
pub use protocol::{ClientMessage, Codec, ErrorCode, ProtocolError, ServerMessage};
pub use registry::{SessionError, SessionRegistry};
pub use resync::ResyncPlan;
pub use server::{ServerStats, SyncServer};
pub use storage::{MemoryStore, PersistError, Persistence, StoredDocument};
#[cfg(feature = "rocksdb")]
pub use storage::{RocksConfig, RocksStore};
pub use transform::{transform, TransformError};
