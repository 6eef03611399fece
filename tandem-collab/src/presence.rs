//! Presence: who is in a document and where their cursor is.
//!
//! Presence is advisory. It travels on the session channel next to edits
//! so a cursor never refers to text the receiver has not seen yet, but it
//! is never persisted and never replayed on resync.
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceRoom::set_local_cursor()   (throttled)
//!       │
//!       ▼
//! ClientMessage::Cursor { position }
//!       │
//!       ▼   (session channel, version ordered)
//! ServerMessage::Presence { state: Cursor { position } }
//!       │
//!       ▼
//! Remote PresenceRoom::handle_presence()
//!       │
//!       ▼
//! PresenceRoom::apply_operation()    (cursors follow later edits)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::auth::UserId;
use crate::operation::{ClientId, Operation};
use crate::transform::map_position;

/// Presence transitions carried by `ServerMessage::Presence`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceState {
    Joined,
    Cursor { position: usize },
    Left,
}

// ───────────────────────────────────────────────────────────────────
// Remote peer state
// ───────────────────────────────────────────────────────────────────

/// A remote collaborator as seen by the local client.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub client_id: ClientId,
    pub user_id: UserId,
    /// Character offset in the local replica, None until first reported
    pub cursor: Option<usize>,
    last_update: Instant,
}

impl RemotePeer {
    fn new(client_id: ClientId, user_id: UserId) -> Self {
        Self {
            client_id,
            user_id,
            cursor: None,
            last_update: Instant::now(),
        }
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence room
// ───────────────────────────────────────────────────────────────────

/// Client-side view of everyone else attached to the same document.
pub struct PresenceRoom {
    local_client: Option<ClientId>,
    peers: HashMap<ClientId, RemotePeer>,
    local_cursor: Option<usize>,
    /// Last time a cursor update was sent
    last_cursor_send: Option<Instant>,
    /// Minimum interval between cursor sends
    cursor_interval: Duration,
}

impl PresenceRoom {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_millis(50))
    }

    /// Custom cursor throttle (tests use zero).
    pub fn with_interval(cursor_interval: Duration) -> Self {
        Self {
            local_client: None,
            peers: HashMap::new(),
            local_cursor: None,
            last_cursor_send: None,
            cursor_interval,
        }
    }

    /// Forget all peers and adopt a new local identity (after a join).
    pub fn reset(&mut self, local_client: ClientId) {
        self.local_client = Some(local_client);
        self.peers.clear();
        self.last_cursor_send = None;
    }

    /// Apply a presence message. Returns true if anything changed.
    pub fn handle_presence(&mut self, client_id: ClientId, user_id: &UserId, state: &PresenceState) -> bool {
        if Some(client_id) == self.local_client {
            return false;
        }
        match state {
            PresenceState::Joined => {
                self.peers
                    .insert(client_id, RemotePeer::new(client_id, user_id.clone()));
                log::debug!("presence: {user_id} ({client_id}) joined");
            }
            PresenceState::Cursor { position } => {
                let peer = self
                    .peers
                    .entry(client_id)
                    .or_insert_with(|| RemotePeer::new(client_id, user_id.clone()));
                peer.cursor = Some(*position);
                peer.last_update = Instant::now();
            }
            PresenceState::Left => {
                if self.peers.remove(&client_id).is_none() {
                    return false;
                }
                log::debug!("presence: {user_id} ({client_id}) left");
            }
        }
        true
    }

    /// Shift every known cursor past an operation applied to the replica.
    pub fn apply_operation(&mut self, op: &Operation) {
        for peer in self.peers.values_mut() {
            if let Some(cursor) = peer.cursor.as_mut() {
                *cursor = map_position(*cursor, op);
            }
        }
        if let Some(cursor) = self.local_cursor.as_mut() {
            *cursor = map_position(*cursor, op);
        }
    }

    /// Record the local cursor. Returns the position to send, or None
    /// while throttled or unchanged.
    pub fn set_local_cursor(&mut self, position: usize) -> Option<usize> {
        self.set_local_cursor_at(position, Instant::now())
    }

    pub fn set_local_cursor_at(&mut self, position: usize, now: Instant) -> Option<usize> {
        let changed = self.local_cursor != Some(position);
        self.local_cursor = Some(position);
        let due = self
            .last_cursor_send
            .map_or(true, |last| now.saturating_duration_since(last) >= self.cursor_interval);
        if changed && due {
            self.last_cursor_send = Some(now);
            Some(position)
        } else {
            None
        }
    }

    pub fn local_cursor(&self) -> Option<usize> {
        self.local_cursor
    }

    pub fn peer(&self, client_id: &ClientId) -> Option<&RemotePeer> {
        self.peers.get(client_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Drop peers silent for longer than `timeout`. Returns how many.
    pub fn prune_idle(&mut self, timeout: Duration) -> usize {
        let before = self.peers.len();
        self.peers.retain(|_, peer| !peer.is_idle(timeout));
        before - self.peers.len()
    }
}

impl Default for PresenceRoom {
    fn default() -> Self {
        Self::new()
    }
}
