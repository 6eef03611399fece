//! Connection Manager's client table: who is connected and how to reach them.
//!
//! Each connection registers a bounded mailbox. Anything that is not part
//! of the ordered edit stream (notifications, relayed alerts) is pushed
//! through it with `try_send`, so a stuck socket never blocks the sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};

use crate::auth::UserId;
use crate::operation::ClientId;
use crate::protocol::ServerMessage;

/// A live connection's identity and outbound mailbox.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub user_id: UserId,
    pub mailbox: mpsc::Sender<ServerMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    /// Mailbox full; the message was dropped
    Dropped,
    /// No such client, or its connection is gone
    Gone,
}

#[derive(Default)]
pub struct ClientDirectory {
    clients: RwLock<HashMap<ClientId, ClientHandle>>,
    dropped: AtomicU64,
}

impl ClientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, client_id: ClientId, handle: ClientHandle) {
        self.clients.write().await.insert(client_id, handle);
    }

    pub async fn unregister(&self, client_id: &ClientId) -> Option<ClientHandle> {
        self.clients.write().await.remove(client_id)
    }

    /// Best-effort delivery to many clients under one read lock.
    /// Returns the number delivered.
    pub async fn deliver_many<'a, I>(&self, targets: I, msg: &ServerMessage) -> usize
    where
        I: IntoIterator<Item = &'a ClientId>,
    {
        let clients = self.clients.read().await;
        targets
            .into_iter()
            .filter_map(|id| clients.get(id).map(|handle| (id, handle)))
            .filter(|(id, handle)| self.push(id, handle, msg.clone()) == Delivery::Delivered)
            .count()
    }

    fn push(&self, client_id: &ClientId, handle: &ClientHandle, msg: ServerMessage) -> Delivery {
        match handle.mailbox.try_send(msg) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("mailbox full for {client_id}, dropping message");
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Messages dropped because a mailbox was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
