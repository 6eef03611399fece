//! Topic-based notification hub.
//!
//! Notifications have no ordering relative to edits and are dropped
//! rather than queued when a subscriber is slow.
//!
//! ```text
//!             publish(Document("a"), UserJoined)
//!                          │
//!          ┌───────────────┴───────────────┐
//!          ▼                               ▼
//!  subscribers of Document("a")     subscribers of All
//!          │                               │
//!          └──────► ClientDirectory ◄──────┘
//!                   (try_send per mailbox)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::auth::UserId;
use crate::directory::ClientDirectory;
use crate::operation::{ClientId, DocumentId};
use crate::protocol::ServerMessage;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Every document
    All,
    Document(DocumentId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::All => f.write_str("*"),
            Topic::Document(id) => write!(f, "doc:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationEvent {
    UserJoined {
        user_id: UserId,
        document_id: DocumentId,
    },
    UserLeft {
        user_id: UserId,
        document_id: DocumentId,
    },
    /// Free-form message relayed from a client
    Alert { from: UserId, message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub topics: usize,
    pub subscriptions: usize,
    pub published: u64,
    pub delivered: u64,
}

pub struct NotificationHub {
    topics: RwLock<HashMap<Topic, HashSet<ClientId>>>,
    directory: Arc<ClientDirectory>,
    published: AtomicU64,
    delivered: AtomicU64,
}

impl NotificationHub {
    pub fn new(directory: Arc<ClientDirectory>) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            directory,
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// Returns false if the client was already subscribed.
    pub async fn subscribe(&self, client_id: ClientId, topic: Topic) -> bool {
        log::debug!("{client_id} subscribed to {topic}");
        self.topics.write().await.entry(topic).or_default().insert(client_id)
    }

    pub async fn unsubscribe(&self, client_id: &ClientId, topic: &Topic) -> bool {
        let mut topics = self.topics.write().await;
        let Some(members) = topics.get_mut(topic) else {
            return false;
        };
        let removed = members.remove(client_id);
        if members.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// Drop every subscription held by a disconnecting client.
    pub async fn unsubscribe_all(&self, client_id: &ClientId) -> usize {
        let mut topics = self.topics.write().await;
        let mut removed = 0;
        topics.retain(|_, members| {
            if members.remove(client_id) {
                removed += 1;
            }
            !members.is_empty()
        });
        removed
    }

    /// Deliver to every subscriber of `topic`. Returns the number reached.
    pub async fn publish(&self, topic: Topic, event: NotificationEvent) -> usize {
        self.publish_inner(topic, event, None).await
    }

    /// Like `publish`, but never echoes back to `sender`.
    pub async fn publish_from(&self, sender: &ClientId, topic: Topic, event: NotificationEvent) -> usize {
        self.publish_inner(topic, event, Some(sender)).await
    }

    async fn publish_inner(&self, topic: Topic, event: NotificationEvent, skip: Option<&ClientId>) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);

        let targets: HashSet<ClientId> = {
            let topics = self.topics.read().await;
            let direct = topics.get(&topic).into_iter().flatten();
            let wildcard = match topic {
                Topic::Document(_) => topics.get(&Topic::All),
                Topic::All => None,
            };
            direct
                .chain(wildcard.into_iter().flatten())
                .filter(|id| Some(*id) != skip)
                .copied()
                .collect()
        };
        if targets.is_empty() {
            return 0;
        }

        let msg = ServerMessage::Notification { topic, event };
        let count = self.directory.deliver_many(&targets, &msg).await;
        self.delivered.fetch_add(count as u64, Ordering::Relaxed);
        log::trace!("notification reached {count}/{} subscribers", targets.len());
        count
    }

    pub async fn stats(&self) -> HubStats {
        let topics = self.topics.read().await;
        HubStats {
            topics: topics.len(),
            subscriptions: topics.values().map(HashSet::len).sum(),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ClientHandle;
    use tokio::sync::mpsc;

    async fn connect(directory: &ClientDirectory) -> (ClientId, mpsc::Receiver<ServerMessage>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(8);
        directory
            .register(
                id,
                ClientHandle {
                    user_id: UserId::from("u"),
                    mailbox: tx,
                },
            )
            .await;
        (id, rx)
    }

    fn joined(doc: &str) -> NotificationEvent {
        NotificationEvent::UserJoined {
            user_id: UserId::from("alice"),
            document_id: DocumentId::from(doc),
        }
    }

    #[tokio::test]
    async fn test_document_topic_reaches_wildcard() {
        let directory = Arc::new(ClientDirectory::new());
        let hub = NotificationHub::new(directory.clone());
        let (doc_sub, mut doc_rx) = connect(&directory).await;
        let (all_sub, mut all_rx) = connect(&directory).await;
        let (other_sub, mut other_rx) = connect(&directory).await;

        hub.subscribe(doc_sub, Topic::Document("a".into())).await;
        hub.subscribe(all_sub, Topic::All).await;
        hub.subscribe(other_sub, Topic::Document("b".into())).await;

        let reached = hub.publish(Topic::Document("a".into()), joined("a")).await;
        assert_eq!(reached, 2);
        assert!(doc_rx.try_recv().is_ok());
        assert!(all_rx.try_recv().is_ok());
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_from_skips_sender() {
        let directory = Arc::new(ClientDirectory::new());
        let hub = NotificationHub::new(directory.clone());
        let (a, mut a_rx) = connect(&directory).await;
        let (b, mut b_rx) = connect(&directory).await;
        hub.subscribe(a, Topic::All).await;
        hub.subscribe(b, Topic::All).await;

        let alert = NotificationEvent::Alert {
            from: UserId::from("alice"),
            message: "hi".into(),
        };
        assert_eq!(hub.publish_from(&a, Topic::All, alert.clone()).await, 1);
        assert!(a_rx.try_recv().is_err());
        assert_eq!(
            b_rx.try_recv().ok(),
            Some(ServerMessage::Notification {
                topic: Topic::All,
                event: alert
            })
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let directory = Arc::new(ClientDirectory::new());
        let hub = NotificationHub::new(directory.clone());
        let (a, _rx) = connect(&directory).await;

        assert!(hub.subscribe(a, Topic::All).await);
        assert!(!hub.subscribe(a, Topic::All).await);
        hub.subscribe(a, Topic::Document("x".into())).await;
        assert_eq!(hub.stats().await.subscriptions, 2);

        assert_eq!(hub.unsubscribe_all(&a).await, 2);
        let stats = hub.stats().await;
        assert_eq!(stats.topics, 0);
        assert_eq!(hub.publish(Topic::All, joined("x")).await, 0);
    }
}
