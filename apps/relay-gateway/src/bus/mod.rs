//! Cross-replica event bus.
//!
//! One subscriber task per replica holds the store's pub/sub link and
//! multiplexes every topic any local socket cares about: the first local
//! subscriber for a topic subscribes on the store, the last one unsubscribes.
//! Inbound events are fanned out to the per-socket mailboxes in arrival
//! order, so per-topic delivery order matches publish order.

pub mod mailbox;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::store::{StoreError, StoreGateway};
use crate::ws::events;

use mailbox::{Frame, Mailbox};

enum BusCommand {
    Subscribe(String),
    Unsubscribe(String),
}

struct LocalSubscriber {
    id: u64,
    mailbox: Mailbox,
}

pub struct EventBus {
    topics: DashMap<String, Vec<LocalSubscriber>>,
    cmd_tx: mpsc::UnboundedSender<BusCommand>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Open the store subscription and spawn the dispatcher task.
    pub async fn start(store: Arc<dyn StoreGateway>) -> Result<Arc<Self>, StoreError> {
        let subscriber = store.open_subscriber().await?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(Self {
            topics: DashMap::new(),
            cmd_tx,
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(run_dispatcher(bus.clone(), subscriber, cmd_rx));
        Ok(bus)
    }

    /// A unique id for one local subscriber (usually one per socket).
    pub fn subscriber_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Attach a mailbox to a topic. Subscribes on the store when this is the
    /// topic's first local subscriber.
    ///
    /// Commands are sent while the topic entry is locked so their order
    /// matches the order of table mutations.
    pub fn subscribe(&self, topic: &str, id: u64, mailbox: Mailbox) {
        let mut entry = self.topics.entry(topic.to_string()).or_default();
        if entry.is_empty() {
            let _ = self.cmd_tx.send(BusCommand::Subscribe(topic.to_string()));
        }
        entry.push(LocalSubscriber { id, mailbox });
    }

    /// Detach a subscriber. Unsubscribes on the store when the topic has no
    /// local subscribers left.
    pub fn unsubscribe(&self, topic: &str, id: u64) {
        if let Some(mut entry) = self.topics.get_mut(topic) {
            entry.retain(|s| s.id != id);
            if entry.is_empty() {
                let _ = self.cmd_tx.send(BusCommand::Unsubscribe(topic.to_string()));
            }
        }
        self.topics.remove_if(topic, |_, subs| subs.is_empty());
    }

    /// Number of topics with at least one local subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    fn dispatch(&self, topic: &str, payload: &str) {
        let event_type = serde_json::from_str::<serde_json::Value>(payload)
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string));
        let Some(event_type) = event_type else {
            tracing::warn!(%topic, "discarding malformed bus event");
            return;
        };
        let critical = events::is_lifecycle(&event_type);

        let Some(subs) = self.topics.get(topic) else {
            return;
        };
        for sub in subs.iter() {
            let frame = if critical {
                Frame::critical(payload.to_string())
            } else {
                Frame::normal(payload.to_string())
            };
            sub.mailbox.push(frame);
        }
    }
}

async fn run_dispatcher(
    bus: Arc<EventBus>,
    mut subscriber: Box<dyn crate::store::TopicSubscriber>,
    mut cmd_rx: mpsc::UnboundedReceiver<BusCommand>,
) {
    let mut pending: Vec<BusCommand> = Vec::new();
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => pending.push(cmd),
                None => break,
            },
            event = subscriber.next_event() => match event {
                Some((topic, payload)) => bus.dispatch(&topic, &payload),
                None => {
                    tracing::error!("store pub/sub link closed; bus dispatcher exiting");
                    break;
                }
            },
        }

        // Applied outside the select so the subscriber is not borrowed twice.
        for cmd in pending.drain(..) {
            let result = match &cmd {
                BusCommand::Subscribe(topic) => subscriber.subscribe(topic).await,
                BusCommand::Unsubscribe(topic) => subscriber.unsubscribe(topic).await,
            };
            if let Err(e) = result {
                tracing::warn!(%e, "pub/sub command failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::memory::MemoryStore;

    async fn settle() {
        // Give the dispatcher task a beat to apply subscribe commands.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn delivers_to_subscribed_mailboxes_in_order() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::start(store.clone() as Arc<dyn StoreGateway>)
            .await
            .unwrap();

        let mailbox = Mailbox::new(16);
        let id = bus.subscriber_id();
        bus.subscribe("session:s1", id, mailbox.clone());
        settle().await;

        store
            .publish("session:s1", r#"{"type":"session_updated","n":1}"#)
            .await
            .unwrap();
        store
            .publish("session:s1", r#"{"type":"session_updated","n":2}"#)
            .await
            .unwrap();
        settle().await;

        let first = mailbox.pop().await.unwrap();
        let second = mailbox.pop().await.unwrap();
        assert!(first.payload.contains("\"n\":1"));
        assert!(second.payload.contains("\"n\":2"));
    }

    #[tokio::test]
    async fn unsubscribed_topics_are_silent() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::start(store.clone() as Arc<dyn StoreGateway>)
            .await
            .unwrap();

        let mailbox = Mailbox::new(16);
        let id = bus.subscriber_id();
        bus.subscribe("user:alice", id, mailbox.clone());
        settle().await;

        bus.unsubscribe("user:alice", id);
        settle().await;

        store
            .publish("user:alice", r#"{"type":"logout"}"#)
            .await
            .unwrap();
        settle().await;

        assert!(mailbox.is_empty());
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn lifecycle_events_are_critical() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::start(store.clone() as Arc<dyn StoreGateway>)
            .await
            .unwrap();

        let mailbox = Mailbox::new(16);
        let id = bus.subscriber_id();
        bus.subscribe("user:alice", id, mailbox.clone());
        settle().await;

        store
            .publish("user:alice", r#"{"type":"logout"}"#)
            .await
            .unwrap();
        settle().await;

        let frame = mailbox.pop().await.unwrap();
        assert!(frame.critical);
    }

    #[tokio::test]
    async fn two_subscribers_both_receive() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::start(store.clone() as Arc<dyn StoreGateway>)
            .await
            .unwrap();

        let a = Mailbox::new(16);
        let b = Mailbox::new(16);
        bus.subscribe("user:alice", bus.subscriber_id(), a.clone());
        bus.subscribe("user:alice", bus.subscriber_id(), b.clone());
        settle().await;

        store
            .publish("user:alice", r#"{"type":"role_changed"}"#)
            .await
            .unwrap();
        settle().await;

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
