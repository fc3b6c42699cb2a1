//! The in-memory pub/sub adapter.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{
    FanoutCapability, LocalSink, PubSubAdapter, PublishEnvelope, PublishError, PublishOk,
    PublishResult, ReplaceOutcome,
};
use crate::connection::ClientId;
use crate::error::ErrorCode;

/// Topic index and local fan-out for a single instance.
///
/// Two mirrored maps make both directions O(1): `topic → subscribers` for
/// fan-out and `client → topics` for connection-close cleanup. A topic
/// whose subscriber set drains is removed from the index entirely, so
/// `has_topic` is equivalent to "at least one subscriber".
///
/// Mutations hold a single coarse lock; `publish` snapshots the subscriber
/// set under the lock and delivers outside it, so a slow socket never
/// stalls `subscribe`/`replace` on other tasks.
pub struct MemoryPubSub {
    index: StdMutex<Index>,
    sink: StdMutex<Option<Arc<dyn LocalSink>>>,
}

#[derive(Default)]
struct Index {
    by_topic: HashMap<String, HashSet<ClientId>>,
    by_client: HashMap<ClientId, HashSet<String>>,
}

impl Index {
    fn insert(&mut self, client_id: &ClientId, topic: &str) {
        self.by_topic
            .entry(topic.to_owned())
            .or_default()
            .insert(client_id.clone());
        self.by_client
            .entry(client_id.clone())
            .or_default()
            .insert(topic.to_owned());
    }

    fn remove(&mut self, client_id: &ClientId, topic: &str) {
        if let Some(subscribers) = self.by_topic.get_mut(topic) {
            subscribers.remove(client_id);
            if subscribers.is_empty() {
                self.by_topic.remove(topic);
            }
        }
        if let Some(topics) = self.by_client.get_mut(client_id) {
            topics.remove(topic);
            if topics.is_empty() {
                self.by_client.remove(client_id);
            }
        }
    }
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self {
            index: StdMutex::new(Index::default()),
            sink: StdMutex::new(None),
        }
    }

    fn index(&self) -> std::sync::MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn local_sink(&self) -> Option<Arc<dyn LocalSink>> {
        self.sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubAdapter for MemoryPubSub {
    async fn publish(&self, envelope: PublishEnvelope) -> PublishResult {
        // snapshot under the lock, deliver outside it
        let targets: Vec<ClientId> = {
            let index = self.index();
            match index.by_topic.get(&envelope.topic) {
                Some(subscribers) => {
                    let mut targets: Vec<ClientId> = subscribers
                        .iter()
                        .filter(|c| Some(*c) != envelope.exclude_client_id.as_ref())
                        .cloned()
                        .collect();
                    // deterministic delivery order
                    targets.sort();
                    targets
                }
                None => Vec::new(),
            }
        };

        let matched = targets.len();
        if matched > 0 {
            if let Some(sink) = self.local_sink() {
                let frame = match serde_json::to_string(&envelope.to_frame()) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(topic = %envelope.topic, %err, "publish envelope failed to serialize");
                        return Err(PublishError::new(ErrorCode::AdapterError, false)
                            .with_message(err.to_string()));
                    }
                };
                // sequential delivery keeps same-sender/same-topic order
                for client in &targets {
                    if !sink.deliver(client, &frame).await {
                        debug!(client_id = %client, topic = %envelope.topic,
                               "subscriber unreachable, frame dropped");
                    }
                }
            }
        }

        Ok(PublishOk {
            capability: FanoutCapability::Exact,
            matched: Some(matched),
        })
    }

    async fn subscribe(&self, client_id: &ClientId, topic: &str) {
        self.index().insert(client_id, topic);
    }

    async fn unsubscribe(&self, client_id: &ClientId, topic: &str) {
        self.index().remove(client_id, topic);
    }

    async fn subscribers(&self, topic: &str) -> Vec<ClientId> {
        self.index()
            .by_topic
            .get(topic)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn replace(&self, client_id: &ClientId, topics: &[String]) -> ReplaceOutcome {
        let new: HashSet<String> = topics.iter().cloned().collect();
        let mut index = self.index();
        let old: HashSet<String> = index
            .by_client
            .get(client_id)
            .cloned()
            .unwrap_or_default();
        if new == old {
            return ReplaceOutcome {
                added: 0,
                removed: 0,
                total: new.len(),
            };
        }
        let added: Vec<&String> = new.difference(&old).collect();
        let removed: Vec<&String> = old.difference(&new).collect();
        let outcome = ReplaceOutcome {
            added: added.len(),
            removed: removed.len(),
            total: new.len(),
        };
        for topic in added {
            index.insert(client_id, topic);
        }
        for topic in removed {
            index.remove(client_id, topic);
        }
        outcome
    }

    async fn topics(&self) -> Vec<String> {
        self.index().by_topic.keys().cloned().collect()
    }

    async fn has_topic(&self, topic: &str) -> bool {
        self.index().by_topic.contains_key(topic)
    }

    async fn dispose(&self) {
        let mut index = self.index();
        index.by_topic.clear();
        index.by_client.clear();
    }

    fn bind(&self, sink: Arc<dyn LocalSink>) {
        *self
            .sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sink);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn client(name: &str) -> ClientId {
        ClientId::from_string(name.to_owned())
    }

    fn envelope(topic: &str, exclude: Option<&ClientId>) -> PublishEnvelope {
        PublishEnvelope {
            topic: topic.to_owned(),
            ty: "ROOM_EVENT".to_owned(),
            payload: Some(json!({ "n": 1 })),
            meta: Default::default(),
            exclude_client_id: exclude.cloned(),
        }
    }

    struct RecordingSink {
        frames: Mutex<Vec<(ClientId, String)>>,
    }

    #[async_trait]
    impl LocalSink for RecordingSink {
        async fn deliver(&self, client_id: &ClientId, frame: &str) -> bool {
            self.frames
                .lock()
                .unwrap()
                .push((client_id.clone(), frame.to_owned()));
            true
        }
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_cleanup_removes_empty_topics() {
        let pubsub = MemoryPubSub::new();
        let a = client("a");

        pubsub.subscribe(&a, "room:1").await;
        pubsub.subscribe(&a, "room:1").await;
        assert_eq!(pubsub.subscribers("room:1").await, vec![a.clone()]);
        assert!(pubsub.has_topic("room:1").await);

        pubsub.unsubscribe(&a, "room:1").await;
        // non-member unsubscribe is a no-op
        pubsub.unsubscribe(&a, "room:1").await;
        assert!(!pubsub.has_topic("room:1").await);
        assert!(pubsub.topics().await.is_empty());
    }

    #[tokio::test]
    async fn replace_reports_set_difference_and_is_noop_on_equal_sets() {
        let pubsub = MemoryPubSub::new();
        let a = client("a");
        pubsub.subscribe(&a, "x").await;
        pubsub.subscribe(&a, "y").await;

        let outcome = pubsub
            .replace(&a, &["y".to_owned(), "z".to_owned(), "w".to_owned()])
            .await;
        assert_eq!(
            outcome,
            ReplaceOutcome {
                added: 2,
                removed: 1,
                total: 3
            }
        );
        assert!(!pubsub.has_topic("x").await);
        assert!(pubsub.has_topic("w").await);

        let outcome = pubsub
            .replace(&a, &["w".to_owned(), "y".to_owned(), "z".to_owned()])
            .await;
        assert_eq!(
            outcome,
            ReplaceOutcome {
                added: 0,
                removed: 0,
                total: 3
            }
        );
    }

    #[tokio::test]
    async fn replace_with_empty_set_purges_the_client() {
        let pubsub = MemoryPubSub::new();
        let a = client("a");
        pubsub.subscribe(&a, "x").await;
        pubsub.subscribe(&a, "y").await;
        let outcome = pubsub.replace(&a, &[]).await;
        assert_eq!(outcome.removed, 2);
        assert_eq!(outcome.total, 0);
        assert!(pubsub.topics().await.is_empty());
    }

    #[tokio::test]
    async fn publish_counts_exactly_and_suppresses_the_sender() {
        let pubsub = MemoryPubSub::new();
        let sink = Arc::new(RecordingSink {
            frames: Mutex::new(Vec::new()),
        });
        pubsub.bind(sink.clone());

        let (a, b, c) = (client("a"), client("b"), client("c"));
        for client in [&a, &b, &c] {
            pubsub.subscribe(client, "room:1").await;
        }

        let ok = pubsub.publish(envelope("room:1", Some(&a))).await.unwrap();
        assert_eq!(ok.capability, FanoutCapability::Exact);
        assert_eq!(ok.matched, Some(2));

        let frames = sink.frames.lock().unwrap();
        let receivers: Vec<&ClientId> = frames.iter().map(|(c, _)| c).collect();
        assert!(receivers.contains(&&b) && receivers.contains(&&c));
        assert!(!receivers.contains(&&a));
        // delivered frames carry the topic in meta
        let frame: serde_json::Value = serde_json::from_str(&frames[0].1).unwrap();
        assert_eq!(frame["meta"]["topic"], "room:1");
        assert_eq!(frame["type"], "ROOM_EVENT");
    }

    #[tokio::test]
    async fn publish_to_an_unknown_topic_matches_zero() {
        let pubsub = MemoryPubSub::new();
        let ok = pubsub.publish(envelope("nowhere", None)).await.unwrap();
        assert_eq!(ok.matched, Some(0));
    }

    #[tokio::test]
    async fn dispose_drops_the_whole_index() {
        let pubsub = MemoryPubSub::new();
        pubsub.subscribe(&client("a"), "x").await;
        pubsub.subscribe(&client("b"), "y").await;
        pubsub.dispose().await;
        assert!(pubsub.topics().await.is_empty());
        assert!(pubsub.subscribers("x").await.is_empty());
    }
}
