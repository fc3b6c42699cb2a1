//! Per-connection topic management: validation, quota, atomic replacement.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;

use crate::connection::ClientId;
use crate::pubsub::{PubSubAdapter, ReplaceOutcome};

/// Why a topic was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicRejectReason {
    /// Empty, or longer than the configured maximum.
    Length,
    /// A character outside `[a-z0-9:_./-]` (case-insensitive).
    Pattern,
    /// Rejected by the configured policy hook.
    Policy,
}

impl TopicRejectReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TopicRejectReason::Length => "length",
            TopicRejectReason::Pattern => "pattern",
            TopicRejectReason::Policy => "policy",
        }
    }
}

/// A subscribe-side failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("invalid topic {topic:?}: {}", reason.as_str())]
    InvalidTopic {
        topic: String,
        reason: TopicRejectReason,
    },
    #[error("topic quota exceeded: limit is {limit}")]
    QuotaExceeded { limit: usize },
}

impl TopicError {
    /// Structured details for an `ERROR` payload.
    pub fn details(&self) -> Value {
        match self {
            TopicError::InvalidTopic { topic, reason } => serde_json::json!({
                "topic": topic,
                "reason": reason.as_str(),
            }),
            TopicError::QuotaExceeded { limit } => serde_json::json!({ "limit": limit }),
        }
    }
}

/// Topic syntax rules, applied on the subscribe path only — unsubscribing
/// never validates, so error paths can always clean up.
#[derive(Clone)]
pub struct TopicValidator {
    max_len: usize,
    policy: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
}

impl TopicValidator {
    /// The default rules: at most 128 characters of `[a-z0-9:_./-]`,
    /// case-insensitive, no policy hook.
    pub fn new() -> Self {
        Self {
            max_len: 128,
            policy: None,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Install an application policy; topics it returns `false` for are
    /// rejected with reason `policy`.
    pub fn with_policy(mut self, policy: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    pub fn check(&self, topic: &str) -> Result<(), TopicError> {
        let reject = |reason| {
            Err(TopicError::InvalidTopic {
                topic: topic.to_owned(),
                reason,
            })
        };
        if topic.is_empty() || topic.chars().count() > self.max_len {
            return reject(TopicRejectReason::Length);
        }
        let ok = topic.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '.' | '/' | '-')
        });
        if !ok {
            return reject(TopicRejectReason::Pattern);
        }
        if let Some(policy) = &self.policy {
            if !policy(topic) {
                return reject(TopicRejectReason::Policy);
            }
        }
        Ok(())
    }
}

impl Default for TopicValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for TopicValidator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TopicValidator")
            .field("max_len", &self.max_len)
            .field("policy", &self.policy.is_some())
            .finish()
    }
}

/// A connection's view of its subscriptions.
///
/// Wraps the shared [`PubSubAdapter`] with per-connection bookkeeping: the
/// validator, the quota, and the mirror set used for O(1) quota checks and
/// close-time cleanup.
#[derive(Clone)]
pub struct Topics {
    pub(crate) client_id: ClientId,
    pub(crate) adapter: Arc<dyn PubSubAdapter>,
    pub(crate) validator: Arc<TopicValidator>,
    pub(crate) max_topics: Option<usize>,
    pub(crate) mirror: Arc<StdMutex<HashSet<String>>>,
}

impl Topics {
    /// Join a topic. A repeat subscribe is a no-op.
    pub async fn subscribe(&self, topic: &str) -> Result<(), TopicError> {
        self.validator.check(topic)?;
        {
            let mirror = self.mirror();
            if !mirror.contains(topic) {
                if let Some(limit) = self.max_topics {
                    if mirror.len() >= limit {
                        return Err(TopicError::QuotaExceeded { limit });
                    }
                }
            }
        }
        self.adapter.subscribe(&self.client_id, topic).await;
        self.mirror().insert(topic.to_owned());
        Ok(())
    }

    /// Join several topics; all are validated (and counted against the
    /// quota) before any takes effect.
    pub async fn subscribe_many(&self, topics: &[String]) -> Result<(), TopicError> {
        for topic in topics {
            self.validator.check(topic)?;
        }
        {
            let mirror = self.mirror();
            let new = topics.iter().filter(|t| !mirror.contains(*t)).count();
            if let Some(limit) = self.max_topics {
                if mirror.len() + new > limit {
                    return Err(TopicError::QuotaExceeded { limit });
                }
            }
        }
        for topic in topics {
            self.adapter.subscribe(&self.client_id, topic).await;
            self.mirror().insert(topic.clone());
        }
        Ok(())
    }

    /// Leave a topic. Never validates and never fails, so it is safe to
    /// call from error paths; leaving a topic that was never joined is a
    /// no-op.
    pub async fn unsubscribe(&self, topic: &str) {
        self.adapter.unsubscribe(&self.client_id, topic).await;
        self.mirror().remove(topic);
    }

    /// Atomically swap the whole subscription set.
    pub async fn replace(&self, topics: &[String]) -> Result<ReplaceOutcome, TopicError> {
        for topic in topics {
            self.validator.check(topic)?;
        }
        if let Some(limit) = self.max_topics {
            let distinct: HashSet<&String> = topics.iter().collect();
            if distinct.len() > limit {
                return Err(TopicError::QuotaExceeded { limit });
            }
        }
        let outcome = self.adapter.replace(&self.client_id, topics).await;
        *self.mirror() = topics.iter().cloned().collect();
        Ok(outcome)
    }

    /// Alias for [`replace`](Topics::replace).
    pub async fn set(&self, topics: &[String]) -> Result<ReplaceOutcome, TopicError> {
        self.replace(topics).await
    }

    /// Snapshot of this connection's subscriptions.
    pub fn list(&self) -> Vec<String> {
        self.mirror().iter().cloned().collect()
    }

    fn mirror(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.mirror.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pubsub::MemoryPubSub;

    fn topics(max: Option<usize>, validator: TopicValidator) -> (Topics, Arc<MemoryPubSub>) {
        let adapter = Arc::new(MemoryPubSub::new());
        let topics = Topics {
            client_id: ClientId::from_string("c1".to_owned()),
            adapter: adapter.clone(),
            validator: Arc::new(validator),
            max_topics: max,
            mirror: Arc::new(StdMutex::new(HashSet::new())),
        };
        (topics, adapter)
    }

    #[test]
    fn validator_length_boundary() {
        let v = TopicValidator::new();
        let at_limit: String = "a".repeat(128);
        let over: String = "a".repeat(129);
        assert!(v.check(&at_limit).is_ok());
        assert_eq!(
            v.check(&over),
            Err(TopicError::InvalidTopic {
                topic: over.clone(),
                reason: TopicRejectReason::Length
            })
        );
        assert!(matches!(
            v.check(""),
            Err(TopicError::InvalidTopic {
                reason: TopicRejectReason::Length,
                ..
            })
        ));
    }

    #[test]
    fn validator_pattern_and_case_insensitivity() {
        let v = TopicValidator::new();
        assert!(v.check("room:1/general.chat_x-y").is_ok());
        assert!(v.check("ROOM:1").is_ok());
        for bad in ["room 1", "room#1", "röom", "a\nb"] {
            assert!(matches!(
                v.check(bad),
                Err(TopicError::InvalidTopic {
                    reason: TopicRejectReason::Pattern,
                    ..
                })
            ));
        }
    }

    #[test]
    fn validator_policy_hook() {
        let v = TopicValidator::new().with_policy(|t| t.starts_with("room:"));
        assert!(v.check("room:1").is_ok());
        assert!(matches!(
            v.check("admin:1"),
            Err(TopicError::InvalidTopic {
                reason: TopicRejectReason::Policy,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn quota_applies_to_new_topics_only() {
        let (topics, _) = topics(Some(2), TopicValidator::new());
        topics.subscribe("a").await.unwrap();
        topics.subscribe("b").await.unwrap();
        // resubscribing an existing topic does not hit the quota
        topics.subscribe("a").await.unwrap();
        assert_eq!(
            topics.subscribe("c").await,
            Err(TopicError::QuotaExceeded { limit: 2 })
        );
    }

    #[tokio::test]
    async fn unsubscribe_skips_validation() {
        let (topics, adapter) = topics(None, TopicValidator::new().with_max_len(4));
        // would never validate, but unsubscribing it must not error
        topics.unsubscribe("not a valid topic at all").await;
        assert!(adapter.topics().await.is_empty());
    }

    #[tokio::test]
    async fn replace_validates_everything_first() {
        let (topics, adapter) = topics(None, TopicValidator::new());
        topics.subscribe("old").await.unwrap();
        let err = topics
            .replace(&["fine".to_owned(), "bad topic".to_owned()])
            .await
            .unwrap_err();
        assert!(matches!(err, TopicError::InvalidTopic { .. }));
        // nothing changed
        assert_eq!(topics.list(), vec!["old".to_owned()]);
        assert!(adapter.has_topic("old").await);
        assert!(!adapter.has_topic("fine").await);
    }
}
