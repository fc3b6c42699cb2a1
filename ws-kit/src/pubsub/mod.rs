//! The pub/sub plane: adapter contracts and the in-memory implementation.
//!
//! The router consumes a [`PubSubAdapter`]: an index of `topic →
//! subscribers` plus a `publish` that fans an envelope out. The in-memory
//! [`MemoryPubSub`] is the default and the building block distributed
//! drivers reuse for their local leg; remote drivers additionally supply a
//! [`BrokerConsumer`] so envelopes published on *other* instances reach
//! this one.
//!
//! `publish` never errors at the `Result`-of-transport level: the outcome
//! is always a tagged [`PublishResult`], and the `retryable` flag on
//! failures tells the caller whether backing off can help.

pub mod memory;

pub use memory::MemoryPubSub;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::ClientId;
use crate::error::ErrorCode;
use crate::wire::{Envelope, Meta};
use crate::BoxFuture;

/// The unit handed to adapters and broker consumers.
///
/// Serializable so distributed drivers can move it between instances.
/// `exclude_client_id` implements sender suppression: local fan-out skips
/// that subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishEnvelope {
    pub topic: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    pub meta: Meta,
    #[serde(
        rename = "excludeClientId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub exclude_client_id: Option<ClientId>,
}

impl PublishEnvelope {
    /// The frame subscribers receive: `{type, meta (+topic), payload}`.
    pub fn to_frame(&self) -> Envelope {
        let mut meta = self.meta.clone();
        meta.topic = Some(self.topic.clone());
        Envelope {
            ty: self.ty.clone(),
            meta,
            payload: self.payload.clone(),
        }
    }
}

/// How precise the `matched` count of a successful publish is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutCapability {
    /// A local index with an exact subscriber count.
    Exact,
    /// Partial knowledge, e.g. the local leg of a sharded deployment.
    Estimate,
    /// A remote broker with no count at all.
    Unknown,
}

/// A successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOk {
    pub capability: FanoutCapability,
    /// Subscribers matched at the instant of publish, when the capability
    /// permits counting. Excluded senders are not counted.
    pub matched: Option<usize>,
}

/// A failed publish. Conveyed by value, never panicked or thrown.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("publish failed: {code}")]
pub struct PublishError {
    pub code: ErrorCode,
    /// Whether retrying (possibly after a backoff) can succeed.
    pub retryable: bool,
    #[source]
    pub details: Option<PublishErrorDetails>,
    /// Name of the adapter that surfaced the failure, if any.
    pub adapter: Option<String>,
}

/// Free-form failure context.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct PublishErrorDetails {
    pub message: String,
    pub data: Option<Value>,
}

impl PublishError {
    pub fn new(code: ErrorCode, retryable: bool) -> Self {
        Self {
            code,
            retryable,
            details: None,
            adapter: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.details = Some(PublishErrorDetails {
            message: message.into(),
            data: None,
        });
        self
    }
}

/// The tagged outcome of every publish.
pub type PublishResult = Result<PublishOk, PublishError>;

/// Outcome of an atomic bulk subscription replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaceOutcome {
    pub added: usize,
    pub removed: usize,
    /// Size of the new subscription set.
    pub total: usize,
}

/// Core-side delivery hook for local fan-out.
///
/// The router implements this over its connection registry; adapters call
/// it once per matched subscriber, in subscriber order.
#[async_trait]
pub trait LocalSink: Send + Sync + 'static {
    /// Deliver an already-serialized frame to one client. Returns `false`
    /// when the client is gone or its socket rejected the frame.
    async fn deliver(&self, client_id: &ClientId, frame: &str) -> bool;
}

/// The pub/sub adapter contract.
///
/// `subscribe` and `unsubscribe` are idempotent; neither validates topics
/// (that is the connection-side [`Topics`](crate::Topics) manager's job,
/// so error paths can always unsubscribe safely).
#[async_trait]
pub trait PubSubAdapter: Send + Sync + 'static {
    /// Fan an envelope out to the topic's subscribers.
    async fn publish(&self, envelope: PublishEnvelope) -> PublishResult;

    /// Add `(client, topic)` to the index. A repeat is a no-op.
    async fn subscribe(&self, client_id: &ClientId, topic: &str);

    /// Remove `(client, topic)` from the index. A non-member is a no-op.
    async fn unsubscribe(&self, client_id: &ClientId, topic: &str);

    /// Snapshot of a topic's subscribers.
    async fn subscribers(&self, topic: &str) -> Vec<ClientId>;

    /// Atomically replace a client's subscription set.
    async fn replace(&self, client_id: &ClientId, topics: &[String]) -> ReplaceOutcome;

    /// Snapshot of every topic with at least one subscriber.
    async fn topics(&self) -> Vec<String>;

    /// Whether a topic currently has subscribers.
    async fn has_topic(&self, topic: &str) -> bool;

    /// Drop all state. The adapter is unusable afterwards.
    async fn dispose(&self);

    /// Install the core-side delivery hook. Default: no local fan-out
    /// (remote drivers deliver through their broker instead).
    fn bind(&self, _sink: Arc<dyn LocalSink>) {}
}

/// Callback invoked for each envelope arriving from a remote broker.
pub type OnEnvelope = Arc<dyn Fn(PublishEnvelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Ingress from a remote broker, supplied by the adapter driver.
///
/// Implementations own whatever auxiliary subscriber connection the broker
/// needs, decode its stream into [`PublishEnvelope`]s, and hand each one to
/// the callback. A bad envelope must be logged and skipped, never allowed
/// to break the stream.
#[async_trait]
pub trait BrokerConsumer: Send + Sync + 'static {
    /// Begin consuming. Calling `start` twice without `stop` is an error
    /// surfaced as `ADAPTER_ERROR`.
    async fn start(&self, on_envelope: OnEnvelope) -> Result<(), PublishError>;

    /// Stop consuming and clean up. Idempotent.
    async fn stop(&self);
}
