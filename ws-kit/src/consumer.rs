//! Distributed ingress: fan envelopes from a remote broker out locally.
//!
//! The consumer itself is supplied by the adapter driver (a duplicated
//! subscriber connection on a Redis-like broker, a shard coordinator
//! stream). The router's contribution is the callback: every envelope the
//! consumer decodes is pushed through the local pub/sub index, and a
//! failing envelope is reported to the error sink without breaking the
//! stream.

use std::sync::Arc;

use tracing::debug;

use crate::error::ErrorEvent;
use crate::pubsub::{BrokerConsumer, OnEnvelope, PublishError};
use crate::router::Router;

impl Router {
    /// Start consuming broker ingress, fanning each envelope out to local
    /// subscribers.
    ///
    /// Call [`BrokerConsumer::stop`] on the consumer to shut the stream
    /// down; both `start` and `stop` are the consumer's to make idempotent.
    pub async fn start_consumer(
        self: Arc<Self>,
        consumer: &Arc<dyn BrokerConsumer>,
    ) -> Result<(), PublishError> {
        let router = self;
        let on_envelope: OnEnvelope = Arc::new(move |envelope| {
            let router = router.clone();
            Box::pin(async move {
                let topic = envelope.topic.clone();
                match router.pubsub.publish(envelope).await {
                    Ok(ok) => {
                        debug!(topic, matched = ?ok.matched, "broker envelope fanned out");
                    }
                    Err(err) => {
                        router.emit_error(ErrorEvent::Adapter {
                            detail: format!("broker fan-out for {topic:?} failed: {err}"),
                        });
                    }
                }
            })
        });
        consumer.start(on_envelope).await
    }
}
