//! Handler-facing capabilities.
//!
//! Three layers, outer derefs to inner:
//!
//! * [`Client`] — the connection: identity, data bag, `send`, `publish`,
//!   `topics`, `close`. Lifecycle hooks receive this.
//! * [`Context`] — a message on that connection: `type`, normalized meta,
//!   raw payload. Event handlers and middleware receive this.
//! * [`RpcContext<R>`] — an in-flight RPC: `reply`, `progress`, `error`,
//!   the abort signal. Only `rpc()` handlers receive this, so the terminal
//!   methods cannot be reached from event context at all.
//!
//! Every send-family method is safe to call after a terminal or after the
//! connection closed: it no-ops, logs at debug, and returns `false` instead
//! of erroring.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::connection::{ClientId, ConnectionShared, ConnectionState, DataBag};
use crate::error::{ErrorCode, ErrorPayload};
use crate::pubsub::PublishResult;
use crate::router::Router;
use crate::rpc::{AbortSignal, RpcEntry};
use crate::socket::CloseCode;
use crate::topics::Topics;
use crate::validate::{Outgoing, SchemaId, Validated};
use crate::wire::{Envelope, Meta};
use crate::{EventMessage, RpcMessage};

/// Options for [`Client::send_with`] / [`Context::send_with`].
#[derive(Default)]
pub struct SendOptions {
    /// Extra meta entries. Reserved keys are stripped; well-known keys move
    /// to their typed slots.
    pub meta: Option<Map<String, Value>>,
    /// Explicit correlation id for the outbound frame.
    pub correlation_id: Option<String>,
    /// Copy the inbound frame's correlation id onto the outbound frame.
    /// Only meaningful on [`Context::send_with`].
    pub inherit_correlation_id: bool,
    /// Skip the send entirely if this signal has fired by enqueue time.
    /// Firing later does not rescind a sent frame.
    pub signal: Option<AbortSignal>,
}

/// Options for [`Client::publish`].
#[derive(Default)]
pub struct PublishOptions {
    /// Suppress delivery to the publishing connection itself.
    pub exclude_self: bool,
    /// Extra meta entries carried to subscribers.
    pub meta: Option<Map<String, Value>>,
}

/// Options for [`RpcContext::progress_with`].
#[derive(Default)]
pub struct ProgressOptions {
    /// Drop progress frames landing inside this window after an emitted
    /// one.
    pub throttle: Option<core::time::Duration>,
}

/// Typed extension storage contributed by plugins at router assembly.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
    }
}

impl core::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

/// A handle on one connection. Cheap to clone; safe to move into spawned
/// tasks.
#[derive(Clone)]
pub struct Client {
    pub(crate) conn: Arc<ConnectionShared>,
    pub(crate) router: Arc<Router>,
}

impl Client {
    pub fn client_id(&self) -> &ClientId {
        &self.conn.client_id
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// The per-connection typed data bag.
    pub fn data(&self) -> &DataBag {
        &self.conn.data
    }

    /// A router-level extension contributed by a plugin.
    pub fn extension<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.router.extensions.get::<T>()
    }

    /// This connection's subscription manager.
    pub fn topics(&self) -> Topics {
        Topics {
            client_id: self.conn.client_id.clone(),
            adapter: self.router.pubsub.clone(),
            validator: self.router.topic_validator.clone(),
            max_topics: self.router.config.limits.max_topics_per_conn,
            mirror: self.conn.subscriptions.clone(),
        }
    }

    /// Fire-and-forget send of an event message.
    pub async fn send<E: EventMessage>(&self, payload: E::Payload) -> bool {
        self.send_with::<E>(payload, SendOptions::default()).await
    }

    /// Send with meta / correlation / abort options.
    pub async fn send_with<E: EventMessage>(&self, payload: E::Payload, opts: SendOptions) -> bool {
        if let Some(signal) = &opts.signal {
            if signal.is_aborted() {
                debug!(client_id = %self.client_id(), ty = E::TYPE, "send skipped, signal aborted");
                return false;
            }
        }
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(err) => {
                warn!(ty = E::TYPE, %err, "payload failed to serialize, send dropped");
                return false;
            }
        };
        let mut meta = opts.meta.map(Meta::from_map).unwrap_or_default();
        if meta.correlation_id.is_none() {
            meta.correlation_id = opts.correlation_id;
        }
        let envelope = Envelope {
            ty: E::TYPE.to_owned(),
            meta,
            payload: Some(payload),
        };
        self.send_frame(envelope, E::SCHEMA, E::OUTGOING).await
    }

    /// Broadcast to a topic's subscribers.
    pub async fn publish<E: EventMessage>(
        &self,
        topic: &str,
        payload: E::Payload,
        opts: PublishOptions,
    ) -> PublishResult {
        let exclude = opts.exclude_self.then(|| self.client_id().clone());
        self.router
            .do_publish::<E>(topic, payload, opts.meta, exclude)
            .await
    }

    /// Close this connection from the server side.
    pub async fn close(&self, code: CloseCode, reason: &str) {
        self.conn.begin_close(code, reason).await;
    }

    /// Validate (when configured) and send a fully-built envelope.
    pub(crate) async fn send_frame(
        &self,
        envelope: Envelope,
        schema: SchemaId,
        outgoing: Outgoing,
    ) -> bool {
        if outgoing.resolve(self.router.config.validate_outgoing) {
            let value = match serde_json::to_value(&envelope) {
                Ok(value) => value,
                Err(err) => {
                    warn!(ty = %envelope.ty, %err, "outbound frame failed to serialize");
                    return false;
                }
            };
            match self.router.validator.validate_outgoing(schema, &value) {
                Validated::Valid(None) => {}
                Validated::Valid(Some(replacement)) => {
                    match serde_json::from_value::<Envelope>(replacement) {
                        Ok(coerced) => return self.conn.send_envelope(&coerced).await,
                        Err(err) => {
                            warn!(ty = %envelope.ty, %err, "validator replacement is not an envelope, dropped");
                            return false;
                        }
                    }
                }
                Validated::Invalid(issues) => {
                    warn!(ty = %envelope.ty, ?issues, "outgoing frame failed validation, dropped");
                    return false;
                }
            }
        }
        self.conn.send_envelope(&envelope).await
    }
}

impl core::fmt::Debug for Client {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.conn.client_id)
            .field("state", &self.conn.state())
            .finish()
    }
}

/// One inbound message, bound to its connection.
#[derive(Clone)]
pub struct Context {
    pub(crate) client: Client,
    pub(crate) ty: Arc<str>,
    pub(crate) meta: Arc<Meta>,
    pub(crate) payload: Arc<Option<Value>>,
}

impl Context {
    /// The inbound `type` string.
    pub fn ty(&self) -> &str {
        &self.ty
    }

    /// The normalized inbound meta (reserved keys already stripped).
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// The raw inbound payload, before typed deserialization.
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref().as_ref()
    }

    /// The inbound correlation id, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.meta.correlation_id.as_deref()
    }

    /// Like [`Client::send_with`], but resolves
    /// [`SendOptions::inherit_correlation_id`] against this message.
    pub async fn send_with<E: EventMessage>(&self, payload: E::Payload, mut opts: SendOptions) -> bool {
        if opts.inherit_correlation_id && opts.correlation_id.is_none() {
            opts.correlation_id = self.meta.correlation_id.clone();
        }
        self.client.send_with::<E>(payload, opts).await
    }
}

impl core::ops::Deref for Context {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("client_id", &self.client.conn.client_id)
            .field("ty", &self.ty)
            .finish()
    }
}

/// An in-flight RPC invocation.
///
/// At most one of [`reply`](RpcContext::reply) / [`error`](RpcContext::error)
/// produces a wire frame; whichever runs second (including a racing client
/// abort) is a silent no-op.
pub struct RpcContext<R: RpcMessage> {
    pub(crate) ctx: Context,
    pub(crate) entry: Arc<RpcEntry>,
    pub(crate) _rpc: PhantomData<fn(R)>,
}

impl<R: RpcMessage> RpcContext<R> {
    pub fn correlation_id(&self) -> &str {
        self.entry.correlation_id()
    }

    /// Fires on client `$ws:abort` or disconnect.
    pub fn abort_signal(&self) -> AbortSignal {
        self.entry.abort_signal()
    }

    /// Run `f` when the RPC is cancelled; immediately if it already was.
    pub fn on_cancel(&self, f: impl FnOnce() + Send + 'static) {
        self.entry.abort_signal().on_abort(f);
    }

    /// Send the terminal response. The first terminal wins; later calls
    /// return `false` without touching the wire.
    pub async fn reply(&self, response: R::Response) -> bool {
        let payload = match serde_json::to_value(response) {
            Ok(value) => value,
            Err(err) => {
                warn!(ty = R::RESPONSE_TYPE, %err, "response failed to serialize, reply dropped");
                return false;
            }
        };
        if !self.entry.try_terminal() {
            debug!(
                correlation_id = self.correlation_id(),
                "terminal already sent, reply dropped"
            );
            return false;
        }
        self.ctx.client.conn.rpc.remove(self.correlation_id());
        let envelope = Envelope {
            ty: R::RESPONSE_TYPE.to_owned(),
            meta: Meta::correlated(self.correlation_id()),
            payload: Some(payload),
        };
        self.ctx
            .client
            .send_frame(envelope, R::RESPONSE_SCHEMA, R::OUTGOING)
            .await
    }

    /// Send a non-terminal progress frame (`meta.progress = true`).
    pub async fn progress(&self, response: R::Response) -> bool {
        self.progress_with(response, ProgressOptions::default()).await
    }

    /// Progress with a throttle window; frames inside the window after an
    /// emitted one are dropped.
    pub async fn progress_with(&self, response: R::Response, opts: ProgressOptions) -> bool {
        let payload = match serde_json::to_value(response) {
            Ok(value) => value,
            Err(err) => {
                warn!(ty = R::RESPONSE_TYPE, %err, "progress payload failed to serialize, dropped");
                return false;
            }
        };
        if !self.entry.progress_gate(opts.throttle) {
            debug!(
                correlation_id = self.correlation_id(),
                "progress gated, frame dropped"
            );
            return false;
        }
        let mut meta = Meta::correlated(self.correlation_id());
        meta.progress = Some(true);
        let envelope = Envelope {
            ty: R::RESPONSE_TYPE.to_owned(),
            meta,
            payload: Some(payload),
        };
        self.ctx
            .client
            .send_frame(envelope, R::RESPONSE_SCHEMA, R::OUTGOING)
            .await
    }

    /// Send the terminal `ERROR` reply. Same one-shot rule as `reply`.
    pub async fn error(
        &self,
        code: ErrorCode,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> bool {
        if !self.entry.try_terminal() {
            debug!(
                correlation_id = self.correlation_id(),
                "terminal already sent, error dropped"
            );
            return false;
        }
        self.ctx.client.conn.rpc.remove(self.correlation_id());
        let mut payload = ErrorPayload::new(code, message);
        payload.details = details;
        let envelope = Envelope::rpc_error(self.correlation_id(), &payload);
        self.ctx.client.conn.send_envelope(&envelope).await
    }
}

impl<R: RpcMessage> core::ops::Deref for RpcContext<R> {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.ctx
    }
}

impl<R: RpcMessage> core::fmt::Debug for RpcContext<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RpcContext")
            .field("ty", &R::TYPE)
            .field("correlation_id", &self.entry.correlation_id())
            .finish()
    }
}
