//! # ws-kit
//!
//! A schema-driven WebSocket message router: the server side terminates
//! long-lived duplex connections, validates every inbound frame against a
//! declared message catalog, and routes typed messages to registered
//! handlers. Three interaction styles are supported:
//!
//! 1. Fire-and-forget **events** ([`EventMessage`], registered with
//!    [`Router::on`])
//! 2. Request/response **RPC** with progress streaming and client-initiated
//!    cancellation ([`RpcMessage`], registered with [`Router::rpc`])
//! 3. Topic-scoped **publish/subscribe** fan-out across one or many
//!    instances (the [`pubsub`] module)
//!
//! ## Wire format
//!
//! Every frame is a UTF-8 JSON envelope:
//!
//! ```json
//! { "type": "GET_USER",
//!   "meta": { "correlationId": "req-1", "timestamp": 1720000000000 },
//!   "payload": { "id": "u1" } }
//! ```
//!
//! `type` is a stable string identifier, `meta` carries transport-level
//! attributes and the RPC correlation id, and `payload` is schema-defined
//! and may be absent. Message types starting with `$ws:` are control frames
//! handled by the router itself, never by user handlers.
//!
//! ## Declaring messages
//!
//! Messages are declared as marker types via the [`events!`] and [`rpcs!`]
//! table macros:
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use ws_kit::{events, rpcs};
//!
//! #[derive(Serialize, Deserialize)]
//! pub struct ChatBody { pub text: String }
//! #[derive(Serialize, Deserialize)]
//! pub struct GetUserReq { pub id: String }
//! #[derive(Serialize, Deserialize)]
//! pub struct User { pub id: String, pub name: String }
//!
//! events! {
//!     | EventTy      | PayloadTy | Type           |
//!     | -------      | --------- | ----           |
//!     | ChatMessage  | ChatBody  | "CHAT_MESSAGE" |
//! }
//!
//! rpcs! {
//!     | RpcTy   | RequestTy  | ResponseTy | Type       | ResponseType |
//!     | -----   | ---------- | ---------- | ----       | ------------ |
//!     | GetUser | GetUserReq | User       | "GET_USER" | "USER"       |
//! }
//! ```
//!
//! The declared marker types are used as type parameters when registering
//! handlers and when sending:
//!
//! ```rust,ignore
//! let mut router = Router::new(RouterConfig::default());
//! router.rpc::<GetUser, _, _>(|ctx, req| async move {
//!     ctx.reply(User { id: req.id, name: "Alice".into() }).await;
//!     Ok(())
//! });
//! ```
//!
//! ## Transports
//!
//! The router core is transport-agnostic. Acceptors hand each upgraded
//! connection to [`Router::serve`] as a [`ServerSocket`] (outbound half)
//! plus a [`SocketRx`] (inbound half). A channel-backed implementation for
//! tests lives in [`transport`] behind the `test-utils` feature.

use serde::{de::DeserializeOwned, Serialize};

pub mod connection;
pub mod consumer;
pub mod context;
pub(crate) mod dispatch;
pub mod error;
pub mod hash;
pub mod heartbeat;
pub mod limit;
pub mod macros;
pub mod pubsub;
pub mod router;
pub mod rpc;
pub mod socket;
pub mod topics;
pub mod validate;
pub mod wire;

#[cfg(feature = "test-utils")]
pub mod transport;

pub use connection::{ClientId, CloseInfo, ConnectionState, DataBag};
pub use context::{Client, Context, Extensions, ProgressOptions, PublishOptions, RpcContext, SendOptions};
pub use error::{AuthError, ErrorCode, ErrorEvent, ErrorPayload, Issue};
pub use heartbeat::HeartbeatConfig;
pub use limit::{RateDecision, RateLimiter, RateLimiterConfig};
pub use pubsub::{
    BrokerConsumer, FanoutCapability, LocalSink, MemoryPubSub, PubSubAdapter, PublishEnvelope,
    PublishError, PublishOk, PublishResult, ReplaceOutcome,
};
pub use router::{Limits, MessageKind, Middleware, Next, Plugin, Router, RouterConfig};
pub use rpc::AbortSignal;
pub use socket::{CloseCode, Frame, ServerSocket, SocketError, SocketRx};
pub use topics::{TopicError, TopicRejectReason, TopicValidator, Topics};
pub use validate::{Outgoing, SchemaId, Validated, ValidatorAdapter};
pub use wire::{Envelope, Meta};

/// A boxed, sendable future — the erased shape of handlers, middleware and
/// lifecycle hooks.
pub type BoxFuture<'a, T> = core::pin::Pin<Box<dyn core::future::Future<Output = T> + Send + 'a>>;

/// The error type handlers and middleware may bubble up with `?`.
///
/// Anything that reaches the router this way is routed to the
/// [`on_error`](Router::on_error) sink; for RPC handlers that have not yet
/// sent a terminal, an `INTERNAL_ERROR` reply is emitted as well.
pub type HandlerError = Box<dyn core::error::Error + Send + Sync>;

//////////////////////////////////////////////////////////////////////////////
// MESSAGE DESCRIPTORS
//////////////////////////////////////////////////////////////////////////////

/// A fire-and-forget message declaration.
///
/// Usually generated by the [`events!`] macro rather than implemented by
/// hand. The marker type never exists at runtime; it only carries the wire
/// type string, the payload type, and the validator handle.
pub trait EventMessage: 'static {
    /// The payload carried under the envelope's `payload` key.
    type Payload: Serialize + DeserializeOwned + Send + 'static;

    /// The wire `type` string. Uppercase by convention.
    const TYPE: &'static str;

    /// The validator handle for inbound (and optionally outbound) payloads.
    const SCHEMA: SchemaId = SchemaId::new(Self::TYPE);

    /// Per-message override for outgoing validation.
    const OUTGOING: Outgoing = Outgoing::Inherit;
}

/// A request/response message declaration.
///
/// Usually generated by the [`rpcs!`] macro. An RPC descriptor binds a
/// request type to exactly one response type; progress frames reuse the
/// response type with `meta.progress = true`.
pub trait RpcMessage: 'static {
    /// The request payload.
    type Request: Serialize + DeserializeOwned + Send + 'static;
    /// The terminal (and progress) response payload.
    type Response: Serialize + DeserializeOwned + Send + 'static;

    /// The wire `type` string of the request.
    const TYPE: &'static str;
    /// The wire `type` string of response and progress frames.
    const RESPONSE_TYPE: &'static str;

    /// The validator handle for the request envelope.
    const SCHEMA: SchemaId = SchemaId::new(Self::TYPE);
    /// The validator handle for outbound responses.
    const RESPONSE_SCHEMA: SchemaId = SchemaId::new(Self::RESPONSE_TYPE);

    /// Per-message override for outgoing validation.
    const OUTGOING: Outgoing = Outgoing::Inherit;
}
