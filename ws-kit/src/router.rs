//! Router assembly: the handler registry, middleware chain, lifecycle
//! hooks, plugin composition, and the per-connection serve loop.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::connection::{ClientId, CloseInfo, ConnectionShared, ConnectionState};
use crate::context::{Client, Context, Extensions, PublishOptions};
use crate::dispatch::{self, ErasedHandler, EventHandlerFn, RpcHandlerFn};
use crate::error::{AuthError, ErrorCode, ErrorEvent};
use crate::heartbeat::{self, HeartbeatConfig, HeartbeatEnd};
use crate::pubsub::{
    LocalSink, MemoryPubSub, PubSubAdapter, PublishEnvelope, PublishError, PublishErrorDetails,
    PublishResult,
};
use crate::socket::{CloseCode, Frame, ServerSocket, SocketRx};
use crate::topics::TopicValidator;
use crate::validate::{AcceptAll, Validated, ValidatorAdapter};
use crate::wire::{Envelope, Meta};
use crate::{BoxFuture, EventMessage, HandlerError, RpcMessage};

/// Whether a registered type is an event or an RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Event,
    Rpc,
}

/// Resource bounds enforced per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest accepted frame, in bytes. One byte over closes with 1009.
    pub max_payload_bytes: usize,
    /// In-flight RPC ceiling; excess requests get `PENDING_LIMIT`.
    pub max_pending: usize,
    /// Subscription ceiling enforced by the topic manager.
    pub max_topics_per_conn: Option<usize>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
            max_pending: 100,
            max_topics_per_conn: None,
        }
    }
}

/// Router-wide options.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub heartbeat: HeartbeatConfig,
    pub limits: Limits,
    /// Name of the header acceptors use to report the assigned client id
    /// at upgrade time. The core never reads it.
    pub client_id_header: String,
    /// Validate `send`/`reply`/`progress` frames against their schema.
    /// Individual messages may override via their `OUTGOING` const.
    pub validate_outgoing: bool,
    /// Close (1008) instead of dropping frames whose type has no handler.
    pub close_on_unknown_type: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            limits: Limits::default(),
            client_id_header: "x-client-id".to_owned(),
            validate_outgoing: false,
            close_on_unknown_type: false,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// MIDDLEWARE
//////////////////////////////////////////////////////////////////////////////

/// A middleware layer. Runs after routing and before validation; may
/// short-circuit by not calling [`Next::run`].
pub trait Middleware: Send + Sync + 'static {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<'static, Result<(), HandlerError>>;
}

struct FnMiddleware<F>(F);

impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: core::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin((self.0)(ctx, next))
    }
}

/// The continuation a middleware layer calls to keep the pipeline going.
pub struct Next {
    pub(crate) router: Arc<Router>,
    pub(crate) index: usize,
    pub(crate) tail: Arc<dyn dispatch::Tail>,
}

impl Next {
    /// Run the rest of the chain: remaining middleware in insertion order,
    /// then validation and handler invocation.
    pub fn run(mut self, ctx: Context) -> BoxFuture<'static, Result<(), HandlerError>> {
        match self.router.middleware.get(self.index).cloned() {
            Some(layer) => {
                self.index += 1;
                layer.handle(ctx, self)
            }
            None => self.tail.call(ctx),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// HOOKS & REGISTRY
//////////////////////////////////////////////////////////////////////////////

pub(crate) type OpenHook = Arc<dyn Fn(Client) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type CloseHook = Arc<dyn Fn(Client, CloseInfo) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type ErrorHook = Arc<dyn Fn(&ErrorEvent) + Send + Sync>;
pub(crate) type AuthHook =
    Arc<dyn Fn(Client, Envelope) -> BoxFuture<'static, Result<(), AuthError>> + Send + Sync>;

/// Everything the router knows about one message type.
#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) kind: MessageKind,
    pub(crate) schema: crate::validate::SchemaId,
    pub(crate) handlers: Vec<Arc<dyn ErasedHandler>>,
}

/// Live connections, addressable by client id. Doubles as the
/// [`LocalSink`] pub/sub adapters deliver through.
#[derive(Default)]
pub(crate) struct Connections {
    map: StdMutex<HashMap<ClientId, Arc<ConnectionShared>>>,
}

impl Connections {
    fn insert(&self, conn: Arc<ConnectionShared>) {
        self.guard().insert(conn.client_id.clone(), conn);
    }

    fn remove(&self, client_id: &ClientId) {
        self.guard().remove(client_id);
    }

    fn socket_of(&self, client_id: &ClientId) -> Option<Arc<dyn ServerSocket>> {
        self.guard().get(client_id).map(|conn| conn.socket.clone())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, HashMap<ClientId, Arc<ConnectionShared>>> {
        self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LocalSink for Connections {
    async fn deliver(&self, client_id: &ClientId, frame: &str) -> bool {
        match self.socket_of(client_id) {
            Some(socket) => socket.send_text(frame).await.is_ok(),
            None => false,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// ROUTER
//////////////////////////////////////////////////////////////////////////////

/// A plugin folds behavior into the router at assembly time: middleware,
/// hooks, handler registrations, and typed [`Extensions`] later read by
/// handlers via [`Client::extension`].
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn install(&self, router: &mut Router);
}

/// The top-level object: registry, middleware, hooks, adapters.
///
/// Registration happens on `&mut Router`; serving happens on
/// `Arc<Router>`. The borrow checker is the hot-swap rule: once the router
/// is shared with a connection, nothing can register further handlers.
pub struct Router {
    pub(crate) config: RouterConfig,
    pub(crate) validator: Arc<dyn ValidatorAdapter>,
    pub(crate) pubsub: Arc<dyn PubSubAdapter>,
    pub(crate) topic_validator: Arc<TopicValidator>,
    pub(crate) registry: HashMap<&'static str, Registration>,
    pub(crate) middleware: Vec<Arc<dyn Middleware>>,
    pub(crate) auth: Option<AuthHook>,
    pub(crate) open_hooks: Vec<OpenHook>,
    pub(crate) close_hooks: Vec<CloseHook>,
    pub(crate) error_hooks: Vec<ErrorHook>,
    pub(crate) extensions: Extensions,
    pub(crate) connections: Arc<Connections>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        let connections = Arc::new(Connections::default());
        let pubsub = Arc::new(MemoryPubSub::new());
        pubsub.bind(connections.clone());
        Self {
            config,
            validator: Arc::new(AcceptAll),
            pubsub,
            topic_validator: Arc::new(TopicValidator::default()),
            registry: HashMap::new(),
            middleware: Vec::new(),
            auth: None,
            open_hooks: Vec::new(),
            close_hooks: Vec::new(),
            error_hooks: Vec::new(),
            extensions: Extensions::default(),
            connections,
        }
    }

    /// Swap in a validator adapter.
    pub fn with_validator(&mut self, validator: impl ValidatorAdapter) -> &mut Self {
        self.validator = Arc::new(validator);
        self
    }

    /// Swap in a pub/sub adapter; the router binds its delivery sink to it.
    pub fn with_pubsub(&mut self, pubsub: Arc<dyn PubSubAdapter>) -> &mut Self {
        pubsub.bind(self.connections.clone());
        self.pubsub = pubsub;
        self
    }

    /// Swap in topic syntax rules.
    pub fn with_topic_validator(&mut self, validator: TopicValidator) -> &mut Self {
        self.topic_validator = Arc::new(validator);
        self
    }

    /// Register an event handler. Several handlers may share one type; they
    /// run in registration order.
    pub fn on<E, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        E: EventMessage,
        F: Fn(Context, E::Payload) -> Fut + Send + Sync + 'static,
        Fut: core::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(
            E::TYPE,
            MessageKind::Event,
            E::SCHEMA,
            Arc::new(EventHandlerFn::<E, F>::new(handler)),
        )
    }

    /// Register an RPC handler.
    pub fn rpc<R, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        R: RpcMessage,
        F: Fn(crate::context::RpcContext<R>, R::Request) -> Fut + Send + Sync + 'static,
        Fut: core::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(
            R::TYPE,
            MessageKind::Rpc,
            R::SCHEMA,
            Arc::new(RpcHandlerFn::<R, F>::new(handler)),
        )
    }

    fn register(
        &mut self,
        ty: &'static str,
        kind: MessageKind,
        schema: crate::validate::SchemaId,
        handler: Arc<dyn ErasedHandler>,
    ) -> &mut Self {
        match self.registry.entry(ty) {
            Entry::Occupied(mut occupied) => {
                let registration = occupied.get_mut();
                if registration.kind == kind {
                    registration.handlers.push(handler);
                } else {
                    warn!(ty, "conflicting event/rpc registration, handler ignored");
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Registration {
                    kind,
                    schema,
                    handlers: vec![handler],
                });
            }
        }
        self
    }

    /// Append a middleware layer. Layers run in insertion order.
    pub fn layer<F, Fut>(&mut self, layer: F) -> &mut Self
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: core::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.middleware.push(Arc::new(FnMiddleware(layer)));
        self
    }

    /// Run on every accepted connection, in registration order.
    pub fn on_open<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(Client) -> Fut + Send + Sync + 'static,
        Fut: core::future::Future<Output = ()> + Send + 'static,
    {
        self.open_hooks.push(Arc::new(move |client| Box::pin(hook(client))));
        self
    }

    /// Run once per connection after teardown, with the close cause.
    pub fn on_close<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(Client, CloseInfo) -> Fut + Send + Sync + 'static,
        Fut: core::future::Future<Output = ()> + Send + 'static,
    {
        self.close_hooks
            .push(Arc::new(move |client, info| Box::pin(hook(client, info))));
        self
    }

    /// The non-fatal error sink. Every sink registered runs, in order; a
    /// panicking sink is contained and logged.
    pub fn on_error<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.error_hooks.push(Arc::new(hook));
        self
    }

    /// The single-slot authentication hook; replaces any prior hook. Runs
    /// on the first inbound message of each connection. A rejection closes
    /// with 1008 and the hook-supplied reason.
    pub fn on_auth<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(Client, Envelope) -> Fut + Send + Sync + 'static,
        Fut: core::future::Future<Output = Result<(), AuthError>> + Send + 'static,
    {
        self.auth = Some(Arc::new(move |client, envelope| {
            Box::pin(hook(client, envelope))
        }));
        self
    }

    /// Fold a plugin into the router.
    pub fn plugin(&mut self, plugin: impl Plugin) -> &mut Self {
        debug!(plugin = plugin.name(), "installing plugin");
        plugin.install(self);
        self
    }

    /// Typed extension storage, written by plugins at assembly time.
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Take the union of another router's handlers, middleware and hooks,
    /// preserving registration order. The other router's auth hook (if any)
    /// replaces this one's.
    pub fn merge(&mut self, other: Router) -> &mut Self {
        for (ty, registration) in other.registry {
            match self.registry.entry(ty) {
                Entry::Occupied(mut occupied) => {
                    let existing = occupied.get_mut();
                    if existing.kind == registration.kind {
                        existing.handlers.extend(registration.handlers);
                    } else {
                        warn!(ty, "conflicting registration kind in merge, handlers ignored");
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(registration);
                }
            }
        }
        self.middleware.extend(other.middleware);
        self.open_hooks.extend(other.open_hooks);
        self.close_hooks.extend(other.close_hooks);
        self.error_hooks.extend(other.error_hooks);
        if other.auth.is_some() {
            self.auth = other.auth;
        }
        self
    }

    /// Router-level broadcast, with no sender context.
    pub async fn publish<E: EventMessage>(
        &self,
        topic: &str,
        payload: E::Payload,
        opts: PublishOptions,
    ) -> PublishResult {
        self.do_publish::<E>(topic, payload, opts.meta, None).await
    }

    pub(crate) async fn do_publish<E: EventMessage>(
        &self,
        topic: &str,
        payload: E::Payload,
        meta: Option<Map<String, Value>>,
        exclude: Option<ClientId>,
    ) -> PublishResult {
        if let Err(err) = self.topic_validator.check(topic) {
            return Err(PublishError {
                code: ErrorCode::Validation,
                retryable: false,
                details: Some(PublishErrorDetails {
                    message: err.to_string(),
                    data: Some(err.details()),
                }),
                adapter: None,
            });
        }
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(err) => {
                return Err(PublishError::new(ErrorCode::Validation, false)
                    .with_message(err.to_string()))
            }
        };
        if E::OUTGOING.resolve(self.config.validate_outgoing) {
            let frame = serde_json::json!({ "type": E::TYPE, "payload": payload });
            if let Validated::Invalid(issues) = self.validator.validate_outgoing(E::SCHEMA, &frame)
            {
                return Err(PublishError {
                    code: ErrorCode::Validation,
                    retryable: false,
                    details: Some(PublishErrorDetails {
                        message: "outgoing validation failed".to_owned(),
                        data: serde_json::to_value(&issues).ok(),
                    }),
                    adapter: None,
                });
            }
        }
        let envelope = PublishEnvelope {
            topic: topic.to_owned(),
            ty: E::TYPE.to_owned(),
            payload: Some(payload),
            meta: meta.map(Meta::from_map).unwrap_or_default(),
            exclude_client_id: exclude,
        };
        self.pubsub.publish(envelope).await
    }

    pub(crate) fn emit_error(&self, event: ErrorEvent) {
        debug!(kind = event.kind(), "router error event");
        for hook in &self.error_hooks {
            let caught =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(&event)));
            if caught.is_err() {
                warn!(kind = event.kind(), "on_error sink panicked, ignored");
            }
        }
    }

    //////////////////////////////////////////////////////////////////////
    // SERVE
    //////////////////////////////////////////////////////////////////////

    /// Drive one connection to completion with a fresh client id.
    pub async fn serve(self: Arc<Self>, socket: Arc<dyn ServerSocket>, rx: impl SocketRx) -> CloseInfo {
        self.serve_as(ClientId::generate(), socket, rx).await
    }

    /// Drive one connection with an acceptor-assigned client id.
    ///
    /// Resolves when the connection reaches `closed`, returning the close
    /// cause. Inbound frames are dispatched strictly in wire order; a
    /// frame's pipeline (through middleware, validation and handler entry)
    /// completes before the next frame is pulled, while handler bodies run
    /// as spawned tasks and may outlive many subsequent frames.
    pub async fn serve_as(
        self: Arc<Self>,
        client_id: ClientId,
        socket: Arc<dyn ServerSocket>,
        mut rx: impl SocketRx,
    ) -> CloseInfo {
        let conn = Arc::new(ConnectionShared::new(
            client_id,
            socket.clone(),
            self.config.limits.max_pending,
        ));
        self.connections.insert(conn.clone());
        conn.set_state(ConnectionState::Open);
        debug!(client_id = %conn.client_id, "connection open");

        let client = Client {
            conn: conn.clone(),
            router: self.clone(),
        };
        for hook in &self.open_hooks {
            hook(client.clone()).await;
        }

        let heartbeat_task = if self.config.heartbeat.enabled {
            let router = self.clone();
            let conn = conn.clone();
            let socket = socket.clone();
            let config = self.config.heartbeat;
            Some(tokio::spawn(async move {
                match heartbeat::run(&conn, &socket, &conn.shutdown, &config).await {
                    HeartbeatEnd::Shutdown => {}
                    HeartbeatEnd::Timeout => {
                        router.emit_error(ErrorEvent::Heartbeat {
                            client_id: conn.client_id.clone(),
                        });
                        conn.begin_close(CloseCode::Internal, "HEARTBEAT_TIMEOUT").await;
                    }
                    HeartbeatEnd::SendFailed => {
                        conn.record_close(CloseInfo::new(
                            CloseCode::Abnormal,
                            "HEARTBEAT_SEND_FAILED",
                        ));
                        conn.shutdown.abort();
                    }
                }
            }))
        } else {
            None
        };

        loop {
            tokio::select! {
                _ = conn.shutdown.aborted() => break,
                frame = rx.receive() => match frame {
                    None => {
                        conn.record_close(CloseInfo::new(CloseCode::Abnormal, ""));
                        break;
                    }
                    Some(Frame::Closed(code)) => {
                        let code = code.map(CloseCode::from_code).unwrap_or(CloseCode::Normal);
                        conn.record_close(CloseInfo::new(code, ""));
                        break;
                    }
                    Some(Frame::Pong) => conn.pong.notify_one(),
                    Some(Frame::Text(text)) => dispatch::process_text(&self, &conn, &text).await,
                }
            }
        }

        // teardown: cancel the heartbeat, abort in-flight rpcs, purge
        // subscriptions, then report the close exactly once
        conn.set_state(ConnectionState::Closing);
        conn.shutdown.abort();
        if let Some(task) = heartbeat_task {
            let _ = task.await;
        }
        if conn.rpc.len() > 0 {
            debug!(client_id = %conn.client_id, in_flight = conn.rpc.len(), "aborting in-flight rpcs");
        }
        conn.rpc.abort_all();
        self.pubsub.replace(&conn.client_id, &[]).await;
        conn.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        self.connections.remove(&conn.client_id);
        conn.set_state(ConnectionState::Closed);
        debug!(client_id = %conn.client_id, "connection closed");

        let info = conn
            .close_info()
            .unwrap_or_else(|| CloseInfo::new(CloseCode::Abnormal, ""));
        for hook in &self.close_hooks {
            hook(client.clone(), info.clone()).await;
        }
        info
    }
}
