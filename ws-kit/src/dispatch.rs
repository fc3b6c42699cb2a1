//! The inbound dispatch pipeline.
//!
//! Per frame: decode → normalize → envelope check → control branch → auth
//! gate → route → middleware → validate → handler invocation. Everything
//! up to handler entry runs inline on the connection driver, so frames on
//! one connection enter their handlers in wire order; the handler body is
//! spawned and may suspend without holding up the next frame (which is how
//! `$ws:abort` can reach a looping handler at all).

use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::connection::{ConnectionShared, ConnectionState};
use crate::context::{Client, Context, RpcContext};
use crate::error::{ErrorCode, ErrorEvent, ErrorPayload, Issue};
use crate::router::{MessageKind, Next, Registration, Router};
use crate::rpc::{AdmitError, RpcEntry};
use crate::socket::CloseCode;
use crate::validate::Validated;
use crate::wire::{self, Envelope, Meta};
use crate::{BoxFuture, EventMessage, HandlerError, RpcMessage};

//////////////////////////////////////////////////////////////////////////////
// HANDLER ERASURE
//////////////////////////////////////////////////////////////////////////////

/// A registered handler with its payload typing folded in.
pub(crate) trait ErasedHandler: Send + Sync {
    fn call(
        &self,
        ctx: Context,
        entry: Option<Arc<RpcEntry>>,
    ) -> BoxFuture<'static, Result<(), HandlerError>>;
}

pub(crate) struct EventHandlerFn<E, F> {
    f: F,
    _marker: PhantomData<fn(E)>,
}

impl<E, F> EventHandlerFn<E, F> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<E, F, Fut> ErasedHandler for EventHandlerFn<E, F>
where
    E: EventMessage,
    F: Fn(Context, E::Payload) -> Fut + Send + Sync + 'static,
    Fut: core::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn call(
        &self,
        ctx: Context,
        _entry: Option<Arc<RpcEntry>>,
    ) -> BoxFuture<'static, Result<(), HandlerError>> {
        let payload = ctx.payload().cloned().unwrap_or(Value::Null);
        match serde_json::from_value::<E::Payload>(payload) {
            Ok(payload) => Box::pin((self.f)(ctx, payload)),
            Err(err) => Box::pin(core::future::ready(Err(Box::new(err) as HandlerError))),
        }
    }
}

pub(crate) struct RpcHandlerFn<R, F> {
    f: F,
    _marker: PhantomData<fn(R)>,
}

impl<R, F> RpcHandlerFn<R, F> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<R, F, Fut> ErasedHandler for RpcHandlerFn<R, F>
where
    R: RpcMessage,
    F: Fn(RpcContext<R>, R::Request) -> Fut + Send + Sync + 'static,
    Fut: core::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn call(
        &self,
        ctx: Context,
        entry: Option<Arc<RpcEntry>>,
    ) -> BoxFuture<'static, Result<(), HandlerError>> {
        let Some(entry) = entry else {
            return Box::pin(core::future::ready(Err(HandlerError::from(
                "rpc handler invoked without a correlation entry",
            ))));
        };
        let payload = ctx.payload().cloned().unwrap_or(Value::Null);
        match serde_json::from_value::<R::Request>(payload) {
            Ok(request) => {
                let rpc_ctx = RpcContext {
                    ctx,
                    entry,
                    _rpc: PhantomData,
                };
                Box::pin((self.f)(rpc_ctx, request))
            }
            Err(err) => Box::pin(core::future::ready(Err(Box::new(err) as HandlerError))),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// PIPELINE
//////////////////////////////////////////////////////////////////////////////

/// The post-middleware stage: validation, RPC admission, handler spawn.
pub(crate) trait Tail: Send + Sync {
    fn call(&self, ctx: Context) -> BoxFuture<'static, Result<(), HandlerError>>;
}

struct DispatchTail {
    router: Arc<Router>,
    conn: Arc<ConnectionShared>,
    registration: Registration,
    /// The full normalized envelope, as the validator sees it.
    envelope: Value,
}

impl Tail for DispatchTail {
    fn call(&self, ctx: Context) -> BoxFuture<'static, Result<(), HandlerError>> {
        let router = self.router.clone();
        let conn = self.conn.clone();
        let registration = self.registration.clone();
        let envelope = self.envelope.clone();
        Box::pin(async move {
            let ctx = match router.validator.validate(registration.schema, &envelope) {
                Validated::Valid(None) => ctx,
                Validated::Valid(Some(replacement)) => Context {
                    payload: Arc::new(replacement.get("payload").cloned()),
                    ..ctx
                },
                Validated::Invalid(issues) => {
                    if registration.kind == MessageKind::Rpc {
                        if let Some(correlation_id) = ctx.correlation_id() {
                            let payload =
                                ErrorPayload::new(ErrorCode::Validation, "envelope failed validation")
                                    .with_details(json!({ "issues": &issues }));
                            conn.send_envelope(&Envelope::rpc_error(correlation_id, &payload))
                                .await;
                        }
                    }
                    router.emit_error(ErrorEvent::Validation {
                        client_id: conn.client_id.clone(),
                        ty: ctx.ty().to_owned(),
                        issues,
                    });
                    return Ok(());
                }
            };

            let entry = match registration.kind {
                MessageKind::Event => None,
                MessageKind::Rpc => {
                    let Some(correlation_id) = ctx.correlation_id().map(ToOwned::to_owned) else {
                        router.emit_error(ErrorEvent::Validation {
                            client_id: conn.client_id.clone(),
                            ty: ctx.ty().to_owned(),
                            issues: vec![Issue::new(
                                "meta.correlationId",
                                "rpc requests require a correlation id",
                            )],
                        });
                        return Ok(());
                    };
                    match conn.rpc.admit(&correlation_id) {
                        Ok(entry) => Some(entry),
                        Err(AdmitError::Duplicate) => {
                            let payload = ErrorPayload::new(
                                ErrorCode::DuplicateCorrelation,
                                "correlation id already in flight",
                            );
                            conn.send_envelope(&Envelope::rpc_error(&correlation_id, &payload))
                                .await;
                            return Ok(());
                        }
                        Err(AdmitError::PendingLimit) => {
                            let payload = ErrorPayload::new(
                                ErrorCode::PendingLimit,
                                "too many in-flight requests",
                            );
                            conn.send_envelope(&Envelope::rpc_error(&correlation_id, &payload))
                                .await;
                            return Ok(());
                        }
                    }
                }
            };

            // handler entry: the body runs concurrently with later frames
            tokio::spawn(run_handlers(
                router,
                conn,
                ctx,
                registration.handlers,
                entry,
            ));
            Ok(())
        })
    }
}

/// Run a type's handlers in registration order within one task.
async fn run_handlers(
    router: Arc<Router>,
    conn: Arc<ConnectionShared>,
    ctx: Context,
    handlers: Vec<Arc<dyn ErasedHandler>>,
    entry: Option<Arc<RpcEntry>>,
) {
    for handler in handlers {
        let Err(error) = handler.call(ctx.clone(), entry.clone()).await else {
            continue;
        };

        // a payload that failed typed decode is a validation problem, not
        // a handler bug
        if error.downcast_ref::<serde_json::Error>().is_some() {
            let issues = vec![Issue::new("payload", error.to_string())];
            if let Some(entry) = &entry {
                if entry.try_terminal() {
                    conn.rpc.remove(entry.correlation_id());
                    let payload =
                        ErrorPayload::new(ErrorCode::Validation, "payload failed to decode")
                            .with_details(json!({ "issues": &issues }));
                    conn.send_envelope(&Envelope::rpc_error(entry.correlation_id(), &payload))
                        .await;
                }
            }
            router.emit_error(ErrorEvent::Validation {
                client_id: conn.client_id.clone(),
                ty: ctx.ty().to_owned(),
                issues,
            });
        } else {
            router.emit_error(ErrorEvent::Handler {
                client_id: conn.client_id.clone(),
                ty: ctx.ty().to_owned(),
                error,
            });
            if let Some(entry) = &entry {
                if entry.try_terminal() {
                    conn.rpc.remove(entry.correlation_id());
                    let payload = ErrorPayload::new(ErrorCode::InternalError, "handler failed");
                    conn.send_envelope(&Envelope::rpc_error(entry.correlation_id(), &payload))
                        .await;
                }
            }
        }
        break;
    }
}

/// Process one inbound text frame through the full pipeline.
pub(crate) async fn process_text(router: &Arc<Router>, conn: &Arc<ConnectionShared>, text: &str) {
    if text.len() > router.config.limits.max_payload_bytes {
        conn.begin_close(CloseCode::MessageTooBig, "PAYLOAD_TOO_LARGE").await;
        return;
    }

    let raw: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            router.emit_error(ErrorEvent::Parse {
                client_id: conn.client_id.clone(),
                detail: err.to_string(),
            });
            return;
        }
    };

    let normalized = match wire::normalize(raw) {
        Ok(value) => value,
        Err(err) => {
            router.emit_error(ErrorEvent::Parse {
                client_id: conn.client_id.clone(),
                detail: err.to_string(),
            });
            return;
        }
    };

    let envelope: Envelope = match serde_json::from_value(normalized.clone()) {
        Ok(envelope) => envelope,
        Err(err) => {
            router.emit_error(ErrorEvent::Validation {
                client_id: conn.client_id.clone(),
                ty: normalized
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                issues: vec![Issue::new("type", err.to_string())],
            });
            return;
        }
    };

    if envelope.is_control() {
        handle_control(conn, &envelope).await;
        return;
    }

    // auth gate: the first non-control message decides
    if conn.state() == ConnectionState::Open {
        if let Some(auth) = &router.auth {
            let client = Client {
                conn: conn.clone(),
                router: router.clone(),
            };
            match auth(client, envelope.clone()).await {
                Ok(()) => conn.set_state(ConnectionState::Authenticated),
                Err(err) => {
                    debug!(client_id = %conn.client_id, reason = %err.reason, "auth rejected");
                    conn.begin_close(CloseCode::Policy, &err.reason).await;
                    return;
                }
            }
        }
    }

    let Some(registration) = router.registry.get(envelope.ty.as_str()) else {
        router.emit_error(ErrorEvent::UnknownType {
            client_id: conn.client_id.clone(),
            ty: envelope.ty.clone(),
        });
        if router.config.close_on_unknown_type {
            conn.begin_close(CloseCode::Policy, "UNKNOWN_TYPE").await;
        }
        return;
    };

    let ctx = Context {
        client: Client {
            conn: conn.clone(),
            router: router.clone(),
        },
        ty: Arc::from(envelope.ty.as_str()),
        meta: Arc::new(envelope.meta),
        payload: Arc::new(envelope.payload),
    };
    let tail = Arc::new(DispatchTail {
        router: router.clone(),
        conn: conn.clone(),
        registration: registration.clone(),
        envelope: normalized,
    });
    let next = Next {
        router: router.clone(),
        index: 0,
        tail,
    };

    if let Err(error) = next.run(ctx).await {
        router.emit_error(ErrorEvent::Handler {
            client_id: conn.client_id.clone(),
            ty: envelope.ty,
            error,
        });
    }
}

/// Control frames: dispatched before auth, never routed to user handlers.
async fn handle_control(conn: &Arc<ConnectionShared>, envelope: &Envelope) {
    match envelope.ty.as_str() {
        wire::ABORT_TYPE => {
            let Some(correlation_id) = envelope.meta.correlation_id.as_deref() else {
                debug!("abort without correlation id, dropped");
                return;
            };
            let Some(entry) = conn.rpc.get(correlation_id) else {
                // unknown id: already terminal, or never existed
                debug!(correlation_id, "abort for unknown correlation id, dropped");
                return;
            };
            if entry.try_terminal() {
                // abort wins: the handler's terminal becomes a no-op
                conn.rpc.remove(correlation_id);
                entry.abort_signal().abort();
                let cancelled = Envelope {
                    ty: wire::CANCELLED_TYPE.to_owned(),
                    meta: Meta::correlated(correlation_id),
                    payload: None,
                };
                conn.send_envelope(&cancelled).await;
            }
            // terminal won: the response is already in flight
        }
        other => debug!(ty = other, "unknown control frame dropped"),
    }
}
