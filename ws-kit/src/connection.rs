//! Per-connection state.
//!
//! A connection is created by the acceptor at upgrade time and driven by
//! [`Router::serve`](crate::Router::serve). Its lifecycle:
//!
//! ```text
//! opening ── upgrade ok ──▶ open
//! open    ── first msg + auth ok ───▶ authenticated
//! open    ── first msg + auth fail ─▶ closing (1008, hook-supplied reason)
//! open/authenticated ── wire close ──▶ closing ──▶ closed
//! open/authenticated ── server close ▶ closing ──▶ closed
//! ```
//!
//! Reaching `closed` drains everything: in-flight RPCs are aborted, the
//! subscription set is purged from the pub/sub index, `on_close` hooks run,
//! and the heartbeat task is cancelled.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::rpc::{AbortSignal, CorrelationTable};
use crate::socket::{CloseCode, ServerSocket};

/// The server-assigned connection identity: a UUIDv7, immutable for the
/// connection's lifetime and never settable from the wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// A fresh UUIDv7 id. Time-ordered, so log output sorts by accept
    /// order.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// Adopt an id minted elsewhere (e.g. by an upstream acceptor).
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ClientId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Opening,
    Open,
    Authenticated,
    Closing,
    Closed,
}

/// How (and why) a connection ended.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseInfo {
    pub code: CloseCode,
    /// Short machine-readable token, e.g. `UNAUTHENTICATED`.
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Typed per-connection storage, written by auth hooks and middleware and
/// read by handlers. Values are stored by type; reads clone.
#[derive(Default)]
pub struct DataBag {
    map: StdMutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl DataBag {
    pub fn insert<T: Send + Sync + 'static>(&self, value: T) {
        self.guard().insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.guard()
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }

    pub fn remove<T: Send + Sync + 'static>(&self) -> bool {
        self.guard().remove(&TypeId::of::<T>()).is_some()
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.guard().contains_key(&TypeId::of::<T>())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, HashMap<TypeId, Box<dyn Any + Send + Sync>>> {
        self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl core::fmt::Debug for DataBag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DataBag")
            .field("len", &self.guard().len())
            .finish()
    }
}

/// Shared bookkeeping for one connection.
pub(crate) struct ConnectionShared {
    pub(crate) client_id: ClientId,
    pub(crate) data: DataBag,
    pub(crate) socket: Arc<dyn ServerSocket>,
    pub(crate) state: StdMutex<ConnectionState>,
    /// Mirror of the adapter-side subscription set.
    pub(crate) subscriptions: Arc<StdMutex<HashSet<String>>>,
    pub(crate) rpc: CorrelationTable,
    /// Pong receipts, consumed by the heartbeat task.
    pub(crate) pong: Notify,
    /// Fires once when the connection begins tearing down.
    pub(crate) shutdown: AbortSignal,
    /// First close wins; everyone later observes the original cause.
    close_info: StdMutex<Option<CloseInfo>>,
}

impl ConnectionShared {
    pub(crate) fn new(
        client_id: ClientId,
        socket: Arc<dyn ServerSocket>,
        max_pending: usize,
    ) -> Self {
        Self {
            client_id,
            data: DataBag::default(),
            socket,
            state: StdMutex::new(ConnectionState::Opening),
            subscriptions: Arc::new(StdMutex::new(HashSet::new())),
            rpc: CorrelationTable::new(max_pending),
            pong: Notify::new(),
            shutdown: AbortSignal::new(),
            close_info: StdMutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Record the close cause if none is recorded yet.
    pub(crate) fn record_close(&self, info: CloseInfo) {
        let mut guard = self
            .close_info
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_none() {
            *guard = Some(info);
        }
    }

    pub(crate) fn close_info(&self) -> Option<CloseInfo> {
        self.close_info
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Serialize and send a frame, dropping silently (with a debug log)
    /// when the socket is gone. The transport keeps queued frames FIFO.
    pub(crate) async fn send_envelope(&self, envelope: &crate::wire::Envelope) -> bool {
        if !self.socket.is_open() {
            debug!(client_id = %self.client_id, ty = %envelope.ty, "send on closed socket dropped");
            return false;
        }
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(err) => {
                debug!(client_id = %self.client_id, %err, "outbound frame failed to serialize");
                return false;
            }
        };
        match self.socket.send_text(&text).await {
            Ok(()) => true,
            Err(err) => {
                debug!(client_id = %self.client_id, %err, "send failed, frame dropped");
                false
            }
        }
    }

    /// Server-initiated close: record the cause, close the socket, wake the
    /// driver. Safe to call more than once.
    pub(crate) async fn begin_close(&self, code: CloseCode, reason: &str) {
        self.record_close(CloseInfo::new(code, reason));
        self.set_state(ConnectionState::Closing);
        if let Err(err) = self.socket.close(code, reason).await {
            debug!(client_id = %self.client_id, %err, "close frame not delivered");
        }
        self.shutdown.abort();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn client_ids_are_unique_and_displayable() {
        let a = ClientId::generate();
        let b = ClientId::generate();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_str());
    }

    #[test]
    fn data_bag_stores_by_type() {
        #[derive(Debug, Clone, PartialEq)]
        struct User(String);

        let bag = DataBag::default();
        assert!(bag.get::<User>().is_none());
        bag.insert(User("alice".into()));
        bag.insert(7u32);
        assert_eq!(bag.get::<User>(), Some(User("alice".into())));
        assert_eq!(bag.get::<u32>(), Some(7));
        assert!(bag.remove::<u32>());
        assert!(!bag.contains::<u32>());
        assert!(bag.contains::<User>());
    }
}
