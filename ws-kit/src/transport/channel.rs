//! Implementation that uses channels for local testing.
//!
//! [`socket_pair`] builds both halves of a fake connection: the server
//! side ([`ChannelSocket`] + [`ChannelRx`]) plugs into
//! [`Router::serve`](crate::Router::serve), and the [`TestClient`] plays
//! the browser: it pushes raw JSON text, answers pings, and asserts on the
//! frames the server emits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::pubsub::{BrokerConsumer, OnEnvelope, PublishEnvelope, PublishError};
use crate::rpc::AbortSignal;
use crate::socket::{CloseCode, Frame, ServerSocket, SocketError, SocketRx};
use crate::error::ErrorCode;

/// What the server side pushed onto the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum OutFrame {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

/// The outbound half handed to the router.
pub struct ChannelSocket {
    tx: mpsc::Sender<OutFrame>,
    open: AtomicBool,
}

#[async_trait]
impl ServerSocket for ChannelSocket {
    async fn send_text(&self, text: &str) -> Result<(), SocketError> {
        if !self.is_open() {
            return Err(SocketError::Closed);
        }
        self.tx
            .send(OutFrame::Text(text.to_owned()))
            .await
            .map_err(|_| SocketError::Closed)
    }

    async fn send_ping(&self) -> Result<(), SocketError> {
        if !self.is_open() {
            return Err(SocketError::Closed);
        }
        self.tx
            .send(OutFrame::Ping)
            .await
            .map_err(|_| SocketError::Closed)
    }

    async fn close(&self, code: CloseCode, reason: &str) -> Result<(), SocketError> {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self
                .tx
                .send(OutFrame::Close {
                    code: code.code(),
                    reason: reason.to_owned(),
                })
                .await;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// The inbound half handed to the router.
pub struct ChannelRx {
    rx: mpsc::Receiver<Frame>,
}

#[async_trait]
impl SocketRx for ChannelRx {
    async fn receive(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

/// The client side of a fake connection.
pub struct TestClient {
    to_server: mpsc::Sender<Frame>,
    from_server: mpsc::Receiver<OutFrame>,
}

impl TestClient {
    /// Push a raw text frame.
    pub async fn send_text(&self, text: impl Into<String>) {
        let _ = self.to_server.send(Frame::Text(text.into())).await;
    }

    /// Push a JSON value as a text frame.
    pub async fn send_json(&self, value: &Value) {
        self.send_text(value.to_string()).await;
    }

    /// Answer an outstanding ping.
    pub async fn pong(&self) {
        let _ = self.to_server.send(Frame::Pong).await;
    }

    /// Send a close frame.
    pub async fn close(&self, code: u16) {
        let _ = self.to_server.send(Frame::Closed(Some(code))).await;
    }

    /// Drop the wire without a close frame (abnormal end).
    pub fn drop_wire(self) {}

    /// The next frame of any kind, `None` once the server side hung up.
    pub async fn next(&mut self) -> Option<OutFrame> {
        self.from_server.recv().await
    }

    /// The next text frame parsed as JSON, skipping pings.
    pub async fn next_json(&mut self) -> Option<Value> {
        loop {
            match self.from_server.recv().await? {
                OutFrame::Ping => continue,
                OutFrame::Text(text) => {
                    return Some(serde_json::from_str(&text).expect("server sent invalid JSON"))
                }
                OutFrame::Close { code, reason } => {
                    panic!("expected a text frame, got close {code} ({reason:?})")
                }
            }
        }
    }

    /// The close frame, skipping pings and any buffered text.
    pub async fn next_close(&mut self) -> Option<(u16, String)> {
        loop {
            match self.from_server.recv().await? {
                OutFrame::Close { code, reason } => return Some((code, reason)),
                other => debug!(?other, "skipping frame while waiting for close"),
            }
        }
    }
}

/// Build a connected socket/rx/client triple with the given channel depth.
pub fn socket_pair(depth: usize) -> (Arc<ChannelSocket>, ChannelRx, TestClient) {
    let (out_tx, out_rx) = mpsc::channel(depth);
    let (in_tx, in_rx) = mpsc::channel(depth);
    let socket = Arc::new(ChannelSocket {
        tx: out_tx,
        open: AtomicBool::new(true),
    });
    let rx = ChannelRx { rx: in_rx };
    let client = TestClient {
        to_server: in_tx,
        from_server: out_rx,
    };
    (socket, rx, client)
}

/// A [`BrokerConsumer`] fed by an mpsc channel of JSON lines, standing in
/// for a remote broker's subscriber connection.
pub struct ChannelConsumer {
    source: StdMutex<Option<mpsc::Receiver<String>>>,
    stopper: AbortSignal,
}

impl ChannelConsumer {
    pub fn new(source: mpsc::Receiver<String>) -> Self {
        Self {
            source: StdMutex::new(Some(source)),
            stopper: AbortSignal::new(),
        }
    }
}

#[async_trait]
impl BrokerConsumer for ChannelConsumer {
    async fn start(&self, on_envelope: OnEnvelope) -> Result<(), PublishError> {
        let Some(mut source) = self
            .source
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        else {
            return Err(PublishError::new(ErrorCode::AdapterError, false)
                .with_message("consumer already started"));
        };
        let stopper = self.stopper.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopper.aborted() => return,
                    line = source.recv() => {
                        let Some(line) = line else { return };
                        // one bad envelope must not break the stream
                        match serde_json::from_str::<PublishEnvelope>(&line) {
                            Ok(envelope) => on_envelope(envelope).await,
                            Err(err) => warn!(%err, "broker envelope failed to decode, skipped"),
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        self.stopper.abort();
    }
}
