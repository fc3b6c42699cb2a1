//! Connection liveness tracking.
//!
//! Each connection runs one heartbeat task: every `interval` the server
//! pings, arms a `timeout`, and expects a pong before it fires. A pong
//! cancels the pending timeout and re-arms the interval; a missed pong
//! closes the connection with 1011. The task is cancelled unconditionally
//! when the connection tears down for any other reason.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::connection::ConnectionShared;
use crate::rpc::AbortSignal;
use crate::socket::ServerSocket;

/// Ping cadence and pong deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Disabled heartbeats never ping and never time a connection out.
    pub enabled: bool,
}

impl HeartbeatConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            enabled: true,
        }
    }

    /// No pings, no liveness enforcement.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(30_000),
            timeout: Duration::from_millis(5_000),
            enabled: true,
        }
    }
}

/// Why the heartbeat task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatEnd {
    /// The connection shut down for some other reason.
    Shutdown,
    /// The pong deadline passed.
    Timeout,
    /// The transport refused the ping; the wire is already gone.
    SendFailed,
}

/// The per-connection heartbeat loop.
///
/// Does not close anything itself; the caller maps the outcome to the
/// right close code (1011 for a timeout, 1006 when the wire was already
/// dead).
pub(crate) async fn run(
    conn: &Arc<ConnectionShared>,
    socket: &Arc<dyn ServerSocket>,
    shutdown: &AbortSignal,
    config: &HeartbeatConfig,
) -> HeartbeatEnd {
    loop {
        tokio::select! {
            _ = shutdown.aborted() => return HeartbeatEnd::Shutdown,
            _ = sleep(config.interval) => {}
        }
        if socket.send_ping().await.is_err() {
            return HeartbeatEnd::SendFailed;
        }
        tokio::select! {
            _ = shutdown.aborted() => return HeartbeatEnd::Shutdown,
            _ = conn.pong.notified() => {}
            _ = sleep(config.timeout) => return HeartbeatEnd::Timeout,
        }
    }
}
