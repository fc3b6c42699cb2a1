//! The transport seam.
//!
//! The router core never touches a real WebSocket. Acceptors (out of scope
//! here) perform the HTTP upgrade and hand the core two halves:
//!
//! * [`ServerSocket`] — the outbound half: cheap to clone behind an `Arc`,
//!   shared by handlers, the heartbeat task and pub/sub fan-out.
//! * [`SocketRx`] — the inbound half: owned by the connection driver, which
//!   pulls [`Frame`]s in wire order.
//!
//! All send errors are terminal from the core's point of view: a closed
//! socket makes later sends silent drops, and connection teardown handles
//! the rest.

use async_trait::async_trait;

/// WebSocket close codes the router emits or interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000 — normal closure.
    Normal,
    /// 1006 — abnormal closure, reported by the transport.
    Abnormal,
    /// 1008 — policy violation (authentication reject).
    Policy,
    /// 1009 — message too big.
    MessageTooBig,
    /// 1011 — internal error or heartbeat timeout.
    Internal,
    /// Any other code seen on the wire.
    Other(u16),
}

impl CloseCode {
    pub const fn code(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::Abnormal => 1006,
            CloseCode::Policy => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::Internal => 1011,
            CloseCode::Other(code) => *code,
        }
    }

    pub const fn from_code(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1006 => CloseCode::Abnormal,
            1008 => CloseCode::Policy,
            1009 => CloseCode::MessageTooBig,
            1011 => CloseCode::Internal,
            other => CloseCode::Other(other),
        }
    }
}

impl core::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One inbound item from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A text frame carrying a JSON envelope.
    Text(String),
    /// A pong control frame; feeds the heartbeat tracker.
    Pong,
    /// The peer sent a close frame. `None` means no status code.
    Closed(Option<u16>),
}

/// A send-side failure. Resolvable conditions are not errors — transports
/// retry or buffer internally and only surface what the core must treat as
/// the end of the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SocketError {
    #[error("connection closed")]
    Closed,
    #[error("transport failure: {0}")]
    Transport(String),
}

/// The outbound half of a connection.
#[async_trait]
pub trait ServerSocket: Send + Sync + 'static {
    /// Send a text frame. Completes when the transport has accepted the
    /// frame into its outbound queue; queued frames are delivered FIFO.
    async fn send_text(&self, text: &str) -> Result<(), SocketError>;

    /// Send a ping control frame.
    async fn send_ping(&self) -> Result<(), SocketError>;

    /// Close the connection with a code and a short machine-readable
    /// reason token. Idempotent.
    async fn close(&self, code: CloseCode, reason: &str) -> Result<(), SocketError>;

    /// Whether the socket can still accept frames.
    fn is_open(&self) -> bool;
}

/// The inbound half of a connection.
#[async_trait]
pub trait SocketRx: Send + 'static {
    /// Pull the next frame in wire order. `None` means the transport ended
    /// without a close frame (abnormal, 1006).
    async fn receive(&mut self) -> Option<Frame>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn close_codes_round_trip() {
        for code in [1000u16, 1006, 1008, 1009, 1011, 4321] {
            assert_eq!(CloseCode::from_code(code).code(), code);
        }
        assert_eq!(CloseCode::from_code(4321), CloseCode::Other(4321));
    }
}
