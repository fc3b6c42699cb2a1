//! Transport implementations that ship with the crate.
//!
//! Only the channel transport lives here; real WebSocket acceptors are
//! external, per the transport seam in [`socket`](crate::socket).

pub mod channel;

pub use channel::{socket_pair, ChannelConsumer, ChannelRx, ChannelSocket, OutFrame, TestClient};
