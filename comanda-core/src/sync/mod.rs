//! Realtime channel to the sync server.
//!
//! ## Layers
//!
//! 1. [`protocol`]: Engine.IO / Socket.IO text packets
//! 2. [`Transport`]: the websocket, handshake, heartbeat and reconnects
//! 3. [`ChannelSession`]: handler registry and acknowledgment table, stable
//!    across reconnects
//! 4. [`Requester`]: one event, one acknowledgment, bounded by a timeout
//!
//! ## Protocol
//!
//! 1. Connect to `/socket.io/?EIO=4&transport=websocket`
//! 2. Receive the Engine.IO open packet (`0{...}`) with the ping interval
//! 3. Send `40` and wait for the server's `40{"sid":...}`
//! 4. Exchange events (`42`) and acknowledgments (`43`), answering each
//!    server ping (`2`) with a pong (`3`)

mod error;
pub mod protocol;
mod request;
mod session;
mod transport;

pub use error::{SyncError, GENERIC_REJECTION};
pub use protocol::{Handshake, Packet, ProtocolError};
pub use request::{interpret_ack, Reply, RequestContext, Requester};
pub use session::{
    ChannelSession, Handler, PendingAck, Subscription, CONNECT_EVENT, DISCONNECT_EVENT,
};
pub use transport::Transport;

#[cfg(test)]
pub(crate) use session::loopback;
