//! Channels and the peers that own them.
//!
//! A channel is one loopback TCP connection between a host process and one
//! client process. Every logical object multiplexed over it has a routing id;
//! messages on `RoutingId::CONTROL` are handled by the peers themselves.
//!
//! # Architecture
//!
//! - **Protocol**: framing, the message envelope and the hello handshake
//! - **Messages**: the fixed, versioned message set
//! - **Transport**: channel tasks, reply matching and channel events
//! - **Peer**: the `Listener` capability and shared dispatch rules
//! - **Host** / **Client**: the two peer variants

pub mod client;
pub mod host;
pub mod messages;
pub mod peer;
pub mod protocol;
pub mod transport;

pub use client::ClientPeer;
pub use host::{HostPeer, HostServices};
pub use messages::{
    ControlHostMsg, ControlMsg, CreateNewHostChannelReply, NewProfileParams, ProfileControlMsg,
    ProfileHostMsg,
};
pub use peer::{Dispatch, Listener};
pub use protocol::{Message, ProtocolError};
pub use transport::{error_reason, Channel, ChannelEvent, ChannelSender, EventSink};

/// Identifies one channel endpoint within its owning process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}
