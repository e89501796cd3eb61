//! Network module
//!
//! Persistent TCP links between nodes: framing, the link table, the
//! listener, and the reconnect policy. All link-table state is owned by
//! the node's reactor task; the tasks spawned here (readers, writers,
//! dials, timers) communicate with it exclusively through
//! [`NetworkEvent`] messages.

pub(crate) mod connection;
pub(crate) mod listener;
pub(crate) mod manager;
pub mod reconnect;

pub use connection::{LinkDirection, LinkId, LinkState};
pub use reconnect::ReconnectPolicy;

use crate::protocol::Envelope;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Messages from network tasks into the reactor
///
/// Every socket event re-enters the single dispatch path through this
/// enum; nothing mutates the registry or link table from a spawned task.
#[derive(Debug)]
pub(crate) enum NetworkEvent {
    /// The listener accepted a new inbound connection
    IncomingConnection {
        /// The accepted socket
        stream: TcpStream,
        /// Remote address of the socket
        addr: SocketAddr,
    },

    /// An outbound dial completed (successfully or not)
    DialFinished {
        /// The link the dial belongs to
        link_id: LinkId,
        /// The connected socket, or the dial error
        result: Result<TcpStream, crate::error::NetworkError>,
    },

    /// A decoded envelope arrived on a link
    InboundEnvelope {
        /// Source link
        link_id: LinkId,
        /// The decoded envelope
        envelope: Envelope,
    },

    /// A link's socket closed or failed
    LinkClosed {
        /// The affected link
        link_id: LinkId,
        /// Close reason, for logging
        reason: String,
    },

    /// A scheduled reconnect delay elapsed
    ReconnectDue {
        /// Dial target
        addr: SocketAddr,
        /// Call-sign of the peer, when known at schedule time
        call_sign: Option<String>,
        /// Which attempt this is (1-based)
        attempt: u32,
    },
}
