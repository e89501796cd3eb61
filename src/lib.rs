//! # peerlink
//!
//! Peer registry and one-hop message relay for call-sign-identified
//! nodes over persistent TCP links.
//!
//! Each node keeps an in-memory directory of known peers, maintains at
//! most one open link per remote call-sign, and exchanges flat JSON
//! envelopes (one per line) for registration, discovery, introductions,
//! and chat relay. Protocol activity surfaces to the embedding
//! application through a local event bus.
//!
//! ## Quick start
//!
//! ```no_run
//! use peerlink::{Event, Node};
//!
//! #[tokio::main]
//! async fn main() -> peerlink::Result<()> {
//!     let mut node = Node::builder()
//!         .call_sign("alice")
//!         .listen_addr("0.0.0.0:4300".parse().unwrap())
//!         .build()?;
//!
//!     node.on_event(|event| {
//!         if let Event::MessageReceived { sender, content } = event {
//!             println!("{}: {}", sender, content);
//!         }
//!     });
//!
//!     node.start().await?;
//!     node.add_peer("bob", "203.0.113.7", 4300)?;
//!     node.send_message("bob", "hello")?;
//!     node.stop().await
//! }
//! ```
//!
//! ## Guarantees and limits
//!
//! - At most one open link per remote call-sign; simultaneous mutual
//!   dials are resolved deterministically on both sides.
//! - Envelopes on the same link keep submission order (FIFO per link);
//!   there is no ordering across links.
//! - Delivery is at-most-once and best-effort: an unreachable recipient
//!   produces exactly one [`Event::MessageFailed`], with no retry or
//!   queuing.
//! - Nothing survives a restart, links carry no authentication or
//!   encryption, and relay is strictly one hop.

#![warn(missing_docs)]

pub mod api;
pub mod error;
pub mod network;
pub mod protocol;
pub mod registry;

pub(crate) mod relay;

pub use api::{Event, EventCallback, EventHandlers, Node, NodeBuilder, NodeConfig, SubscriptionHandle};
pub use error::{ConfigError, NetworkError, PeerlinkError, ProtocolError, RelayError, Result};
pub use network::{LinkDirection, LinkId, LinkState, ReconnectPolicy};
pub use protocol::{Envelope, NodeInfo, MAX_ENVELOPE_SIZE};
pub use registry::{NodeRecord, NodeStatus};
