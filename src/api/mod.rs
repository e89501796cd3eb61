//! Public API
//!
//! The node handle, its configuration, and the local event bus.

pub mod config;
pub mod events;
pub mod node;

pub use config::NodeConfig;
pub use events::{Event, EventCallback, EventHandlers, SubscriptionHandle};
pub use node::{Node, NodeBuilder};
