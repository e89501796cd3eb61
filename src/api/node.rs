//! Node lifecycle and public entry points
//!
//! A [`Node`] bundles the listener, the reactor task, and the local
//! event bus behind one handle. Everything submitted through it, from
//! the UI layer or from tests, re-enters the same dispatch path as
//! envelopes read off the wire.

use crate::api::config::NodeConfig;
use crate::api::events::{Event, EventHandlers, SubscriptionHandle};
use crate::error::{ConfigError, Result};
use crate::network::listener::Listener;
use crate::network::manager::ConnectionManager;
use crate::network::ReconnectPolicy;
use crate::protocol::handler::{EnvelopeSource, LocalIdentity, ProtocolHandler};
use crate::protocol::Envelope;
use crate::registry::NodeRecord;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

/// Builder for [`Node`]
///
/// # Examples
///
/// ```no_run
/// use peerlink::Node;
///
/// # async fn example() -> peerlink::Result<()> {
/// let mut node = Node::builder()
///     .call_sign("alice")
///     .listen_addr("0.0.0.0:4300".parse().unwrap())
///     .build()?;
/// node.start().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct NodeBuilder {
    config: NodeConfig,
}

impl NodeBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the node's call-sign (required)
    pub fn call_sign(mut self, call_sign: impl Into<String>) -> Self {
        self.config.call_sign = call_sign.into();
        self
    }

    /// Set the listen address; port 0 picks an ephemeral port
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    /// Set the endpoint announced to peers
    ///
    /// Needed when the bound address is not what peers should dial
    /// (ephemeral ports, NAT).
    pub fn advertised_endpoint(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.config.advertised_ip = Some(ip.into());
        self.config.advertised_port = Some(port);
        self
    }

    /// Set the reconnect policy for outbound links
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Cap the number of concurrent links
    pub fn max_links(mut self, max_links: usize) -> Self {
        self.config.max_links = max_links;
        self
    }

    /// Validate the configuration and build the node
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration is incomplete or
    /// inconsistent.
    pub fn build(self) -> Result<Node> {
        self.config.validate()?;
        Ok(Node {
            config: self.config,
            events: EventHandlers::new(),
            commands: None,
            local_addr: None,
            reactor: None,
            accept_loop: None,
        })
    }
}

/// Requests from the node handle into the reactor
enum Command {
    Submit {
        envelope: Envelope,
        exclude: Option<SubscriptionHandle>,
    },
    KnownNodes {
        reply: oneshot::Sender<Vec<NodeRecord>>,
    },
    Shutdown,
}

/// A running (or stopped) peerlink node
///
/// Holds the configuration, the observer bus, and, while running, the
/// channel into the reactor task.
pub struct Node {
    config: NodeConfig,
    events: EventHandlers,
    commands: Option<mpsc::UnboundedSender<Command>>,
    local_addr: Option<SocketAddr>,
    reactor: Option<JoinHandle<()>>,
    accept_loop: Option<JoinHandle<()>>,
}

impl Node {
    /// Start building a node
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    /// This node's call-sign
    pub fn call_sign(&self) -> &str {
        &self.config.call_sign
    }

    /// The bound listen address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Check whether the reactor is running
    pub fn is_running(&self) -> bool {
        self.commands.is_some()
    }

    /// Bind the listener and spawn the reactor
    ///
    /// # Errors
    ///
    /// Returns an error when the node is already running or the listen
    /// address cannot be bound.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(ConfigError::InvalidState {
                reason: "node is already running".to_string(),
            }
            .into());
        }

        let listener = Listener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr();
        self.local_addr = Some(local_addr);

        let advertised_ip = self
            .config
            .advertised_ip
            .clone()
            .unwrap_or_else(|| local_addr.ip().to_string());
        let advertised_port = self.config.advertised_port.unwrap_or(local_addr.port());

        let (net_tx, mut net_rx) = mpsc::unbounded_channel();
        let (command_tx, mut command_rx) = mpsc::unbounded_channel();

        self.accept_loop = Some(listener.spawn_accept_loop(net_tx.clone()));

        let connections = ConnectionManager::new(
            self.config.call_sign.clone(),
            net_tx,
            self.config.reconnect.clone(),
            self.config.max_links,
        );
        let identity = LocalIdentity {
            call_sign: self.config.call_sign.clone(),
            ip: advertised_ip,
            port: advertised_port,
        };
        let mut handler = ProtocolHandler::new(identity, connections, self.events.clone());

        // The reactor exclusively owns the registry and the link table;
        // every mutation flows through this loop.
        let reactor = tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = command_rx.recv() => match command {
                        Some(Command::Submit { envelope, exclude }) => {
                            handler.handle(EnvelopeSource::Local(exclude), envelope);
                        }
                        Some(Command::KnownNodes { reply }) => {
                            let _ = reply.send(handler.known_nodes());
                        }
                        Some(Command::Shutdown) | None => {
                            handler.shutdown();
                            break;
                        }
                    },
                    event = net_rx.recv() => match event {
                        Some(event) => handler.handle_network_event(event),
                        None => break,
                    },
                }
            }
        });

        self.commands = Some(command_tx);
        self.reactor = Some(reactor);
        info!(call_sign = %self.config.call_sign, %local_addr, "node started");
        self.events.publish(Event::NodeStarted, None);
        Ok(())
    }

    /// Close every link and stop the reactor
    ///
    /// Idempotent: stopping a node that never started is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(commands) = self.commands.take() else {
            return Ok(());
        };
        let _ = commands.send(Command::Shutdown);
        if let Some(reactor) = self.reactor.take() {
            let _ = reactor.await;
        }
        // The accept loop owns the listening socket; aborting it here
        // guarantees the port is free once stop() returns.
        if let Some(accept_loop) = self.accept_loop.take() {
            accept_loop.abort();
            let _ = accept_loop.await;
        }
        self.local_addr = None;
        info!(call_sign = %self.config.call_sign, "node stopped");
        self.events.publish(Event::NodeStopped, None);
        Ok(())
    }

    fn command(&self, command: Command) -> Result<()> {
        let commands = self.commands.as_ref().ok_or(ConfigError::InvalidState {
            reason: "node is not running".to_string(),
        })?;
        commands.send(command).map_err(|_| {
            ConfigError::InvalidState {
                reason: "reactor is gone".to_string(),
            }
            .into()
        })
    }

    /// Submit an envelope into the dispatch path
    ///
    /// Takes exactly the path an envelope arriving on a link would take.
    ///
    /// # Errors
    ///
    /// Returns an error when the node is not running.
    pub fn submit(&self, envelope: Envelope) -> Result<()> {
        self.command(Command::Submit {
            envelope,
            exclude: None,
        })
    }

    /// Submit an envelope on behalf of an observer
    ///
    /// The observer named by `handle` is excluded from the event fan-out
    /// its own submission produces.
    pub fn submit_from(&self, handle: SubscriptionHandle, envelope: Envelope) -> Result<()> {
        self.command(Command::Submit {
            envelope,
            exclude: Some(handle),
        })
    }

    /// Relay a chat message to a peer
    ///
    /// Delivery is best-effort: an unreachable recipient surfaces as one
    /// [`Event::MessageFailed`], never as an error here.
    pub fn send_message(
        &self,
        recipient_call_sign: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<()> {
        self.submit(Envelope::Message {
            sender: self.config.call_sign.clone(),
            recipient_call_sign: recipient_call_sign.into(),
            content: content.into(),
        })
    }

    /// Introduce a peer and dial it
    ///
    /// Registers the peer and opens a link to it unless one already
    /// exists; once the link is confirmed, observers see
    /// [`Event::UserAdded`] and the peer receives a confirmation.
    pub fn add_peer(
        &self,
        call_sign: impl Into<String>,
        ip: impl Into<String>,
        port: u16,
    ) -> Result<()> {
        let sender_ip = self
            .config
            .advertised_ip
            .clone()
            .or_else(|| self.local_addr.map(|a| a.ip().to_string()));
        let sender_port = self
            .config
            .advertised_port
            .or_else(|| self.local_addr.map(|a| a.port()));
        self.submit(Envelope::AddUser {
            call_sign: call_sign.into(),
            ip: ip.into(),
            port,
            sender_call_sign: Some(self.config.call_sign.clone()),
            sender_ip,
            sender_port,
        })
    }

    /// Ask for the current peer snapshot as an [`Event::NodesDiscovered`]
    pub fn discover(&self) -> Result<()> {
        self.submit(Envelope::Discover)
    }

    /// Snapshot of known peers, in registration order
    ///
    /// # Errors
    ///
    /// Returns an error when the node is not running.
    pub async fn known_nodes(&self) -> Result<Vec<NodeRecord>> {
        let (reply, response) = oneshot::channel();
        self.command(Command::KnownNodes { reply })?;
        response.await.map_err(|_| {
            ConfigError::InvalidState {
                reason: "reactor is gone".to_string(),
            }
            .into()
        })
    }

    /// Attach an observer to this node's events
    pub fn on_event<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// Detach an observer
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.events.unsubscribe(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node(call_sign: &str) -> Node {
        Node::builder()
            .call_sign(call_sign)
            .listen_addr("127.0.0.1:0".parse().unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_call_sign() {
        let result = Node::builder().build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_sets_fields() {
        let node = Node::builder()
            .call_sign("alice")
            .listen_addr("127.0.0.1:4300".parse().unwrap())
            .advertised_endpoint("203.0.113.7", 4300)
            .max_links(8)
            .build()
            .unwrap();

        assert_eq!(node.call_sign(), "alice");
        assert_eq!(node.config.advertised_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(node.config.max_links, 8);
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut node = test_node("alice");

        node.start().await.unwrap();
        assert!(node.is_running());
        assert!(node.local_addr().is_some());

        node.stop().await.unwrap();
        assert!(!node.is_running());
        assert!(node.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let mut node = test_node("alice");
        node.start().await.unwrap();
        assert!(node.start().await.is_err());
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let mut node = test_node("alice");
        assert!(node.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_submit_requires_running_node() {
        let node = test_node("alice");
        assert!(node.discover().is_err());
    }

    #[tokio::test]
    async fn test_known_nodes_contains_self() {
        let mut node = test_node("alice");
        node.start().await.unwrap();

        let nodes = node.known_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].call_sign, "alice");

        node.stop().await.unwrap();
    }
}
