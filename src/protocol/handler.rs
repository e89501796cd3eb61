//! Envelope dispatch
//!
//! Single dispatch surface for every envelope entering the node, whether
//! it arrived on a link or was submitted by a local observer. Validation
//! happens here, once, before any side effect; an invalid envelope is
//! dropped and logged, never answered.

use crate::api::events::{Event, EventHandlers, SubscriptionHandle};
use crate::error::NetworkError;
use crate::network::connection::LinkId;
use crate::network::manager::{
    BindOutcome, ClosedLink, ConnectionManager, ConnectOutcome, DialOutcome,
};
use crate::network::NetworkEvent;
use crate::protocol::Envelope;
use crate::registry::{NodeRegistry, NodeRecord, NodeStatus, RegistryChange};
use crate::relay::relay_message;
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// This node's own identity as announced in `register` and `userAddedBy`
#[derive(Debug, Clone)]
pub(crate) struct LocalIdentity {
    pub call_sign: String,
    pub ip: String,
    pub port: u16,
}

/// Where an envelope entered the node
#[derive(Debug, Clone, Copy)]
pub(crate) enum EnvelopeSource {
    /// Arrived on a link
    Link(LinkId),
    /// Submitted by a local observer, optionally identifying itself so
    /// it is excluded from the resulting event fan-out
    Local(Option<SubscriptionHandle>),
}

impl EnvelopeSource {
    fn exclude(&self) -> Option<SubscriptionHandle> {
        match self {
            EnvelopeSource::Link(_) => None,
            EnvelopeSource::Local(handle) => *handle,
        }
    }
}

/// The node's dispatch core
///
/// Owns the registry and the link table; runs exclusively on the
/// reactor task, so every mutation flows through one call path.
pub(crate) struct ProtocolHandler {
    identity: LocalIdentity,
    registry: NodeRegistry,
    connections: ConnectionManager,
    events: EventHandlers,
    /// Introductions waiting for their outbound link to open, keyed by
    /// the introduced peer's call-sign. The value is the local observer
    /// to exclude from the eventual `UserAdded` fan-out.
    pending_intros: HashMap<String, Option<SubscriptionHandle>>,
}

impl ProtocolHandler {
    /// Build the dispatch core; the node's own identity is seeded into
    /// the registry so snapshots always include it
    pub fn new(
        identity: LocalIdentity,
        connections: ConnectionManager,
        events: EventHandlers,
    ) -> Self {
        let mut registry = NodeRegistry::new();
        registry.register(&identity.call_sign, &identity.ip, identity.port);
        Self {
            identity,
            registry,
            connections,
            events,
            pending_intros: HashMap::new(),
        }
    }

    /// Snapshot of known peers, in registration order
    pub fn known_nodes(&self) -> Vec<NodeRecord> {
        self.registry.list()
    }

    /// Close every link and stop reconnection
    pub fn shutdown(&mut self) {
        self.connections.close_all();
    }

    /// Feed one reactor input from the network side
    pub fn handle_network_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::IncomingConnection { stream, addr } => {
                if let Err(e) = self.connections.accept(stream, addr) {
                    warn!(%addr, error = %e, "rejecting inbound connection");
                }
            }
            NetworkEvent::DialFinished { link_id, result } => {
                match self.connections.handle_dial_finished(link_id, result) {
                    DialOutcome::Opened(link_id) => self.on_link_open(link_id),
                    DialOutcome::Failed {
                        call_sign: Some(call_sign),
                        retrying: false,
                    } => {
                        if self.pending_intros.remove(&call_sign).is_some() {
                            warn!(%call_sign, "abandoning introduction, peer unreachable");
                        }
                    }
                    DialOutcome::Failed { .. } => {}
                }
            }
            NetworkEvent::InboundEnvelope { link_id, envelope } => {
                self.handle(EnvelopeSource::Link(link_id), envelope);
            }
            NetworkEvent::LinkClosed { link_id, reason } => {
                if let Some(closed) = self.connections.close_link(link_id, &reason, true) {
                    self.on_link_closed(closed);
                }
            }
            NetworkEvent::ReconnectDue {
                addr,
                call_sign,
                attempt,
            } => {
                self.connections.handle_reconnect_due(addr, call_sign, attempt);
            }
        }
    }

    /// Dispatch one envelope
    ///
    /// Local submissions take exactly the same path as envelopes read
    /// off a link.
    pub fn handle(&mut self, source: EnvelopeSource, envelope: Envelope) {
        if let Err(e) = envelope.validate() {
            warn!(error = %e, "dropping invalid envelope");
            return;
        }

        match envelope {
            Envelope::Register {
                call_sign,
                ip,
                port,
            } => self.on_register(source, &call_sign, &ip, port),

            Envelope::Discover => self.on_discover(source),

            Envelope::Nodes { nodes } => {
                debug!(count = nodes.len(), "nodes snapshot received");
                self.events
                    .publish(Event::NodesDiscovered { nodes }, source.exclude());
            }

            Envelope::AddUser {
                call_sign,
                ip,
                port,
                sender_call_sign,
                sender_ip,
                sender_port,
            } => {
                if let (Some(cs), Some(s_ip), Some(s_port)) =
                    (sender_call_sign, sender_ip, sender_port)
                {
                    self.register_peer(&cs, &s_ip, s_port);
                }
                self.on_add_user(source, &call_sign, &ip, port);
            }

            Envelope::UserAdded {
                call_sign,
                ip,
                port,
            } => {
                // Informational fan-out; registration stays explicit.
                self.events.publish(
                    Event::UserAdded {
                        call_sign,
                        ip,
                        port,
                    },
                    source.exclude(),
                );
            }

            Envelope::UserAddedBy {
                call_sign,
                ip,
                port,
            } => self.on_user_added_by(source, &call_sign, &ip, port),

            Envelope::UserRemoved { call_sign } => {
                // Registry removal rides the link-close path; this is
                // fan-out only.
                self.events
                    .publish(Event::UserRemoved { call_sign }, source.exclude());
            }

            Envelope::Message {
                sender,
                recipient_call_sign,
                content,
            } => {
                let _ = relay_message(
                    &self.connections,
                    &self.events,
                    &sender,
                    &recipient_call_sign,
                    &content,
                );
            }

            Envelope::ForwardedMessage {
                sender,
                recipient_call_sign,
                content,
            } => {
                if recipient_call_sign == self.identity.call_sign {
                    self.events.publish(
                        Event::MessageReceived { sender, content },
                        source.exclude(),
                    );
                } else {
                    // One hop only; never re-forwarded.
                    warn!(
                        recipient = %recipient_call_sign,
                        "dropping forwarded message not addressed to this node"
                    );
                }
            }
        }
    }

    /// Run the handshake on a freshly opened outbound link
    pub fn on_link_open(&mut self, link_id: LinkId) {
        let register = Envelope::Register {
            call_sign: self.identity.call_sign.clone(),
            ip: self.identity.ip.clone(),
            port: self.identity.port,
        };
        if let Err(e) = self.connections.send_on(link_id, register) {
            warn!(%link_id, error = %e, "handshake send failed");
            return;
        }

        // Outbound links dialed for a known peer bind immediately.
        let Some(link) = self.connections.link(link_id) else {
            return;
        };
        let remote_addr = link.remote_addr();
        let Some(call_sign) = link.call_sign().map(str::to_string) else {
            return;
        };

        // A reconnect lands here after the close path dropped the
        // peer's record; restore it from the dial target.
        let restored = if self.registry.lookup(&call_sign).is_none() {
            self.register_peer(&call_sign, &remote_addr.ip().to_string(), remote_addr.port());
            true
        } else {
            false
        };

        let had_intro = self.pending_intros.contains_key(&call_sign);
        if !self.bind_link(link_id, &call_sign) {
            return;
        }
        self.registry.set_status(&call_sign, NodeStatus::Online);
        if restored && !had_intro {
            self.publish_user_added(&call_sign, None);
        }
    }

    /// Tear-down bookkeeping after a link left the table
    pub fn on_link_closed(&mut self, closed: ClosedLink) {
        // An introduction survives while reconnection is still trying;
        // once it gives up, the intro dies with the link.
        if !closed.reconnecting {
            if let Some(cs) = closed.call_sign.as_deref() {
                if self.pending_intros.remove(cs).is_some() {
                    warn!(call_sign = %cs, "abandoning introduction, link lost");
                }
            }
        }

        let ClosedLink {
            call_sign: Some(call_sign),
            should_remove_record: true,
            ..
        } = closed
        else {
            return;
        };

        if self.registry.remove(&call_sign).is_some() {
            info!(%call_sign, "peer removed");
            self.connections.broadcast(Envelope::UserRemoved {
                call_sign: call_sign.clone(),
            });
            self.events
                .publish(Event::UserRemoved { call_sign }, None);
        }
    }

    fn on_register(&mut self, source: EnvelopeSource, call_sign: &str, ip: &str, port: u16) {
        if call_sign == self.identity.call_sign {
            warn!(%call_sign, "dropping register carrying this node's own call-sign");
            return;
        }

        let EnvelopeSource::Link(link_id) = source else {
            // A local register gets the same contract a wire one does:
            // upsert, then the snapshot answer as an event.
            self.register_peer(call_sign, ip, port);
            self.events.publish(
                Event::NodesDiscovered {
                    nodes: self.registry.snapshot(),
                },
                source.exclude(),
            );
            self.events.publish(
                Event::UserAdded {
                    call_sign: call_sign.to_string(),
                    ip: ip.to_string(),
                    port,
                },
                source.exclude(),
            );
            return;
        };

        self.register_peer(call_sign, ip, port);
        let had_intro = self.pending_intros.contains_key(call_sign);
        if !self.bind_link(link_id, call_sign) {
            return;
        }

        let snapshot = self.registry.snapshot();
        if let Err(e) = self.connections.send_on(link_id, Envelope::Nodes { nodes: snapshot }) {
            warn!(%link_id, error = %e, "snapshot reply failed");
        }

        // Binding may have completed a pending introduction, which
        // already announced this peer.
        let intro_completed = had_intro && !self.pending_intros.contains_key(call_sign);
        if !intro_completed {
            self.events.publish(
                Event::UserAdded {
                    call_sign: call_sign.to_string(),
                    ip: ip.to_string(),
                    port,
                },
                None,
            );
        }
    }

    fn on_discover(&mut self, source: EnvelopeSource) {
        let snapshot = self.registry.snapshot();
        match source {
            EnvelopeSource::Link(link_id) => {
                if let Err(e) = self
                    .connections
                    .send_on(link_id, Envelope::Nodes { nodes: snapshot })
                {
                    warn!(%link_id, error = %e, "snapshot reply failed");
                }
            }
            // A local discover is answered as the event a remote nodes
            // reply would have produced.
            EnvelopeSource::Local(_) => {
                self.events
                    .publish(Event::NodesDiscovered { nodes: snapshot }, None);
            }
        }
    }

    fn on_add_user(&mut self, source: EnvelopeSource, call_sign: &str, ip: &str, port: u16) {
        if call_sign == self.identity.call_sign {
            debug!("ignoring introduction to this node itself");
            return;
        }

        self.register_peer(call_sign, ip, port);

        if let Some(link_id) = self.connections.open_link_for(call_sign) {
            // Already linked; confirm right away.
            self.publish_user_added(call_sign, source.exclude());
            self.send_confirmation(link_id);
            return;
        }

        self.registry.set_status(call_sign, NodeStatus::Offline);

        let addr = match format!("{}:{}", ip, port).parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => {
                let err = NetworkError::InvalidAddress {
                    address: format!("{}:{}", ip, port),
                };
                warn!(%call_sign, error = %err, "cannot dial introduced peer");
                return;
            }
        };

        self.pending_intros
            .insert(call_sign.to_string(), source.exclude());
        match self.connections.connect_to(addr, Some(call_sign.to_string())) {
            Ok(ConnectOutcome::Dialing(link_id)) => {
                debug!(%link_id, %call_sign, "dialing introduced peer");
            }
            Ok(ConnectOutcome::AlreadyConnected(link_id)) => {
                self.complete_intro(link_id, call_sign);
            }
            Err(e) => {
                warn!(%call_sign, error = %e, "cannot dial introduced peer");
                self.pending_intros.remove(call_sign);
            }
        }
    }

    fn on_user_added_by(&mut self, source: EnvelopeSource, call_sign: &str, ip: &str, port: u16) {
        self.register_peer(call_sign, ip, port);
        if let EnvelopeSource::Link(link_id) = source {
            self.bind_link(link_id, call_sign);
        }
        self.events.publish(
            Event::UserAddedBy {
                call_sign: call_sign.to_string(),
                ip: ip.to_string(),
                port,
            },
            source.exclude(),
        );
    }

    /// Upsert a peer, logging the conflict policy when an endpoint is
    /// overwritten
    fn register_peer(&mut self, call_sign: &str, ip: &str, port: u16) {
        match self.registry.register(call_sign, ip, port) {
            RegistryChange::Added => info!(%call_sign, ip, port, "peer registered"),
            RegistryChange::Updated => {
                warn!(%call_sign, ip, port, "re-registration overwrote a different endpoint")
            }
            RegistryChange::Refreshed => debug!(%call_sign, "peer refreshed"),
        }
    }

    /// Bind a call-sign to its link, resolving cross-connection ties
    ///
    /// Any successful binding finishes a pending introduction for that
    /// call-sign, whichever link ended up carrying it. Returns false
    /// when this link lost the tie-break and was closed.
    fn bind_link(&mut self, link_id: LinkId, call_sign: &str) -> bool {
        let bound = match self.connections.bind_call_sign(link_id, call_sign) {
            BindOutcome::Bound => true,
            BindOutcome::Displaced(old) => {
                self.connections.close_link(old, "replaced by preferred link", false);
                true
            }
            BindOutcome::Duplicate(loser) => {
                self.connections
                    .close_link(loser, "duplicate connection", false);
                false
            }
        };
        if bound {
            self.complete_intro(link_id, call_sign);
        }
        bound
    }

    /// Finish an introduction once the link to the introduced peer is up
    fn complete_intro(&mut self, link_id: LinkId, call_sign: &str) {
        let Some(exclude) = self.pending_intros.remove(call_sign) else {
            return;
        };
        self.publish_user_added(call_sign, exclude);
        self.send_confirmation(link_id);
    }

    fn publish_user_added(&self, call_sign: &str, exclude: Option<SubscriptionHandle>) {
        let Some(record) = self.registry.lookup(call_sign) else {
            return;
        };
        self.events.publish(
            Event::UserAdded {
                call_sign: record.call_sign.clone(),
                ip: record.ip.clone(),
                port: record.port,
            },
            exclude,
        );
    }

    /// Tell the peer on this link that we added it
    fn send_confirmation(&self, link_id: LinkId) {
        let confirmation = Envelope::UserAddedBy {
            call_sign: self.identity.call_sign.clone(),
            ip: self.identity.ip.clone(),
            port: self.identity.port,
        };
        if let Err(e) = self.connections.send_on(link_id, confirmation) {
            warn!(%link_id, error = %e, "confirmation send failed");
        }
    }
}
