//! Connection manager
//!
//! Owns the link table: every [`Link`] to a remote node, the call-sign
//! binding for links whose peer has identified itself, and the reconnect
//! bookkeeping for outbound links. The manager is exclusively owned by
//! the node's reactor task; dials, accepts, and timers it starts report
//! back through [`NetworkEvent`] messages rather than touching state
//! from spawned tasks.

use crate::error::NetworkError;
use crate::network::connection::{spawn_link_io, Link, LinkDirection, LinkId};
use crate::network::reconnect::ReconnectPolicy;
use crate::network::NetworkEvent;
use crate::protocol::Envelope;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome of a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectOutcome {
    /// An open link to the peer already exists; no dial was started
    AlreadyConnected(LinkId),
    /// A dial is in flight (newly started or already pending)
    Dialing(LinkId),
}

/// Outcome of a completed dial
#[derive(Debug)]
pub(crate) enum DialOutcome {
    /// The link is open and its I/O tasks are running
    Opened(LinkId),
    /// The dial failed; `retrying` says whether a reconnect timer was
    /// started
    Failed {
        /// Call-sign the dial was for, when known
        call_sign: Option<String>,
        /// True when the reconnect policy scheduled another attempt
        retrying: bool,
    },
}

/// Outcome of binding a call-sign to a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindOutcome {
    /// The call-sign is now bound to this link
    Bound,
    /// Bound to this link; the previously bound link lost the tie-break
    /// and must be closed
    Displaced(LinkId),
    /// Another open link keeps the binding; this link lost the tie-break
    /// and must be closed
    Duplicate(LinkId),
}

/// What the reactor needs to know about a link that just closed
#[derive(Debug)]
pub(crate) struct ClosedLink {
    /// The closed link
    pub link_id: LinkId,
    /// Call-sign the link was carrying, when known
    pub call_sign: Option<String>,
    /// Direction of the closed link
    pub direction: LinkDirection,
    /// Remote address of the closed link
    pub remote_addr: SocketAddr,
    /// True when this was the peer's last link, so its registry record
    /// should be dropped and `userRemoved` announced
    pub should_remove_record: bool,
    /// True when a reconnect timer for this target was started
    pub reconnecting: bool,
}

/// Deterministic winner for simultaneous cross-connections
///
/// When two nodes dial each other at the same time, both end up with two
/// links to the same peer. Both sides keep the link initiated by the
/// lexicographically smaller call-sign, so they agree on which TCP
/// connection survives without any extra round-trip.
pub(crate) fn preferred_direction(local: &str, remote: &str) -> LinkDirection {
    if local < remote {
        LinkDirection::Outbound
    } else {
        LinkDirection::Inbound
    }
}

/// The link table and its dial/reconnect machinery
pub(crate) struct ConnectionManager {
    local_call_sign: String,
    links: HashMap<LinkId, Link>,
    /// Call-sign to link binding; at most one entry per call-sign
    by_call_sign: HashMap<String, LinkId>,
    /// Dials in flight, keyed by target address
    pending_dials: HashMap<SocketAddr, LinkId>,
    /// Reconnect attempt counters, keyed by target address
    dial_attempts: HashMap<SocketAddr, u32>,
    next_link_id: u64,
    events: mpsc::UnboundedSender<NetworkEvent>,
    reconnect: ReconnectPolicy,
    max_links: usize,
    shutting_down: bool,
}

impl ConnectionManager {
    pub fn new(
        local_call_sign: String,
        events: mpsc::UnboundedSender<NetworkEvent>,
        reconnect: ReconnectPolicy,
        max_links: usize,
    ) -> Self {
        Self {
            local_call_sign,
            links: HashMap::new(),
            by_call_sign: HashMap::new(),
            pending_dials: HashMap::new(),
            dial_attempts: HashMap::new(),
            next_link_id: 0,
            events,
            reconnect,
            max_links,
            shutting_down: false,
        }
    }

    fn allocate_link_id(&mut self) -> LinkId {
        let id = LinkId::new(self.next_link_id);
        self.next_link_id += 1;
        id
    }

    /// Look up a link by identifier
    pub fn link(&self, link_id: LinkId) -> Option<&Link> {
        self.links.get(&link_id)
    }

    /// The open link bound to a call-sign, if any
    pub fn open_link_for(&self, call_sign: &str) -> Option<LinkId> {
        let link_id = *self.by_call_sign.get(call_sign)?;
        let link = self.links.get(&link_id)?;
        link.state().is_open().then_some(link_id)
    }

    /// Number of links in the table (any state)
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Start (or join) a dial to a remote address
    ///
    /// Deduplicates against an existing open link when the target's
    /// call-sign is known, and against an in-flight dial to the same
    /// address. The dial itself runs in a spawned task and reports back
    /// through [`NetworkEvent::DialFinished`].
    pub fn connect_to(
        &mut self,
        addr: SocketAddr,
        call_sign: Option<String>,
    ) -> Result<ConnectOutcome, NetworkError> {
        if let Some(cs) = call_sign.as_deref() {
            if let Some(link_id) = self.open_link_for(cs) {
                return Ok(ConnectOutcome::AlreadyConnected(link_id));
            }
        }
        if let Some(&link_id) = self.pending_dials.get(&addr) {
            return Ok(ConnectOutcome::Dialing(link_id));
        }
        if self.links.len() >= self.max_links {
            return Err(NetworkError::LinkLimitReached {
                max: self.max_links,
            });
        }

        let link_id = self.allocate_link_id();
        self.links
            .insert(link_id, Link::outbound(link_id, addr, call_sign));
        self.pending_dials.insert(addr, link_id);

        debug!(%link_id, %addr, "dialing");
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = TcpStream::connect(addr)
                .await
                .map_err(|e| NetworkError::ConnectionFailed {
                    address: addr.to_string(),
                    reason: e.to_string(),
                });
            let _ = events.send(NetworkEvent::DialFinished { link_id, result });
        });

        Ok(ConnectOutcome::Dialing(link_id))
    }

    /// Complete a dial reported by [`NetworkEvent::DialFinished`]
    ///
    /// On success the link transitions to open, its reader/writer tasks
    /// start, and the link id is returned so the caller can run the
    /// handshake. On failure the link is dropped and a reconnect is
    /// scheduled per policy; the outcome says whether a retry is coming.
    pub fn handle_dial_finished(
        &mut self,
        link_id: LinkId,
        result: Result<TcpStream, NetworkError>,
    ) -> DialOutcome {
        let Some(link) = self.links.get_mut(&link_id) else {
            return DialOutcome::Failed {
                call_sign: None,
                retrying: false,
            };
        };
        let addr = link.remote_addr();
        self.pending_dials.remove(&addr);

        match result {
            Ok(stream) => {
                if self.shutting_down {
                    self.links.remove(&link_id);
                    return DialOutcome::Failed {
                        call_sign: None,
                        retrying: false,
                    };
                }
                let (writer_tx, writer_rx) = mpsc::unbounded_channel();
                link.set_open(writer_tx);
                spawn_link_io(link_id, stream, self.events.clone(), writer_rx);
                self.dial_attempts.remove(&addr);
                info!(%link_id, %addr, "outbound link open");
                DialOutcome::Opened(link_id)
            }
            Err(e) => {
                let call_sign = link.call_sign().map(str::to_string);
                self.links.remove(&link_id);
                warn!(%link_id, %addr, error = %e, "dial failed");
                let attempt = self.dial_attempts.get(&addr).copied().unwrap_or(0) + 1;
                let retrying = self.schedule_reconnect(addr, call_sign.clone(), attempt);
                DialOutcome::Failed {
                    call_sign,
                    retrying,
                }
            }
        }
    }

    /// Admit an accepted inbound connection
    ///
    /// The link opens immediately; the peer's call-sign stays unknown
    /// until its `register` arrives.
    pub fn accept(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<LinkId, NetworkError> {
        if self.links.len() >= self.max_links {
            return Err(NetworkError::LinkLimitReached {
                max: self.max_links,
            });
        }

        let link_id = self.allocate_link_id();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        self.links
            .insert(link_id, Link::inbound(link_id, addr, writer_tx));
        spawn_link_io(link_id, stream, self.events.clone(), writer_rx);
        info!(%link_id, %addr, "inbound link open");
        Ok(link_id)
    }

    /// Bind a call-sign to a link once the peer has identified itself
    ///
    /// When another open link already carries the same call-sign, the
    /// survivor is picked deterministically: a same-direction duplicate
    /// means the old link is stale (a re-dial) and the new one wins; a
    /// cross-connection (both nodes dialed each other) is settled by
    /// [`preferred_direction`] so both ends keep the same TCP
    /// connection. The caller must close the link named by the outcome.
    pub fn bind_call_sign(&mut self, link_id: LinkId, call_sign: &str) -> BindOutcome {
        if let Some(&existing_id) = self.by_call_sign.get(call_sign) {
            if existing_id == link_id {
                return BindOutcome::Bound;
            }
            let existing_direction = self
                .links
                .get(&existing_id)
                .filter(|l| l.state().is_open())
                .map(|l| l.direction());
            if let Some(existing_direction) = existing_direction {
                let direction = match self.links.get_mut(&link_id) {
                    Some(link) => {
                        link.set_call_sign(call_sign);
                        link.direction()
                    }
                    None => return BindOutcome::Duplicate(link_id),
                };
                let wins = direction == existing_direction
                    || direction == preferred_direction(&self.local_call_sign, call_sign);
                return if wins {
                    self.by_call_sign.insert(call_sign.to_string(), link_id);
                    debug!(%link_id, call_sign, "duplicate link: new link wins");
                    BindOutcome::Displaced(existing_id)
                } else {
                    debug!(%link_id, call_sign, "duplicate link: existing link wins");
                    BindOutcome::Duplicate(link_id)
                };
            }
        }

        if let Some(link) = self.links.get_mut(&link_id) {
            link.set_call_sign(call_sign);
            self.by_call_sign.insert(call_sign.to_string(), link_id);
            self.dial_attempts.remove(&link.remote_addr());
            BindOutcome::Bound
        } else {
            BindOutcome::Duplicate(link_id)
        }
    }

    /// Close a link and drop it from the table
    ///
    /// `allow_reconnect` is false when the close is deliberate (duplicate
    /// tie-break loser, shutdown); socket failures pass true so outbound
    /// links get re-dialed per policy.
    pub fn close_link(
        &mut self,
        link_id: LinkId,
        reason: &str,
        allow_reconnect: bool,
    ) -> Option<ClosedLink> {
        let mut link = self.links.remove(&link_id)?;
        link.set_closed();

        let call_sign = link.call_sign().map(str::to_string);
        let remote_addr = link.remote_addr();
        let direction = link.direction();
        self.pending_dials.remove(&remote_addr);

        // The binding only falls away when this link held it; a
        // tie-break loser never did.
        let mut held_binding = false;
        if let Some(cs) = call_sign.as_deref() {
            if self.by_call_sign.get(cs) == Some(&link_id) {
                self.by_call_sign.remove(cs);
                held_binding = true;
            }
        }

        info!(%link_id, %remote_addr, reason, "link closed");

        let reconnecting =
            if allow_reconnect && direction == LinkDirection::Outbound && !self.shutting_down {
                let attempt = self.dial_attempts.get(&remote_addr).copied().unwrap_or(0) + 1;
                self.schedule_reconnect(remote_addr, call_sign.clone(), attempt)
            } else {
                false
            };

        Some(ClosedLink {
            link_id,
            call_sign,
            direction,
            remote_addr,
            should_remove_record: held_binding,
            reconnecting,
        })
    }

    /// Start a reconnect timer, honoring the policy's retry cap
    ///
    /// Returns false when the policy refuses another attempt.
    fn schedule_reconnect(
        &mut self,
        addr: SocketAddr,
        call_sign: Option<String>,
        attempt: u32,
    ) -> bool {
        match self.reconnect.delay_for(attempt) {
            Some(delay) => {
                debug!(%addr, attempt, ?delay, "scheduling reconnect");
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(NetworkEvent::ReconnectDue {
                        addr,
                        call_sign,
                        attempt,
                    });
                });
                true
            }
            None => {
                info!(%addr, attempt, "reconnect attempts exhausted");
                self.dial_attempts.remove(&addr);
                false
            }
        }
    }

    /// Act on an elapsed reconnect timer
    pub fn handle_reconnect_due(
        &mut self,
        addr: SocketAddr,
        call_sign: Option<String>,
        attempt: u32,
    ) {
        if self.shutting_down {
            return;
        }
        // The peer may have reconnected to us in the meantime.
        if let Some(cs) = call_sign.as_deref() {
            if self.open_link_for(cs).is_some() {
                self.dial_attempts.remove(&addr);
                return;
            }
        }
        if self.pending_dials.contains_key(&addr) {
            return;
        }
        self.dial_attempts.insert(addr, attempt);
        if let Err(e) = self.connect_to(addr, call_sign) {
            warn!(%addr, error = %e, "reconnect dial rejected");
        }
    }

    /// Enqueue an envelope on the open link bound to a call-sign
    pub fn send_to(&self, call_sign: &str, envelope: Envelope) -> Result<(), NetworkError> {
        let link_id = self
            .open_link_for(call_sign)
            .ok_or_else(|| NetworkError::LinkNotOpen {
                call_sign: call_sign.to_string(),
            })?;
        self.send_on(link_id, envelope)
    }

    /// Enqueue an envelope on a specific link
    pub fn send_on(&self, link_id: LinkId, envelope: Envelope) -> Result<(), NetworkError> {
        let link = self.links.get(&link_id).ok_or_else(|| NetworkError::SendFailed {
            link_id: link_id.to_string(),
            reason: "unknown link".to_string(),
        })?;
        link.send(envelope)
    }

    /// Enqueue an envelope on every open link
    pub fn broadcast(&self, envelope: Envelope) {
        for link in self.links.values() {
            if link.state().is_open() {
                if let Err(e) = link.send(envelope.clone()) {
                    debug!(link_id = %link.id(), error = %e, "broadcast send failed");
                }
            }
        }
    }

    /// Close every link and stop all reconnection
    pub fn close_all(&mut self) {
        self.shutting_down = true;
        for (_, mut link) in self.links.drain() {
            link.set_closed();
        }
        self.by_call_sign.clear();
        self.pending_dials.clear();
        self.dial_attempts.clear();
    }
}
