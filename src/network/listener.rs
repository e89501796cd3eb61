//! Listening socket
//!
//! Binds the node's TCP listener and runs the accept loop in a spawned
//! task. Accepted sockets are handed to the reactor through
//! [`NetworkEvent::IncomingConnection`]; the listener itself never
//! touches the link table.

use crate::error::NetworkError;
use crate::network::NetworkEvent;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub(crate) struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind the listening socket
    ///
    /// Port 0 binds an ephemeral port; [`Listener::local_addr`] reports
    /// the one actually assigned.
    pub async fn bind(addr: SocketAddr) -> Result<Self, NetworkError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::BindFailed {
                address: addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = inner.local_addr().map_err(|e| NetworkError::BindFailed {
            address: addr.to_string(),
            reason: e.to_string(),
        })?;
        info!(%local_addr, "listening");
        Ok(Self { inner, local_addr })
    }

    /// The bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until the reactor goes away
    ///
    /// Transient accept errors are logged and the loop keeps going; only
    /// a closed event channel ends it. The returned handle lets the node
    /// abort the loop on shutdown, which drops the listening socket and
    /// frees the port.
    pub fn spawn_accept_loop(
        self,
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.inner.accept().await {
                    Ok((stream, addr)) => {
                        if events
                            .send(NetworkEvent::IncomingConnection { stream, addr })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        })
    }
}
