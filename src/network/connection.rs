//! Links and message framing
//!
//! A [`Link`] is one persistent bidirectional TCP connection to a remote
//! node. Frames are newline-delimited JSON envelopes: one newline-free
//! text record per frame. Each link gets a dedicated reader task and a
//! dedicated writer task; the writer is fed by an mpsc queue, which
//! preserves submission order per link (FIFO).

use crate::error::NetworkError;
use crate::network::NetworkEvent;
use crate::protocol::{decode_envelope, encode_envelope, Envelope, MAX_ENVELOPE_SIZE};
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Unique identifier for a link instance
///
/// Re-establishing a connection always creates a new link with a new
/// identifier; a closed link is never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl LinkId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link:{}", self.0)
    }
}

/// Link lifecycle state
///
/// State is monotone: `Connecting → Open → Closed`, never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Outbound dial in progress
    Connecting,
    /// Ready for traffic
    Open,
    /// Terminal; a new link must be created to reconnect
    Closed,
}

impl LinkState {
    /// Check if the link can carry traffic
    pub fn is_open(&self) -> bool {
        matches!(self, LinkState::Open)
    }

    /// Check if the link is in its terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Closed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Connecting => "connecting",
            LinkState::Open => "open",
            LinkState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Direction of link establishment
///
/// Only outbound links are reconnected after a failure; each side owns
/// reconnection of the links it initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// The remote peer initiated the connection
    Inbound,
    /// This node initiated the connection
    Outbound,
}

impl fmt::Display for LinkDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkDirection::Inbound => "inbound",
            LinkDirection::Outbound => "outbound",
        };
        write!(f, "{}", s)
    }
}

/// One persistent connection to a remote node
///
/// Owned exclusively by the connection manager; other components reach a
/// link only by call-sign lookup, never by handle sharing. The remote
/// call-sign is unknown until the peer's `register` arrives.
#[derive(Debug)]
pub(crate) struct Link {
    id: LinkId,
    direction: LinkDirection,
    state: LinkState,
    remote_addr: SocketAddr,
    call_sign: Option<String>,
    /// Outbound envelope queue; present once the link is open
    writer: Option<mpsc::UnboundedSender<Envelope>>,
}

impl Link {
    /// Create an outbound link in `Connecting` state
    pub fn outbound(id: LinkId, remote_addr: SocketAddr, call_sign: Option<String>) -> Self {
        Self {
            id,
            direction: LinkDirection::Outbound,
            state: LinkState::Connecting,
            remote_addr,
            call_sign,
            writer: None,
        }
    }

    /// Create an inbound link, open immediately
    pub fn inbound(
        id: LinkId,
        remote_addr: SocketAddr,
        writer: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            id,
            direction: LinkDirection::Inbound,
            state: LinkState::Open,
            remote_addr,
            call_sign: None,
            writer: Some(writer),
        }
    }

    /// Link identifier
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Direction of establishment
    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Remote socket address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Remote call-sign, once learned from the peer's `register`
    pub fn call_sign(&self) -> Option<&str> {
        self.call_sign.as_deref()
    }

    /// Record the remote call-sign after the handshake
    pub fn set_call_sign(&mut self, call_sign: &str) {
        self.call_sign = Some(call_sign.to_string());
    }

    /// Transition `Connecting → Open` with the writer queue attached
    pub fn set_open(&mut self, writer: mpsc::UnboundedSender<Envelope>) {
        debug_assert_eq!(self.state, LinkState::Connecting);
        self.state = LinkState::Open;
        self.writer = Some(writer);
    }

    /// Transition to the terminal `Closed` state
    ///
    /// Dropping the writer queue ends the writer task, which closes the
    /// socket.
    pub fn set_closed(&mut self) {
        self.state = LinkState::Closed;
        self.writer = None;
    }

    /// Enqueue an envelope for transmission
    ///
    /// Envelopes enqueued on the same link are written in submission
    /// order.
    pub fn send(&self, envelope: Envelope) -> Result<(), NetworkError> {
        let writer = self.writer.as_ref().ok_or_else(|| NetworkError::SendFailed {
            link_id: self.id.to_string(),
            reason: format!("link is {}", self.state),
        })?;
        writer
            .send(envelope)
            .map_err(|_| NetworkError::SendFailed {
                link_id: self.id.to_string(),
                reason: "writer task gone".to_string(),
            })
    }
}

/// Read one frame (up to, not including, the newline)
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary. Frames larger
/// than [`MAX_ENVELOPE_SIZE`] are a connection error: the size is
/// checked as bytes accumulate, before the frame is complete.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Option<String>, NetworkError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut frame: Vec<u8> = Vec::new();

    loop {
        let available = reader
            .fill_buf()
            .await
            .map_err(|e| NetworkError::ReceiveFailed {
                reason: e.to_string(),
            })?;

        if available.is_empty() {
            // EOF
            if frame.is_empty() {
                return Ok(None);
            }
            return Err(NetworkError::ConnectionReset);
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                frame.extend_from_slice(&available[..pos]);
                reader.consume(pos + 1);
                if frame.len() > MAX_ENVELOPE_SIZE {
                    return Err(NetworkError::EnvelopeTooLarge {
                        size: frame.len(),
                        max: MAX_ENVELOPE_SIZE,
                    });
                }
                return Ok(Some(String::from_utf8_lossy(&frame).into_owned()));
            }
            None => {
                let n = available.len();
                frame.extend_from_slice(available);
                reader.consume(n);
                if frame.len() > MAX_ENVELOPE_SIZE {
                    return Err(NetworkError::EnvelopeTooLarge {
                        size: frame.len(),
                        max: MAX_ENVELOPE_SIZE,
                    });
                }
            }
        }
    }
}

/// Write one frame followed by the delimiter and flush
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &str) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Spawn the reader and writer tasks for an open link
///
/// The reader decodes frames and forwards envelopes into the reactor;
/// malformed frames are dropped and logged (never answered), in arrival
/// order. The writer drains the link's envelope queue. Either task
/// reports `LinkClosed` on socket failure or EOF; the reactor treats the
/// first such report as authoritative.
pub(crate) fn spawn_link_io(
    link_id: LinkId,
    stream: TcpStream,
    events: mpsc::UnboundedSender<NetworkEvent>,
    mut writer_rx: mpsc::UnboundedReceiver<Envelope>,
) {
    let (read_half, mut write_half) = stream.into_split();

    // Reader task: frames are processed in arrival order.
    let reader_events = events.clone();
    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let reason = loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => match decode_envelope(&frame) {
                    Ok(envelope) => {
                        if reader_events
                            .send(NetworkEvent::InboundEnvelope { link_id, envelope })
                            .is_err()
                        {
                            // Reactor gone; node is shutting down.
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(%link_id, error = %e, "dropping malformed envelope");
                    }
                },
                Ok(None) => break "closed by peer".to_string(),
                Err(e) => break e.to_string(),
            }
        };
        let _ = reader_events.send(NetworkEvent::LinkClosed {
            link_id,
            reason,
        });
    });

    // Writer task: drains the queue in FIFO order. The queue closing
    // means the link was closed by the reactor; shut the socket down.
    tokio::spawn(async move {
        while let Some(envelope) = writer_rx.recv().await {
            let frame = match encode_envelope(&envelope) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(%link_id, error = %e, "failed to encode outbound envelope");
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut write_half, &frame).await {
                debug!(%link_id, error = %e, "write failed");
                let _ = events.send(NetworkEvent::LinkClosed {
                    link_id,
                    reason: e.to_string(),
                });
                return;
            }
        }
        let _ = write_half.shutdown().await;
    });
}
