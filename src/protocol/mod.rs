//! Protocol module
//!
//! Wire envelope definitions and serialization for all peerlink
//! communication. Envelopes are flat JSON records discriminated by a
//! `type` field, one per frame, and carry no idempotency key: delivery
//! is at-most-once, best-effort.
//!
//! The envelope set is an exhaustive enum matched once at the boundary;
//! there is no "unhandled type" fallthrough.

pub(crate) mod handler;

use serde::{Deserialize, Serialize};

pub use crate::error::ProtocolError;

/// Maximum size of a single wire frame (64 KB)
///
/// Chat payloads are short text; anything larger is treated as a
/// connection error and closes the link.
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// A peer entry as carried inside a `nodes` snapshot reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Call-sign of the peer
    pub call_sign: String,
    /// IP address of the peer
    pub ip: String,
    /// Listening port of the peer
    pub port: u16,
}

/// A protocol envelope
///
/// Envelopes are immutable once constructed. Every wire frame decodes to
/// exactly one variant; the `type` discriminator is the serde tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Announce the sender's identity and endpoint (doubles as the
    /// handshake on a freshly opened outbound link)
    #[serde(rename = "register", rename_all = "camelCase")]
    Register {
        /// Call-sign of the registering node
        call_sign: String,
        /// Advertised IP address
        ip: String,
        /// Advertised listening port
        port: u16,
    },

    /// Request a snapshot of the receiver's known peers
    #[serde(rename = "discover")]
    Discover,

    /// Snapshot reply listing known peers
    #[serde(rename = "nodes")]
    Nodes {
        /// Known peers in registry insertion order
        nodes: Vec<NodeInfo>,
    },

    /// Introduce a peer to the receiving node, optionally naming the
    /// introducing sender
    #[serde(rename = "addUser", rename_all = "camelCase")]
    AddUser {
        /// Call-sign of the peer being introduced
        call_sign: String,
        /// IP address of the introduced peer
        ip: String,
        /// Listening port of the introduced peer
        port: u16,
        /// Call-sign of the introducer, if self-identifying
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_call_sign: Option<String>,
        /// IP address of the introducer
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_ip: Option<String>,
        /// Listening port of the introducer
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_port: Option<u16>,
    },

    /// Notification that a peer was added to the registry
    #[serde(rename = "userAdded", rename_all = "camelCase")]
    UserAdded {
        /// Call-sign of the added peer
        call_sign: String,
        /// IP address of the added peer
        ip: String,
        /// Listening port of the added peer
        port: u16,
    },

    /// Confirmation sent to a newly introduced peer once the link to it
    /// is established, carrying the confirming node's own identity
    #[serde(rename = "userAddedBy", rename_all = "camelCase")]
    UserAddedBy {
        /// Call-sign of the confirming node
        call_sign: String,
        /// IP address of the confirming node
        ip: String,
        /// Listening port of the confirming node
        port: u16,
    },

    /// Notification that a peer left the registry
    #[serde(rename = "userRemoved", rename_all = "camelCase")]
    UserRemoved {
        /// Call-sign of the removed peer
        call_sign: String,
    },

    /// Application chat payload submitted for relay
    #[serde(rename = "message", rename_all = "camelCase")]
    Message {
        /// Call-sign of the author
        sender: String,
        /// Call-sign of the intended recipient
        recipient_call_sign: String,
        /// Chat text
        content: String,
    },

    /// Chat payload as relayed over a link (one hop, never re-forwarded)
    #[serde(rename = "forwardedMessage", rename_all = "camelCase")]
    ForwardedMessage {
        /// Call-sign of the author
        sender: String,
        /// Call-sign of the intended recipient
        recipient_call_sign: String,
        /// Chat text
        content: String,
    },
}

impl Envelope {
    /// The wire value of the `type` discriminator
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Register { .. } => "register",
            Envelope::Discover => "discover",
            Envelope::Nodes { .. } => "nodes",
            Envelope::AddUser { .. } => "addUser",
            Envelope::UserAdded { .. } => "userAdded",
            Envelope::UserAddedBy { .. } => "userAddedBy",
            Envelope::UserRemoved { .. } => "userRemoved",
            Envelope::Message { .. } => "message",
            Envelope::ForwardedMessage { .. } => "forwardedMessage",
        }
    }

    /// Validate per-type field requirements
    ///
    /// Every required field must be non-empty. Callers drop and log
    /// invalid envelopes; no error is ever returned to the sender.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        fn required(
            envelope_type: &'static str,
            field: &'static str,
            value: &str,
        ) -> Result<(), ProtocolError> {
            if value.is_empty() {
                Err(ProtocolError::EmptyField {
                    envelope_type,
                    field,
                })
            } else {
                Ok(())
            }
        }

        match self {
            Envelope::Register {
                call_sign,
                ip,
                port,
            } => {
                required("register", "callSign", call_sign)?;
                required("register", "ip", ip)?;
                if *port == 0 {
                    return Err(ProtocolError::EmptyField {
                        envelope_type: "register",
                        field: "port",
                    });
                }
                Ok(())
            }
            Envelope::Discover => Ok(()),
            Envelope::Nodes { .. } => Ok(()),
            Envelope::AddUser {
                call_sign,
                ip,
                port,
                sender_call_sign,
                sender_ip,
                sender_port,
            } => {
                required("addUser", "callSign", call_sign)?;
                required("addUser", "ip", ip)?;
                if *port == 0 {
                    return Err(ProtocolError::EmptyField {
                        envelope_type: "addUser",
                        field: "port",
                    });
                }
                // Sender fields are optional, but empty when present is
                // still a validation failure.
                if let Some(s) = sender_call_sign {
                    required("addUser", "senderCallSign", s)?;
                }
                if let Some(s) = sender_ip {
                    required("addUser", "senderIp", s)?;
                }
                if sender_port == &Some(0) {
                    return Err(ProtocolError::EmptyField {
                        envelope_type: "addUser",
                        field: "senderPort",
                    });
                }
                Ok(())
            }
            Envelope::UserAdded {
                call_sign,
                ip,
                port,
            }
            | Envelope::UserAddedBy {
                call_sign,
                ip,
                port,
            } => {
                let envelope_type = self.type_name();
                required(envelope_type, "callSign", call_sign)?;
                required(envelope_type, "ip", ip)?;
                if *port == 0 {
                    return Err(ProtocolError::EmptyField {
                        envelope_type,
                        field: "port",
                    });
                }
                Ok(())
            }
            Envelope::UserRemoved { call_sign } => {
                required("userRemoved", "callSign", call_sign)
            }
            Envelope::Message {
                sender,
                recipient_call_sign,
                content,
            }
            | Envelope::ForwardedMessage {
                sender,
                recipient_call_sign,
                content,
            } => {
                let envelope_type = self.type_name();
                required(envelope_type, "sender", sender)?;
                required(envelope_type, "recipientCallSign", recipient_call_sign)?;
                required(envelope_type, "content", content)?;
                Ok(())
            }
        }
    }
}

/// Serialize an envelope to a single wire frame (no trailing newline)
///
/// The output is guaranteed newline-free: serde_json escapes control
/// characters inside string values.
pub fn encode_envelope(envelope: &Envelope) -> Result<String, ProtocolError> {
    let frame = serde_json::to_string(envelope).map_err(|e| ProtocolError::EncodeFailed {
        reason: e.to_string(),
    })?;
    debug_assert!(!frame.contains('\n'));
    Ok(frame)
}

/// Decode a single wire frame into an envelope
///
/// The frame must be one flat JSON record with a `type` discriminator.
pub fn decode_envelope(frame: &str) -> Result<Envelope, ProtocolError> {
    serde_json::from_str(frame).map_err(|e| ProtocolError::MalformedEnvelope {
        reason: e.to_string(),
    })
}
