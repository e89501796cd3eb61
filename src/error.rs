//! Error types for peerlink
//!
//! Errors are grouped per domain (network, protocol, relay, config) and
//! wrapped in the top-level [`PeerlinkError`]. Nothing in this crate is
//! process-fatal: failures are contained to the affected link or envelope.

use thiserror::Error;

/// Network-level errors (dial, accept, I/O on a link)
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Failed to establish an outbound connection
    #[error("connection to {address} failed: {reason}")]
    ConnectionFailed {
        /// Target address of the dial
        address: String,
        /// Underlying failure description
        reason: String,
    },

    /// Failed to bind the listening socket
    #[error("failed to bind listener on {address}: {reason}")]
    BindFailed {
        /// Requested listen address
        address: String,
        /// Underlying failure description
        reason: String,
    },

    /// The link to a peer is not open
    #[error("no open link to {call_sign}")]
    LinkNotOpen {
        /// Call-sign of the unreachable peer
        call_sign: String,
    },

    /// Writing an envelope to a link failed
    #[error("send on {link_id} failed: {reason}")]
    SendFailed {
        /// Identifier of the affected link
        link_id: String,
        /// Underlying failure description
        reason: String,
    },

    /// Reading from a link failed
    #[error("receive failed: {reason}")]
    ReceiveFailed {
        /// Underlying failure description
        reason: String,
    },

    /// An inbound frame exceeded the size limit
    #[error("envelope too large: {size} bytes (max: {max} bytes)")]
    EnvelopeTooLarge {
        /// Observed frame size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// The remote side closed the connection mid-frame
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The link table is full
    #[error("link limit reached ({max} links)")]
    LinkLimitReached {
        /// Configured maximum number of links
        max: usize,
    },

    /// An address could not be parsed or resolved
    #[error("invalid address: {address}")]
    InvalidAddress {
        /// The offending address string
        address: String,
    },
}

/// Protocol-level errors (envelope decoding and validation)
///
/// A validation failure never produces a response to the sender; the
/// envelope is dropped and logged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// A frame could not be decoded into an envelope
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        /// Decoder failure description
        reason: String,
    },

    /// A required field was present but empty
    #[error("envelope {envelope_type}: field {field} must be non-empty")]
    EmptyField {
        /// Discriminator of the envelope being validated
        envelope_type: &'static str,
        /// Name of the offending field
        field: &'static str,
    },

    /// An envelope could not be serialized for the wire
    #[error("failed to encode envelope: {reason}")]
    EncodeFailed {
        /// Encoder failure description
        reason: String,
    },
}

/// Relay errors (one-hop forwarding)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    /// The recipient has no open link; surfaced to the origin only as a
    /// `MessageFailed` event, never back across the wire
    #[error("recipient {call_sign} is unknown or unreachable")]
    RecipientUnavailable {
        /// Call-sign of the intended recipient
        call_sign: String,
    },
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The node was built without a call-sign
    #[error("call-sign must be set and non-empty")]
    MissingCallSign,

    /// A configuration field holds an invalid value
    #[error("invalid configuration: {field}: {reason}")]
    InvalidField {
        /// Name of the offending field
        field: &'static str,
        /// Why the value is rejected
        reason: String,
    },

    /// The node is not in a state that permits the requested operation
    #[error("invalid node state: {reason}")]
    InvalidState {
        /// Which transition was rejected
        reason: String,
    },
}

/// Top-level error type for peerlink operations
#[derive(Error, Debug)]
pub enum PeerlinkError {
    /// Network-related errors
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Relay errors
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, PeerlinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NetworkError::ConnectionFailed {
            address: "10.0.0.1:4300".to_string(),
            reason: "refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "connection to 10.0.0.1:4300 failed: refused"
        );
    }

    #[test]
    fn test_error_conversion() {
        let err: PeerlinkError = ProtocolError::EmptyField {
            envelope_type: "register",
            field: "callSign",
        }
        .into();
        assert!(matches!(err, PeerlinkError::Protocol(_)));
    }

    #[test]
    fn test_relay_error_display() {
        let err = RelayError::RecipientUnavailable {
            call_sign: "alice".to_string(),
        };
        assert_eq!(err.to_string(), "recipient alice is unknown or unreachable");
    }
}
