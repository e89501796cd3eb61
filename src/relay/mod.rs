//! One-hop message relay
//!
//! Routes a chat payload to its recipient over the direct link bound to
//! the recipient's call-sign. There is no multi-hop forwarding, no retry
//! and no queuing: either the recipient has an open link right now, or
//! the send fails with exactly one `MessageFailed` event to this node's
//! observers. Failures are never reported back across the wire.

use crate::api::events::{Event, EventHandlers};
use crate::error::RelayError;
use crate::network::manager::ConnectionManager;
use crate::protocol::Envelope;
use tracing::{debug, warn};

/// Relay a chat payload to its recipient
///
/// Wraps the payload in a `forwardedMessage` and enqueues it on the
/// recipient's link; per-link FIFO order makes relayed messages from the
/// same origin arrive in submission order.
pub(crate) fn relay_message(
    connections: &ConnectionManager,
    events: &EventHandlers,
    sender: &str,
    recipient: &str,
    content: &str,
) -> Result<(), RelayError> {
    let forwarded = Envelope::ForwardedMessage {
        sender: sender.to_string(),
        recipient_call_sign: recipient.to_string(),
        content: content.to_string(),
    };

    match connections.send_to(recipient, forwarded) {
        Ok(()) => {
            debug!(sender, recipient, "message relayed");
            Ok(())
        }
        Err(e) => {
            warn!(sender, recipient, error = %e, "message relay failed");
            events.publish(
                Event::MessageFailed {
                    recipient_call_sign: recipient.to_string(),
                    reason: e.to_string(),
                },
                None,
            );
            Err(RelayError::RecipientUnavailable {
                call_sign: recipient.to_string(),
            })
        }
    }
}
