//! Message dispatch: decode -> handler fan-out -> ack decision.
//!
//! Factored out of the consumer so the decode/dispatch cycle and the
//! resulting acknowledgement decision can be exercised without a broker.

use tracing::{debug, error};

use crate::event::Envelope;
use crate::registry::SubscriptionRegistry;

/// What the consumer should tell the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the queue.
    Ack,
    /// Negative-acknowledge with requeue: redeliver later.
    Requeue,
    /// Reject without requeue: retrying cannot help.
    Drop,
}

/// Outcome of processing one delivery through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every registered handler succeeded.
    Handled,
    /// Nobody is subscribed to this type anymore; not an error.
    NoHandlers,
    /// At least one handler failed; the message must come back.
    HandlerFailed,
    /// Envelope or payload could not be decoded.
    Undecodable,
}

impl DispatchOutcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Handled | Self::NoHandlers => Disposition::Ack,
            Self::HandlerFailed => Disposition::Requeue,
            Self::Undecodable => Disposition::Drop,
        }
    }
}

/// Process one raw message body against the registry.
///
/// Handlers are resolved by routing key. A message for a type nobody cares
/// about is acknowledged and dropped; an undecodable message is rejected
/// (a dead-letter policy is the extension point for those). Handler
/// failures are all-or-nothing per message: one failing handler requeues
/// the whole delivery.
pub async fn process_message(
    registry: &SubscriptionRegistry,
    routing_key: &str,
    body: &[u8],
) -> DispatchOutcome {
    let Some(binding) = registry.binding_snapshot(routing_key).await else {
        debug!(event_type = %routing_key, "No handlers registered, dropping message");
        return DispatchOutcome::NoHandlers;
    };

    let envelope: Envelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            error!(event_type = %routing_key, error = %e, "Failed to decode envelope");
            return DispatchOutcome::Undecodable;
        }
    };

    let event = match (binding.decode)(envelope.payload.clone()) {
        Ok(event) => event,
        Err(e) => {
            error!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                error = %e,
                "Failed to decode payload"
            );
            return DispatchOutcome::Undecodable;
        }
    };

    let mut all_succeeded = true;
    for registration in &binding.handlers {
        // Fresh instance per delivery: handler state never outlives a message
        let handler = (registration.factory)();
        if let Err(e) = handler.call(event.clone()).await {
            error!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                handler = registration.id,
                error = %e,
                "Handler failed"
            );
            all_succeeded = false;
        }
    }

    if all_succeeded {
        debug!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            "Message handled"
        );
        DispatchOutcome::Handled
    } else {
        DispatchOutcome::HandlerFailed
    }
}
