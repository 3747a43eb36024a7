//! Integration event envelope.
//!
//! Every event crossing a process boundary travels inside an `Envelope`:
//! identity, creation time, logical type name, and the serialized business
//! payload. The envelope is immutable after construction; its `id` is the
//! idempotency key consumers use to detect duplicate delivery.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A business event that can travel through the bus.
///
/// `NAME` is the fully-qualified logical type name. It doubles as the
/// routing key on the wire and as the reverse-lookup key the consumer uses
/// to pick a deserializer for incoming messages.
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
}

/// Immutable record describing one integration event.
///
/// Serialized as JSON, this is the wire format: the broker routes on
/// `event_type` and carries the envelope as the message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique, generated at construction, never reused.
    pub id: Uuid,
    /// Construction time (UTC).
    pub created_at: DateTime<Utc>,
    /// Logical type name; the routing key.
    pub event_type: String,
    /// Serialized business fields, opaque to the bus.
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Wrap a business event for transport.
    pub fn new<E: IntegrationEvent>(event: &E) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            event_type: E::NAME.to_string(),
            payload: serde_json::to_value(event)?,
        })
    }
}
