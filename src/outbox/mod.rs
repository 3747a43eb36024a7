//! Transactional outbox.
//!
//! The only way to publish an event is to first durably record the intent to
//! publish, in the same database transaction as the business change that
//! produced it. After commit, the relay reads that transaction's pending
//! entries and hands each to the publisher, marking the outcome.
//!
//! Entries are never deleted here; retention/cleanup is an external concern.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::event::Envelope;

pub mod memory;
pub mod postgres;
pub mod relay;

pub use memory::MemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use relay::{OutboxRelay, RelayReport, SweeperHandle};

/// Errors from the outbox store and relay.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Outbox entry not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid outbox state '{0}'")]
    InvalidState(String),
}

/// Publish state of one outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    /// Recorded, not yet handed to the broker.
    NotPublished,
    /// A publish attempt is underway.
    InProgress,
    /// The broker accepted the message.
    Published,
    /// The last publish attempt failed; eligible for retry.
    Failed,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotPublished => "NotPublished",
            Self::InProgress => "InProgress",
            Self::Published => "Published",
            Self::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, OutboxError> {
        match s {
            "NotPublished" => Ok(Self::NotPublished),
            "InProgress" => Ok(Self::InProgress),
            "Published" => Ok(Self::Published),
            "Failed" => Ok(Self::Failed),
            other => Err(OutboxError::InvalidState(other.to_string())),
        }
    }
}

/// One durably recorded intent to publish.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    /// Envelope id; primary key.
    pub event_id: Uuid,
    /// Logical type name, duplicated out of the envelope for queries.
    pub event_type: String,
    /// Serialized envelope.
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// The local database transaction this entry was written in.
    pub transaction_id: Uuid,
    pub state: EventState,
    /// Publish attempts made so far.
    pub times_sent: i32,
}

impl OutboxEntry {
    /// Build the entry recorded alongside a business change.
    pub fn new(envelope: &Envelope, transaction_id: Uuid) -> Result<Self, OutboxError> {
        Ok(Self {
            event_id: envelope.id,
            event_type: envelope.event_type.clone(),
            content: serde_json::to_string(envelope)?,
            created_at: envelope.created_at,
            transaction_id,
            state: EventState::NotPublished,
            times_sent: 0,
        })
    }

    /// Decode the stored envelope for publishing.
    pub fn envelope(&self) -> Result<Envelope, OutboxError> {
        Ok(serde_json::from_str(&self.content)?)
    }
}

/// Relay-facing store operations.
///
/// Writing an entry is backend-specific (it must ride the caller's open
/// transaction), so saving lives on the concrete stores; everything the
/// relay needs after commit goes through this trait.
#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync {
    /// Entries still `NotPublished` for a transaction, in creation order.
    async fn pending_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<OutboxEntry>, OutboxError>;

    /// Transition to `InProgress` and count the attempt.
    async fn mark_in_progress(&self, event_id: Uuid) -> Result<(), OutboxError>;

    /// Transition to `Published`.
    async fn mark_published(&self, event_id: Uuid) -> Result<(), OutboxError>;

    /// Transition to `Failed`; the entry stays eligible for a later retry.
    async fn mark_failed(&self, event_id: Uuid) -> Result<(), OutboxError>;

    /// Unsent entries (`NotPublished` or `Failed`) older than a threshold,
    /// oldest first, for the background sweep.
    async fn stalled_entries(
        &self,
        older_than: std::time::Duration,
        limit: u32,
    ) -> Result<Vec<OutboxEntry>, OutboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::IntegrationEvent;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct AppointmentCreated {
        appointment_id: u64,
    }

    impl IntegrationEvent for AppointmentCreated {
        const NAME: &'static str = "appointments.AppointmentCreated";
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            EventState::NotPublished,
            EventState::InProgress,
            EventState::Published,
            EventState::Failed,
        ] {
            assert_eq!(EventState::parse(state.as_str()).unwrap(), state);
        }
        assert!(EventState::parse("Bogus").is_err());
    }

    #[test]
    fn entry_preserves_envelope() {
        let envelope = Envelope::new(&AppointmentCreated { appointment_id: 4 }).unwrap();
        let transaction_id = Uuid::new_v4();

        let entry = OutboxEntry::new(&envelope, transaction_id).unwrap();

        assert_eq!(entry.event_id, envelope.id);
        assert_eq!(entry.event_type, AppointmentCreated::NAME);
        assert_eq!(entry.state, EventState::NotPublished);
        assert_eq!(entry.times_sent, 0);

        let decoded = entry.envelope().unwrap();
        assert_eq!(decoded.id, envelope.id);
        assert_eq!(decoded.event_type, envelope.event_type);
    }
}
