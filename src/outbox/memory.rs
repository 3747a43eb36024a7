//! In-memory outbox store.
//!
//! Store twin for tests and standalone deployments with no database. A
//! staged-save plus explicit commit/rollback stands in for the SQL
//! transaction: staged entries become visible only on commit, so the
//! commit-or-roll-back-together guarantee can be exercised in-process.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{EventState, OutboxEntry, OutboxError, OutboxStore};
use crate::event::Envelope;

#[derive(Default)]
pub struct MemoryOutboxStore {
    entries: RwLock<HashMap<Uuid, OutboxEntry>>,
    staged: RwLock<HashMap<Uuid, Vec<OutboxEntry>>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an entry under an open unit of work.
    pub async fn save(
        &self,
        envelope: &Envelope,
        transaction_id: Uuid,
    ) -> Result<(), OutboxError> {
        let entry = OutboxEntry::new(envelope, transaction_id)?;
        self.staged
            .write()
            .await
            .entry(transaction_id)
            .or_default()
            .push(entry);
        Ok(())
    }

    /// Make a unit of work's staged entries durable.
    pub async fn commit(&self, transaction_id: Uuid) {
        let staged = self.staged.write().await.remove(&transaction_id);
        if let Some(staged) = staged {
            let mut entries = self.entries.write().await;
            for entry in staged {
                entries.insert(entry.event_id, entry);
            }
        }
    }

    /// Discard a unit of work's staged entries.
    pub async fn rollback(&self, transaction_id: Uuid) {
        self.staged.write().await.remove(&transaction_id);
    }

    /// Current state of one entry, if recorded.
    pub async fn entry(&self, event_id: Uuid) -> Option<OutboxEntry> {
        self.entries.read().await.get(&event_id).cloned()
    }

    async fn update_state(
        &self,
        event_id: Uuid,
        state: EventState,
        count_attempt: bool,
    ) -> Result<(), OutboxError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&event_id)
            .ok_or(OutboxError::NotFound(event_id))?;
        entry.state = state;
        if count_attempt {
            entry.times_sent += 1;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn pending_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let mut pending: Vec<OutboxEntry> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.transaction_id == transaction_id && e.state == EventState::NotPublished)
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at);
        Ok(pending)
    }

    async fn mark_in_progress(&self, event_id: Uuid) -> Result<(), OutboxError> {
        self.update_state(event_id, EventState::InProgress, true).await
    }

    async fn mark_published(&self, event_id: Uuid) -> Result<(), OutboxError> {
        self.update_state(event_id, EventState::Published, false).await
    }

    async fn mark_failed(&self, event_id: Uuid) -> Result<(), OutboxError> {
        self.update_state(event_id, EventState::Failed, false).await
    }

    async fn stalled_entries(
        &self,
        older_than: Duration,
        limit: u32,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let threshold = Utc::now() - older_than;
        let mut stalled: Vec<OutboxEntry> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| {
                matches!(e.state, EventState::NotPublished | EventState::Failed)
                    && e.created_at < threshold
            })
            .cloned()
            .collect();
        stalled.sort_by_key(|e| e.created_at);
        stalled.truncate(limit as usize);
        Ok(stalled)
    }
}
