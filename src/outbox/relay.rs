//! Outbox relay: hand recorded events to the broker.
//!
//! Runs after the enclosing business transaction commits, in the same
//! request context. Each entry is marked `InProgress` before the attempt
//! and `Published` or `Failed` after it; a failure on one entry never
//! stops the next, because every entry is already durable and retryable
//! on its own.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{OutboxEntry, OutboxError, OutboxStore};
use crate::config::OutboxSettings;
use crate::EventPublisher;

/// Outcome counts for one relay pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub published: u32,
    pub failed: u32,
}

/// Handle to a running background sweep task.
pub struct SweeperHandle {
    cancel: watch::Sender<bool>,
}

impl SweeperHandle {
    /// Signal the sweep task to stop.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Publishes pending outbox entries and records each outcome.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn OutboxStore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { store, publisher }
    }

    /// Relay every pending entry of a committed transaction, in creation
    /// order.
    pub async fn publish_pending(&self, transaction_id: Uuid) -> Result<RelayReport, OutboxError> {
        let entries = self.store.pending_for_transaction(transaction_id).await?;
        if entries.is_empty() {
            return Ok(RelayReport::default());
        }

        debug!(
            transaction_id = %transaction_id,
            count = entries.len(),
            "Relaying pending outbox entries"
        );

        let mut report = RelayReport::default();
        for entry in entries {
            if self.relay_entry(entry).await {
                report.published += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.failed > 0 {
            info!(
                transaction_id = %transaction_id,
                published = report.published,
                failed = report.failed,
                "Relay pass finished with failures left for retry"
            );
        }

        Ok(report)
    }

    /// One re-relay pass over stalled entries.
    ///
    /// Recovers `Failed` entries and `NotPublished` entries orphaned by a
    /// crash between commit and relay.
    pub async fn sweep_once(
        &self,
        older_than: Duration,
        limit: u32,
    ) -> Result<RelayReport, OutboxError> {
        let entries = self.store.stalled_entries(older_than, limit).await?;

        let mut report = RelayReport::default();
        for entry in entries {
            if self.relay_entry(entry).await {
                report.published += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.published > 0 {
            info!(recovered = report.published, "Recovered stalled outbox entries");
        }

        Ok(report)
    }

    /// Spawn a background task that periodically re-relays stalled entries.
    ///
    /// Returns a handle that can be used to stop the task.
    pub fn spawn_sweeper(self: &Arc<Self>, settings: &OutboxSettings) -> SweeperHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let relay = Arc::clone(self);
        let interval = Duration::from_secs(settings.sweep_interval_secs);
        let older_than = Duration::from_secs(settings.stalled_after_secs);
        let limit = settings.sweep_batch_size;

        tokio::spawn(async move {
            info!(
                interval_secs = interval.as_secs(),
                "Outbox sweep task started"
            );

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = relay.sweep_once(older_than, limit).await {
                            error!(error = %e, "Outbox sweep failed");
                        }
                    }
                    res = cancel_rx.changed() => {
                        if res.is_err() || *cancel_rx.borrow() {
                            info!("Outbox sweep task stopped");
                            break;
                        }
                    }
                }
            }
        });

        SweeperHandle { cancel: cancel_tx }
    }

    /// Attempt one entry; returns whether it reached `Published`.
    async fn relay_entry(&self, entry: OutboxEntry) -> bool {
        if let Err(e) = self.store.mark_in_progress(entry.event_id).await {
            error!(event_id = %entry.event_id, error = %e, "Failed to mark entry in progress");
            return false;
        }

        let envelope = match entry.envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    event_id = %entry.event_id,
                    error = %e,
                    "Stored envelope is undecodable, marking failed"
                );
                self.mark_failed_logged(entry.event_id).await;
                return false;
            }
        };

        match self.publisher.publish(&envelope).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_published(entry.event_id).await {
                    error!(event_id = %entry.event_id, error = %e, "Failed to mark entry published");
                }
                debug!(
                    event_id = %entry.event_id,
                    event_type = %entry.event_type,
                    "Outbox entry published"
                );
                true
            }
            Err(e) => {
                error!(
                    event_id = %entry.event_id,
                    event_type = %entry.event_type,
                    error = %e,
                    "Publish failed, entry left for retry"
                );
                self.mark_failed_logged(entry.event_id).await;
                false
            }
        }
    }

    async fn mark_failed_logged(&self, event_id: Uuid) {
        if let Err(e) = self.store.mark_failed(event_id).await {
            error!(event_id = %event_id, error = %e, "Failed to mark entry failed");
        }
    }
}
