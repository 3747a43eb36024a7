//! Mock publisher implementation for testing.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::event::Envelope;
use crate::{BusError, EventPublisher, Result};

/// Records published envelopes; can be told to fail the next N publishes.
#[derive(Default)]
pub struct MockPublisher {
    published: RwLock<Vec<Envelope>>,
    fail_next: RwLock<u32>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publish calls fail.
    pub async fn fail_times(&self, n: u32) {
        *self.fail_next.write().await = n;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.published.write().await)
    }
}

#[async_trait]
impl EventPublisher for MockPublisher {
    async fn publish(&self, envelope: &Envelope) -> Result<()> {
        {
            let mut fail_next = self.fail_next.write().await;
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(BusError::Publish("Mock publish failure".to_string()));
            }
        }
        self.published.write().await.push(envelope.clone());
        Ok(())
    }
}
