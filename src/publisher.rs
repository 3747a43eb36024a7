//! Routed, persistent publishing over AMQP.
//!
//! One fresh channel per publish call: channels are never reused across
//! calls, so a failed or cancelled publish cannot interfere with the next
//! one. The broker is asked to confirm acceptance before the call returns.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};
use tracing::debug;

use crate::connection::ConnectionManager;
use crate::event::{Envelope, IntegrationEvent};
use crate::{BusError, EventPublisher, Result};

/// Publishes envelopes to a durable topic exchange, routing key = event type.
pub struct AmqpPublisher {
    connection: Arc<ConnectionManager>,
    exchange: String,
}

impl AmqpPublisher {
    pub fn new(connection: Arc<ConnectionManager>, exchange: impl Into<String>) -> Self {
        Self {
            connection,
            exchange: exchange.into(),
        }
    }

    /// Wrap a business event in an envelope and publish it.
    pub async fn publish_event<E: IntegrationEvent>(&self, event: &E) -> Result<()> {
        let envelope = Envelope::new(event)?;
        self.publish(&envelope).await
    }
}

#[async_trait]
impl EventPublisher for AmqpPublisher {
    async fn publish(&self, envelope: &Envelope) -> Result<()> {
        // Best-effort delivery without requiring the caller to pre-connect
        if !self.connection.is_connected().await && !self.connection.try_connect().await {
            return Err(BusError::NotConnected);
        }

        let body = serde_json::to_vec(envelope)?;

        let channel = self.connection.create_channel().await?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Publish(format!("Failed to enable confirms: {}", e)))?;

        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to declare exchange: {}", e)))?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2); // persistent

        let confirm = channel
            .basic_publish(
                &self.exchange,
                &envelope.event_type,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Broker did not confirm: {}", e)))?;

        debug!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            exchange = %self.exchange,
            "Published event"
        );

        // Scoped release; error paths drop the channel, which also frees it
        let _ = channel.close(200, "publish complete").await;

        Ok(())
    }
}


/// Integration tests requiring a running RabbitMQ instance.
///
/// Run with: AMQP_URL=amqp://localhost:5672 cargo test publisher_integration -- --ignored
#[cfg(test)]
mod publisher_integration {
    use super::*;
    use crate::config::AmqpSettings;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct PingSent {
        n: u32,
    }

    impl IntegrationEvent for PingSent {
        const NAME: &'static str = "diagnostics.PingSent";
    }

    fn amqp_url() -> String {
        std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string())
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn publish_is_confirmed_by_broker() {
        let connection = ConnectionManager::new(AmqpSettings {
            url: amqp_url(),
            ..Default::default()
        });
        let publisher = AmqpPublisher::new(Arc::clone(&connection), "caravel.events");

        publisher
            .publish_event(&PingSent { n: 1 })
            .await
            .expect("publish should succeed");

        connection.dispose().await;
    }
}
