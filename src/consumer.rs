//! Queue consumption with acknowledge-or-requeue delivery.
//!
//! One subscriber channel bound to one durable queue. The consume loop is
//! driven by a select over three streams: broker deliveries, registry
//! change notifications (dynamic bind/unbind), and the stop signal. A lost
//! channel is recreated with backoff, re-declared and re-bound, without
//! operator intervention; while the registry is empty the consumer holds no
//! channel at all.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, ExchangeKind};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::connection::ConnectionManager;
use crate::dispatch::{self, Disposition};
use crate::registry::{RegistryChange, SubscriptionRegistry};
use crate::{BusError, Result};

/// Handle to a running consumer task.
///
/// `stop()` shuts the consumer down; dropping the handle has the same
/// effect.
pub struct ConsumerHandle {
    cancel: watch::Sender<bool>,
}

impl ConsumerHandle {
    /// Signal the consumer task to stop.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Why the inner consume loop returned control to the outer loop.
enum LoopExit {
    Cancelled,
    ChannelLost,
    Unsubscribed,
}

/// Consumes one durable queue and dispatches deliveries to the registry's
/// handlers.
pub struct AmqpConsumer {
    connection: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    exchange: String,
    queue: String,
}

impl AmqpConsumer {
    pub fn new(
        connection: Arc<ConnectionManager>,
        registry: Arc<SubscriptionRegistry>,
        exchange: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            registry,
            exchange: exchange.into(),
            queue: queue.into(),
        }
    }

    /// Spawn the consumer task.
    pub fn start(&self) -> ConsumerHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let connection = Arc::clone(&self.connection);
        let registry = Arc::clone(&self.registry);
        let exchange = self.exchange.clone();
        let queue = self.queue.clone();

        tokio::spawn(async move {
            Self::run(connection, registry, exchange, queue, cancel_rx).await;
        });

        ConsumerHandle { cancel: cancel_tx }
    }

    /// Outer loop: (re)create the channel, consume until it is lost, back
    /// off, repeat. Idles without a channel while nothing is registered.
    async fn run(
        connection: Arc<ConnectionManager>,
        registry: Arc<SubscriptionRegistry>,
        exchange: String,
        queue: String,
        mut cancel: watch::Receiver<bool>,
    ) {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();
        let mut backoff = backoff_builder.build();

        loop {
            if *cancel.borrow() {
                break;
            }

            // Subscribe before checking emptiness so a registration landing
            // in between is not missed
            let mut changes = registry.changes();

            if registry.is_empty().await {
                info!(queue = %queue, "No subscriptions registered, consumer idle");
                tokio::select! {
                    res = cancel.changed() => {
                        if res.is_err() || *cancel.borrow() {
                            break;
                        }
                    }
                    _ = changes.recv() => {}
                }
                continue;
            }

            match Self::bind_channel(&connection, &registry, &exchange, &queue).await {
                Ok((channel, consumer)) => {
                    backoff = backoff_builder.build();

                    match Self::consume_loop(
                        &registry,
                        &exchange,
                        &queue,
                        channel,
                        consumer,
                        changes,
                        &mut cancel,
                    )
                    .await
                    {
                        LoopExit::Cancelled => break,
                        LoopExit::Unsubscribed => continue,
                        LoopExit::ChannelLost => {
                            info!(queue = %queue, "Consumer channel lost, recreating");
                        }
                    }
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Failed to set up consumer channel");
                }
            }

            let delay = backoff.next().unwrap_or(Duration::from_secs(30));
            tokio::select! {
                res = cancel.changed() => {
                    if res.is_err() || *cancel.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(queue = %queue, "Consumer stopped");
    }

    /// Declare the exchange and the durable queue, bind every registered
    /// routing key, and start consuming with manual acknowledgement.
    async fn bind_channel(
        connection: &ConnectionManager,
        registry: &SubscriptionRegistry,
        exchange: &str,
        queue: &str,
    ) -> Result<(Channel, lapin::Consumer)> {
        if !connection.is_connected().await && !connection.try_connect().await {
            return Err(BusError::NotConnected);
        }

        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare exchange: {}", e)))?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        for event_type in registry.registered_event_types().await {
            channel
                .queue_bind(
                    queue,
                    exchange,
                    &event_type,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    BusError::Subscribe(format!("Failed to bind '{}': {}", event_type, e))
                })?;
        }

        // Manual acknowledgement only: receipt is not handling
        let consumer = channel
            .basic_consume(
                queue,
                &format!("{}-consumer", queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %queue, exchange = %exchange, "Consumer bound and consuming");

        Ok((channel, consumer))
    }

    /// Inner loop over one live channel.
    async fn consume_loop(
        registry: &SubscriptionRegistry,
        exchange: &str,
        queue: &str,
        channel: Channel,
        mut consumer: lapin::Consumer,
        mut changes: broadcast::Receiver<RegistryChange>,
        cancel: &mut watch::Receiver<bool>,
    ) -> LoopExit {
        loop {
            tokio::select! {
                res = cancel.changed() => {
                    if res.is_err() || *cancel.borrow() {
                        let _ = channel.close(200, "consumer stopped").await;
                        return LoopExit::Cancelled;
                    }
                }
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => Self::handle_delivery(registry, delivery).await,
                    Some(Err(e)) => {
                        error!(queue = %queue, error = %e, "Consumer delivery error");
                        return LoopExit::ChannelLost;
                    }
                    None => {
                        warn!(queue = %queue, "Consumer stream ended");
                        return LoopExit::ChannelLost;
                    }
                },
                change = changes.recv() => match change {
                    Ok(RegistryChange::EventAdded { event_type }) => {
                        match channel
                            .queue_bind(
                                queue,
                                exchange,
                                &event_type,
                                QueueBindOptions::default(),
                                FieldTable::default(),
                            )
                            .await
                        {
                            Ok(()) => info!(event_type = %event_type, "Routing key bound"),
                            Err(e) => error!(
                                event_type = %event_type,
                                error = %e,
                                "Failed to bind routing key"
                            ),
                        }
                    }
                    Ok(RegistryChange::EventRemoved { event_type }) => {
                        match channel
                            .queue_unbind(queue, exchange, &event_type, FieldTable::default())
                            .await
                        {
                            Ok(()) => info!(event_type = %event_type, "Routing key unbound"),
                            Err(e) => error!(
                                event_type = %event_type,
                                error = %e,
                                "Failed to unbind routing key"
                            ),
                        }

                        if registry.is_empty().await {
                            info!(queue = %queue, "Registry empty, closing consumer channel");
                            let _ = channel.close(200, "no subscriptions").await;
                            return LoopExit::Unsubscribed;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Registry change stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Registry outlives the consumer task; unreachable in
                        // practice, deliveries keep the loop alive regardless
                    }
                },
            }
        }
    }

    /// Decide the delivery's fate from the dispatch outcome.
    async fn handle_delivery(registry: &SubscriptionRegistry, delivery: Delivery) {
        let outcome =
            dispatch::process_message(registry, delivery.routing_key.as_str(), &delivery.data)
                .await;

        match outcome.disposition() {
            Disposition::Ack => {
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!(error = %e, "Failed to ack message");
                }
            }
            Disposition::Requeue => {
                if let Err(e) = delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
                {
                    error!(error = %e, "Failed to nack message");
                }
            }
            Disposition::Drop => {
                if let Err(e) = delivery.reject(BasicRejectOptions { requeue: false }).await {
                    error!(error = %e, "Failed to reject message");
                }
            }
        }
    }
}

/// Integration tests requiring a running RabbitMQ instance.
///
/// Run with: AMQP_URL=amqp://localhost:5672 cargo test consumer_integration -- --ignored
#[cfg(test)]
mod consumer_integration {
    use super::*;
    use crate::config::AmqpSettings;
    use crate::event::IntegrationEvent;
    use crate::publisher::AmqpPublisher;
    use crate::{EventHandler, Result};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PatientRegistered {
        patient_id: u64,
    }

    impl IntegrationEvent for PatientRegistered {
        const NAME: &'static str = "patients.PatientRegistered";
    }

    struct ForwardingHandler {
        tx: mpsc::Sender<PatientRegistered>,
    }

    #[async_trait]
    impl EventHandler<PatientRegistered> for ForwardingHandler {
        async fn handle(&self, event: &PatientRegistered) -> Result<()> {
            let _ = self.tx.send(event.clone()).await;
            Ok(())
        }
    }

    /// Fails on the first delivery, succeeds on redelivery.
    struct FlakyHandler {
        attempts: Arc<AtomicUsize>,
        tx: mpsc::Sender<PatientRegistered>,
    }

    #[async_trait]
    impl EventHandler<PatientRegistered> for FlakyHandler {
        async fn handle(&self, event: &PatientRegistered) -> Result<()> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(BusError::Handler {
                    name: "FlakyHandler".to_string(),
                    message: "first attempt fails".to_string(),
                });
            }
            let _ = self.tx.send(event.clone()).await;
            Ok(())
        }
    }

    fn amqp_url() -> String {
        std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string())
    }

    fn test_settings() -> AmqpSettings {
        AmqpSettings {
            url: amqp_url(),
            ..Default::default()
        }
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn publish_and_consume_acks_once() {
        let connection = ConnectionManager::new(test_settings());
        let registry = Arc::new(SubscriptionRegistry::new());

        let (tx, mut rx) = mpsc::channel(8);
        registry
            .add_subscription::<PatientRegistered, ForwardingHandler, _>(move || {
                ForwardingHandler { tx: tx.clone() }
            })
            .await;

        let queue = format!("caravel-test-{}", uuid::Uuid::new_v4());
        let consumer = AmqpConsumer::new(
            Arc::clone(&connection),
            Arc::clone(&registry),
            "caravel.events",
            &queue,
        );
        let handle = consumer.start();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let publisher = AmqpPublisher::new(Arc::clone(&connection), "caravel.events");
        publisher
            .publish_event(&PatientRegistered { patient_id: 77 })
            .await
            .expect("publish");

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("channel closed");
        assert_eq!(received.patient_id, 77);

        handle.stop();
        connection.dispose().await;
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn failed_handler_gets_redelivery() {
        let connection = ConnectionManager::new(test_settings());
        let registry = Arc::new(SubscriptionRegistry::new());

        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(8);

        let attempts_clone = Arc::clone(&attempts);
        registry
            .add_subscription::<PatientRegistered, FlakyHandler, _>(move || FlakyHandler {
                attempts: Arc::clone(&attempts_clone),
                tx: tx.clone(),
            })
            .await;

        let queue = format!("caravel-test-{}", uuid::Uuid::new_v4());
        let consumer = AmqpConsumer::new(
            Arc::clone(&connection),
            Arc::clone(&registry),
            "caravel.events",
            &queue,
        );
        let handle = consumer.start();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let publisher = AmqpPublisher::new(Arc::clone(&connection), "caravel.events");
        publisher
            .publish_event(&PatientRegistered { patient_id: 5 })
            .await
            .expect("publish");

        // First delivery is nacked with requeue, second succeeds
        let received = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for redelivery")
            .expect("channel closed");
        assert_eq!(received.patient_id, 5);
        assert!(attempts.load(Ordering::SeqCst) >= 2);

        handle.stop();
        connection.dispose().await;
    }
}
