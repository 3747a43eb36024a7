//! Caravel - reliable integration-event bus.
//!
//! Services publish domain facts ("AppointmentCreated", "PatientRegistered")
//! and other services consume them at-least-once, across process crashes,
//! broker outages, and partial transaction failures. The crate provides:
//!
//! - `Envelope` / `IntegrationEvent`: the immutable wire record
//! - `outbox`: transactional outbox store and post-commit relay
//! - `ConnectionManager`: one shared broker connection with self-healing
//! - `SubscriptionRegistry`: event type -> handler dispatch table
//! - `AmqpPublisher` / `AmqpConsumer`: routed persistent publish and
//!   ack-or-requeue consumption over RabbitMQ

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatch;
pub mod event;
pub mod mock;
pub mod outbox;
pub mod publisher;
pub mod registry;

pub use config::BusConfig;
pub use connection::ConnectionManager;
pub use consumer::{AmqpConsumer, ConsumerHandle};
pub use event::{Envelope, IntegrationEvent};
pub use publisher::AmqpPublisher;
pub use registry::{RegistryChange, SubscriptionRegistry};

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Handler '{name}' failed: {message}")]
    Handler { name: String, message: String },
}

/// Handler for one integration event type.
///
/// Invoked once per (message, registered handler) pair per delivery attempt.
/// Delivery is at-least-once, so implementations must be idempotent against
/// duplicate delivery of the same `Envelope` id.
#[async_trait]
pub trait EventHandler<E: IntegrationEvent>: Send + Sync {
    async fn handle(&self, event: &E) -> Result<()>;
}

/// Interface for handing an envelope to the broker.
///
/// Implementations:
/// - `AmqpPublisher`: RabbitMQ via AMQP
/// - `mock::MockPublisher`: in-memory recorder for testing
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one envelope for routed delivery.
    ///
    /// Any error leaves the caller responsible for retry; when invoked via
    /// the outbox relay, the relay marks the entry `Failed` and moves on.
    async fn publish(&self, envelope: &Envelope) -> Result<()>;
}

// ============================================================================
// Wiring
// ============================================================================

/// Construct the bus components from configuration.
///
/// The connection manager is shared by the publisher and consumer; the
/// registry is the one the consumer dispatches against.
pub fn init_bus(
    config: &BusConfig,
    registry: Arc<SubscriptionRegistry>,
) -> (Arc<ConnectionManager>, Arc<AmqpPublisher>, AmqpConsumer) {
    let connection = ConnectionManager::new(config.amqp.clone());
    let publisher = Arc::new(AmqpPublisher::new(
        Arc::clone(&connection),
        &config.amqp.exchange,
    ));
    let consumer = AmqpConsumer::new(
        Arc::clone(&connection),
        registry,
        &config.amqp.exchange,
        &config.consumer.queue,
    );

    info!(
        exchange = %config.amqp.exchange,
        queue = %config.consumer.queue,
        "Integration event bus initialized"
    );

    (connection, publisher, consumer)
}
