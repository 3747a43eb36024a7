//! Subscription registry: event type name -> handler dispatch table.
//!
//! Incoming wire messages carry only a string type name, so the registry
//! keeps, per type, both the monomorphized payload decoder and the set of
//! handler registrations. Handlers are registered as factories; dispatch
//! constructs a fresh instance per delivery so no handler-local state leaks
//! across messages.
//!
//! Reads (every inbound message) run concurrently with rare mutation
//! (startup registration, feature toggling) behind a reader/writer lock.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::event::IntegrationEvent;
use crate::{BusError, EventHandler, Result};

/// A deserialized event, type-erased for dispatch.
pub(crate) type DynEvent = Arc<dyn Any + Send + Sync>;

/// Monomorphized payload decoder; the registry's stand-in for the concrete
/// event type behind a string name.
pub(crate) type DecodeFn =
    fn(serde_json::Value) -> std::result::Result<DynEvent, serde_json::Error>;

fn decode_event<E: IntegrationEvent>(
    payload: serde_json::Value,
) -> std::result::Result<DynEvent, serde_json::Error> {
    let event: E = serde_json::from_value(payload)?;
    Ok(Arc::new(event) as DynEvent)
}

/// One handler invocation, consumed by the call.
pub(crate) trait ErasedHandler: Send {
    fn call(self: Box<Self>, event: DynEvent) -> BoxFuture<'static, Result<()>>;
}

struct TypedHandler<E, H> {
    inner: H,
    _marker: PhantomData<fn() -> E>,
}

impl<E, H> ErasedHandler for TypedHandler<E, H>
where
    E: IntegrationEvent,
    H: EventHandler<E> + 'static,
{
    fn call(self: Box<Self>, event: DynEvent) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let event = event.downcast::<E>().map_err(|_| BusError::Handler {
                name: std::any::type_name::<H>().to_string(),
                message: format!("payload is not a {}", E::NAME),
            })?;
            self.inner.handle(&event).await
        })
    }
}

type HandlerFactory = Arc<dyn Fn() -> Box<dyn ErasedHandler> + Send + Sync>;

/// A registered handler: identity plus the factory producing transient
/// instances.
#[derive(Clone)]
pub(crate) struct HandlerRegistration {
    pub(crate) id: &'static str,
    pub(crate) factory: HandlerFactory,
}

/// Everything known about one event type.
#[derive(Clone)]
pub(crate) struct EventBinding {
    pub(crate) decode: DecodeFn,
    pub(crate) handlers: Vec<HandlerRegistration>,
}

/// Registry mutation notifications, consumed by the bus for queue
/// (un)binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    /// First handler registered for a type: bind its routing key.
    EventAdded { event_type: String },
    /// Last handler removed for a type: unbind its routing key.
    EventRemoved { event_type: String },
}

/// In-memory mapping from logical event type name to registered handlers.
///
/// Not persisted; rebuilt at process startup from registration code. Passed
/// explicitly to the consumer and anything else that dispatches.
pub struct SubscriptionRegistry {
    bindings: RwLock<HashMap<String, EventBinding>>,
    changes: broadcast::Sender<RegistryChange>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            bindings: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Register a handler for an event type.
    ///
    /// The factory runs once per delivery. Registering the same
    /// (event type, handler type) pair twice is a logged no-op, so duplicate
    /// adds never double-invoke.
    pub async fn add_subscription<E, H, F>(&self, factory: F)
    where
        E: IntegrationEvent,
        H: EventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let handler_id = std::any::type_name::<H>();

        let mut bindings = self.bindings.write().await;
        let first_for_type = !bindings.contains_key(E::NAME);

        let binding = bindings.entry(E::NAME.to_string()).or_insert_with(|| EventBinding {
            decode: decode_event::<E>,
            handlers: Vec::new(),
        });

        if binding.handlers.iter().any(|h| h.id == handler_id) {
            warn!(
                event_type = E::NAME,
                handler = handler_id,
                "Handler already registered, ignoring duplicate"
            );
            return;
        }

        binding.handlers.push(HandlerRegistration {
            id: handler_id,
            factory: Arc::new(move || {
                Box::new(TypedHandler::<E, H> {
                    inner: factory(),
                    _marker: PhantomData,
                }) as Box<dyn ErasedHandler>
            }),
        });

        info!(
            event_type = E::NAME,
            handler = handler_id,
            "Subscription added"
        );

        if first_for_type {
            let _ = self.changes.send(RegistryChange::EventAdded {
                event_type: E::NAME.to_string(),
            });
        }
    }

    /// Remove one handler for an event type.
    ///
    /// Emptying the type's handler set emits `EventRemoved`, which the bus
    /// uses to unbind the routing key.
    pub async fn remove_subscription<E, H>(&self)
    where
        E: IntegrationEvent,
        H: EventHandler<E> + 'static,
    {
        let handler_id = std::any::type_name::<H>();

        let mut bindings = self.bindings.write().await;
        let Some(binding) = bindings.get_mut(E::NAME) else {
            return;
        };

        let before = binding.handlers.len();
        binding.handlers.retain(|h| h.id != handler_id);
        if binding.handlers.len() == before {
            return;
        }

        debug!(
            event_type = E::NAME,
            handler = handler_id,
            "Subscription removed"
        );

        if binding.handlers.is_empty() {
            bindings.remove(E::NAME);
            let _ = self.changes.send(RegistryChange::EventRemoved {
                event_type: E::NAME.to_string(),
            });
        }
    }

    pub async fn has_subscriptions_for(&self, event_type: &str) -> bool {
        self.bindings.read().await.contains_key(event_type)
    }

    /// Handler identities registered for a type, in registration order.
    pub async fn handlers_for(&self, event_type: &str) -> Vec<&'static str> {
        self.bindings
            .read()
            .await
            .get(event_type)
            .map(|b| b.handlers.iter().map(|h| h.id).collect())
            .unwrap_or_default()
    }

    /// Whether a concrete type (decoder) is known for this name.
    pub async fn is_event_registered(&self, event_type: &str) -> bool {
        self.bindings.read().await.contains_key(event_type)
    }

    /// All currently-registered type names, for queue binding at startup.
    pub async fn registered_event_types(&self) -> Vec<String> {
        self.bindings.read().await.keys().cloned().collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.bindings.read().await.is_empty()
    }

    /// Subscribe to registry change notifications.
    pub fn changes(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }

    pub(crate) async fn binding_snapshot(&self, event_type: &str) -> Option<EventBinding> {
        self.bindings.read().await.get(event_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use tokio::sync::broadcast::error::TryRecvError;

    #[derive(Debug, Serialize, Deserialize)]
    struct PatientRegistered {
        patient_id: u64,
    }

    impl IntegrationEvent for PatientRegistered {
        const NAME: &'static str = "patients.PatientRegistered";
    }

    struct IndexHandler;

    #[async_trait]
    impl EventHandler<PatientRegistered> for IndexHandler {
        async fn handle(&self, _event: &PatientRegistered) -> Result<()> {
            Ok(())
        }
    }

    struct NotifyHandler;

    #[async_trait]
    impl EventHandler<PatientRegistered> for NotifyHandler {
        async fn handle(&self, _event: &PatientRegistered) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_no_op() {
        let registry = SubscriptionRegistry::new();

        registry
            .add_subscription::<PatientRegistered, IndexHandler, _>(|| IndexHandler)
            .await;
        registry
            .add_subscription::<PatientRegistered, IndexHandler, _>(|| IndexHandler)
            .await;

        let handlers = registry.handlers_for(PatientRegistered::NAME).await;
        assert_eq!(handlers.len(), 1);
    }

    #[tokio::test]
    async fn distinct_handlers_register_independently() {
        let registry = SubscriptionRegistry::new();

        registry
            .add_subscription::<PatientRegistered, IndexHandler, _>(|| IndexHandler)
            .await;
        registry
            .add_subscription::<PatientRegistered, NotifyHandler, _>(|| NotifyHandler)
            .await;

        assert_eq!(registry.handlers_for(PatientRegistered::NAME).await.len(), 2);
        assert!(registry.has_subscriptions_for(PatientRegistered::NAME).await);
        assert!(registry.is_event_registered(PatientRegistered::NAME).await);
        assert!(!registry.is_event_registered("patients.Unknown").await);
    }

    #[tokio::test]
    async fn first_add_emits_event_added() {
        let registry = SubscriptionRegistry::new();
        let mut changes = registry.changes();

        registry
            .add_subscription::<PatientRegistered, IndexHandler, _>(|| IndexHandler)
            .await;
        registry
            .add_subscription::<PatientRegistered, NotifyHandler, _>(|| NotifyHandler)
            .await;

        assert_eq!(
            changes.try_recv().unwrap(),
            RegistryChange::EventAdded {
                event_type: PatientRegistered::NAME.to_string()
            }
        );
        // Second handler for the same type is not a new binding
        assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn removing_last_handler_emits_event_removed_once() {
        let registry = SubscriptionRegistry::new();

        registry
            .add_subscription::<PatientRegistered, IndexHandler, _>(|| IndexHandler)
            .await;
        registry
            .add_subscription::<PatientRegistered, NotifyHandler, _>(|| NotifyHandler)
            .await;

        let mut changes = registry.changes();

        registry
            .remove_subscription::<PatientRegistered, IndexHandler>()
            .await;
        assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));

        registry
            .remove_subscription::<PatientRegistered, NotifyHandler>()
            .await;
        assert_eq!(
            changes.try_recv().unwrap(),
            RegistryChange::EventRemoved {
                event_type: PatientRegistered::NAME.to_string()
            }
        );
        assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));

        assert!(registry.is_empty().await);
        assert!(!registry.has_subscriptions_for(PatientRegistered::NAME).await);
    }

    #[tokio::test]
    async fn removing_unregistered_handler_is_silent() {
        let registry = SubscriptionRegistry::new();
        let mut changes = registry.changes();

        registry
            .remove_subscription::<PatientRegistered, IndexHandler>()
            .await;

        assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));
    }
}
