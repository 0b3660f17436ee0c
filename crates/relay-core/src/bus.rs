//! Pattern-matched pub/sub coupling the core's components
//!
//! The in-memory bus is the default backend: single-process, not persistent,
//! no cross-subscriber ordering. A distributed backend would implement the
//! same trait with at-least-once delivery; consumers already dedupe on event
//! idempotency keys.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::error::CoreError;
use crate::event::BusEvent;

/// Handler invoked for each matching event.
pub type EventHandler = Arc<
    dyn Fn(BusEvent) -> Pin<Box<dyn Future<Output = Result<(), CoreError>> + Send>>
        + Send
        + Sync,
>;

/// Opaque subscription identifier.
pub type SubscriptionId = String;

/// Pub/sub contract.
///
/// Patterns are exact event types, `*`, or `prefix.*` (see
/// [`BusEvent::matches`]).
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Deliver an event to all matching subscribers.
    async fn publish(&self, event: BusEvent);

    /// Subscribe a handler to a pattern.
    fn subscribe(&self, pattern: &str, handler: EventHandler) -> SubscriptionId;

    /// Remove a subscription. Returns whether it existed.
    fn unsubscribe(&self, subscription_id: &str) -> bool;

    /// Close the bus: drop all subscriptions, ignore further publishes.
    fn close(&self);
}

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    handler: EventHandler,
}

/// In-process event bus.
///
/// Fan-out is concurrent; a failing handler is logged and does not prevent
/// delivery to the others.
pub struct InMemoryEventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    closed: RwLock<bool>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            closed: RwLock::new(false),
        }
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: BusEvent) {
        if *self.closed.read() {
            return;
        }

        let matching: Vec<(SubscriptionId, EventHandler)> = {
            let subs = self.subscriptions.read();
            subs.iter()
                .filter(|s| event.matches(&s.pattern))
                .map(|s| (s.id.clone(), Arc::clone(&s.handler)))
                .collect()
        };

        if matching.is_empty() {
            return;
        }

        let futures = matching.into_iter().map(|(sub_id, handler)| {
            let event = event.clone();
            async move {
                if let Err(error) = handler(event.clone()).await {
                    warn!(
                        subscription_id = %sub_id,
                        event_type = %event.event_type,
                        %error,
                        "event handler failed"
                    );
                }
            }
        });

        futures::future::join_all(futures).await;
    }

    fn subscribe(&self, pattern: &str, handler: EventHandler) -> SubscriptionId {
        let id = format!("sub_{}", Uuid::now_v7().simple());
        self.subscriptions.write().push(Subscription {
            id: id.clone(),
            pattern: pattern.to_string(),
            handler,
        });
        id
    }

    fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != subscription_id);
        subs.len() != before
    }

    fn close(&self) {
        *self.closed.write() = true;
        self.subscriptions.write().clear();
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CoreError>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}
