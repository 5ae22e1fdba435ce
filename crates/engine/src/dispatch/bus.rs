//! Publish/subscribe event bus

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use super::EngineEvent;

/// Trait for reacting to engine events
///
/// Listeners run after the transition behind the event is persisted. They
/// should be fast: anything heavy belongs in a dispatched command.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &EngineEvent);

    /// Event types this listener cares about, `None` for all
    fn event_types(&self) -> Option<Vec<&'static str>> {
        None
    }

    fn name(&self) -> &'static str {
        "EventListener"
    }
}

/// Fan-out of events to every subscribed listener
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver an event to every interested listener, in subscription order
    pub async fn publish(&self, event: EngineEvent) {
        let listeners = self.listeners.read().clone();
        let event_type = event.event_type();

        for listener in listeners {
            if let Some(types) = listener.event_types() {
                if !types.contains(&event_type) {
                    continue;
                }
            }
            trace!(listener = listener.name(), event_type, "Delivering event");
            listener.on_event(&event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct Counting {
        count: AtomicU32,
        filter: Option<Vec<&'static str>>,
    }

    #[async_trait]
    impl EventListener for Counting {
        async fn on_event(&self, _event: &EngineEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }

        fn event_types(&self) -> Option<Vec<&'static str>> {
            self.filter.clone()
        }
    }

    fn started() -> EngineEvent {
        EngineEvent::ProcessStarted {
            process_id: Uuid::nil(),
            definition_key: "p".into(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_listeners() {
        let bus = EventBus::new();
        let a = Arc::new(Counting {
            count: AtomicU32::new(0),
            filter: None,
        });
        let b = Arc::new(Counting {
            count: AtomicU32::new(0),
            filter: None,
        });
        bus.subscribe(a.clone());
        bus.subscribe(b.clone());

        bus.publish(started()).await;

        assert_eq!(bus.len(), 2);
        assert_eq!(a.count.load(Ordering::SeqCst), 1);
        assert_eq!(b.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listener_filter() {
        let bus = EventBus::new();
        let only_completed = Arc::new(Counting {
            count: AtomicU32::new(0),
            filter: Some(vec!["process.completed"]),
        });
        bus.subscribe(only_completed.clone());

        bus.publish(started()).await;
        assert_eq!(only_completed.count.load(Ordering::SeqCst), 0);

        bus.publish(EngineEvent::ProcessCompleted {
            process_id: Uuid::nil(),
            definition_key: "p".into(),
        })
        .await;
        assert_eq!(only_completed.count.load(Ordering::SeqCst), 1);
    }
}
