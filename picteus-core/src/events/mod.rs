//! In-process publish/subscribe channel announcing catalog changes.
//!
//! Delivery is synchronous: `emit` runs every matching listener on the
//! caller's task before returning, in subscription order. Listeners run
//! outside the registry lock so they may subscribe or unsubscribe while
//! being notified.
//!
//! Subscriptions are exact (`entity.action[.state]`) or catch-all; prefix
//! wildcards are not supported.
//!
//! Request/response is layered on top through a [`ReplyHook`]: the first
//! listener resolving it decides the value `emit_with_reply` returns, and the
//! caller bounds the wait with its own timeout.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use picteus_model::{CatalogEvent, Topic};
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::{PicteusError, Result};

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// One notification as seen by listeners.
#[derive(Clone)]
pub struct Event {
    pub payload: CatalogEvent,
    /// Correlation marker chosen by the emitter.
    pub marker: Option<String>,
    pub emitted_at: DateTime<Utc>,
    reply: Option<ReplyHook>,
}

impl Event {
    pub fn topic(&self) -> Topic {
        self.payload.topic()
    }

    /// Present when the emitter awaits an answer.
    pub fn reply_hook(&self) -> Option<&ReplyHook> {
        self.reply.as_ref()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("topic", &self.topic().to_string())
            .field("payload", &self.payload)
            .field("marker", &self.marker)
            .field("awaits_reply", &self.reply.is_some())
            .finish()
    }
}

/// Answer slot handed to listeners of `emit_with_reply`. Only the first
/// resolution is kept.
#[derive(Clone)]
pub struct ReplyHook {
    slot: Arc<Mutex<Option<oneshot::Sender<serde_json::Value>>>>,
}

impl ReplyHook {
    /// Returns `false` when another listener already answered or the emitter
    /// stopped waiting.
    pub fn resolve(&self, value: serde_json::Value) -> bool {
        match lock(&self.slot).take() {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for ReplyHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyHook")
            .field("resolved", &lock(&self.slot).is_none())
            .finish()
    }
}

/// Handle returned by `on`/`on_all`, used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
    topic: Option<Topic>,
}

impl Subscription {
    /// `None` for catch-all subscriptions.
    pub fn topic(&self) -> Option<Topic> {
        self.topic
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(u64, Option<Topic>, Listener)>,
}

/// Hierarchical publish/subscribe channel. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to exactly one topic.
    pub fn on<F>(&self, topic: Topic, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(Some(topic), Arc::new(listener))
    }

    /// Subscribe to every topic.
    pub fn on_all<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(None, Arc::new(listener))
    }

    /// Remove a subscription. Returns whether it was still registered.
    pub fn off(&self, subscription: &Subscription) -> bool {
        let mut registry = lock(&self.registry);
        let before = registry.listeners.len();
        registry.listeners.retain(|(id, _, _)| *id != subscription.id);
        before != registry.listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.registry).listeners.len()
    }

    /// Deliver `payload` to every matching listener; returns how many ran.
    pub fn emit(&self, payload: CatalogEvent, marker: Option<String>) -> usize {
        self.dispatch(Event {
            payload,
            marker,
            emitted_at: Utc::now(),
            reply: None,
        })
    }

    /// Emit and wait for the first listener to answer through the event's
    /// [`ReplyHook`].
    pub async fn emit_with_reply(
        &self,
        payload: CatalogEvent,
        marker: Option<String>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        let topic = payload.topic();
        self.dispatch(Event {
            payload,
            marker,
            emitted_at: Utc::now(),
            reply: Some(ReplyHook {
                slot: Arc::new(Mutex::new(Some(tx))),
            }),
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            // Every listener dropped the hook without answering.
            Ok(Err(_)) => Err(PicteusError::Timeout(format!(
                "no listener answered '{topic}'"
            ))),
            Err(_) => Err(PicteusError::Timeout(format!(
                "no answer to '{topic}' within {} ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Register interest in the first event of `topic` accepted by
    /// `predicate`. Register before triggering the action that emits it.
    pub fn once<P>(&self, topic: Topic, predicate: P) -> EventWaiter
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let subscription = self.on(topic, move |event| {
            if predicate(event)
                && let Some(sender) = lock(&slot).take()
            {
                let _ = sender.send(event.clone());
            }
        });

        EventWaiter {
            bus: self.clone(),
            subscription,
            receiver: Some(rx),
        }
    }

    fn subscribe(&self, topic: Option<Topic>, listener: Listener) -> Subscription {
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.listeners.push((id, topic, listener));
        Subscription { id, topic }
    }

    fn dispatch(&self, event: Event) -> usize {
        let topic = event.topic();
        let matching: Vec<Listener> = lock(&self.registry)
            .listeners
            .iter()
            .filter(|(_, filter, _)| filter.is_none_or(|wanted| wanted == topic))
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();

        debug!(%topic, listeners = matching.len(), "emitting event");
        for listener in &matching {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!(%topic, "event listener panicked");
            }
        }
        matching.len()
    }
}

/// Pending one-shot subscription created by [`EventBus::once`]. Dropping it
/// unsubscribes.
pub struct EventWaiter {
    bus: EventBus,
    subscription: Subscription,
    receiver: Option<oneshot::Receiver<Event>>,
}

impl fmt::Debug for EventWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventWaiter")
            .field("subscription", &self.subscription)
            .finish()
    }
}

impl EventWaiter {
    pub async fn wait(mut self, timeout: Duration) -> Result<Event> {
        let Some(receiver) = self.receiver.take() else {
            return Err(PicteusError::Internal("event waiter already used".into()));
        };
        let topic = self.subscription.topic;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(PicteusError::Internal(
                "event waiter subscription dropped".into(),
            )),
            Err(_) => Err(PicteusError::Timeout(format!(
                "no matching {} event within {} ms",
                topic.map(|t| t.to_string()).unwrap_or_default(),
                timeout.as_millis()
            ))),
        }
    }
}

impl Drop for EventWaiter {
    fn drop(&mut self) {
        self.bus.off(&self.subscription);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use picteus_model::{ImageID, RepositoryID};
    use serde_json::json;

    use super::*;

    fn created(repository_id: RepositoryID) -> CatalogEvent {
        CatalogEvent::ImageCreated {
            image_id: ImageID::new(),
            repository_id,
        }
    }

    #[test]
    fn exact_and_catch_all_subscriptions() {
        let bus = EventBus::new();
        let exact = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&exact);
        bus.on(Topic::IMAGE_CREATED, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&all);
        bus.on_all(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let repository_id = RepositoryID::new();
        assert_eq!(bus.emit(created(repository_id), None), 2);
        bus.emit(CatalogEvent::RepositoryDeleted { repository_id }, None);

        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn state_qualifier_is_part_of_the_topic() {
        let bus = EventBus::new();
        let updated = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&updated);
        bus.on(Topic::IMAGE_UPDATED, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(
            CatalogEvent::ImageRenamed {
                image_id: ImageID::new(),
                repository_id: RepositoryID::new(),
                previous_path: "/a.png".into(),
            },
            None,
        );
        assert_eq!(updated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn off_is_idempotent() {
        let bus = EventBus::new();
        let subscription = bus.on_all(|_| {});
        assert!(bus.off(&subscription));
        assert!(!bus.off(&subscription));
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(bus.emit(created(RepositoryID::new()), None), 0);
    }

    #[test]
    fn listeners_may_unsubscribe_while_notified() {
        let bus = EventBus::new();
        let inner = bus.clone();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let own = Arc::clone(&slot);
        let subscription = bus.on_all(move |_| {
            if let Some(subscription) = lock(&own).take() {
                inner.off(&subscription);
            }
        });
        *lock(&slot) = Some(subscription);

        assert_eq!(bus.emit(created(RepositoryID::new()), None), 1);
        assert_eq!(bus.emit(created(RepositoryID::new()), None), 0);
    }

    #[test]
    fn a_panicking_listener_does_not_starve_the_others() {
        let bus = EventBus::new();
        let reached = Arc::new(AtomicUsize::new(0));
        bus.on_all(|_| panic!("listener failure"));
        let counter = Arc::clone(&reached);
        bus.on_all(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(created(RepositoryID::new()), Some("marker".into()));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_reply_wins() {
        let bus = EventBus::new();
        bus.on(Topic::IMAGE_CREATED, |event| {
            if let Some(hook) = event.reply_hook() {
                assert!(hook.resolve(json!("first")));
            }
        });
        bus.on(Topic::IMAGE_CREATED, |event| {
            if let Some(hook) = event.reply_hook() {
                assert!(!hook.resolve(json!("second")));
            }
        });

        let reply = bus
            .emit_with_reply(created(RepositoryID::new()), None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, json!("first"));
    }

    #[tokio::test]
    async fn unanswered_reply_fails_explicitly() {
        let bus = EventBus::new();
        let keep: Arc<Mutex<Vec<ReplyHook>>> = Arc::new(Mutex::new(Vec::new()));
        let hooks = Arc::clone(&keep);
        bus.on_all(move |event| {
            if let Some(hook) = event.reply_hook() {
                lock(&hooks).push(hook.clone());
            }
        });

        let outcome = bus
            .emit_with_reply(
                created(RepositoryID::new()),
                None,
                Duration::from_millis(50),
            )
            .await;
        assert!(matches!(outcome, Err(PicteusError::Timeout(_))));
    }

    #[tokio::test]
    async fn once_resolves_on_first_match_and_unsubscribes() {
        let bus = EventBus::new();
        let repository_id = RepositoryID::new();
        let wanted = ImageID::new();

        let waiter = bus.once(Topic::IMAGE_CREATED, move |event| {
            event.payload.image_id() == Some(wanted)
        });
        bus.emit(created(repository_id), None);
        bus.emit(
            CatalogEvent::ImageCreated {
                image_id: wanted,
                repository_id,
            },
            None,
        );

        let event = waiter.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(event.payload.image_id(), Some(wanted));
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn once_times_out() {
        let bus = EventBus::new();
        let waiter = bus.once(Topic::IMAGE_RENAMED, |_| true);
        let outcome = waiter.wait(Duration::from_millis(20)).await;
        assert!(matches!(outcome, Err(PicteusError::Timeout(_))));
    }
}
