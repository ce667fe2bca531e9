//! Message bus trait and the in-memory implementation.

use crate::message::{Message, PublishedMessage, SubscriptionFilter};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use plinth_core::clock::{Clock, SystemClock};
use plinth_core::error::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Boxed subscriber handler
pub type MessageHandlerFn =
    Arc<dyn Fn(PublishedMessage) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Hook observing subscriber failures
pub type SubscriberErrorHook = Arc<dyn Fn(Uuid, &Error) + Send + Sync>;

/// Message bus contract.
///
/// Messages with no matching subscriber are dropped; there is no backlog.
/// Subscriber failures never propagate to the publisher.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a type-erased message, optionally withholding it for `delay`
    async fn publish_message(
        &self,
        message: PublishedMessage,
        delay: Option<Duration>,
    ) -> Result<()>;

    /// Register a handler for messages matching `filter`
    fn subscribe_matching(
        &self,
        filter: SubscriptionFilter,
        handler: MessageHandlerFn,
    ) -> Result<Subscription>;

    /// Stop accepting publishes and tear down subscriptions
    fn close(&self);

    /// Bus identifier used in logs
    fn name(&self) -> &str;
}

/// Typed convenience surface over any [`MessageBus`]
#[async_trait]
pub trait MessageBusExt: MessageBus {
    /// Publish a typed message
    async fn publish<T: Message>(&self, message: T) -> Result<()> {
        self.publish_message(PublishedMessage::new(message), None)
            .await
    }

    /// Publish a typed message after `delay`
    async fn publish_delayed<T: Message>(&self, message: T, delay: Duration) -> Result<()> {
        self.publish_message(PublishedMessage::new(message), Some(delay))
            .await
    }

    /// Subscribe to the concrete message type `T`
    fn subscribe<T, F, Fut>(&self, handler: F) -> Result<Subscription>
    where
        T: Message,
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe_matching(
            SubscriptionFilter::of_type::<T>(),
            Arc::new(move |message: PublishedMessage| match message.downcast::<T>() {
                Some(typed) => handler(typed).boxed(),
                None => futures::future::ready(Ok(())).boxed(),
            }),
        )
    }

    /// Subscribe to every message answering to `kind`
    fn subscribe_kind<F, Fut>(&self, kind: impl Into<String>, handler: F) -> Result<Subscription>
    where
        F: Fn(PublishedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe_matching(
            SubscriptionFilter::Kind(kind.into()),
            Arc::new(move |message| handler(message).boxed()),
        )
    }

    /// Subscribe to every published message
    fn subscribe_all<F, Fut>(&self, handler: F) -> Result<Subscription>
    where
        F: Fn(PublishedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe_matching(
            SubscriptionFilter::All,
            Arc::new(move |message| handler(message).boxed()),
        )
    }
}

impl<B: MessageBus + ?Sized> MessageBusExt for B {}

/// Handle to a registered subscription; lives until cancelled
pub struct Subscription {
    id: Uuid,
    cancelled: Arc<AtomicBool>,
    unsubscribe: Arc<dyn Fn() + Send + Sync>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Stop delivery and remove the subscription from the bus
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            (self.unsubscribe)();
        }
    }
}

/// Message bus configuration
#[derive(Clone)]
pub struct MessageBusOptions {
    /// Bus identifier used in logs
    pub name: String,
    /// Time source for delayed publishes
    pub clock: Arc<dyn Clock>,
    /// Invoked whenever a subscriber handler fails or panics
    pub on_subscriber_error: Option<SubscriberErrorHook>,
}

impl Default for MessageBusOptions {
    fn default() -> Self {
        Self {
            name: "in-memory".to_string(),
            clock: SystemClock::shared(),
            on_subscriber_error: None,
        }
    }
}

struct SubscriptionEntry {
    filter: SubscriptionFilter,
    tx: mpsc::UnboundedSender<PublishedMessage>,
}

struct BusInner {
    options: MessageBusOptions,
    subscriptions: DashMap<Uuid, SubscriptionEntry>,
    closed: CancellationToken,
}

impl BusInner {
    fn dispatch(&self, message: PublishedMessage) {
        let mut matched = 0usize;
        for entry in self.subscriptions.iter() {
            if entry.filter.matches(&message) {
                matched += 1;
                // A send error means the drain task is gone; the entry is
                // removed lazily on cancel.
                let _ = entry.tx.send(message.clone());
            }
        }

        tracing::trace!(
            bus = %self.options.name,
            message_type = message.type_name(),
            matched,
            "Dispatched message"
        );
    }
}

/// In-memory message bus
///
/// Each subscription gets its own channel and drain task, so delivery within
/// one subscriber follows publish order while subscribers never block each
/// other.
pub struct InMemoryMessageBus {
    inner: Arc<BusInner>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::with_options(MessageBusOptions::default())
    }

    pub fn with_options(options: MessageBusOptions) -> Self {
        Self {
            inner: Arc::new(BusInner {
                options,
                subscriptions: DashMap::new(),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    fn spawn_drain_task(
        inner: &Arc<BusInner>,
        id: Uuid,
        handler: MessageHandlerFn,
        cancelled: Arc<AtomicBool>,
        mut rx: mpsc::UnboundedReceiver<PublishedMessage>,
    ) {
        let bus_name = inner.options.name.clone();
        let error_hook = inner.options.on_subscriber_error.clone();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }

                let message_type = message.type_name();
                let outcome = std::panic::AssertUnwindSafe(handler(message))
                    .catch_unwind()
                    .await;

                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        tracing::error!(
                            bus = %bus_name,
                            subscription = %id,
                            message_type,
                            %error,
                            "Subscriber handler failed"
                        );
                        if let Some(hook) = &error_hook {
                            hook(id, &error);
                        }
                    }
                    Err(_) => {
                        tracing::error!(
                            bus = %bus_name,
                            subscription = %id,
                            message_type,
                            "Subscriber handler panicked"
                        );
                        if let Some(hook) = &error_hook {
                            hook(id, &Error::handler("subscriber handler panicked"));
                        }
                    }
                }
            }
        });
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish_message(
        &self,
        message: PublishedMessage,
        delay: Option<Duration>,
    ) -> Result<()> {
        if self.inner.closed.is_cancelled() {
            return Err(Error::closed("message bus"));
        }

        match delay.filter(|d| !d.is_zero()) {
            None => self.inner.dispatch(message),
            Some(delay) => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = inner.closed.cancelled() => return,
                        _ = inner.options.clock.sleep(delay) => {}
                    }
                    // Closed while we slept: the message is dropped.
                    if !inner.closed.is_cancelled() {
                        inner.dispatch(message);
                    }
                });
            }
        }
        Ok(())
    }

    fn subscribe_matching(
        &self,
        filter: SubscriptionFilter,
        handler: MessageHandlerFn,
    ) -> Result<Subscription> {
        if self.inner.closed.is_cancelled() {
            return Err(Error::closed("message bus"));
        }

        let id = Uuid::new_v4();
        let cancelled = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        Self::spawn_drain_task(&self.inner, id, handler, cancelled.clone(), rx);
        self.inner
            .subscriptions
            .insert(id, SubscriptionEntry { filter, tx });

        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        let unsubscribe = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.subscriptions.remove(&id);
            }
        });

        tracing::debug!(bus = %self.inner.options.name, subscription = %id, "Subscribed");
        Ok(Subscription {
            id,
            cancelled,
            unsubscribe,
        })
    }

    fn close(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();
        // Dropping the senders ends every drain task.
        self.inner.subscriptions.clear();
        tracing::debug!(bus = %self.inner.options.name, "Message bus closed");
    }

    fn name(&self) -> &str {
        &self.inner.options.name
    }
}

impl Drop for InMemoryMessageBus {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plinth_core::clock::ManualClock;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    struct SimpleMessageA {
        data: String,
    }
    impl Message for SimpleMessageA {
        fn message_type() -> &'static str {
            "simple-message-a"
        }
        fn message_kinds() -> &'static [&'static str] {
            &["simple-message"]
        }
    }

    struct SimpleMessageB;
    impl Message for SimpleMessageB {
        fn message_type() -> &'static str {
            "simple-message-b"
        }
        fn message_kinds() -> &'static [&'static str] {
            &["simple-message"]
        }
    }

    struct SimpleMessageC;
    impl Message for SimpleMessageC {
        fn message_type() -> &'static str {
            "simple-message-c"
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = InMemoryMessageBus::new();
        let counter = Arc::new(AtomicU32::new(0));

        let c = counter.clone();
        let _sub = bus
            .subscribe::<SimpleMessageA, _, _>(move |message| {
                let c = c.clone();
                async move {
                    assert_eq!(message.data, "Hello");
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        bus.publish(SimpleMessageA {
            data: "Hello".into(),
        })
        .await
        .unwrap();

        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_subscriber_message_dropped() {
        let bus = InMemoryMessageBus::new();
        // Nothing to assert beyond "publish succeeds with nobody listening".
        bus.publish(SimpleMessageC).await.unwrap();
    }

    #[tokio::test]
    async fn test_kind_dispatch_is_polymorphic() {
        let bus = InMemoryMessageBus::new();
        let counter = Arc::new(AtomicU32::new(0));

        let c = counter.clone();
        let _sub = bus
            .subscribe_kind("simple-message", move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        bus.publish(SimpleMessageA { data: "a".into() }).await.unwrap();
        bus.publish(SimpleMessageB).await.unwrap();
        bus.publish(SimpleMessageC).await.unwrap();

        settle().await;
        assert_eq!(
            counter.load(Ordering::SeqCst),
            2,
            "only A and B answer to the simple-message kind"
        );
    }

    #[tokio::test]
    async fn test_subscribe_all_receives_everything() {
        let bus = InMemoryMessageBus::new();
        let counter = Arc::new(AtomicU32::new(0));

        let c = counter.clone();
        let _sub = bus
            .subscribe_all(move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        bus.publish(SimpleMessageA { data: "a".into() }).await.unwrap();
        bus.publish(SimpleMessageB).await.unwrap();
        bus.publish(SimpleMessageC).await.unwrap();

        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_delayed_publish_timing() {
        let bus = InMemoryMessageBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _sub = bus
            .subscribe::<SimpleMessageA, _, _>(move |_| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(Instant::now());
                    Ok(())
                }
            })
            .unwrap();

        let published = Instant::now();
        bus.publish_delayed(
            SimpleMessageA { data: "d".into() },
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delayed message should arrive")
            .unwrap();
        let elapsed = fired.duration_since(published);
        assert!(
            elapsed >= Duration::from_millis(80) && elapsed <= Duration::from_millis(300),
            "fired after {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_delayed_publish_dropped_after_close() {
        let clock = ManualClock::starting_now();
        let bus = InMemoryMessageBus::with_options(MessageBusOptions {
            clock: clock.clone(),
            ..Default::default()
        });
        let counter = Arc::new(AtomicU32::new(0));

        let c = counter.clone();
        let _sub = bus
            .subscribe::<SimpleMessageA, _, _>(move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        bus.publish_delayed(
            SimpleMessageA { data: "late".into() },
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

        bus.close();
        clock.advance(Duration::from_secs(3601));
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0, "message dropped at close");
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let bus = InMemoryMessageBus::new();
        bus.close();
        let err = bus
            .publish(SimpleMessageA { data: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed { .. }));
    }

    #[tokio::test]
    async fn test_subscriber_errors_are_isolated() {
        let errors = Arc::new(AtomicU32::new(0));
        let hook_errors = errors.clone();
        let bus = InMemoryMessageBus::with_options(MessageBusOptions {
            on_subscriber_error: Some(Arc::new(move |_, _| {
                hook_errors.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        });

        let received = Arc::new(AtomicU32::new(0));

        let _failing = bus
            .subscribe::<SimpleMessageA, _, _>(|_| async {
                Err(Error::handler("this subscriber always fails"))
            })
            .unwrap();

        let r = received.clone();
        let _healthy = bus
            .subscribe::<SimpleMessageA, _, _>(move |_| {
                let r = r.clone();
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        bus.publish(SimpleMessageA { data: "x".into() }).await.unwrap();
        bus.publish(SimpleMessageA { data: "y".into() }).await.unwrap();

        settle().await;
        assert_eq!(received.load(Ordering::SeqCst), 2, "healthy subscriber unaffected");
        assert_eq!(errors.load(Ordering::SeqCst), 2, "hook saw each failure");
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery() {
        let bus = InMemoryMessageBus::new();
        let counter = Arc::new(AtomicU32::new(0));

        let c = counter.clone();
        let sub = bus
            .subscribe::<SimpleMessageA, _, _>(move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        bus.publish(SimpleMessageA { data: "1".into() }).await.unwrap();
        settle().await;

        sub.cancel();
        assert_eq!(bus.subscription_count(), 0);

        bus.publish(SimpleMessageA { data: "2".into() }).await.unwrap();
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_per_subscriber_order_preserved() {
        let bus = InMemoryMessageBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _sub = bus
            .subscribe::<SimpleMessageA, _, _>(move |message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message.data.clone());
                    Ok(())
                }
            })
            .unwrap();

        for i in 0..20 {
            bus.publish(SimpleMessageA {
                data: i.to_string(),
            })
            .await
            .unwrap();
        }

        settle().await;
        for i in 0..20 {
            assert_eq!(rx.recv().await.unwrap(), i.to_string());
        }
    }
}
