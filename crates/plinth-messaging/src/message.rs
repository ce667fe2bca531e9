//! Message types and subscription matching.

use std::any::{Any, TypeId};
use std::sync::Arc;

/// A value that can travel over the bus.
///
/// `message_type` is a stable name used for logging and kind matching;
/// `message_kinds` lists the additional logical kinds the message answers to.
/// Kinds are how a family of concrete messages shares a subscription: every
/// message carrying the kind `"order-event"` is delivered to a
/// `subscribe_kind("order-event", ..)` subscriber, whatever its concrete type.
pub trait Message: Send + Sync + 'static {
    /// Stable type name
    fn message_type() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }

    /// Additional kinds this message answers to
    fn message_kinds() -> &'static [&'static str]
    where
        Self: Sized,
    {
        &[]
    }
}

/// Type-erased message as it travels through the bus
#[derive(Clone)]
pub struct PublishedMessage {
    body: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
    kinds: &'static [&'static str],
}

impl std::fmt::Debug for PublishedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishedMessage")
            .field("type_name", &self.type_name)
            .field("kinds", &self.kinds)
            .finish()
    }
}

impl PublishedMessage {
    /// Wrap a typed message for publishing
    pub fn new<T: Message>(message: T) -> Self {
        Self {
            body: Arc::new(message),
            type_id: TypeId::of::<T>(),
            type_name: T::message_type(),
            kinds: T::message_kinds(),
        }
    }

    /// Stable name of the concrete message type
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether the concrete type is `T`
    pub fn is<T: Message>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Downcast to the concrete message type
    pub fn downcast<T: Message>(&self) -> Option<Arc<T>> {
        self.body.clone().downcast::<T>().ok()
    }

    /// Whether this message answers to `kind` (its type name or a listed kind)
    pub fn has_kind(&self, kind: &str) -> bool {
        self.type_name == kind || self.kinds.contains(&kind)
    }
}

/// Predicate deciding which published messages a subscription receives
#[derive(Debug, Clone)]
pub enum SubscriptionFilter {
    /// Every message (root subscription)
    All,
    /// Messages of one concrete type
    Type(TypeId),
    /// Messages answering to a kind name
    Kind(String),
}

impl SubscriptionFilter {
    /// Filter for the concrete type `T`
    pub fn of_type<T: Message>() -> Self {
        SubscriptionFilter::Type(TypeId::of::<T>())
    }

    pub fn matches(&self, message: &PublishedMessage) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Type(type_id) => message.type_id == *type_id,
            SubscriptionFilter::Kind(kind) => message.has_kind(kind),
        }
    }
}
