//! # Plinth Messaging
//!
//! Topic-style publish/subscribe: typed subscriptions, kind-based polymorphic
//! dispatch, delayed delivery and subscriber-failure isolation.

pub mod bus;
pub mod message;

pub use bus::{
    InMemoryMessageBus, MessageBus, MessageBusExt, MessageBusOptions, MessageHandlerFn,
    SubscriberErrorHook, Subscription,
};
pub use message::{Message, PublishedMessage, SubscriptionFilter};
