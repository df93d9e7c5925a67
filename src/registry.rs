// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Registry
//!
//! Maps routing keys to subscriptions. A routing key is the resolved name of a
//! message type: the explicit override returned by [`Message::message_type`] when
//! there is one, the unqualified Rust type name otherwise. Resolved names are
//! memoized in a [`TypeNameCache`] shared by the publish and subscribe paths, so a
//! type that is only ever published still gets a stable key.
//!
//! Handlers are stored type-erased. The payload is decoded once per delivery into
//! the subscription's message type and then handed to every handler.
//!
//! The registry is mutable only until it is sealed, which happens when the
//! messenger binds its queue and starts consuming.

use crate::errors::AmqpError;
use futures_util::{
    future::{join_all, BoxFuture},
    FutureExt,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// An application message that can travel through the messenger.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Explicit routing key for this type. Defaults to the type name.
    fn message_type() -> Option<&'static str> {
        None
    }
}

/// Error a handler may return to signal a permanent failure.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of one handler invocation: `Ok(true)` when the message was handled.
pub type HandlerResult = Result<bool, HandlerError>;

type ErasedMessage = Arc<dyn Any + Send + Sync>;

type ErasedHandler =
    Arc<dyn Fn(ErasedMessage, CancellationToken) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

type Decoder = fn(&[u8]) -> Result<ErasedMessage, serde_json::Error>;

fn decode<T: Message>(body: &[u8]) -> Result<ErasedMessage, serde_json::Error> {
    let message: T = serde_json::from_slice(body)?;
    Ok(Arc::new(message))
}

/// Memoized routing keys, by message type. Entries are never evicted.
#[derive(Default)]
pub struct TypeNameCache {
    names: RwLock<HashMap<TypeId, String>>,
}

impl TypeNameCache {
    /// Routing key of `T`: [`Message::message_type`] when set, otherwise the
    /// type name without module paths.
    ///
    /// # Returns
    /// The key, computed on first use and served from the cache afterwards
    pub fn resolve<T: Message>(&self) -> String {
        let id = TypeId::of::<T>();

        if let Some(name) = self
            .names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            return name.clone();
        }

        let mut names = self.names.write().unwrap_or_else(PoisonError::into_inner);
        names
            .entry(id)
            .or_insert_with(|| {
                T::message_type()
                    .map(str::to_owned)
                    .unwrap_or_else(|| short_type_name(type_name::<T>()))
            })
            .clone()
    }

    pub fn contains<T: Message>(&self) -> bool {
        self.names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.names.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Strips module paths from every segment of a Rust type name, so that
/// `app::events::Envelope<app::Order>` becomes `Envelope<Order>`.
fn short_type_name(full: &str) -> String {
    fn last_segment(path: &str) -> &str {
        path.rsplit("::").next().unwrap_or(path)
    }

    let mut out = String::with_capacity(full.len());
    let mut path = String::new();

    for c in full.chars() {
        match c {
            '<' | '>' | ',' | ' ' | '(' | ')' | '[' | ']' | ';' | '&' => {
                out.push_str(last_segment(&path));
                path.clear();
                out.push(c);
            }
            _ => path.push(c),
        }
    }
    out.push_str(last_segment(&path));

    out
}

/// All handlers registered for one message type.
#[derive(Clone)]
pub struct Subscription {
    type_id: TypeId,
    type_name: &'static str,
    decoder: Decoder,
    handlers: Vec<ErasedHandler>,
}

impl Subscription {
    fn new<T: Message>() -> Self {
        Subscription {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            decoder: decode::<T>,
            handlers: vec![],
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn add<T, H, Fut>(&mut self, handler: H)
    where
        T: Message,
        H: Fn(Arc<T>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = Arc::new(handler);

        self.handlers.push(Arc::new(move |message: ErasedMessage, token: CancellationToken| {
            let handler = handler.clone();
            let fut: BoxFuture<'static, HandlerResult> = Box::pin(async move {
                match message.downcast::<T>() {
                    Ok(message) => handler(message, token).await,
                    Err(_) => Err(HandlerError::from(format!(
                        "message is not a `{}`",
                        type_name::<T>()
                    ))),
                }
            });
            fut
        }));
    }

    /// Decodes `body` and runs every handler concurrently.
    ///
    /// # Parameters
    /// * `body` - JSON payload of the delivery
    /// * `token` - Cancellation token handed to every handler
    ///
    /// # Returns
    /// `Ok(true)` only if all handlers returned `Ok(true)`. A decode failure, a
    /// handler error or a handler panic is returned as an error
    pub async fn dispatch(
        &self,
        body: &[u8],
        token: CancellationToken,
    ) -> Result<bool, AmqpError> {
        let message = (self.decoder)(body)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

        let calls = self
            .handlers
            .iter()
            .map(|handler| AssertUnwindSafe(handler(message.clone(), token.clone())).catch_unwind());

        let mut success = true;
        for result in join_all(calls).await {
            match result {
                Ok(Ok(handled)) => success &= handled,
                Ok(Err(err)) => return Err(AmqpError::HandlerError(err.to_string())),
                Err(panic) => return Err(AmqpError::HandlerError(panic_message(panic.as_ref()))),
            }
        }

        Ok(success)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", msg)
    } else {
        "handler panicked".to_owned()
    }
}

/// Routing key → subscription map.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
    type_names: TypeNameCache,
    sealed: AtomicBool,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves (and memoizes) the routing key of `T`.
    pub fn routing_key<T: Message>(&self) -> String {
        self.type_names.resolve::<T>()
    }

    pub fn type_names(&self) -> &TypeNameCache {
        &self.type_names
    }

    /// Appends `handler` to the subscription of `T`'s routing key, creating the
    /// subscription on first use. Handlers run in registration order.
    ///
    /// # Parameters
    /// * `handler` - Called with the decoded message and a cancellation token
    ///
    /// # Returns
    /// `RegistrySealed` once the messenger has bound the queue, or
    /// `MessageTypeConflict` when another type already owns the routing key
    pub fn subscribe<T, H, Fut>(&self, handler: H) -> Result<(), AmqpError>
    where
        T: Message,
        H: Fn(Arc<T>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let key = self.routing_key::<T>();
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if self.is_sealed() {
            return Err(AmqpError::RegistrySealed);
        }

        let subscription = subscriptions
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Subscription::new::<T>()));

        if subscription.type_id != TypeId::of::<T>() {
            return Err(AmqpError::MessageTypeConflict(
                key,
                subscription.type_name.to_owned(),
            ));
        }

        Arc::make_mut(subscription).add(handler);
        debug!(
            routing_key = key,
            handlers = subscription.len(),
            "handler subscribed"
        );

        Ok(())
    }

    /// Looks up the subscription bound to `routing_key`.
    ///
    /// # Returns
    /// `None` when no handler was registered for the key
    pub fn get(&self, routing_key: &str) -> Option<Arc<Subscription>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(routing_key)
            .cloned()
    }

    /// Registered routing keys, sorted.
    pub fn routing_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Forbids further subscriptions.
    pub fn seal(&self) {
        let _guard = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Drops every subscription. The type name cache is kept.
    pub fn clear(&self) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Serialize, Deserialize)]
    struct MyMessage {
        greeting: String,
    }

    impl Message for MyMessage {}

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: u32,
    }

    impl Message for OrderCreated {
        fn message_type() -> Option<&'static str> {
            Some("orders.created")
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct ImpostorOrder {
        order_id: u32,
    }

    impl Message for ImpostorOrder {
        fn message_type() -> Option<&'static str> {
            Some("orders.created")
        }
    }

    fn body(greeting: &str) -> Vec<u8> {
        serde_json::to_vec(&MyMessage {
            greeting: greeting.to_owned(),
        })
        .unwrap()
    }

    #[test]
    fn override_is_returned_and_stable() {
        let cache = TypeNameCache::default();

        assert_eq!(cache.resolve::<OrderCreated>(), "orders.created");
        assert_eq!(cache.resolve::<OrderCreated>(), "orders.created");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn default_name_is_memoized() {
        let cache = TypeNameCache::default();
        assert!(!cache.contains::<MyMessage>());

        assert_eq!(cache.resolve::<MyMessage>(), "MyMessage");
        assert!(cache.contains::<MyMessage>());
        assert_eq!(cache.resolve::<MyMessage>(), "MyMessage");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn short_names_strip_every_module_path() {
        assert_eq!(short_type_name("app::events::MyMessage"), "MyMessage");
        assert_eq!(
            short_type_name("app::Envelope<app::orders::Order, alloc::string::String>"),
            "Envelope<Order, String>"
        );
        assert_eq!(short_type_name("Plain"), "Plain");
    }

    #[tokio::test]
    async fn all_handlers_run_in_registration_order() {
        let registry = SubscriptionRegistry::new();
        let seen = Arc::new(Mutex::new(vec![]));

        for id in 0..3 {
            let seen = seen.clone();
            registry
                .subscribe(move |msg: Arc<MyMessage>, _| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push((id, msg.greeting.clone()));
                        Ok(true)
                    }
                })
                .unwrap();
        }

        let subscription = registry.get("MyMessage").unwrap();
        assert_eq!(subscription.len(), 3);

        let result = subscription
            .dispatch(&body("hi"), CancellationToken::new())
            .await;

        assert_eq!(result, Ok(true));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(0, "hi".to_owned()), (1, "hi".to_owned()), (2, "hi".to_owned())]
        );
    }

    #[tokio::test]
    async fn one_false_handler_fails_the_dispatch() {
        let registry = SubscriptionRegistry::new();
        registry
            .subscribe(|_: Arc<MyMessage>, _| async { Ok(true) })
            .unwrap();
        registry
            .subscribe(|_: Arc<MyMessage>, _| async { Ok(false) })
            .unwrap();

        let result = registry
            .get("MyMessage")
            .unwrap()
            .dispatch(&body("hi"), CancellationToken::new())
            .await;

        assert_eq!(result, Ok(false));
    }

    #[tokio::test]
    async fn handler_errors_and_panics_propagate() {
        let registry = SubscriptionRegistry::new();
        registry
            .subscribe(|_: Arc<MyMessage>, _| async { Err(HandlerError::from("database down")) })
            .unwrap();

        let result = registry
            .get("MyMessage")
            .unwrap()
            .dispatch(&body("hi"), CancellationToken::new())
            .await;
        assert_eq!(result, Err(AmqpError::HandlerError("database down".to_owned())));

        let registry = SubscriptionRegistry::new();
        registry
            .subscribe(|_: Arc<MyMessage>, _| async {
                if true {
                    panic!("boom");
                }
                Ok(true)
            })
            .unwrap();

        let result = registry
            .get("MyMessage")
            .unwrap()
            .dispatch(&body("hi"), CancellationToken::new())
            .await;
        assert_eq!(
            result,
            Err(AmqpError::HandlerError("handler panicked: boom".to_owned()))
        );
    }

    #[tokio::test]
    async fn undecodable_payloads_propagate() {
        let registry = SubscriptionRegistry::new();
        registry
            .subscribe(|_: Arc<MyMessage>, _| async { Ok(true) })
            .unwrap();

        let result = registry
            .get("MyMessage")
            .unwrap()
            .dispatch(b"not json", CancellationToken::new())
            .await;

        assert!(matches!(result, Err(AmqpError::ParsePayloadError(_))));
    }

    #[test]
    fn sealed_registry_rejects_subscriptions() {
        let registry = SubscriptionRegistry::new();
        registry
            .subscribe(|_: Arc<MyMessage>, _| async { Ok(true) })
            .unwrap();
        registry.seal();

        let result = registry.subscribe(|_: Arc<OrderCreated>, _| async { Ok(true) });

        assert_eq!(result, Err(AmqpError::RegistrySealed));
        assert_eq!(registry.routing_keys(), vec!["MyMessage".to_owned()]);
    }

    #[test]
    fn conflicting_types_cannot_share_a_key() {
        let registry = SubscriptionRegistry::new();
        registry
            .subscribe(|_: Arc<OrderCreated>, _| async { Ok(true) })
            .unwrap();

        let result = registry.subscribe(|_: Arc<ImpostorOrder>, _| async { Ok(true) });

        assert!(matches!(
            result,
            Err(AmqpError::MessageTypeConflict(key, _)) if key == "orders.created"
        ));
    }

    #[test]
    fn clear_keeps_resolved_names() {
        let registry = SubscriptionRegistry::new();
        registry
            .subscribe(|_: Arc<MyMessage>, _| async { Ok(true) })
            .unwrap();

        registry.clear();

        assert!(registry.is_empty());
        assert!(registry.type_names().contains::<MyMessage>());
    }
}
