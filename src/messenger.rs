// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messenger
//!
//! Facade over one RabbitMQ channel. On construction it declares the exchange and
//! queue, binds the queue once per subscribed routing key and starts consuming with
//! manual acknowledgement. Messages are published as JSON with the routing key of
//! their type.
//!
//! The channel is rebuilt when it faults, when its consumer stream ends and when
//! the [`ConnectionManager`] installs a new connection. None of these rebuild
//! inline: the hooks only enqueue a request and a supervisor task disposes the
//! stale channel and builds a fresh one. A publish that finds the channel closed
//! replaces it before sending. Rebuild, publish and topology declaration share one
//! async lock, so a publish never observes a half-built channel.

use crate::{
    channel::{AmqpChannel, ChannelHook},
    connection_manager::ConnectionManager,
    dispatcher::DeliveryDispatcher,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    otel,
    queue::QueueDefinition,
    registry::{Message, SubscriptionRegistry},
    topology::{AmqpTopology, Topology},
};
use lapin::{types::ShortString, BasicProperties};
use opentelemetry::Context;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, PoisonError, Weak,
};
use tokio::{
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        watch, Mutex as AsyncMutex,
    },
    task::JoinHandle,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Content type of every published payload.
pub const JSON_CONTENT_TYPE: &str = "application/json";

const COMPONENT: &str = "Messenger";

/// A rebuild request, tagged with the generation of the channel that failed.
type RebuildRequest = (u64, AmqpError);

struct ChannelState {
    channel: Arc<dyn AmqpChannel>,
    consumer: JoinHandle<()>,
    generation: u64,
    /// Generation of the connection the channel was opened on.
    connection: u64,
}

impl ChannelState {
    async fn close(self) {
        self.consumer.abort();
        if let Err(err) = self.channel.close().await {
            debug!(error = err.to_string(), "error closing channel");
        }
    }
}

/// Publishes messages and feeds deliveries to the subscriptions of a
/// [`SubscriptionRegistry`] over a self-healing channel.
pub struct Messenger {
    connection: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    exchange_name: String,
    queue_name: String,
    consumer_tag: String,
    state: AsyncMutex<Option<ChannelState>>,
    generation: AtomicU64,
    disposed: AtomicBool,
    rebuilds: UnboundedSender<RebuildRequest>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Messenger {
    /// Builds the messenger and its first channel, connecting if needed.
    ///
    /// The registry is sealed while the channel is built: every subscription must
    /// be registered before this call.
    ///
    /// # Parameters
    /// * `connection` - Manager of the broker connection, owned by the messenger
    ///   from now on and disposed with it
    /// * `registry` - Subscriptions whose routing keys are bound to the queue
    /// * `exchange_name` - Direct exchange every message is published to
    /// * `queue_name` - Queue consumed by this messenger
    ///
    /// # Returns
    /// The ready messenger, `InvalidArgument` for a blank name, `ConnectionError`
    /// when the broker stays unreachable, or the first topology fault
    pub async fn connect(
        connection: Arc<ConnectionManager>,
        registry: Arc<SubscriptionRegistry>,
        exchange_name: &str,
        queue_name: &str,
    ) -> Result<Arc<Messenger>, AmqpError> {
        if exchange_name.trim().is_empty() {
            return Err(AmqpError::InvalidArgument(
                "exchange name must not be empty".to_owned(),
            ));
        }
        if queue_name.trim().is_empty() {
            return Err(AmqpError::InvalidArgument(
                "queue name must not be empty".to_owned(),
            ));
        }

        let connections = connection.watch_generations();
        let (rebuilds, requests) = unbounded_channel();
        let messenger = Arc::new(Messenger {
            connection,
            registry,
            exchange_name: exchange_name.to_owned(),
            queue_name: queue_name.to_owned(),
            consumer_tag: format!("{}-{}", queue_name, Uuid::new_v4()),
            state: AsyncMutex::new(None),
            generation: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            rebuilds,
            supervisor: Mutex::new(None),
        });

        {
            let mut state = messenger.state.lock().await;
            *state = Some(messenger.build_channel().await?);
        }

        let supervisor = tokio::spawn(supervise(
            Arc::downgrade(&messenger),
            requests,
            connections,
        ));
        *messenger
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(supervisor);

        debug!(
            exchange = messenger.exchange_name,
            queue = messenger.queue_name,
            "messenger ready"
        );

        Ok(messenger)
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Publishes `message` to the exchange with the routing key of `T`.
    ///
    /// No broker confirmation is awaited. A closed channel is replaced first,
    /// reconnecting when the connection is gone too.
    ///
    /// # Parameters
    /// * `message` - Payload, serialized as JSON
    ///
    /// # Returns
    /// `PublishingError` on a transport fault while sending, `Disposed` after
    /// [`Messenger::dispose`], or the fault that prevented a channel rebuild
    pub async fn publish<T: Message>(&self, message: &T) -> Result<(), AmqpError> {
        if self.is_disposed() {
            return Err(AmqpError::Disposed(COMPONENT.to_owned()));
        }

        let routing_key = self.registry.routing_key::<T>();
        let payload = serde_json::to_vec(message).map_err(|err| {
            error!(error = err.to_string(), "error serializing message");
            AmqpError::SerializePayloadError(err.to_string())
        })?;

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_type(ShortString::from(routing_key.clone()))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(otel::inject_headers(&Context::current()));

        let mut state = self.state.lock().await;
        if self.is_disposed() {
            return Err(AmqpError::Disposed(COMPONENT.to_owned()));
        }

        let channel = match state.as_ref() {
            Some(current) if current.channel.is_open() => current.channel.clone(),
            Some(_) => {
                warn!("RabbitMQ channel is closed. Recreating it before publishing...");
                self.replace(&mut state).await?
            }
            None => self.replace(&mut state).await?,
        };

        channel
            .basic_publish(&self.exchange_name, &routing_key, &payload, properties)
            .await
            .map_err(|err| match err {
                AmqpError::Transport(reason) => {
                    error!(error = reason, "transport failure publishing message");
                    AmqpError::PublishingError
                }
                other => other,
            })?;

        debug!(
            exchange = self.exchange_name,
            routing_key = routing_key,
            "message published"
        );

        Ok(())
    }

    /// Stops consuming, closes the channel, clears the registry and disposes the
    /// connection. Idempotent.
    ///
    /// A connection attempt in backoff, such as one started by a concurrent
    /// publish, is interrupted first so that this call returns promptly.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(supervisor) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            supervisor.abort();
        }

        self.connection.interrupt();

        let current = self.state.lock().await.take();
        if let Some(current) = current {
            current.close().await;
        }

        self.registry.clear();
        self.connection.dispose().await;

        debug!("messenger disposed");
    }

    /// Opens a channel and provisions it from scratch. Callers hold the state lock.
    async fn build_channel(&self) -> Result<ChannelState, AmqpError> {
        if !self.connection.ensure_connected().await? {
            return Err(AmqpError::ConnectionError);
        }

        let connection = self.connection.generation();
        let channel = self.connection.create_channel().await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        match self.provision(channel.clone(), generation).await {
            Ok(consumer) => Ok(ChannelState {
                channel,
                consumer,
                generation,
                connection,
            }),
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = close_err.to_string(), "error closing channel");
                }
                Err(err)
            }
        }
    }

    /// Closes the channel held in `state`, if any, and installs a fresh one.
    async fn replace(
        &self,
        state: &mut Option<ChannelState>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if let Some(stale) = state.take() {
            stale.close().await;
        }

        let fresh = self.build_channel().await?;
        let channel = fresh.channel.clone();
        *state = Some(fresh);
        debug!("channel rebuilt");

        Ok(channel)
    }

    async fn provision(
        &self,
        channel: Arc<dyn AmqpChannel>,
        generation: u64,
    ) -> Result<JoinHandle<()>, AmqpError> {
        self.registry.seal();
        let keys = self.registry.routing_keys();

        AmqpTopology::new(channel.clone())
            .exchange(ExchangeDefinition::new(&self.exchange_name).delete())
            .queue(QueueDefinition::new(&self.queue_name).delete())
            .bind_keys(&self.queue_name, &self.exchange_name, &keys)
            .install()
            .await?;

        channel.on_error(self.fault_hook(generation));

        let deliveries = channel
            .basic_consume(&self.queue_name, &self.consumer_tag)
            .await?;

        let dispatcher = Arc::new(DeliveryDispatcher::new(self.registry.clone(), channel));
        let rebuilds = self.rebuilds.clone();
        let consumer_tag = self.consumer_tag.clone();

        Ok(tokio::spawn(async move {
            dispatcher.run(deliveries).await;

            let stopped = AmqpError::ConsumerCancelled(consumer_tag);
            if rebuilds.send((generation, stopped)).is_err() {
                debug!("channel supervisor is gone");
            }
        }))
    }

    fn fault_hook(&self, generation: u64) -> ChannelHook {
        let rebuilds = self.rebuilds.clone();
        Box::new(move |err| {
            if rebuilds.send((generation, err)).is_err() {
                debug!("channel supervisor is gone");
            }
        })
    }

    /// Replaces the channel of `generation`. Requests for a channel that was
    /// already replaced are ignored.
    async fn rebuild(&self, generation: u64) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        if self.is_disposed() {
            return Ok(());
        }

        if state
            .as_ref()
            .is_some_and(|current| current.generation != generation)
        {
            debug!(generation, "ignoring fault from a replaced channel");
            return Ok(());
        }

        self.replace(&mut state).await.map(|_| ())
    }

    /// Replaces the channel when it was opened on a connection older than
    /// `connection`.
    async fn reattach(&self, connection: u64) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        if self.is_disposed() {
            return Ok(());
        }

        if state
            .as_ref()
            .is_some_and(|current| current.connection >= connection)
        {
            return Ok(());
        }

        warn!(connection, "RabbitMQ connection replaced. Recreating the channel...");
        self.replace(&mut state).await.map(|_| ())
    }
}

async fn supervise(
    messenger: Weak<Messenger>,
    mut requests: UnboundedReceiver<RebuildRequest>,
    mut connections: watch::Receiver<u64>,
) {
    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some((mut generation, mut fault)) = request else {
                    break;
                };
                while let Ok((next_generation, next_fault)) = requests.try_recv() {
                    if next_generation >= generation {
                        generation = next_generation;
                        fault = next_fault;
                    }
                }

                let Some(messenger) = messenger.upgrade() else {
                    break;
                };
                if messenger.is_disposed() {
                    break;
                }

                warn!(
                    error = fault.to_string(),
                    "RabbitMQ channel failed. Recreating it..."
                );

                if let Err(err) = messenger.rebuild(generation).await {
                    error!(error = err.to_string(), "error recreating channel");
                }
            }
            changed = connections.changed() => {
                if changed.is_err() {
                    break;
                }
                let connection = *connections.borrow_and_update();

                let Some(messenger) = messenger.upgrade() else {
                    break;
                };
                if messenger.is_disposed() {
                    break;
                }

                if let Err(err) = messenger.reattach(connection).await {
                    error!(error = err.to_string(), "error recreating channel");
                }
            }
        }
    }
}
