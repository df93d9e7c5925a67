// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Dispatcher
//!
//! This module routes inbound deliveries to their subscription and settles each
//! delivery with the broker according to the aggregate handler outcome:
//!
//! | Outcome                               | Settlement              |
//! |---------------------------------------|-------------------------|
//! | no subscription for the routing key   | ack (message discarded) |
//! | every handler returned `true`         | ack                     |
//! | a handler returned `false`            | nack, requeue           |
//! | decode error, handler error or panic  | nack, no requeue        |
//!
//! Every delivery tag is settled exactly once. The ack/nack call itself is retried
//! with backoff when the channel reports a transient transport fault.

use crate::{
    channel::{AmqpChannel, DeliveryStream, InboundDelivery},
    errors::AmqpError,
    otel,
    registry::SubscriptionRegistry,
    retry::RetryPolicy,
};
use futures_util::StreamExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Name of the tracer used for consumer spans.
pub const CONSUMER_TRACER: &str = "amqp consumer";

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
}

impl Settlement {
    /// Maps a dispatch outcome to its settlement. A handler that returned `false`
    /// gets its message redelivered; a failed dispatch drops the message so a
    /// poison message cannot loop forever.
    pub fn from_outcome(outcome: &Result<bool, AmqpError>) -> Self {
        match outcome {
            Ok(true) => Settlement::Ack,
            Ok(false) => Settlement::Nack { requeue: true },
            Err(_) => Settlement::Nack { requeue: false },
        }
    }
}

/// Routes deliveries from one channel to the registered handlers.
pub struct DeliveryDispatcher {
    registry: Arc<SubscriptionRegistry>,
    channel: Arc<dyn AmqpChannel>,
    retry: RetryPolicy,
}

impl DeliveryDispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>, channel: Arc<dyn AmqpChannel>) -> Self {
        DeliveryDispatcher {
            registry,
            channel,
            retry: RetryPolicy::default(),
        }
    }

    /// Overrides the backoff used for ack/nack calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Dispatches one delivery and settles it.
    ///
    /// Returns the settlement that was applied, or the error of the ack/nack call
    /// once its retries are exhausted.
    pub async fn deliver(
        &self,
        delivery: &InboundDelivery,
        token: CancellationToken,
    ) -> Result<Settlement, AmqpError> {
        let tracer = global::tracer(CONSUMER_TRACER);
        let (_ctx, mut span) = otel::new_span(&delivery.properties, &tracer, &delivery.routing_key);

        debug!(
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            exchange = delivery.exchange,
            routing_key = delivery.routing_key,
            "message received"
        );

        let Some(subscription) = self.registry.get(&delivery.routing_key) else {
            warn!(
                routing_key = delivery.routing_key,
                "message received, but there are no listeners"
            );
            span.set_status(Status::Error {
                description: Cow::from("unsupported msg type"),
            });
            self.settle(delivery.delivery_tag, Settlement::Ack).await?;
            return Ok(Settlement::Ack);
        };

        let outcome = subscription.dispatch(&delivery.data, token).await;

        match &outcome {
            Ok(true) => debug!("message successfully processed"),
            Ok(false) => warn!(
                routing_key = delivery.routing_key,
                "handler rejected message, requeuing for later"
            ),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    routing_key = delivery.routing_key,
                    message_type = subscription.type_name(),
                    delivery_tag = delivery.delivery_tag,
                    "failure processing message, dropping it"
                );
                span.record_error(err);
            }
        }

        let settlement = Settlement::from_outcome(&outcome);
        if let Err(err) = self.settle(delivery.delivery_tag, settlement).await {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to settle msg"),
            });
            return Err(err);
        }

        if outcome.is_ok() {
            span.set_status(Status::Ok);
        }

        Ok(settlement)
    }

    async fn settle(&self, delivery_tag: u64, settlement: Settlement) -> Result<(), AmqpError> {
        let result = match settlement {
            Settlement::Ack => {
                self.retry
                    .run("ack", move || self.channel.basic_ack(delivery_tag))
                    .await
            }
            Settlement::Nack { requeue } => {
                self.retry
                    .run("nack", move || self.channel.basic_nack(delivery_tag, requeue))
                    .await
            }
        };

        if let Err(err) = &result {
            error!(
                error = err.to_string(),
                delivery_tag,
                ?settlement,
                "error while settling msg"
            );
        }

        result
    }

    /// Feeds every delivery of `deliveries` to the dispatcher, each one on its own
    /// task, and returns once the stream ends.
    ///
    /// # Parameters
    /// * `deliveries` - The consumer stream of one channel
    pub async fn run(self: Arc<Self>, mut deliveries: DeliveryStream) {
        while let Some(result) = deliveries.next().await {
            match result {
                Ok(delivery) => {
                    let dispatcher = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = dispatcher
                            .deliver(&delivery, CancellationToken::new())
                            .await
                        {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    });
                }
                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        debug!("consumer stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockAmqpChannel,
        registry::{HandlerError, Message},
    };
    use futures_util::stream;
    use mockall::predicate::eq;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    #[derive(Debug, Serialize, Deserialize)]
    struct MyMessage {
        greeting: String,
    }

    impl Message for MyMessage {}

    fn delivery(tag: u64, routing_key: &str) -> InboundDelivery {
        InboundDelivery {
            delivery_tag: tag,
            exchange: "RabbitMQMessenger".to_owned(),
            routing_key: routing_key.to_owned(),
            data: br#"{"greeting":"hi"}"#.to_vec(),
            ..Default::default()
        }
    }

    fn registry_with(results: Vec<Result<bool, &'static str>>) -> (Arc<SubscriptionRegistry>, Arc<AtomicUsize>) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));

        for result in results {
            let calls = calls.clone();
            registry
                .subscribe(move |msg: Arc<MyMessage>, _| {
                    let calls = calls.clone();
                    async move {
                        assert_eq!(msg.greeting, "hi");
                        calls.fetch_add(1, Ordering::SeqCst);
                        result.map_err(HandlerError::from)
                    }
                })
                .unwrap();
        }

        (registry, calls)
    }

    #[test]
    fn outcomes_map_to_settlements() {
        assert_eq!(Settlement::from_outcome(&Ok(true)), Settlement::Ack);
        assert_eq!(
            Settlement::from_outcome(&Ok(false)),
            Settlement::Nack { requeue: true }
        );
        assert_eq!(
            Settlement::from_outcome(&Err(AmqpError::HandlerError("boom".to_owned()))),
            Settlement::Nack { requeue: false }
        );
    }

    #[tokio::test]
    async fn all_handlers_true_acks_once() {
        let (registry, calls) = registry_with(vec![Ok(true), Ok(true), Ok(true)]);
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_ack()
            .with(eq(1))
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_basic_nack().never();

        let dispatcher = DeliveryDispatcher::new(registry, Arc::new(channel));
        let settlement = dispatcher
            .deliver(&delivery(1, "MyMessage"), CancellationToken::new())
            .await;

        assert_eq!(settlement, Ok(Settlement::Ack));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn one_false_handler_nacks_with_requeue() {
        let (registry, _) = registry_with(vec![Ok(true), Ok(false), Ok(true)]);
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().never();
        channel
            .expect_basic_nack()
            .with(eq(2), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatcher = DeliveryDispatcher::new(registry, Arc::new(channel));
        let settlement = dispatcher
            .deliver(&delivery(2, "MyMessage"), CancellationToken::new())
            .await;

        assert_eq!(settlement, Ok(Settlement::Nack { requeue: true }));
    }

    #[tokio::test]
    async fn handler_error_nacks_without_requeue() {
        let (registry, _) = registry_with(vec![Ok(true), Err("database down")]);
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().never();
        channel
            .expect_basic_nack()
            .with(eq(3), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatcher = DeliveryDispatcher::new(registry, Arc::new(channel));
        let settlement = dispatcher
            .deliver(&delivery(3, "MyMessage"), CancellationToken::new())
            .await;

        assert_eq!(settlement, Ok(Settlement::Nack { requeue: false }));
    }

    #[tokio::test]
    async fn undecodable_payload_nacks_without_requeue() {
        let (registry, calls) = registry_with(vec![Ok(true)]);
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().never();
        channel
            .expect_basic_nack()
            .with(eq(4), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut bad = delivery(4, "MyMessage");
        bad.data = b"{\"greeting\":".to_vec();

        let dispatcher = DeliveryDispatcher::new(registry, Arc::new(channel));
        let settlement = dispatcher.deliver(&bad, CancellationToken::new()).await;

        assert_eq!(settlement, Ok(Settlement::Nack { requeue: false }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unroutable_delivery_is_acked_without_handlers() {
        let (registry, calls) = registry_with(vec![Ok(true)]);
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_ack()
            .with(eq(5))
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_basic_nack().never();

        let dispatcher = DeliveryDispatcher::new(registry, Arc::new(channel));
        let settlement = dispatcher
            .deliver(&delivery(5, "OrderShipped"), CancellationToken::new())
            .await;

        assert_eq!(settlement, Ok(Settlement::Ack));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_is_retried_on_transport_faults() {
        let (registry, _) = registry_with(vec![Ok(true)]);
        let mut channel = MockAmqpChannel::new();
        let mut attempts = 0;
        channel
            .expect_basic_ack()
            .with(eq(6))
            .times(3)
            .returning(move |_| {
                attempts += 1;
                if attempts < 3 {
                    Err(AmqpError::Transport("connection reset".to_owned()))
                } else {
                    Ok(())
                }
            });

        let dispatcher = DeliveryDispatcher::new(registry, Arc::new(channel));
        let settlement = dispatcher
            .deliver(&delivery(6, "MyMessage"), CancellationToken::new())
            .await;

        assert_eq!(settlement, Ok(Settlement::Ack));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_nack_retries_are_reported() {
        let (registry, _) = registry_with(vec![Ok(false)]);
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_nack()
            .with(eq(7), eq(true))
            .times(6)
            .returning(|_, _| Err(AmqpError::Transport("connection reset".to_owned())));

        let dispatcher = DeliveryDispatcher::new(registry, Arc::new(channel));
        let settlement = dispatcher
            .deliver(&delivery(7, "MyMessage"), CancellationToken::new())
            .await;

        assert_eq!(
            settlement,
            Err(AmqpError::Transport("connection reset".to_owned()))
        );
    }

    #[tokio::test]
    async fn run_settles_every_streamed_delivery() {
        let (registry, calls) = registry_with(vec![Ok(true)]);
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().times(3).returning(|_| Ok(()));

        let deliveries: DeliveryStream = stream::iter(vec![
            Ok(delivery(1, "MyMessage")),
            Err(AmqpError::Broker("frame error".to_owned())),
            Ok(delivery(2, "MyMessage")),
            Ok(delivery(3, "Unknown")),
        ])
        .boxed();

        let dispatcher = Arc::new(DeliveryDispatcher::new(registry, Arc::new(channel)));
        dispatcher.run(deliveries).await;

        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
