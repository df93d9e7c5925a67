// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides functionality for defining and creating RabbitMQ topology
//! components: exchanges, queues, and the bindings between them.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation of the Topology trait over an `AmqpChannel`

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Trait defining the interface for topology management.
///
/// This trait provides methods for registering exchanges and queues,
/// as well as installing the topology to the RabbitMQ server.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This creates all the exchanges and queues, and sets up all the bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Topology installed through an [`AmqpChannel`].
pub struct AmqpTopology {
    channel: Arc<dyn AmqpChannel>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn AmqpChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// Binds `queue` to `exchange` once per routing key.
    pub fn bind_keys<'k, I>(mut self, queue: &str, exchange: &str, keys: I) -> Self
    where
        I: IntoIterator<Item = &'k String>,
    {
        for key in keys {
            self.queues_binding
                .push(QueueBinding::new(queue).exchange(exchange).routing_key(key));
        }
        self
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        if !self.queues.iter().any(|q| q.name == def.name) {
            self.queues.push(def);
        }
        self
    }

    /// Declares exchanges, then queues, then queue bindings. The first failure
    /// aborts the installation.
    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.channel.exchange_declare(exch).await?;
            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);
            self.channel.queue_declare(def).await?;
            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            self.channel.queue_bind(binding).await?;
        }

        debug!("queue was bounded");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockAmqpChannel;
    use mockall::{predicate::eq, Sequence};

    #[tokio::test]
    async fn installs_exchanges_then_queues_then_bindings() {
        let mut channel = MockAmqpChannel::new();
        let mut seq = Sequence::new();

        channel
            .expect_exchange_declare()
            .withf(|def| def.name == "RabbitMQMessenger" && def.delete)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_queue_declare()
            .withf(|def| def.name == "greeter" && def.delete)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_queue_bind()
            .with(eq(QueueBinding::new("greeter")
                .exchange("RabbitMQMessenger")
                .routing_key("MyMessage")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_queue_bind()
            .with(eq(QueueBinding::new("greeter")
                .exchange("RabbitMQMessenger")
                .routing_key("orders.created")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let keys = vec!["MyMessage".to_owned(), "orders.created".to_owned()];
        let topology = AmqpTopology::new(Arc::new(channel))
            .exchange(ExchangeDefinition::new("RabbitMQMessenger").delete())
            .queue(QueueDefinition::new("greeter").delete())
            .bind_keys("greeter", "RabbitMQMessenger", &keys);

        assert!(topology.install().await.is_ok());
    }

    #[tokio::test]
    async fn stops_at_the_first_failure() {
        let mut channel = MockAmqpChannel::new();

        channel
            .expect_exchange_declare()
            .times(1)
            .returning(|def| Err(AmqpError::DeclareExchangeError(def.name.clone())));
        channel.expect_queue_declare().never();
        channel.expect_queue_bind().never();

        let topology = AmqpTopology::new(Arc::new(channel))
            .exchange(ExchangeDefinition::new("RabbitMQMessenger"))
            .queue(QueueDefinition::new("greeter"));

        assert_eq!(
            topology.install().await,
            Err(AmqpError::DeclareExchangeError("RabbitMQMessenger".to_owned()))
        );
    }

    #[test]
    fn duplicate_queues_are_declared_once() {
        let topology = AmqpTopology::new(Arc::new(MockAmqpChannel::new()))
            .queue(QueueDefinition::new("greeter"))
            .queue(QueueDefinition::new("greeter").delete());

        assert_eq!(topology.queues.len(), 1);
    }
}
