// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queue declarations and their bindings to an exchange.

/// Builder for a non-durable queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) delete: bool,
}

impl QueueDefinition {
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Auto-delete when the last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }
}

/// Binds `queue_name` to `exchange_name` for one routing key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// A binding for `queue`. Exchange and routing key start empty.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..Default::default()
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_are_transient_by_default() {
        let def = QueueDefinition::new("greeter");

        assert_eq!(def.name(), "greeter");
        assert!(!def.delete);
        assert!(QueueDefinition::new("greeter").delete().delete);
    }

    #[test]
    fn binding_collects_exchange_and_key() {
        let binding = QueueBinding::new("greeter")
            .exchange("RabbitMQMessenger")
            .routing_key("MyMessage");

        assert_eq!(binding.queue_name, "greeter");
        assert_eq!(binding.exchange_name, "RabbitMQMessenger");
        assert_eq!(binding.routing_key, "MyMessage");
    }
}
