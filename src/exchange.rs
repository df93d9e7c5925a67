// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! The messenger declares a single direct exchange and routes every message by
//! its resolved type name.

/// Definition of a direct RabbitMQ exchange.
///
/// This struct implements the builder pattern to configure the declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) delete: bool,
}

impl ExchangeDefinition {
    /// Creates a new direct exchange definition.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    ///
    /// # Returns
    /// A definition that keeps the exchange after its last queue is unbound
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            delete: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the exchange to auto-delete once the last queue is unbound.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }
}
