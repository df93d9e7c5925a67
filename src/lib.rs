// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient publish/subscribe messenger over RabbitMQ.
//!
//! Subscriptions are registered per message type on a [`SubscriptionRegistry`],
//! then a [`Messenger`] declares the topology, consumes with manual
//! acknowledgement and publishes JSON messages routed by type name. The
//! [`ConnectionManager`] keeps the broker connection alive with bounded backoff.

mod otel;

pub mod channel;
pub mod connection;
pub mod connection_manager;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod hosted;
pub mod messenger;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod settings;
pub mod topology;

pub use connection_manager::{ConnectionManager, ConnectionState};
pub use errors::AmqpError;
pub use hosted::{HostedService, RabbitMQHostedService};
pub use messenger::Messenger;
pub use registry::{HandlerError, HandlerResult, Message, SubscriptionRegistry};
pub use settings::RabbitMQSettings;
