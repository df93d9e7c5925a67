// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Messenger
//!
//! This module provides the error type shared by every layer of the messenger:
//! connection management, channel and topology operations, publishing, delivery
//! dispatch and configuration. The `AmqpError` enum also knows which failures are
//! transient transport faults and therefore eligible for retry.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant provides specific context about what operation failed. Only
/// [`AmqpError::Transport`] is considered recoverable by the retry policies.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Socket-level failure or unreachable broker
    #[error("transport failure `{0}`")]
    Transport(String),

    /// Non-transport error reported by the broker client
    #[error("broker failure `{0}`")]
    Broker(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Operation attempted while the connection or channel is not usable
    #[error("invalid state `{0}`")]
    InvalidState(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing an outgoing payload
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// A handler reported an error or panicked
    #[error("handler failure `{0}`")]
    HandlerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The consumer stream of a channel ended
    #[error("consumer `{0}` stopped")]
    ConsumerCancelled(String),

    /// Subscriptions can no longer be changed
    #[error("subscription registry is sealed")]
    RegistrySealed,

    /// Two different message types resolved to the same routing key
    #[error("routing key `{0}` is already bound to message type `{1}`")]
    MessageTypeConflict(String, String),

    /// A required argument or setting is missing or empty
    #[error("invalid argument `{0}`")]
    InvalidArgument(String),

    /// The component was used after being disposed
    #[error("`{0}` has been disposed")]
    Disposed(String),
}

impl AmqpError {
    /// Returns true for faults that are worth retrying: socket-level failures and
    /// an unreachable broker.
    pub fn is_transient(&self) -> bool {
        matches!(self, AmqpError::Transport(_))
    }
}

impl From<lapin::Error> for AmqpError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(io) => AmqpError::Transport(io.to_string()),
            other => AmqpError::Broker(other.to_string()),
        }
    }
}
