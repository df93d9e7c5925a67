// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connections
//!
//! This module abstracts the broker connection behind the `AmqpConnection` and
//! `ConnectionFactory` traits, and provides the `lapin` implementations used in
//! production. The connection manager only talks to these traits.

use crate::{
    channel::{AmqpChannel, LapinChannel},
    errors::AmqpError,
    settings::RabbitMQSettings,
};
use async_trait::async_trait;
use lapin::{types::LongString, uri::AMQPUri, Connection, ConnectionProperties};
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use tracing::{debug, error};

/// Unexpected events reported by an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection was shut down by the broker or the network.
    Shutdown(String),
    /// The client library raised an error while running a callback.
    CallbackException(String),
    /// The broker blocked the connection, usually because of a resource alarm.
    Blocked(String),
}

impl From<lapin::Error> for ConnectionEvent {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::ProtocolError(e) => ConnectionEvent::CallbackException(e.to_string()),
            other => ConnectionEvent::Shutdown(other.to_string()),
        }
    }
}

/// Callback invoked for every [`ConnectionEvent`].
pub type ConnectionHook = Box<dyn Fn(ConnectionEvent) + Send + Sync>;

/// An open connection to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    /// Registers a hook for shutdown, callback-exception and blocked events.
    fn on_event(&self, hook: ConnectionHook);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens new broker connections.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Opens a connection. Socket failures and an unreachable broker are reported
    /// as [`AmqpError::Transport`].
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// `ConnectionFactory` backed by `lapin`.
pub struct LapinConnectionFactory {
    uri: AMQPUri,
    connection_name: String,
}

impl LapinConnectionFactory {
    pub fn new(settings: &RabbitMQSettings) -> Self {
        LapinConnectionFactory {
            uri: settings.amqp_uri(),
            connection_name: settings.app_name.clone(),
        }
    }
}

#[async_trait]
impl ConnectionFactory for LapinConnectionFactory {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        match Connection::connect_uri(self.uri.clone(), options).await {
            Ok(connection) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection { connection }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::from(err))
            }
        }
    }
}

/// `AmqpConnection` backed by a `lapin` connection.
pub struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.connection.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel::new(c)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    fn on_event(&self, hook: ConnectionHook) {
        self.connection
            .on_error(move |err| hook(ConnectionEvent::from(err)));
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.connection
            .close(200, "closed by messenger")
            .await
            .map_err(AmqpError::from)
    }
}
