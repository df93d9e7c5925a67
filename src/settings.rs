// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messenger Settings
//!
//! Connection and topology settings consumed from the host. Settings are
//! immutable once the connection and the topology have been created.

use crate::errors::AmqpError;
use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::env;
use tracing::debug;

pub const DEFAULT_SERVER_NAME: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_VIRTUAL_HOST: &str = "/";
pub const DEFAULT_EXCHANGE_NAME: &str = "RabbitMQMessenger";

/// Application name used when the running executable cannot be determined.
pub const FALLBACK_APP_NAME: &str = "RabbitMQMessenger";

/// Name of the running application: the file stem of the current executable.
///
/// This is the default queue name, so two applications started with default
/// settings never share a queue.
///
/// # Returns
/// The executable name without extension, or [`FALLBACK_APP_NAME`] when the
/// executable path is unavailable.
pub fn default_app_name() -> String {
    env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_APP_NAME.to_owned())
}

/// RabbitMQ settings.
///
/// Only the credentials are required, everything else falls back to a default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQSettings {
    pub server_name: String,
    pub port: u16,
    pub user_name: String,
    pub password: String,
    pub virtual_host: String,
    pub exchange_name: String,
    pub queue_name: String,
    /// Client-provided connection name shown in the broker management UI.
    pub app_name: String,
}

impl Default for RabbitMQSettings {
    fn default() -> Self {
        RabbitMQSettings {
            server_name: DEFAULT_SERVER_NAME.to_owned(),
            port: DEFAULT_PORT,
            user_name: String::new(),
            password: String::new(),
            virtual_host: DEFAULT_VIRTUAL_HOST.to_owned(),
            exchange_name: DEFAULT_EXCHANGE_NAME.to_owned(),
            queue_name: default_app_name(),
            app_name: default_app_name(),
        }
    }
}

impl RabbitMQSettings {
    /// Creates settings with the given credentials and defaults for the rest.
    pub fn new(user_name: &str, password: &str) -> Self {
        RabbitMQSettings {
            user_name: user_name.to_owned(),
            password: password.to_owned(),
            ..Default::default()
        }
    }

    pub fn server_name(mut self, server_name: &str) -> Self {
        self.server_name = server_name.to_owned();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn virtual_host(mut self, virtual_host: &str) -> Self {
        self.virtual_host = virtual_host.to_owned();
        self
    }

    pub fn exchange_name(mut self, exchange_name: &str) -> Self {
        self.exchange_name = exchange_name.to_owned();
        self
    }

    pub fn queue_name(mut self, queue_name: &str) -> Self {
        self.queue_name = queue_name.to_owned();
        self
    }

    /// Sets the application name. The queue name follows it unless it was
    /// explicitly changed before.
    pub fn app_name(mut self, app_name: &str) -> Self {
        if self.queue_name == self.app_name {
            self.queue_name = app_name.to_owned();
        }
        self.app_name = app_name.to_owned();
        self
    }

    /// Loads the settings from `RABBITMQ_*` environment variables, reading a
    /// `.env` file first when one is present.
    ///
    /// Recognized variables: `RABBITMQ_SERVER_NAME`, `RABBITMQ_PORT`,
    /// `RABBITMQ_USER_NAME`, `RABBITMQ_PASSWORD`, `RABBITMQ_VIRTUAL_HOST`,
    /// `RABBITMQ_EXCHANGE_NAME`, `RABBITMQ_QUEUE_NAME` and `RABBITMQ_APP_NAME`.
    pub fn from_env() -> Result<Self, AmqpError> {
        if dotenv::dotenv().is_ok() {
            debug!("loaded .env file");
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = RabbitMQSettings::default();
        let read = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = read("RABBITMQ_APP_NAME") {
            settings = settings.app_name(&v);
        }
        if let Some(v) = read("RABBITMQ_SERVER_NAME") {
            settings.server_name = v;
        }
        if let Some(v) = read("RABBITMQ_PORT") {
            settings.port = v
                .parse()
                .map_err(|_| AmqpError::InvalidArgument("RABBITMQ_PORT".to_owned()))?;
        }
        if let Some(v) = read("RABBITMQ_USER_NAME") {
            settings.user_name = v;
        }
        if let Some(v) = read("RABBITMQ_PASSWORD") {
            settings.password = v;
        }
        if let Some(v) = read("RABBITMQ_VIRTUAL_HOST") {
            settings.virtual_host = v;
        }
        if let Some(v) = read("RABBITMQ_EXCHANGE_NAME") {
            settings.exchange_name = v;
        }
        if let Some(v) = read("RABBITMQ_QUEUE_NAME") {
            settings.queue_name = v;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Checks that the required settings are present.
    pub fn validate(&self) -> Result<(), AmqpError> {
        let required = [
            ("user_name", &self.user_name),
            ("password", &self.password),
            ("server_name", &self.server_name),
            ("exchange_name", &self.exchange_name),
            ("queue_name", &self.queue_name),
        ];

        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(AmqpError::InvalidArgument(name.to_owned()));
            }
        }

        Ok(())
    }

    /// Builds the broker URI.
    ///
    /// The URI is assembled field by field, so credentials and virtual hosts
    /// containing `@`, `:`, `/` or `%` need no escaping.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user_name.clone(),
                    password: self.password.clone(),
                },
                host: self.server_name.clone(),
                port: self.port,
            },
            vhost: self.virtual_host.clone(),
            ..Default::default()
        }
    }
}
