// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Hosted Service
//!
//! Bridges the [`Messenger`] to a host start/stop lifecycle. Nothing touches the
//! broker until [`HostedService::start`] runs.

use crate::{
    connection::{ConnectionFactory, LapinConnectionFactory},
    connection_manager::ConnectionManager,
    errors::AmqpError,
    messenger::Messenger,
    registry::SubscriptionRegistry,
    settings::RabbitMQSettings,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

const COMPONENT: &str = "RabbitMQHostedService";

/// Start/stop hooks driven by the host.
#[async_trait]
pub trait HostedService: Send + Sync {
    /// Brings the service up.
    ///
    /// # Returns
    /// The fault that kept the service from starting
    async fn start(&self) -> Result<(), AmqpError>;

    /// Releases every resource. Never fails.
    async fn stop(&self);
}

#[derive(Default)]
struct Lifecycle {
    messenger: Option<Arc<Messenger>>,
    stopped: bool,
}

/// Hosts one [`Messenger`] built from [`RabbitMQSettings`].
pub struct RabbitMQHostedService {
    settings: RabbitMQSettings,
    registry: Arc<SubscriptionRegistry>,
    factory: Arc<dyn ConnectionFactory>,
    lifecycle: Mutex<Lifecycle>,
}

impl RabbitMQHostedService {
    /// Validates `settings`, registers subscriptions through `configure` and wires
    /// the `lapin` connection factory.
    ///
    /// # Parameters
    /// * `settings` - Broker address, credentials, exchange and queue names
    /// * `configure` - Registers every subscription before the messenger starts
    ///
    /// # Returns
    /// `InvalidArgument` for incomplete settings, or the first error returned by
    /// `configure`
    pub fn new<F>(settings: RabbitMQSettings, configure: F) -> Result<Self, AmqpError>
    where
        F: FnOnce(&SubscriptionRegistry) -> Result<(), AmqpError>,
    {
        settings.validate()?;
        let factory = Arc::new(LapinConnectionFactory::new(&settings));
        Self::with_factory(settings, factory, configure)
    }

    /// Like [`RabbitMQHostedService::new`], connecting through `factory`.
    pub fn with_factory<F>(
        settings: RabbitMQSettings,
        factory: Arc<dyn ConnectionFactory>,
        configure: F,
    ) -> Result<Self, AmqpError>
    where
        F: FnOnce(&SubscriptionRegistry) -> Result<(), AmqpError>,
    {
        settings.validate()?;

        let registry = SubscriptionRegistry::new();
        configure(&registry)?;

        Ok(RabbitMQHostedService {
            settings,
            registry: Arc::new(registry),
            factory,
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// The live messenger.
    ///
    /// # Returns
    /// `None` before [`HostedService::start`] succeeds and after
    /// [`HostedService::stop`]
    pub async fn messenger(&self) -> Option<Arc<Messenger>> {
        self.lifecycle.lock().await.messenger.clone()
    }
}

#[async_trait]
impl HostedService for RabbitMQHostedService {
    /// Connects the messenger. A second call is a no-op; a call after `stop` fails.
    async fn start(&self) -> Result<(), AmqpError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.stopped {
            return Err(AmqpError::Disposed(COMPONENT.to_owned()));
        }
        if lifecycle.messenger.is_some() {
            return Ok(());
        }

        debug!(
            server = self.settings.server_name,
            exchange = self.settings.exchange_name,
            queue = self.settings.queue_name,
            "starting messenger"
        );

        let connection = ConnectionManager::new(self.factory.clone());
        match Messenger::connect(
            connection.clone(),
            self.registry.clone(),
            &self.settings.exchange_name,
            &self.settings.queue_name,
        )
        .await
        {
            Ok(messenger) => {
                lifecycle.messenger = Some(messenger);
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to start messenger");
                connection.dispose().await;
                Err(err)
            }
        }
    }

    /// Disposes the messenger. Idempotent.
    async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        lifecycle.stopped = true;

        if let Some(messenger) = lifecycle.messenger.take() {
            messenger.dispose().await;
            debug!("messenger stopped");
        }
    }
}
