// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Persistent Connection Manager
//!
//! Owns the broker connection, re-establishes it with bounded backoff and
//! serializes every state transition under one async lock per instance.
//!
//! Connection events (unexpected shutdown, callback exception, connection
//! blocked) never reconnect inline. The hook registered on the connection only
//! enqueues a request; a supervisor task drains the queue, coalesces bursts and
//! calls [`ConnectionManager::try_connect`] through the same lock. Requests coming
//! from a connection that has already been replaced are ignored.

use crate::{
    channel::AmqpChannel,
    connection::{AmqpConnection, ConnectionEvent, ConnectionFactory},
    errors::AmqpError,
    retry::RetryPolicy,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError, RwLock, Weak,
};
use tokio::{
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        watch, Mutex as AsyncMutex,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const COMPONENT: &str = "ConnectionManager";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Disposed; terminal.
    Closed,
}

struct Current {
    state: ConnectionState,
    connection: Option<Arc<dyn AmqpConnection>>,
}

/// A reconnect request, tagged with the generation of the connection that
/// raised it.
type ReconnectRequest = (u64, ConnectionEvent);

pub struct ConnectionManager {
    me: Weak<ConnectionManager>,
    factory: Arc<dyn ConnectionFactory>,
    retry: RetryPolicy,
    transitions: AsyncMutex<()>,
    current: RwLock<Current>,
    generations: watch::Sender<u64>,
    disposed: Arc<AtomicBool>,
    shutdown: CancellationToken,
    requests: UnboundedSender<ReconnectRequest>,
    pending: Mutex<Option<UnboundedReceiver<ReconnectRequest>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        Self::with_retry(factory, RetryPolicy::default())
    }

    pub fn with_retry(factory: Arc<dyn ConnectionFactory>, retry: RetryPolicy) -> Arc<Self> {
        let (requests, pending) = unbounded_channel();

        Arc::new_cyclic(|me| ConnectionManager {
            me: me.clone(),
            factory,
            retry,
            transitions: AsyncMutex::new(()),
            current: RwLock::new(Current {
                state: ConnectionState::Disconnected,
                connection: None,
            }),
            generations: watch::channel(0).0,
            disposed: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            requests,
            pending: Mutex::new(Some(pending)),
            supervisor: Mutex::new(None),
        })
    }

    /// True iff not disposed and the current connection is open.
    pub fn is_connected(&self) -> bool {
        !self.is_disposed() && self.open_connection().is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Generation of the current connection: 0 before the first successful
    /// connect, then incremented once per established connection.
    pub fn generation(&self) -> u64 {
        *self.generations.borrow()
    }

    /// Subscribes to connection generations.
    ///
    /// # Returns
    /// A receiver that is notified every time a new connection is installed, so
    /// that channels opened on the previous connection can be rebuilt
    pub fn watch_generations(&self) -> watch::Receiver<u64> {
        self.generations.subscribe()
    }

    /// Aborts an in-flight connection attempt, including its backoff wait, and
    /// refuses new ones. The current connection stays open until
    /// [`ConnectionManager::dispose`].
    pub fn interrupt(&self) {
        self.shutdown.cancel();
    }

    fn is_stopping(&self) -> bool {
        self.is_disposed() || self.shutdown.is_cancelled()
    }

    pub fn state(&self) -> ConnectionState {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        match current.state {
            ConnectionState::Connected if !self.is_connected_locked(&current) => {
                ConnectionState::Disconnected
            }
            state => state,
        }
    }

    fn is_connected_locked(&self, current: &Current) -> bool {
        !self.is_disposed() && current.connection.as_ref().is_some_and(|c| c.is_open())
    }

    fn open_connection(&self) -> Option<Arc<dyn AmqpConnection>> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        current
            .connection
            .as_ref()
            .filter(|connection| connection.is_open())
            .cloned()
    }

    fn set_state(&self, state: ConnectionState) {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .state = state;
    }

    /// Opens a connection, retrying transient transport faults with backoff.
    ///
    /// Returns `Ok(false)` once the retries are exhausted. Faults that are not
    /// transient are returned as errors without retrying.
    pub async fn try_connect(&self) -> Result<bool, AmqpError> {
        let _transition = self.transitions.lock().await;
        self.connect_locked().await
    }

    /// Like [`ConnectionManager::try_connect`], but keeps the current connection
    /// when it is still open, including one installed while waiting for the lock.
    ///
    /// # Returns
    /// `Ok(true)` when an open connection is available afterwards
    pub async fn ensure_connected(&self) -> Result<bool, AmqpError> {
        let _transition = self.transitions.lock().await;
        if self.is_connected() {
            return Ok(true);
        }
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> Result<bool, AmqpError> {
        debug!("attempting to connect to RabbitMQ");

        if self.is_stopping() {
            return Err(AmqpError::Disposed(COMPONENT.to_owned()));
        }

        self.set_state(ConnectionState::Connecting);

        let this = self;
        let attempts = self.retry.run("connect", move || async move {
            if this.is_stopping() {
                return Err(AmqpError::Disposed(COMPONENT.to_owned()));
            }
            this.factory.connect().await
        });

        let result = tokio::select! {
            result = attempts => result,
            _ = self.shutdown.cancelled() => Err(AmqpError::Disposed(COMPONENT.to_owned())),
        };

        match result {
            Ok(connection) if connection.is_open() && !self.is_stopping() => {
                self.install(connection).await;
                debug!("RabbitMQ connection established");
                Ok(true)
            }
            Ok(connection) => {
                if let Err(err) = connection.close().await {
                    debug!(error = err.to_string(), "error closing unused connection");
                }

                if self.is_stopping() {
                    return Err(AmqpError::Disposed(COMPONENT.to_owned()));
                }

                error!("FATAL ERROR: RabbitMQ connection could not be established");
                self.set_state(ConnectionState::Disconnected);
                Ok(false)
            }
            Err(err) if err.is_transient() => {
                error!(
                    error = err.to_string(),
                    "FATAL ERROR: RabbitMQ connection could not be established"
                );
                self.set_state(ConnectionState::Disconnected);
                Ok(false)
            }
            Err(err) => {
                if !self.is_disposed() {
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(err)
            }
        }
    }

    /// Makes `connection` the current one, wires its event hook, publishes the
    /// new generation and retires the previous handle.
    async fn install(&self, connection: Arc<dyn AmqpConnection>) {
        let generation = self.generation() + 1;

        let requests = self.requests.clone();
        let disposed = self.disposed.clone();
        connection.on_event(Box::new(move |event| {
            if disposed.load(Ordering::SeqCst) {
                return;
            }
            if requests.send((generation, event)).is_err() {
                debug!("reconnect supervisor is gone");
            }
        }));

        let previous = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            current.state = ConnectionState::Connected;
            current.connection.replace(connection)
        };

        self.generations.send_replace(generation);
        self.ensure_supervisor();

        if let Some(previous) = previous {
            if let Err(err) = previous.close().await {
                debug!(error = err.to_string(), "error closing replaced connection");
            }
        }
    }

    fn ensure_supervisor(&self) {
        let Some(pending) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let handle = tokio::spawn(supervise(self.me.clone(), pending));
        *self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Opens a new channel on the current connection.
    pub async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if self.is_disposed() {
            return Err(AmqpError::Disposed(COMPONENT.to_owned()));
        }

        let Some(connection) = self.open_connection() else {
            return Err(AmqpError::InvalidState(
                "No RabbitMQ connections are available to perform this action".to_owned(),
            ));
        };

        connection.create_channel().await
    }

    /// Closes the connection. Idempotent; close faults are logged, never returned.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();
        let _transition = self.transitions.lock().await;

        let connection = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            current.state = ConnectionState::Closed;
            current.connection.take()
        };

        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                error!(error = err.to_string(), "error closing RabbitMQ connection");
            }
        }

        if let Some(supervisor) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            supervisor.abort();
        }

        debug!("connection manager disposed");
    }
}

async fn supervise(manager: Weak<ConnectionManager>, mut requests: UnboundedReceiver<ReconnectRequest>) {
    while let Some((mut generation, mut event)) = requests.recv().await {
        while let Ok((next_generation, next_event)) = requests.try_recv() {
            if next_generation >= generation {
                generation = next_generation;
                event = next_event;
            }
        }

        let Some(manager) = manager.upgrade() else {
            break;
        };

        if manager.is_disposed() {
            break;
        }

        if generation != manager.generation() {
            debug!(?event, "ignoring event from a replaced connection");
            continue;
        }

        match &event {
            ConnectionEvent::Shutdown(reason) => warn!(
                reason = reason,
                "A RabbitMQ connection has been shutdown. Trying to re-connect..."
            ),
            ConnectionEvent::CallbackException(reason) => warn!(
                reason = reason,
                "A RabbitMQ connection threw an exception. Trying to re-connect..."
            ),
            ConnectionEvent::Blocked(reason) => warn!(
                reason = reason,
                "A RabbitMQ connection is blocked. Trying to re-connect..."
            ),
        }

        match manager.try_connect().await {
            Ok(true) => {}
            Ok(false) => error!("reconnect failed, giving up until the next event"),
            Err(err) => error!(error = err.to_string(), "reconnect aborted"),
        }
    }
}
