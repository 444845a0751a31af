// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle
//!
//! The `ConnectionManager` owns at most one live connection to one of its candidate
//! endpoints together with the persistent channel opened on it. Both are created
//! lazily and discarded as soon as the broker or the network closes the connection.
//!
//! Components that need broker state to exist (exchanges, queues, bindings) register
//! a [`ReconnectHook`]. Hooks run on every new connection before its channel is
//! handed out, so a producer or consumer never operates on a connection whose
//! topology has not been declared.

use crate::{
    broker::{BrokerChannel, BrokerConnection, Connector},
    channel::LapinConnector,
    configs::ClientConfigs,
    endpoint::{self, Endpoint},
    errors::AmqpError,
};
use async_trait::async_trait;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Work re-run on every newly established connection.
#[async_trait]
pub trait ReconnectHook: Send + Sync {
    async fn on_reconnect(&self, channel: &Arc<dyn BrokerChannel>) -> Result<(), AmqpError>;
}

struct RegisteredHook {
    hook: Arc<dyn ReconnectHook>,
    /// Connection generation the hook last completed on; 0 means never.
    generation: u64,
}

#[derive(Default)]
struct Session {
    connection: Option<Arc<dyn BrokerConnection>>,
    /// Cleared by the close callback of `connection`.
    alive: Arc<AtomicBool>,
    channel: Option<Arc<dyn BrokerChannel>>,
    generation: u64,
}

impl Session {
    fn connection_alive(&self) -> bool {
        match &self.connection {
            Some(connection) => self.alive.load(Ordering::SeqCst) && connection.is_connected(),
            None => false,
        }
    }

    fn open_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        match &self.channel {
            Some(channel) if self.connection_alive() && channel.is_open() => Some(channel.clone()),
            _ => None,
        }
    }

    fn reset(&mut self) {
        self.connection = None;
        self.channel = None;
        self.alive = Arc::new(AtomicBool::new(false));
    }
}

/// Owns the connection and persistent channel of one client instance.
pub struct ConnectionManager {
    endpoints: Vec<Endpoint>,
    connector: Arc<dyn Connector>,
    session: Mutex<Session>,
    hooks: StdMutex<Vec<RegisteredHook>>,
}

impl ConnectionManager {
    /// Creates a manager that tries `endpoints` in the given order.
    pub fn new(endpoints: Vec<Endpoint>, connector: Arc<dyn Connector>) -> ConnectionManager {
        ConnectionManager {
            endpoints,
            connector,
            session: Mutex::new(Session::default()),
            hooks: StdMutex::new(vec![]),
        }
    }

    /// Creates a `lapin` backed manager over the configured (shuffled) endpoints.
    pub fn from_configs(cfg: &ClientConfigs) -> Result<ConnectionManager, AmqpError> {
        Ok(ConnectionManager::new(
            cfg.endpoints()?,
            Arc::new(LapinConnector::new(cfg)),
        ))
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Registers a hook run on every new connection.
    ///
    /// A hook registered while a connection is already open runs the next time the
    /// persistent channel is requested.
    pub fn register_hook(&self, hook: Arc<dyn ReconnectHook>) {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RegisteredHook {
                hook,
                generation: 0,
            });
    }

    /// Returns the live connection, establishing one if needed.
    ///
    /// Fails with `BrokerUnreachable` when no endpoint accepts a connection. There is
    /// no retry here; callers own their retry policy.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut session = self.session.lock().await;
        self.ensure_connection(&mut session).await
    }

    /// Returns the long-lived channel of the current connection.
    ///
    /// On a new connection every registered hook runs before the channel is returned.
    pub async fn persistent_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut session = self.session.lock().await;

        let channel = match session.open_channel() {
            Some(channel) => channel,
            None => {
                let connection = self.ensure_connection(&mut session).await?;
                let channel = match connection.create_channel().await {
                    Ok(channel) => channel,
                    Err(err) => {
                        session.reset();
                        return Err(err);
                    }
                };
                session.channel = Some(channel.clone());
                channel
            }
        };

        if let Err(err) = self.run_pending_hooks(session.generation, &channel).await {
            if err.is_recoverable() {
                session.reset();
            }
            return Err(err);
        }

        Ok(channel)
    }

    /// Runs `f` on a fresh channel that is closed on every exit path.
    pub async fn with_channel<F, Fut, T>(&self, f: F) -> Result<T, AmqpError>
    where
        F: FnOnce(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let connection = self.connect().await?;
        let guard = ScopedChannel::new(connection.create_channel().await?);

        let result = f(guard.channel()).await;
        guard.release().await;

        result
    }

    /// Discards the cached connection and channel.
    ///
    /// A connection that is still open is closed first, so the broker releases its
    /// exclusive queues before the next connection declares them again.
    pub async fn invalidate(&self) {
        let mut session = self.session.lock().await;
        let connection = session.connection.take();
        session.reset();

        if let Some(connection) = connection {
            debug!("invalidating amqp session");
            if connection.is_connected() {
                if let Err(err) = connection.close().await {
                    debug!(error = err.to_string(), "failure to close invalidated connection");
                }
            }
        }
    }

    /// Gracefully closes the current connection, if any.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let mut session = self.session.lock().await;
        let connection = session.connection.take();
        session.reset();

        match connection {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }

    async fn ensure_connection(
        &self,
        session: &mut Session,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        if let (Some(connection), true) = (&session.connection, session.connection_alive()) {
            return Ok(connection.clone());
        }

        session.reset();

        for endpoint in &self.endpoints {
            match self.connector.connect(endpoint).await {
                Ok(connection) => {
                    let alive = Arc::new(AtomicBool::new(true));
                    let flag = alive.clone();
                    let name = endpoint.to_string();
                    connection.on_close(Box::new(move |err| {
                        flag.store(false, Ordering::SeqCst);
                        warn!(error = err.to_string(), endpoint = name, "amqp connection closed");
                    }));

                    session.generation += 1;
                    session.alive = alive;
                    session.connection = Some(connection.clone());
                    info!(
                        endpoint = endpoint.to_string(),
                        generation = session.generation,
                        "amqp connection established"
                    );

                    return Ok(connection);
                }
                Err(err) => {
                    debug!(error = err.to_string(), endpoint = endpoint.to_string(), "endpoint refused");
                }
            }
        }

        // Reported by the caller; a consumer retrying through an outage logs it once.
        let all = endpoint::describe(&self.endpoints);
        debug!(endpoints = all, "no amqp broker reachable");
        Err(AmqpError::BrokerUnreachable(all))
    }

    async fn run_pending_hooks(
        &self,
        generation: u64,
        channel: &Arc<dyn BrokerChannel>,
    ) -> Result<(), AmqpError> {
        let pending: Vec<(usize, Arc<dyn ReconnectHook>)> = self
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .enumerate()
            .filter(|(_, registered)| registered.generation != generation)
            .map(|(idx, registered)| (idx, registered.hook.clone()))
            .collect();

        for (idx, hook) in pending {
            hook.on_reconnect(channel).await?;

            if let Some(registered) = self
                .hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_mut(idx)
            {
                registered.generation = generation;
            }
        }

        Ok(())
    }
}

/// A channel closed when released, or in the background if dropped unreleased.
struct ScopedChannel {
    channel: Arc<dyn BrokerChannel>,
    released: bool,
}

impl ScopedChannel {
    fn new(channel: Arc<dyn BrokerChannel>) -> ScopedChannel {
        ScopedChannel {
            channel,
            released: false,
        }
    }

    fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.channel.clone()
    }

    async fn release(mut self) {
        self.released = true;
        if let Err(err) = self.channel.close().await {
            warn!(error = err.to_string(), "failure to close scoped channel");
        }
    }
}

impl Drop for ScopedChannel {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let channel = self.channel.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = channel.close().await {
                    warn!(error = err.to_string(), "failure to close scoped channel");
                }
            });
        }
    }
}
