// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides functionality for consuming and processing messages from RabbitMQ.
//! It implements the receive-dispatch-acknowledge loop, including error handling, the
//! opt-in retry mechanism and Dead Letter Queue (DLQ) integration. The module also
//! supports OpenTelemetry for distributed tracing.
//!
//! A [`Consumer`] moves through `Disconnected -> Connecting -> Declaring -> Consuming`.
//! Any transport failure brings it back to `Disconnected`, from where it reconnects
//! with capped exponential backoff. Its topology is declared again on every new
//! connection before consumption resumes. Only a stop request or a configuration
//! error (`NotConfigured`, `TopologyConflict`) ends [`Consumer::run`].

use crate::{
    broker::{BrokerChannel, IncomingMessage},
    codec,
    configs::ClientConfigs,
    connection::ConnectionManager,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind, ExchangeNaming},
    otel,
    queue::{QueueBinding, QueueDefinition},
    topology::{AmqpTopology, Topology},
};
use async_trait::async_trait;
use futures_util::FutureExt;
use lapin::{protocol::basic::AMQPProperties, types::FieldTable};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{FutureExt as _, Span, Status},
};
use serde_json::Value;
use std::{
    borrow::Cow, error::Error, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Error returned by a [`MessageHandler`].
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// `Ok(true)` acknowledges the message; `Ok(false)` or an error rejects it.
pub type HandlerResult = Result<bool, HandlerError>;

/// User code invoked once per delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn process(&self, message: Value) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn process(&self, message: Value) -> HandlerResult {
        (self)(message).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Declaring,
    Consuming,
}

/// Bounded redelivery of failed messages through a TTL retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Time a failed message waits before being delivered again
    pub delay: Duration,
    /// Attempts after which the message is moved to the DLQ
    pub retries: u32,
}

/// Configuration of a [`Consumer`].
///
/// A consumer needs a queue name, an exchange name or both. Without a queue name
/// an exclusive, auto-deleted queue named after the host and process is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub queue_name: Option<String>,
    pub exchange_name: Option<String>,
    /// When set, the exchange is declared before the queue.
    pub exchange_kind: Option<ExchangeKind>,
    pub naming: ExchangeNaming,
    pub routing_keys: Vec<String>,
    /// Adds the `x-ha-policy` mirroring argument to the queue
    pub mirrored: bool,
    pub retry: Option<RetryPolicy>,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        let cfg = ClientConfigs::default();
        ConsumerConfig {
            queue_name: None,
            exchange_name: None,
            exchange_kind: None,
            naming: ExchangeNaming::Plain,
            routing_keys: vec![],
            mirrored: true,
            retry: None,
            reconnect_delay: cfg.reconnect_delay(),
            max_reconnect_delay: cfg.max_reconnect_delay(),
        }
    }
}

impl ConsumerConfig {
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue_name = Some(name.into());
        self
    }

    pub fn exchange(mut self, name: impl Into<String>) -> Self {
        self.exchange_name = Some(name.into());
        self
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = Some(kind);
        self
    }

    pub fn naming(mut self, naming: ExchangeNaming) -> Self {
        self.naming = naming;
        self
    }

    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_keys.push(key.into());
        self
    }

    pub fn mirrored(mut self, mirrored: bool) -> Self {
        self.mirrored = mirrored;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn reconnect(mut self, delay: Duration, max_delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnect_delay = max_delay.max(delay);
        self
    }

    /// Takes the reconnection timings from the client configuration.
    pub fn timings(self, cfg: &ClientConfigs) -> Self {
        self.reconnect(cfg.reconnect_delay(), cfg.max_reconnect_delay())
    }
}

/// Stops a running [`Consumer`] from any task.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn new() -> StopHandle {
        StopHandle::default()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`StopHandle::stop`] has been called on any clone.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

enum Outcome {
    Processed,
    Failed(String),
    Undecodable(String),
}

/// Subscribes to one queue and dispatches its messages to a [`MessageHandler`].
pub struct Consumer {
    manager: Arc<ConnectionManager>,
    queue: QueueDefinition,
    topology: Arc<AmqpTopology>,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
    state: watch::Sender<ConsumerState>,
    stop: StopHandle,
    tracer: BoxedTracer,
}

impl Consumer {
    /// Validates `config` and registers the consumer topology on `manager`.
    ///
    /// Nothing is sent to the broker until [`Consumer::run`] is called.
    pub fn new(manager: Arc<ConnectionManager>, config: ConsumerConfig) -> Result<Consumer, AmqpError> {
        let queue_name = config.queue_name.filter(|name| !name.trim().is_empty());
        let exchange_name = config.exchange_name.filter(|name| !name.trim().is_empty());

        if queue_name.is_none() && exchange_name.is_none() {
            return Err(AmqpError::NotConfigured(
                "a consumer requires a queue name or an exchange name".to_owned(),
            ));
        }

        let mut queue = match queue_name {
            Some(name) => QueueDefinition::shared(name),
            None if config.retry.is_some() => {
                return Err(AmqpError::NotConfigured(
                    "retries require an explicit queue name".to_owned(),
                ));
            }
            None => QueueDefinition::ephemeral(),
        };

        if config.mirrored {
            queue = queue.mirrored();
        }

        if let Some(policy) = config.retry {
            let delay = i32::try_from(policy.delay.as_millis()).unwrap_or(i32::MAX);
            let retries = i32::try_from(policy.retries).unwrap_or(i32::MAX);
            queue = queue.with_retry(delay, retries);
        }

        let mut topology = AmqpTopology::new();

        if let Some(name) = exchange_name {
            let wire_name = match config.exchange_kind.clone() {
                Some(kind) => {
                    let def = ExchangeDefinition::new(name)
                        .kind(kind)
                        .naming(config.naming)
                        .durable();
                    let wire_name = def.wire_name();
                    topology = topology.exchange(def);
                    wire_name
                }
                None if config.naming == ExchangeNaming::WithKind => {
                    return Err(AmqpError::NotConfigured(format!(
                        "exchange `{}` is named after its type but no type was given",
                        name
                    )));
                }
                None => name,
            };

            let mut keys = config.routing_keys;
            if keys.is_empty() && config.exchange_kind == Some(ExchangeKind::Direct) {
                keys.push(crate::publisher::DEFAULT_ROUTING_KEY.to_owned());
            }

            for key in keys {
                topology = topology.queue_binding(
                    QueueBinding::new(queue.name())
                        .exchange(wire_name.clone())
                        .routing_key(key),
                );
            }
        }

        topology = topology.queue(queue.clone());
        let topology = Arc::new(topology);
        manager.register_hook(topology.clone());

        let (state, _) = watch::channel(ConsumerState::Disconnected);

        Ok(Consumer {
            manager,
            queue,
            topology,
            reconnect_delay: config.reconnect_delay,
            max_reconnect_delay: config.max_reconnect_delay.max(config.reconnect_delay),
            state,
            stop: StopHandle::new(),
            tracer: global::tracer(env!("CARGO_PKG_NAME")),
        })
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub fn topology(&self) -> &AmqpTopology {
        &self.topology
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receives every state transition of this consumer.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Makes the consumer observe an existing stop signal.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Consumes messages until stopped.
    ///
    /// Returns `Err(AmqpError::Interrupted)` once a stop is requested, after the
    /// subscription has been cancelled. Transport failures are absorbed by
    /// reconnecting; configuration errors are returned.
    pub async fn run<H>(&self, handler: &H) -> Result<(), AmqpError>
    where
        H: MessageHandler + ?Sized,
    {
        let mut delay = self.reconnect_delay;
        let mut outage = false;

        loop {
            if self.stop.is_stopped() {
                return self.interrupted();
            }

            let err = match self.session(handler, &mut outage, &mut delay).await {
                Err(AmqpError::Interrupted) => return self.interrupted(),
                Err(err) => err,
                Ok(()) => AmqpError::TransportFailure("subscription ended".to_owned()),
            };

            self.set_state(ConsumerState::Disconnected);

            if !err.is_recoverable() {
                error!(error = err.to_string(), queue = self.queue.name, "consumer terminated");
                return Err(err);
            }

            if outage {
                debug!(error = err.to_string(), "broker still unavailable");
            } else {
                error!(
                    error = err.to_string(),
                    queue = self.queue.name,
                    "consumer lost the broker, reconnecting"
                );
                outage = true;
            }

            self.manager.invalidate().await;

            tokio::select! {
                biased;
                _ = self.stop.stopped() => return self.interrupted(),
                _ = tokio::time::sleep(delay) => {}
            }

            delay = self.next_delay(delay);
        }
    }

    /// Discards every ready message of the consumer queue.
    pub async fn purge(&self) -> Result<u32, AmqpError> {
        let channel = self.manager.persistent_channel().await?;
        let purged = channel.queue_purge(&self.queue.name).await?;
        info!(queue = self.queue.name, purged = purged, "queue purged");
        Ok(purged)
    }

    /// One connection worth of consumption. Returns on the first transport error.
    async fn session<H>(
        &self,
        handler: &H,
        outage: &mut bool,
        delay: &mut Duration,
    ) -> Result<(), AmqpError>
    where
        H: MessageHandler + ?Sized,
    {
        self.set_state(ConsumerState::Connecting);
        self.manager.connect().await?;

        self.set_state(ConsumerState::Declaring);
        let channel = self.manager.persistent_channel().await?;

        let tag = format!("{}-{}", self.queue.name, Uuid::new_v4());
        let mut deliveries = channel.basic_consume(&self.queue.name, &tag).await?;
        self.set_state(ConsumerState::Consuming);

        if *outage {
            info!(queue = self.queue.name, "consumer recovered");
            *outage = false;
        }
        *delay = self.reconnect_delay;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.stopped() => {
                    cancel(channel.as_ref(), &tag).await;
                    return Err(AmqpError::Interrupted);
                }
                next = deliveries.next() => next,
            };

            match next {
                None => return Ok(()),
                Some(Err(err)) => return Err(err),
                Some(Ok(msg)) => self.dispatch(channel.as_ref(), handler, msg).await?,
            }

            if self.stop.is_stopped() {
                cancel(channel.as_ref(), &tag).await;
                return Err(AmqpError::Interrupted);
            }
        }
    }

    /// Hands one delivery to the handler and settles it with exactly one ack or reject.
    async fn dispatch<H>(
        &self,
        channel: &dyn BrokerChannel,
        handler: &H,
        msg: IncomingMessage,
    ) -> Result<(), AmqpError>
    where
        H: MessageHandler + ?Sized,
    {
        let (msg_type, count) = extract_header_properties(&msg.properties);
        let span_name = if msg_type.is_empty() {
            msg.routing_key.as_str()
        } else {
            msg_type.as_str()
        };

        let (ctx, mut span) = otel::new_span(&msg.properties, &self.tracer, span_name);
        let handler_ctx = otel::handler_context(&ctx, &span);

        debug!(
            "received: {} - exchange: {} - routing key: {}",
            msg.delivery_tag, msg.exchange, msg.routing_key
        );

        let outcome = match codec::decode(&msg.data) {
            Err(err) => Outcome::Undecodable(err.to_string()),
            Ok(value) => match AssertUnwindSafe(handler.process(value))
                .catch_unwind()
                .with_context(handler_ctx)
                .await
            {
                Ok(Ok(true)) => Outcome::Processed,
                Ok(Ok(false)) => Outcome::Failed("handler reported a failure".to_owned()),
                Ok(Err(err)) => Outcome::Failed(err.to_string()),
                Err(_) => Outcome::Failed("handler panicked".to_owned()),
            },
        };

        let (result, failure) = match outcome {
            Outcome::Processed => {
                debug!("message successfully processed");
                (channel.basic_ack(msg.delivery_tag).await, None)
            }
            Outcome::Undecodable(reason) => {
                warn!(error = reason, "removing message from queue - reason: undecodable body");
                let result = match &self.queue.dlq_name {
                    Some(dlq) => self.move_to_dlq(channel, dlq, &msg).await,
                    None => channel.basic_reject(msg.delivery_tag, false).await,
                };
                (result, Some("undecodable message".to_owned()))
            }
            Outcome::Failed(reason) => {
                let result = self.failed(channel, &msg, count, &reason).await;
                (result, Some(reason))
            }
        };

        match (&result, failure) {
            (Err(err), _) => {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
            (Ok(()), Some(reason)) => span.set_status(Status::Error {
                description: Cow::from(reason),
            }),
            (Ok(()), None) => span.set_status(Status::Ok),
        }

        result
    }

    async fn failed(
        &self,
        channel: &dyn BrokerChannel,
        msg: &IncomingMessage,
        count: i64,
        reason: &str,
    ) -> Result<(), AmqpError> {
        // Without retries the rejected message is dropped or dead-lettered by the broker.
        let (Some(_), Some(retries)) = (&self.queue.retry_name, self.queue.retries) else {
            warn!(error = reason, "error whiling handling msg, rejecting");
            return channel.basic_reject(msg.delivery_tag, false).await;
        };

        if count < i64::from(retries) {
            warn!(error = reason, attempt = count + 1, "error whiling handling msg, requeuing for latter");
            return channel.basic_reject(msg.delivery_tag, false).await;
        }

        error!(error = reason, "too many attempts, sending to dlq");
        match &self.queue.dlq_name {
            Some(dlq) => self.move_to_dlq(channel, dlq, msg).await,
            None => channel.basic_reject(msg.delivery_tag, false).await,
        }
    }

    async fn move_to_dlq(
        &self,
        channel: &dyn BrokerChannel,
        dlq: &str,
        msg: &IncomingMessage,
    ) -> Result<(), AmqpError> {
        if let Err(err) = channel
            .basic_publish("", dlq, &msg.data, msg.properties.clone())
            .await
        {
            error!(error = err.to_string(), "error whiling sending to dlq");
            return Err(AmqpError::PublishingToDLQError(err.to_string()));
        }

        channel.basic_ack(msg.delivery_tag).await
    }

    /// Doubles the reconnection delay, capped at the configured maximum.
    fn next_delay(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max_reconnect_delay)
    }

    fn set_state(&self, state: ConsumerState) {
        if self.state.send_replace(state) != state {
            debug!(queue = self.queue.name, state = ?state, "consumer state changed");
        }
    }

    fn interrupted(&self) -> Result<(), AmqpError> {
        self.set_state(ConsumerState::Disconnected);
        info!(queue = self.queue.name, "consumer stopped");
        Err(AmqpError::Interrupted)
    }
}

async fn cancel(channel: &dyn BrokerChannel, tag: &str) {
    if let Err(err) = channel.basic_cancel(tag).await {
        warn!(error = err.to_string(), "failure to cancel subscription");
    }
}

/// Extracts message type and retry count from message properties.
///
/// The message type comes from the "kind" property and the retry count from the
/// first entry of the x-death header.
fn extract_header_properties(props: &AMQPProperties) -> (String, i64) {
    let headers = match props.headers() {
        Some(val) => val.to_owned(),
        None => FieldTable::default(),
    };

    let count = match headers.inner().get(AMQP_HEADERS_X_DEATH) {
        Some(value) => match value.as_array() {
            Some(arr) => match arr.as_slice().first() {
                Some(value) => match value.as_field_table() {
                    Some(table) => match table.inner().get(AMQP_HEADERS_COUNT) {
                        Some(value) => value.as_long_long_int().unwrap_or_default(),
                        _ => 0,
                    },
                    _ => 0,
                },
                _ => 0,
            },
            _ => 0,
        },
        _ => 0,
    };

    let msg_type = match props.kind() {
        Some(value) => value.to_string(),
        _ => "".to_owned(),
    };

    (msg_type, count)
}
