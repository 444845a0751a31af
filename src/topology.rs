// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the broker-side topology a producer or consumer depends on:
//! exchanges, queues (with their optional retry and dead letter queues) and the
//! bindings between them. Every declaration is idempotent: declaring identical
//! topology again is a no-op on the broker, while a conflicting declaration is
//! refused by the broker and surfaced as `AmqpError::TopologyConflict`.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation of the Topology trait, re-installed on every reconnect
//! - `declare_exchange`, `declare_queue`, `bind_queue`: single declarations
//! - Header constants: Constants for RabbitMQ header fields

use crate::{
    broker::BrokerChannel,
    connection::ReconnectHook,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Trait defining the interface for topology management.
///
/// This trait provides methods for registering exchanges, queues, and bindings,
/// as well as installing the topology through a channel.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares exchanges, then queues, then bindings.
    async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError>;
}

/// Owned description of the exchanges, queues and bindings a participant needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.queues_binding.is_empty()
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.queues_binding
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        if !self.queues_binding.contains(&binding) {
            self.queues_binding.push(binding);
        }
        self
    }

    async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            declare_exchange(channel, exch).await?;
        }

        for queue in &self.queues {
            declare_queue(channel, queue).await?;
        }

        for binding in &self.queues_binding {
            bind_queue(channel, binding).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl ReconnectHook for AmqpTopology {
    async fn on_reconnect(&self, channel: &Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        debug!("installing topology");
        self.install(channel.as_ref()).await
    }
}

/// Declares one exchange.
pub async fn declare_exchange(
    channel: &dyn BrokerChannel,
    def: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    let name = def.wire_name();
    debug!("creating exchange: {}", name);

    if let Err(err) = channel.exchange_declare(def).await {
        error!(
            error = err.to_string(),
            name = name,
            "error to declare the exchange"
        );
        return Err(err);
    }

    debug!("exchange: {} was created", name);
    Ok(())
}

/// Declares one queue, with its retry and dead letter queues when configured.
///
/// Returns the number of messages ready in the main queue.
pub async fn declare_queue(
    channel: &dyn BrokerChannel,
    def: &QueueDefinition,
) -> Result<u32, AmqpError> {
    debug!("creating queue: {}", def.name);

    let mut queue_args = def.arguments.clone();

    if def.retry_name.is_some() {
        declare_retry(channel, def, &mut queue_args).await?;
    }

    if def.dlq_name.is_some() {
        declare_dlq(channel, def, &mut queue_args).await?;
    }

    if let Some(ttl) = def.ttl {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(max) = def.max_length {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    if let Some(max_bytes) = def.max_length_bytes {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
            AMQPValue::LongInt(LongInt::from(max_bytes)),
        );
    }

    match channel.queue_declare(def, FieldTable::from(queue_args)).await {
        Err(err) => {
            error!(error = err.to_string(), name = def.name, "error to declare the queue");
            Err(err)
        }
        Ok(count) => {
            debug!("queue: {} was created", def.name);
            Ok(count)
        }
    }
}

/// Binds a queue to an exchange with one routing key.
pub async fn bind_queue(
    channel: &dyn BrokerChannel,
    binding: &QueueBinding,
) -> Result<(), AmqpError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        binding.queue_name, binding.exchange_name, binding.routing_key
    );

    if let Err(err) = channel
        .queue_bind(
            &binding.queue_name,
            &binding.exchange_name,
            &binding.routing_key,
        )
        .await
    {
        error!(error = err.to_string(), "error to bind queue to exchange");
        return Err(err);
    }

    Ok(())
}

/// Creates a retry queue for the specified queue.
///
/// A retry queue holds failed messages for the retry TTL and then dead-letters them
/// back to the main queue. The main queue arguments are modified so that its
/// rejected messages go to the retry queue.
async fn declare_retry(
    channel: &dyn BrokerChannel,
    def: &QueueDefinition,
    queue_args: &mut BTreeMap<ShortString, AMQPValue>,
) -> Result<(), AmqpError> {
    let (Some(retry_name), Some(retry_ttl)) = (def.retry_name.clone(), def.retry_ttl) else {
        return Ok(());
    };

    let mut args = BTreeMap::new();
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from("")),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(def.name.clone())),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
        AMQPValue::LongInt(LongInt::from(retry_ttl)),
    );

    let retry_def = sibling(def, &retry_name);
    if let Err(err) = channel.queue_declare(&retry_def, FieldTable::from(args)).await {
        error!(error = err.to_string(), "failure to declare retry queue");
        return Err(err);
    }

    queue_args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from("")),
    );
    queue_args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(retry_name)),
    );

    Ok(())
}

/// Creates a Dead Letter Queue (DLQ) for the specified queue.
///
/// Without a retry queue, rejected messages of the main queue are dead-lettered
/// straight to the DLQ.
async fn declare_dlq(
    channel: &dyn BrokerChannel,
    def: &QueueDefinition,
    queue_args: &mut BTreeMap<ShortString, AMQPValue>,
) -> Result<(), AmqpError> {
    let Some(dlq_name) = def.dlq_name.clone() else {
        return Ok(());
    };

    let dlq_def = sibling(def, &dlq_name);
    if let Err(err) = channel.queue_declare(&dlq_def, FieldTable::default()).await {
        error!(error = err.to_string(), "failure to declare dlq");
        return Err(err);
    }

    if def.retry_name.is_none() {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from("")),
        );
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(dlq_name)),
        );
    }

    Ok(())
}

/// A plain queue sharing the flags of `def`.
fn sibling(def: &QueueDefinition, name: &str) -> QueueDefinition {
    QueueDefinition {
        name: name.to_owned(),
        durable: def.durable,
        delete: def.delete,
        exclusive: def.exclusive,
        ..Default::default()
    }
}
