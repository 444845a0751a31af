// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides types for defining RabbitMQ queues and their bindings.
//! Queues are either named (durable and shared between consumers) or ephemeral
//! (exclusive to one connection and deleted with it, named after the host and
//! process). Named queues may additionally get a Dead Letter Queue (DLQ) and a
//! retry queue.

use lapin::types::{AMQPValue, LongString, ShortString};
use std::collections::BTreeMap;

/// Queue argument selecting the classic mirroring policy
pub const AMQP_ARGUMENT_HA_POLICY: &str = "x-ha-policy";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue definitions.
/// It supports standard queue options as well as message TTL, max length, Dead Letter
/// Queues (DLQ) and retry queues.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl: Option<i32>,
    pub(crate) retries: Option<i32>,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, non-exclusive, etc.)
    pub fn new(name: impl Into<String>) -> QueueDefinition {
        QueueDefinition {
            name: name.into(),
            ..Default::default()
        }
    }

    /// A durable queue shared by every consumer that names it.
    pub fn shared(name: impl Into<String>) -> QueueDefinition {
        QueueDefinition::new(name).durable()
    }

    /// A private queue for this process, deleted when its connection closes.
    ///
    /// The name is derived from the host name and the process id so that consumers
    /// on different processes never collide.
    pub fn ephemeral() -> QueueDefinition {
        QueueDefinition::new(ephemeral_queue_name(&host_identity(), std::process::id()))
            .exclusive()
            .delete()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds an arbitrary declaration argument.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    /// Asks the broker to mirror the queue on every node.
    pub fn mirrored(self) -> Self {
        self.argument(
            AMQP_ARGUMENT_HA_POLICY,
            AMQPValue::LongString(LongString::from("all")),
        )
    }

    /// Adds a Dead Letter Queue (DLQ) to the queue.
    ///
    /// The DLQ will receive messages that are rejected, expired, or overflow
    /// from the main queue. The DLQ name will be the main queue name with "-dlq" suffix.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a retry mechanism to the queue.
    ///
    /// Rejected messages wait `ttl` milliseconds in a "-retry" queue before being
    /// routed back to the main queue. After `retries` attempts they are moved to the
    /// DLQ, which this implies.
    pub fn with_retry(mut self, ttl: i32, retries: i32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retries = Some(retries);
        self.retry_ttl = Some(ttl);
        self.with_dlq()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    pub fn arguments(&self) -> &BTreeMap<ShortString, AMQPValue> {
        &self.arguments
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    pub fn retry_name(&self) -> Option<&str> {
        self.retry_name.as_deref()
    }
}

/// Name of the ephemeral queue owned by process `pid` on `host`.
pub fn ephemeral_queue_name(host: &str, pid: u32) -> String {
    format!("{}_pid_{}", host, pid)
}

/// The machine host name. `HOSTNAME` overrides it when set.
fn host_identity() -> String {
    host_identity_from(std::env::var("HOSTNAME").ok())
}

fn host_identity_from(overridden: Option<String>) -> String {
    overridden
        .map(|h| h.trim().to_owned())
        .filter(|h| !h.is_empty())
        .or_else(|| {
            gethostname::gethostname()
                .into_string()
                .ok()
                .map(|h| h.trim().to_owned())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_owned())
}

/// Configuration for binding a queue to an exchange.
///
/// Queue bindings define how messages flow from exchanges to queues based on
/// routing keys and exchange types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    pub fn new(queue: impl Into<String>) -> QueueBinding {
        QueueBinding {
            queue_name: queue.into(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange (wire name) to bind the queue to.
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange_name = exchange.into();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = key.into();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
