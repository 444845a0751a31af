// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Seam
//!
//! The connection manager, topology declarator, producer and consumer are written
//! against the traits in this module rather than against `lapin` directly. The
//! production implementation lives in [`crate::channel`]; tests substitute mocks or
//! an in-memory broker.

use crate::{
    endpoint::Endpoint, errors::AmqpError, exchange::ExchangeDefinition, queue::QueueDefinition,
};
use async_trait::async_trait;
use lapin::{types::FieldTable, BasicProperties};
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Callback invoked when a connection is closed by the broker or the network.
pub type CloseCallback = Box<dyn FnMut(AmqpError) + Send + 'static>;

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// Opens transport sessions to a single endpoint.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live transport session.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Registers the callback fired once the connection is lost.
    fn on_close(&self, callback: CloseCallback);

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A logical channel multiplexed over a connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares the queue and returns the number of ready messages it holds.
    async fn queue_declare(
        &self,
        def: &QueueDefinition,
        arguments: FieldTable,
    ) -> Result<u32, AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn DeliveryStream>, AmqpError>;

    async fn basic_get(&self, queue: &str) -> Result<Option<IncomingMessage>, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Discards every ready message of the queue and returns how many were dropped.
    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// The deliveries of one subscription.
///
/// `None` means the subscription ended, typically because its channel closed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeliveryStream: Send {
    async fn next(&mut self) -> Option<Result<IncomingMessage, AmqpError>>;
}
