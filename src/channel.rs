// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module implements the broker seam on top of `lapin`. It establishes
//! connections to a RabbitMQ endpoint, creates channels on them and translates
//! `lapin` errors into the crate's error taxonomy.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, CloseCallback, Connector, DeliveryStream,
        IncomingMessage,
    },
    configs::ClientConfigs,
    endpoint::Endpoint,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicPublishOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueuePurgeOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use std::sync::Arc;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Opens `lapin` connections using the credentials of [`ClientConfigs`].
#[derive(Debug, Clone)]
pub struct LapinConnector {
    cfg: ClientConfigs,
}

impl LapinConnector {
    pub fn new(cfg: &ClientConfigs) -> LapinConnector {
        LapinConnector { cfg: cfg.clone() }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!(endpoint = endpoint.to_string(), "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.cfg.connection_name.clone()));

        let conn = match Connection::connect(&self.cfg.amqp_uri(endpoint), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                debug!(
                    error = err.to_string(),
                    endpoint = endpoint.to_string(),
                    "failure to connect"
                );
                Err(AmqpError::BrokerUnreachable(endpoint.to_string()))
            }
        }?;
        debug!(endpoint = endpoint.to_string(), "amqp connected");

        Ok(Arc::new(LapinConnection { inner: conn }))
    }
}

/// A `lapin` connection.
pub struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_close(&self, mut callback: CloseCallback) {
        self.inner.on_error(move |err| callback(transport_error(err)));
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { inner: c }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_connected() {
            return Ok(());
        }

        self.inner
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(transport_error)
    }
}

/// A `lapin` channel.
pub struct LapinChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.inner
            .exchange_declare(
                &def.wire_name(),
                def.kind.clone().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(declaration_error)
    }

    async fn queue_declare(
        &self,
        def: &QueueDefinition,
        arguments: FieldTable,
    ) -> Result<u32, AmqpError> {
        self.inner
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                arguments,
            )
            .await
            .map(|queue| queue.message_count())
            .map_err(declaration_error)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(declaration_error)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        // The returned confirm is dropped: publishing is fire-and-forget.
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
            .map(|_| ())
            .map_err(|err| match transport_error(err) {
                AmqpError::TransportFailure(msg) => AmqpError::PublishingError(msg),
                other => other,
            })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn DeliveryStream>, AmqpError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;

        Ok(Box::new(LapinDeliveryStream { inner: consumer }))
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<IncomingMessage>, AmqpError> {
        let message = self
            .inner
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(transport_error)?;

        Ok(message.map(|m| incoming(m.delivery)))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| AmqpError::RejectMessageError(err.to_string()))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(transport_error)
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.inner
            .queue_purge(queue, QueuePurgeOptions { nowait: false })
            .await
            .map_err(transport_error)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.inner
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(transport_error)
    }
}

/// The deliveries of a `lapin` consumer.
pub struct LapinDeliveryStream {
    inner: Consumer,
}

#[async_trait]
impl DeliveryStream for LapinDeliveryStream {
    async fn next(&mut self) -> Option<Result<IncomingMessage, AmqpError>> {
        self.inner
            .next()
            .await
            .map(|result| result.map(incoming).map_err(transport_error))
    }
}

fn incoming(delivery: Delivery) -> IncomingMessage {
    IncomingMessage {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: delivery.properties,
        data: delivery.data,
    }
}

fn transport_error(err: lapin::Error) -> AmqpError {
    AmqpError::TransportFailure(err.to_string())
}

/// Channel-level refusals of a declaration are configuration conflicts. Connection
/// errors (a broker shutting down closes every pending call with CONNECTION_FORCED)
/// and locked exclusive queues are transport problems and get retried.
fn declaration_error(err: lapin::Error) -> AmqpError {
    match err {
        lapin::Error::ProtocolError(amqp_err) => match amqp_err.kind() {
            AMQPErrorKind::Soft(
                AMQPSoftError::PRECONDITIONFAILED
                | AMQPSoftError::ACCESSREFUSED
                | AMQPSoftError::NOTFOUND,
            ) => {
                error!(error = amqp_err.to_string(), "declaration refused by the broker");
                AmqpError::TopologyConflict(amqp_err.to_string())
            }
            _ => AmqpError::TransportFailure(amqp_err.to_string()),
        },
        other => transport_error(other),
    }
}
