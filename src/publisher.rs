// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! This module provides functionality for publishing structured messages to a
//! RabbitMQ exchange. The exchange is declared lazily, through a reconnect hook, the
//! first time a message is produced and again after every reconnect. Messages carry
//! OpenTelemetry context in their headers for distributed request tracking.
//!
//! Publishing is fire-and-forget: no publisher confirm is awaited, so the durability
//! of the exchange and the bound queues is the only delivery guarantee.

use crate::{
    codec::{self, JSON_CONTENT_TYPE},
    connection::ConnectionManager,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind, ExchangeNaming},
    otel,
    topology::{AmqpTopology, Topology},
};
use lapin::{types::ShortString, BasicProperties};
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Routing key used by [`Producer::produce`]
pub const DEFAULT_ROUTING_KEY: &str = "#";

/// Configuration of a [`Producer`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Logical name of the target exchange. Required.
    pub exchange_name: Option<String>,
    /// When set, the exchange is declared (durable) before the first publish.
    /// Otherwise it is expected to exist already.
    pub exchange_kind: Option<ExchangeKind>,
    pub naming: ExchangeNaming,
}

impl ProducerConfig {
    pub fn new(exchange_name: impl Into<String>) -> ProducerConfig {
        ProducerConfig {
            exchange_name: Some(exchange_name.into()),
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = Some(kind);
        self
    }

    pub fn naming(mut self, naming: ExchangeNaming) -> Self {
        self.naming = naming;
        self
    }
}

/// Publishes messages to one exchange over a shared [`ConnectionManager`].
pub struct Producer {
    manager: Arc<ConnectionManager>,
    exchange: String,
}

impl Producer {
    /// Creates a producer for the configured exchange.
    ///
    /// Fails with `NotConfigured` when no exchange name is given. Nothing is sent to
    /// the broker until the first message is produced.
    pub fn new(manager: Arc<ConnectionManager>, config: ProducerConfig) -> Result<Producer, AmqpError> {
        let Some(name) = config.exchange_name.filter(|name| !name.trim().is_empty()) else {
            error!("producer without exchange name");
            return Err(AmqpError::NotConfigured(
                "a producer requires an exchange name".to_owned(),
            ));
        };

        let exchange = match config.exchange_kind {
            Some(kind) => {
                let def = ExchangeDefinition::new(name)
                    .kind(kind)
                    .naming(config.naming)
                    .durable();
                let wire_name = def.wire_name();
                manager.register_hook(Arc::new(AmqpTopology::new().exchange(def)));
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

        Ok(Producer { manager, exchange })
    }

    /// The exchange name used on the wire.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publishes `message` with the routing key `#`.
    pub async fn produce<T>(&self, message: &T) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.produce_with_routing_key(message, DEFAULT_ROUTING_KEY).await
    }

    /// Publishes `message` with an explicit routing key.
    ///
    /// A value that cannot be serialized is sent as a placeholder rather than failing
    /// the call. A transport failure is retried once on a fresh connection.
    pub async fn produce_with_routing_key<T>(
        &self,
        message: &T,
        routing_key: &str,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let payload = codec::encode(message);
        let ctx = Context::current();

        match self.publish(&ctx, &payload, routing_key).await {
            Err(err) if err.is_recoverable() && !matches!(err, AmqpError::BrokerUnreachable(_)) => {
                warn!(
                    error = err.to_string(),
                    exchange = self.exchange,
                    "publish failed, retrying on a new connection"
                );
                self.manager.invalidate().await;
                self.publish(&ctx, &payload, routing_key).await
            }
            result => result,
        }
    }

    async fn publish(&self, ctx: &Context, payload: &[u8], routing_key: &str) -> Result<(), AmqpError> {
        let channel = self.manager.persistent_channel().await?;

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(otel::inject(ctx));

        match channel
            .basic_publish(&self.exchange, routing_key, payload, properties)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(err)
            }
            _ => {
                debug!(exchange = self.exchange, routing_key = routing_key, "message published");
                Ok(())
            }
        }
    }
}
