// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # One-shot Operations
//!
//! Imperative helpers that open a connection and a scoped channel, perform a single
//! operation and close both again. Opening one connection per message is expensive
//! and not meant for sustained traffic; use [`crate::publisher::Producer`] and
//! [`crate::consumer::Consumer`] for that.

use crate::{
    broker::{BrokerChannel, Connector},
    channel::LapinConnector,
    codec::{self, JSON_CONTENT_TYPE},
    configs::ClientConfigs,
    connection::ConnectionManager,
    consumer::{Consumer, ConsumerConfig, MessageHandler, StopHandle},
    endpoint::Endpoint,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    otel,
    queue::{QueueBinding, QueueDefinition},
    topology,
};
use lapin::{types::ShortString, BasicProperties};
use opentelemetry::Context;
use serde::Serialize;
use serde_json::Value;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};
use uuid::Uuid;

/// Interval between two polls of [`OneShot::receive`]
pub const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct OneShot {
    endpoints: Vec<Endpoint>,
    connector: Arc<dyn Connector>,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
}

impl OneShot {
    pub fn new(endpoints: Vec<Endpoint>, connector: Arc<dyn Connector>) -> OneShot {
        let defaults = ClientConfigs::default();
        OneShot {
            endpoints,
            connector,
            reconnect_delay: defaults.reconnect_delay(),
            max_reconnect_delay: defaults.max_reconnect_delay(),
        }
    }

    pub fn from_configs(cfg: &ClientConfigs) -> Result<OneShot, AmqpError> {
        Ok(OneShot {
            endpoints: cfg.endpoints()?,
            connector: Arc::new(LapinConnector::new(cfg)),
            reconnect_delay: cfg.reconnect_delay(),
            max_reconnect_delay: cfg.max_reconnect_delay(),
        })
    }

    /// Declares an exchange.
    pub async fn declare(&self, exchange: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.once(|channel| async move { topology::declare_exchange(channel.as_ref(), exchange).await })
            .await
    }

    /// Declares the shared queue `queue` and binds it to `exchange` with `routing_key`.
    pub async fn bind(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<(), AmqpError> {
        let def = QueueDefinition::shared(queue).mirrored();
        let binding = QueueBinding::new(queue)
            .exchange(exchange)
            .routing_key(routing_key);

        self.once(|channel| async move {
            topology::declare_queue(channel.as_ref(), &def).await?;
            topology::bind_queue(channel.as_ref(), &binding).await
        })
        .await
    }

    /// Publishes a single message.
    pub async fn send<T>(&self, message: &T, exchange: &str, routing_key: &str) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let payload = codec::encode(message);
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(otel::inject(&Context::current()));

        self.once(|channel| async move {
            channel
                .basic_publish(exchange, routing_key, &payload, properties)
                .await
        })
        .await
    }

    /// Waits for the next decodable message of `queue` and acknowledges it.
    ///
    /// Undecodable messages found on the way are rejected without requeue.
    pub async fn receive(&self, queue: &str) -> Result<Value, AmqpError> {
        self.once(|channel| async move {
            loop {
                let Some(msg) = channel.basic_get(queue).await? else {
                    tokio::time::sleep(RECEIVE_POLL_INTERVAL).await;
                    continue;
                };

                match codec::decode(&msg.data) {
                    Ok(value) => {
                        channel.basic_ack(msg.delivery_tag).await?;
                        return Ok(value);
                    }
                    Err(err) => {
                        warn!(error = err.to_string(), queue = queue, "rejecting undecodable message");
                        channel.basic_reject(msg.delivery_tag, false).await?;
                    }
                }
            }
        })
        .await
    }

    /// Consumes `queue` with `handler` until `stop` is triggered.
    ///
    /// Returns `Err(AmqpError::Interrupted)` once stopped, like [`Consumer::run`].
    pub async fn listen<H>(&self, queue: &str, handler: &H, stop: &StopHandle) -> Result<(), AmqpError>
    where
        H: MessageHandler + ?Sized,
    {
        let manager = Arc::new(self.manager());
        let config = ConsumerConfig::default()
            .queue(queue)
            .reconnect(self.reconnect_delay, self.max_reconnect_delay);

        let consumer = Consumer::new(manager.clone(), config)?.with_stop_handle(stop.clone());
        let result = consumer.run(handler).await;

        if let Err(err) = manager.close().await {
            warn!(error = err.to_string(), "failure to close one-shot connection");
        }
        result
    }

    fn manager(&self) -> ConnectionManager {
        ConnectionManager::new(self.endpoints.clone(), self.connector.clone())
    }

    async fn once<F, Fut, T>(&self, f: F) -> Result<T, AmqpError>
    where
        F: FnOnce(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let manager = self.manager();
        let result = manager.with_channel(f).await;

        if let Err(err) = manager.close().await {
            warn!(error = err.to_string(), "failure to close one-shot connection");
        }
        debug!(ok = result.is_ok(), "one-shot operation finished");

        result
    }
}
