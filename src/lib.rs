// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # rabbitmq-pubsub
//!
//! A resilient publish/subscribe client over AMQP 0-9-1. Producers publish JSON
//! messages to named exchanges; consumers receive, dispatch and acknowledge messages
//! from named queues while surviving broker restarts and network failures.

mod otel;

pub mod broker;
pub mod channel;
pub mod codec;
pub mod configs;
pub mod connection;
pub mod consumer;
pub mod endpoint;
pub mod errors;
pub mod exchange;
pub mod logging;
pub mod oneshot;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use connection::ConnectionManager;
pub use consumer::{Consumer, ConsumerConfig, ConsumerState, MessageHandler, RetryPolicy, StopHandle};
pub use errors::AmqpError;
pub use oneshot::OneShot;
pub use publisher::{Producer, ProducerConfig};
