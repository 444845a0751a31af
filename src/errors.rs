// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Pub/Sub Client
//!
//! This module provides the error taxonomy shared by every component of the crate.
//! The `AmqpError` enum separates configuration mistakes (which terminate a consumer)
//! from transport failures (which the consumer loop absorbs by reconnecting).

use thiserror::Error;

/// Represents errors that can occur during AMQP operations.
///
/// The first group of variants mirrors the client's contract: reachability, topology,
/// configuration, decoding, transport and interruption. The remaining variants name
/// the specific channel operation that failed and are all transport-level.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// No configured endpoint accepted a connection
    #[error("no amqp broker reachable at `{0}`")]
    BrokerUnreachable(String),

    /// A declaration disagreed with the state already held by the broker
    #[error("topology conflict: {0}")]
    TopologyConflict(String),

    /// A producer or consumer was built without its required identity
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// A received body could not be decoded into a structured value
    #[error("failure to decode message payload: {0}")]
    MessageDecodeFailure(String),

    /// Socket or network level failure
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The consumer was asked to stop
    #[error("consumer interrupted")]
    Interrupted,

    /// Configuration could not be loaded
    #[error("failure to load configs: {0}")]
    ConfigError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message: {0}")]
    RejectMessageError(String),

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq: {0}")]
    PublishingToDLQError(String),
}

impl AmqpError {
    /// Whether the consumer loop should recover from this error by reconnecting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AmqpError::BrokerUnreachable(_)
                | AmqpError::TransportFailure(_)
                | AmqpError::ChannelError(_)
                | AmqpError::PublishingError(_)
                | AmqpError::AckMessageError(_)
                | AmqpError::RejectMessageError(_)
                | AmqpError::PublishingToDLQError(_)
        )
    }
}

impl From<config::ConfigError> for AmqpError {
    fn from(err: config::ConfigError) -> Self {
        AmqpError::ConfigError(err.to_string())
    }
}
