// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Codec
//!
//! Message bodies travel as JSON. Encoding never fails: a value that cannot be
//! serialized is replaced by [`NON_SERIALIZABLE_PLACEHOLDER`]. Decoding failures are
//! reported so the consumer can reject the delivery.

use crate::errors::AmqpError;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Body sent in place of a value that could not be serialized
pub const NON_SERIALIZABLE_PLACEHOLDER: &str = "<non-serializable data>";

/// Encodes `message` as JSON bytes, falling back to the placeholder string.
pub fn encode<T>(message: &T) -> Vec<u8>
where
    T: Serialize + ?Sized,
{
    match serde_json::to_vec(message) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = err.to_string(), "message replaced by placeholder");
            placeholder()
        }
    }
}

fn placeholder() -> Vec<u8> {
    // A JSON string literal, so the body stays decodable on the other side.
    format!("\"{}\"", NON_SERIALIZABLE_PLACEHOLDER).into_bytes()
}

/// Decodes a received body into a structured value.
pub fn decode(data: &[u8]) -> Result<Value, AmqpError> {
    serde_json::from_slice(data).map_err(|err| AmqpError::MessageDecodeFailure(err.to_string()))
}
