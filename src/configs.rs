// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Configuration
//!
//! Broker addresses, credentials and reconnection timings. Values are read from a
//! `.env` file, an optional `config/amqp` file and `AMQP_*` environment variables,
//! in increasing order of precedence. Anything not provided falls back to defaults
//! suitable for a local broker.

use crate::{
    endpoint::{self, Endpoint, DEFAULT_HOST, DEFAULT_PORT},
    errors::AmqpError,
    logging,
};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfigs {
    /// Comma separated `host[:port]` list
    pub hosts: String,
    /// Port used for hosts listed without one
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Virtual host, already percent-encoded
    pub vhost: String,
    pub connection_name: String,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// Default `tracing` filter, overridden by `RUST_LOG`
    pub log_level: String,
}

impl Default for ClientConfigs {
    fn default() -> Self {
        ClientConfigs {
            hosts: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "%2f".to_owned(),
            connection_name: env!("CARGO_PKG_NAME").to_owned(),
            reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            log_level: "info".to_owned(),
        }
    }
}

impl ClientConfigs {
    /// Loads the configuration from `.env`, `config/amqp.*` and the environment.
    pub fn load() -> Result<ClientConfigs, AmqpError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env file");
        }

        let cfg = Config::builder()
            .add_source(File::with_name("config/amqp").required(false))
            .add_source(Environment::with_prefix("AMQP"))
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    /// The configured endpoints in random order.
    pub fn endpoints(&self) -> Result<Vec<Endpoint>, AmqpError> {
        endpoint::resolve_endpoints(&self.hosts, self.port)
    }

    /// Connection URI for `endpoint` with the configured credentials and vhost.
    pub fn amqp_uri(&self, endpoint: &Endpoint) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, endpoint.host, endpoint.port, self.vhost
        )
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    /// Installs the `tracing` subscriber at the configured level.
    pub fn init_logging(&self) {
        logging::init(&self.log_level);
    }
}
