// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Endpoints
//!
//! Parses the candidate broker addresses a client may connect to. Addresses are
//! given as a comma separated list of `host[:port]` entries; entries without a port
//! use the configured default port.

use crate::errors::AmqpError;
use rand::seq::SliceRandom;
use std::fmt;

/// Host used when nothing else is configured
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Standard AMQP port
pub const DEFAULT_PORT: u16 = 5672;

/// One broker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Parses a single `host[:port]` entry.
    pub fn parse(raw: &str, default_port: u16) -> Result<Endpoint, AmqpError> {
        let raw = raw.trim();
        let (host, port) = match raw.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.trim().parse::<u16>().map_err(|_| {
                    AmqpError::ConfigError(format!("invalid port in endpoint `{}`", raw))
                })?;
                (host.trim(), port)
            }
            None => (raw, default_port),
        };

        if host.is_empty() {
            return Err(AmqpError::ConfigError(format!(
                "missing host in endpoint `{}`",
                raw
            )));
        }

        Ok(Endpoint::new(host, port))
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses a comma separated list of endpoints, keeping the given order.
///
/// Empty entries are skipped. An input without any entry resolves to the default
/// endpoint on `default_port`.
pub fn parse_endpoints(raw: &str, default_port: u16) -> Result<Vec<Endpoint>, AmqpError> {
    let endpoints = raw
        .split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| Endpoint::parse(entry, default_port))
        .collect::<Result<Vec<_>, _>>()?;

    if endpoints.is_empty() {
        return Ok(vec![Endpoint::new(DEFAULT_HOST, default_port)]);
    }

    Ok(endpoints)
}

/// Parses the endpoints and shuffles them so that many clients sharing the same
/// configuration spread over the available brokers.
pub fn resolve_endpoints(raw: &str, default_port: u16) -> Result<Vec<Endpoint>, AmqpError> {
    let mut endpoints = parse_endpoints(raw, default_port)?;
    endpoints.shuffle(&mut rand::rng());
    Ok(endpoints)
}

/// Renders a list of endpoints for log and error messages.
pub fn describe(endpoints: &[Endpoint]) -> String {
    endpoints
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_with_and_without_port() {
        let endpoints = parse_endpoints("rabbit-a:5673, rabbit-b", DEFAULT_PORT).unwrap();

        assert_eq!(
            endpoints,
            vec![
                Endpoint::new("rabbit-a", 5673),
                Endpoint::new("rabbit-b", DEFAULT_PORT)
            ]
        );
    }

    #[test]
    fn empty_input_resolves_to_default() {
        let endpoints = parse_endpoints(" , ", 5680).unwrap();
        assert_eq!(endpoints, vec![Endpoint::new(DEFAULT_HOST, 5680)]);
    }

    #[test]
    fn rejects_invalid_port() {
        let err = parse_endpoints("rabbit:amqp", DEFAULT_PORT).unwrap_err();
        assert!(matches!(err, AmqpError::ConfigError(_)));
    }

    #[test]
    fn rejects_missing_host() {
        let err = Endpoint::parse(":5672", DEFAULT_PORT).unwrap_err();
        assert!(matches!(err, AmqpError::ConfigError(_)));
    }

    #[test]
    fn shuffling_keeps_every_endpoint() {
        let mut endpoints = resolve_endpoints("a,b,c,d", DEFAULT_PORT).unwrap();
        endpoints.sort_by(|l, r| l.host.cmp(&r.host));

        let hosts: Vec<_> = endpoints.iter().map(|e| e.host.as_str()).collect();
        assert_eq!(hosts, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn describes_endpoints() {
        let endpoints = vec![Endpoint::new("a", 1), Endpoint::new("b", 2)];
        assert_eq!(describe(&endpoints), "a:1,b:2");
    }
}
