//! Runtime configuration (spec §10.B), loaded from the environment the same
//! way the reference load-test harness loads its own `Config`.

use std::env;

use thiserror::Error;
use url::Url;

const DEFAULT_MAX_CONNECTED_CLUSTER_NODES: usize = 10;
const DEFAULT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_SERVICE_TYPE: &str = "ejb.jboss";

#[derive(Error, Debug)]
pub enum DiscoveryConfigError {
    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("Invalid URL in {var}: {value}")]
    InvalidUrl { var: String, value: String },
}

/// Configuration for a discovery-capable client (spec §10.B).
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub configured_endpoints: Vec<Url>,
    pub max_connected_cluster_nodes: usize,
    pub queue_capacity: usize,
    pub service_type: String,
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, DiscoveryConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| DiscoveryConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_endpoints(raw: &str) -> Result<Vec<Url>, DiscoveryConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            Url::parse(s).map_err(|_| DiscoveryConfigError::InvalidUrl {
                var: "DISCOVERY_ENDPOINTS".into(),
                value: s.to_string(),
            })
        })
        .collect()
}

impl DiscoveryConfig {
    /// Loads configuration from environment variables. `DISCOVERY_ENDPOINTS`
    /// is optional: a deployment that relies purely on cluster discovery has
    /// no fixed endpoints to configure (spec §10.B).
    pub fn from_env() -> Result<Self, DiscoveryConfigError> {
        let endpoints_raw = env::var("DISCOVERY_ENDPOINTS").unwrap_or_default();
        let configured_endpoints = parse_endpoints(&endpoints_raw)?;

        let max_connected_cluster_nodes = env_parse_or(
            "DISCOVERY_MAX_CLUSTER_NODES",
            DEFAULT_MAX_CONNECTED_CLUSTER_NODES,
        )?;

        let queue_capacity = env_parse_or("DISCOVERY_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?;

        let service_type = env::var("DISCOVERY_SERVICE_TYPE")
            .unwrap_or_else(|_| DEFAULT_SERVICE_TYPE.to_string());

        let config = DiscoveryConfig {
            configured_endpoints,
            max_connected_cluster_nodes,
            queue_capacity,
            service_type,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), DiscoveryConfigError> {
        if self.max_connected_cluster_nodes == 0 {
            return Err(DiscoveryConfigError::InvalidValue {
                var: "DISCOVERY_MAX_CLUSTER_NODES".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(DiscoveryConfigError::InvalidValue {
                var: "DISCOVERY_QUEUE_CAPACITY".into(),
                message: "must be greater than 0".into(),
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn for_testing() -> Self {
        DiscoveryConfig {
            configured_endpoints: vec![Url::parse("remote://h1:8080").unwrap()],
            max_connected_cluster_nodes: DEFAULT_MAX_CONNECTED_CLUSTER_NODES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
        }
    }
}
