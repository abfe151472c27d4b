//! Coordinator configuration loaded from TOML.

use std::{net::SocketAddr, path::Path, time::Duration};

use serde::Deserialize;

use crate::{coordinator::DeliverySettings, error::ConfigError, message::Nom};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7790";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the coordinator listens on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Canonical state before the first put. Defaults to `{}`.
    #[serde(default)]
    pub initial_state: Option<toml::Value>,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// Per-replica delivery bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliveryConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            initial_state: None,
            delivery: DeliveryConfig::default(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn initial_nom(&self) -> Result<Nom, ConfigError> {
        match &self.initial_state {
            Some(value) => Ok(Nom::new(serde_json::to_value(value)?)),
            None => Ok(Nom::empty()),
        }
    }

    pub fn delivery_settings(&self) -> DeliverySettings {
        DeliverySettings {
            queue_capacity: self.delivery.queue_capacity.max(1),
            write_timeout: Duration::from_millis(self.delivery.write_timeout_ms),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7790))
}

fn default_queue_capacity() -> usize {
    DeliverySettings::default().queue_capacity
}

fn default_write_timeout_ms() -> u64 {
    5_000
}
