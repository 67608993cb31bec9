//! Relay node configuration, read from the environment.

use crate::auth::AuthConfig;
use crate::error::{RelayError, Result};
use crate::handler::HandlerConfig;
use crate::ingest::DEFAULT_INGEST_QUEUE_SIZE;
use crate::registry::DEFAULT_DELIVERY_QUEUE_SIZE;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_BACKBONE_URL: &str = "redis://localhost:6379";
pub const DEFAULT_CHANNEL: &str = "chat:global";
pub const DEFAULT_METRICS_PORT: u16 = 9094;

/// How nodes lay out backbone channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelTopology {
    /// Every node subscribes to one shared channel and filters locally.
    #[default]
    Shared,
    /// Nodes also listen on a node-addressed channel and publish presence,
    /// so producers that track presence can target a single node.
    PerNode,
}

impl FromStr for ChannelTopology {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" => Ok(ChannelTopology::Shared),
            "per-node" | "per_node" | "pernode" => Ok(ChannelTopology::PerNode),
            other => Err(RelayError::Config(format!(
                "CHANNEL_TOPOLOGY must be 'shared' or 'per-node', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub backbone_url: String,
    pub channel: String,
    pub topology: ChannelTopology,
    pub node_id: String,
    pub validator_url: Option<String>,
    /// `token:user` pairs, for development without a validation service.
    pub static_tokens: Option<String>,
    pub validator_timeout: Duration,
    pub validator_retries: u32,
    pub ingest_url: Option<String>,
    pub ingest_timeout: Duration,
    pub delivery_queue_size: usize,
    pub ingest_queue_size: usize,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_grace: Duration,
    pub metrics_port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backbone_url: DEFAULT_BACKBONE_URL.to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            topology: ChannelTopology::Shared,
            node_id: uuid::Uuid::new_v4().to_string(),
            validator_url: None,
            static_tokens: None,
            validator_timeout: Duration::from_millis(2000),
            validator_retries: 2,
            ingest_url: None,
            ingest_timeout: Duration::from_millis(5000),
            delivery_queue_size: DEFAULT_DELIVERY_QUEUE_SIZE,
            ingest_queue_size: DEFAULT_INGEST_QUEUE_SIZE,
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            write_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
            metrics_port: DEFAULT_METRICS_PORT,
        }
    }
}

impl RelayConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`; unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let listen_addr = get("LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| RelayError::Config(format!("LISTEN_ADDR: {}", e)))?;

        let topology = match get("CHANNEL_TOPOLOGY") {
            Some(v) => v.parse()?,
            None => ChannelTopology::Shared,
        };

        let config = Self {
            listen_addr,
            backbone_url: get("BACKBONE_URL").unwrap_or(defaults.backbone_url),
            channel: get("CHANNEL").unwrap_or(defaults.channel),
            topology,
            node_id: get("NODE_ID").unwrap_or(defaults.node_id),
            validator_url: get("VALIDATOR_URL"),
            static_tokens: get("STATIC_TOKENS"),
            validator_timeout: Duration::from_millis(parse_or(
                &get,
                "VALIDATOR_TIMEOUT_MS",
                2000u64,
            )?),
            validator_retries: parse_or(&get, "VALIDATOR_RETRIES", defaults.validator_retries)?,
            ingest_url: get("INGEST_URL"),
            ingest_timeout: Duration::from_millis(parse_or(&get, "INGEST_TIMEOUT_MS", 5000u64)?),
            delivery_queue_size: parse_or(&get, "DELIVERY_QUEUE_SIZE", defaults.delivery_queue_size)?,
            ingest_queue_size: parse_or(&get, "INGEST_QUEUE_SIZE", defaults.ingest_queue_size)?,
            ping_interval: Duration::from_secs(parse_or(&get, "PING_INTERVAL_SECS", 30u64)?),
            idle_timeout: Duration::from_secs(parse_or(&get, "IDLE_TIMEOUT_SECS", 90u64)?),
            write_timeout: Duration::from_secs(parse_or(&get, "WRITE_TIMEOUT_SECS", 10u64)?),
            shutdown_grace: Duration::from_secs(parse_or(&get, "SHUTDOWN_GRACE_SECS", 10u64)?),
            metrics_port: parse_or(&get, "METRICS_PORT", defaults.metrics_port)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.validator_url.is_none() && self.static_tokens.is_none() {
            return Err(RelayError::Config(
                "either VALIDATOR_URL or STATIC_TOKENS must be set".into(),
            ));
        }
        if self.validator_url.is_some() && self.static_tokens.is_some() {
            return Err(RelayError::Config(
                "VALIDATOR_URL and STATIC_TOKENS are mutually exclusive".into(),
            ));
        }
        if self.channel.trim().is_empty() {
            return Err(RelayError::Config("CHANNEL must not be empty".into()));
        }
        if self.delivery_queue_size == 0 {
            return Err(RelayError::Config("DELIVERY_QUEUE_SIZE must be at least 1".into()));
        }
        if self.ingest_queue_size == 0 {
            return Err(RelayError::Config("INGEST_QUEUE_SIZE must be at least 1".into()));
        }
        if self.ping_interval.is_zero() {
            return Err(RelayError::Config("PING_INTERVAL_SECS must be at least 1".into()));
        }
        if self.write_timeout.is_zero() {
            return Err(RelayError::Config("WRITE_TIMEOUT_SECS must be at least 1".into()));
        }
        if self.idle_timeout < self.ping_interval {
            return Err(RelayError::Config(
                "IDLE_TIMEOUT_SECS must not be shorter than PING_INTERVAL_SECS".into(),
            ));
        }
        Ok(())
    }

    /// Channel addressed to this node only.
    pub fn node_channel(&self) -> String {
        format!("{}:node:{}", self.channel, self.node_id)
    }

    /// Channel presence announcements are published on.
    pub fn presence_channel(&self) -> String {
        format!("{}:presence", self.channel)
    }

    /// Channels the fan-out bridge subscribes to.
    pub fn channels(&self) -> Vec<String> {
        match self.topology {
            ChannelTopology::Shared => vec![self.channel.clone()],
            ChannelTopology::PerNode => vec![self.channel.clone(), self.node_channel()],
        }
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            timeout: self.validator_timeout,
            max_retries: self.validator_retries,
            ..AuthConfig::default()
        }
    }

    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            delivery_queue_size: self.delivery_queue_size,
            ingest_queue_size: self.ingest_queue_size,
            ping_interval: self.ping_interval,
            idle_timeout: self.idle_timeout,
            write_timeout: self.write_timeout,
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| RelayError::Config(format!("{}='{}': {}", key, raw, e))),
        None => Ok(default),
    }
}
