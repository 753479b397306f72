use crate::packets::NodeType;
use static_assertions::const_assert;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8881;
pub const TICK_PERIOD_MS: u64 = 20;
// Commands must be refreshed faster than this or their state decays
pub const COMMAND_TIMEOUT_MS: u64 = 42;
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

// A steady command stream must survive two full ticks without expiring
const_assert!(COMMAND_TIMEOUT_MS > 2 * TICK_PERIOD_MS);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSpec {
    pub id: i64,
    pub base_value: u32,
    pub base_range: u32,
}

/// Parses `ID:BASE_VALUE:BASE_RANGE`, e.g. `1:10:2`.
impl FromStr for SensorSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidSensorSpec(s.to_string());
        let mut parts = s.split(':').map(str::trim);

        let (Some(id), Some(base_value), Some(base_range), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        Ok(Self {
            id: id.parse().map_err(|_| invalid())?,
            base_value: base_value.parse().map_err(|_| invalid())?,
            base_range: base_range.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSpec {
    pub id: i64,
    pub node_type: NodeType,
}

/// Parses `ID:TYPE`, e.g. `3:igniter`.
impl FromStr for NodeSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidNodeSpec(s.to_string());
        let (id, node_type) = s.split_once(':').ok_or_else(invalid)?;

        Ok(Self {
            id: id.trim().parse().map_err(|_| invalid())?,
            node_type: node_type.trim().parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    pub bind_host: String,
    pub port: u16,
    pub tick_period: Duration,
    pub command_timeout: Duration,
    pub outbound_queue_size: usize,
    /// Registered before the bridge starts accepting clients.
    pub sensors: Vec<SensorSpec>,
    pub nodes: Vec<NodeSpec>,
}

impl SimConfig {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_period.is_zero() || self.command_timeout <= self.tick_period * 2 {
            return Err(ConfigError::InvalidTiming {
                tick_period: self.tick_period,
                command_timeout: self.command_timeout,
            });
        }
        if self.outbound_queue_size == 0 {
            return Err(ConfigError::ZeroQueue);
        }
        Ok(())
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tick_period: Duration::from_millis(TICK_PERIOD_MS),
            command_timeout: Duration::from_millis(COMMAND_TIMEOUT_MS),
            outbound_queue_size: OUTBOUND_QUEUE_SIZE,
            sensors: Vec::new(),
            nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("command timeout {command_timeout:?} must exceed two tick periods of {tick_period:?}")]
    InvalidTiming {
        tick_period: Duration,
        command_timeout: Duration,
    },
    #[error("outbound queue size must be non-zero")]
    ZeroQueue,
    #[error("invalid sensor '{0}', expected ID:BASE_VALUE:BASE_RANGE")]
    InvalidSensorSpec(String),
    #[error("invalid node '{0}', expected ID:TYPE")]
    InvalidNodeSpec(String),
}
