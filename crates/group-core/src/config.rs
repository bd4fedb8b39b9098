//! Configuration for the whole stack.
//!
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```json
//! { "order": { "expire_ms": 5000 }, "dispatch": { "always_send": false } }
//! ```

use crate::error::{ChannelError, Result};
use crate::interceptors::dispatch::DispatchConfig;
use crate::interceptors::failure::FailureDetectorConfig;
use crate::interceptors::fragmentation::FragmentationConfig;
use crate::interceptors::order::OrderConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub fragmentation: FragmentationConfig,

    #[serde(default)]
    pub order: OrderConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub failure_detector: FailureDetectorConfig,

    /// Interval between heartbeat ticks (default: 5s)
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            fragmentation: FragmentationConfig::default(),
            order: OrderConfig::default(),
            dispatch: DispatchConfig::default(),
            failure_detector: FailureDetectorConfig::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl ChannelConfig {
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: ChannelConfig = serde_json::from_str(content)
            .map_err(|e| ChannelError::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&content)?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Reject settings no stage can work with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ChannelError::InvalidConfig(msg.to_string()));

        if self.fragmentation.max_size == 0 {
            return invalid("fragmentation.max_size must be greater than 0");
        }
        if self.fragmentation.max_fragments == 0 {
            return invalid("fragmentation.max_fragments must be greater than 0");
        }
        if self.order.max_queue == 0 {
            return invalid("order.max_queue must be greater than 0");
        }
        if self.dispatch.max_workers == 0 {
            return invalid("dispatch.max_workers must be greater than 0");
        }
        if self.dispatch.min_workers > self.dispatch.max_workers {
            return invalid("dispatch.min_workers must not exceed dispatch.max_workers");
        }
        if self.heartbeat_interval_ms == 0 {
            return invalid("heartbeat_interval_ms must be greater than 0");
        }
        Ok(())
    }
}
