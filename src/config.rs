//! Runtime configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::headless::HeadlessConfig;
use crate::{Error, Result};

/// Backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Longest a fence or a synchronous commit/vblank may take (ms)
    pub fence_timeout_ms: u64,

    /// Turn on vsync delivery for connected outputs at startup
    pub enable_vsync: bool,

    /// Power displays off at startup so the hardware matches the initial state
    pub power_off_on_init: bool,

    /// Simulated displays for the headless composer
    pub headless: HeadlessConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            fence_timeout_ms: 1000,
            enable_vsync: true,
            power_off_on_init: true,
            headless: HeadlessConfig::default(),
        }
    }
}

impl BackendConfig {
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::invalid(format!("bad configuration: {}", e)))?;
        if config.fence_timeout_ms == 0 {
            return Err(Error::invalid("fence_timeout_ms must be positive"));
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(?path, fence_timeout_ms = config.fence_timeout_ms, "loaded configuration");
        Ok(config)
    }
}
