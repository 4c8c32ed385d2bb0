//! Bridge configuration

use std::time::Duration;

use crate::errors::ConfigError;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for a bridge instance
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Upper bound for each link establishment step (connect, resolve, subscribe)
    pub link_timeout: Duration,
    /// Whether to bring up the peripheral role at all
    pub peripheral_enabled: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            link_timeout: Duration::from_secs(10),
            peripheral_enabled: true,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-step link timeout
    pub fn with_link_timeout(mut self, timeout: Duration) -> Self {
        self.link_timeout = timeout;
        self
    }

    /// Enable or disable the peripheral role
    pub fn with_peripheral(mut self, enabled: bool) -> Self {
        self.peripheral_enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.link_timeout.is_zero() {
            return Err(ConfigError::ZeroLinkTimeout);
        }
        Ok(())
    }
}
