//! Rendezvous CLI configuration
//!
//! Settings are layered with figment, later sources winning:
//! - built-in defaults
//! - `rendezvous.toml` in the working directory, or the file given with `--config`
//! - `RENDEZVOUS_*` environment variables (`__` separates sections,
//!   e.g. `RENDEZVOUS_IDENTITY__CLIENT_ID=team1`)
//! - command-line flags

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use rendezvous_core::BridgeConfig;
use serde::{Deserialize, Serialize};

/// Configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "rendezvous.toml";

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "RENDEZVOUS_";

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the rendezvous CLI
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub identity: IdentityConfig,
    pub bridge: BridgeSettings,
    pub cli: CliConfig,
}

/// Who this host is and which network it joins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Shared by every instance that should find each other
    pub client_id: String,
    /// Advertised local name; a per-process name is used when unset
    pub self_id: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            client_id: "rendezvous".to_string(),
            self_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Bound on each link establishment step, in milliseconds
    pub link_timeout_ms: u64,
    /// Bring up the peripheral role when the platform supports it
    pub peripheral: bool,
    /// How long `send` and `peers` scan before acting, in seconds
    pub discovery_secs: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            link_timeout_ms: 10_000,
            peripheral: true,
            discovery_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub verbose: bool,
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub client_id: Option<String>,
    pub self_id: Option<String>,
    pub link_timeout_ms: Option<u64>,
    pub no_peripheral: bool,
    pub verbose: bool,
}

impl AppConfig {
    /// Load with the standard priority order, reading `rendezvous.toml` unless
    /// another file is named
    pub fn load(config_file: Option<&Path>, overrides: &Overrides) -> Result<Self, ConfigError> {
        let file = match config_file {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::FileSystem(format!(
                        "Configuration file {} not found",
                        path.display()
                    )));
                }
                Toml::file(path)
            }
            None => Toml::file(DEFAULT_CONFIG_FILE),
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(file)
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        Self::from_figment(Self::apply_overrides(figment, overrides))
    }

    fn apply_overrides(mut figment: Figment, overrides: &Overrides) -> Figment {
        if let Some(client_id) = &overrides.client_id {
            figment = figment.merge(("identity.client_id", client_id));
        }
        if let Some(self_id) = &overrides.self_id {
            figment = figment.merge(("identity.self_id", self_id));
        }
        if let Some(timeout) = overrides.link_timeout_ms {
            figment = figment.merge(("bridge.link_timeout_ms", timeout));
        }
        if overrides.no_peripheral {
            figment = figment.merge(("bridge.peripheral", false));
        }
        if overrides.verbose {
            figment = figment.merge(("cli.verbose", true));
        }
        figment
    }

    /// Extract and validate
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment
            .extract()
            .map_err(|e| ConfigError::Loading(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.client_id.is_empty() {
            return Err(ConfigError::Validation(
                "client_id must not be empty".to_string(),
            ));
        }
        if self.bridge.discovery_secs == 0 {
            return Err(ConfigError::Validation(
                "discovery_secs must be greater than 0".to_string(),
            ));
        }
        self.bridge_config()
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Bridge settings in the core's terms
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig::new()
            .with_link_timeout(Duration::from_millis(self.bridge.link_timeout_ms))
            .with_peripheral(self.bridge.peripheral)
    }

    /// Local name to advertise
    pub fn self_id(&self) -> String {
        match &self.identity.self_id {
            Some(name) => name.clone(),
            None => format!("{}-{}", self.identity.client_id, std::process::id()),
        }
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_secs(self.bridge.discovery_secs)
    }

    /// Render as TOML, suitable for `rendezvous.toml`
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialization(format!("Failed to serialize config: {}", e)))
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration loading error: {0}")]
    Loading(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layered(file: &str, overrides: &Overrides) -> Result<AppConfig, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(file));
        AppConfig::from_figment(AppConfig::apply_overrides(figment, overrides))
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.bridge.peripheral);
        assert_eq!(config.bridge_config().link_timeout, Duration::from_secs(10));
        assert!(config.self_id().starts_with("rendezvous-"));
    }

    #[test]
    fn test_file_values_apply() {
        let config = layered(
            r#"
            [identity]
            client_id = "team1"
            self_id = "X"

            [bridge]
            link_timeout_ms = 2500
            "#,
            &Overrides::default(),
        )
        .unwrap();

        assert_eq!(config.identity.client_id, "team1");
        assert_eq!(config.self_id(), "X");
        assert_eq!(
            config.bridge_config().link_timeout,
            Duration::from_millis(2500)
        );
        assert_eq!(config.bridge.discovery_secs, 5);
    }

    #[test]
    fn test_flags_override_file() {
        let overrides = Overrides {
            client_id: Some("team2".to_string()),
            no_peripheral: true,
            verbose: true,
            ..Default::default()
        };
        let config = layered("[identity]\nclient_id = \"team1\"\n", &overrides).unwrap();

        assert_eq!(config.identity.client_id, "team2");
        assert!(!config.bridge_config().peripheral_enabled);
        assert!(config.cli.verbose);
    }

    #[test]
    fn test_empty_self_id_is_kept() {
        let overrides = Overrides {
            self_id: Some(String::new()),
            ..Default::default()
        };
        let config = layered("", &overrides).unwrap();
        assert_eq!(config.self_id(), "");
    }

    #[test]
    fn test_validation_failures() {
        assert!(matches!(
            layered("[identity]\nclient_id = \"\"\n", &Overrides::default()),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            layered("[bridge]\nlink_timeout_ms = 0\n", &Overrides::default()),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            layered("[bridge]\nperipheral = \"often\"\n", &Overrides::default()),
            Err(ConfigError::Loading(_))
        ));
    }

    #[test]
    fn test_missing_explicit_file() {
        let result = AppConfig::load(
            Some(Path::new("/nonexistent/rendezvous.toml")),
            &Overrides::default(),
        );
        assert!(matches!(result, Err(ConfigError::FileSystem(_))));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = AppConfig::default();
        config.identity.self_id = Some("Y".to_string());
        let text = config.to_toml().unwrap();
        assert!(text.contains("[identity]"));
        assert_eq!(layered(&text, &Overrides::default()).unwrap(), config);
    }
}
