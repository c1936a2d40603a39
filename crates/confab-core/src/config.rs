//! Configuration management for Confab
//!
//! Handles loading and saving the TOML configuration: backend address and
//! credentials, push transport timing, tab persistence and logging.

use std::path::{Path, PathBuf};
use std::time::Duration;

use confab_push::{CredentialSource, TransportOptions};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub tabs: TabsConfig,
    #[serde(default)]
    pub general: GeneralConfig,
}

/// Backend address and credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// REST and push host, e.g. `https://chat.example.com`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub push_path: String,
    pub token_query_param: String,
    /// Environment variable consulted when `auth_token` is unset
    pub auth_token_env: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            push_path: "/ws".to_string(),
            token_query_param: "token".to_string(),
            auth_token_env: "CONFAB_TOKEN".to_string(),
            auth_token: None,
        }
    }
}

impl BackendConfig {
    /// Get the auth token, checking the environment variable if not set directly
    pub fn get_auth_token(&self) -> Option<String> {
        if let Some(token) = &self.auth_token {
            if !token.is_empty() {
                return Some(token.clone());
            }
        }
        std::env::var(&self.auth_token_env)
            .ok()
            .filter(|token| !token.is_empty())
    }
}

impl CredentialSource for BackendConfig {
    fn backend_url(&self) -> Option<String> {
        self.base_url.clone().filter(|url| !url.is_empty())
    }

    fn auth_token(&self) -> Option<String> {
        self.get_auth_token()
    }
}

/// Push connection timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub initial_reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            initial_reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            heartbeat_interval_secs: 25,
        }
    }
}

impl Config {
    /// Transport options assembled from the backend and transport sections
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            push_path: self.backend.push_path.clone(),
            token_param: self.backend.token_query_param.clone(),
            initial_delay: Duration::from_millis(self.transport.initial_reconnect_delay_ms),
            max_delay: Duration::from_millis(self.transport.max_reconnect_delay_ms),
            heartbeat_interval: Duration::from_secs(self.transport.heartbeat_interval_secs),
        }
    }
}

/// Open-tab persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,
    /// Tab name used when a topic has neither a title nor any messages
    pub placeholder_name: String,
}

impl Default for TabsConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            placeholder_name: "New chat".to_string(),
        }
    }
}

impl TabsConfig {
    /// Configured storage directory, or `<data_dir>/confab/tabs`
    pub fn storage_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.storage_dir {
            return Ok(dir.clone());
        }
        let base = dirs::data_dir()
            .ok_or_else(|| Error::Config("Could not find data directory".to_string()))?;
        Ok(base.join("confab").join("tabs"))
    }
}

/// General application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Configuration manager for loading and saving config
pub struct ConfigManager {
    config_path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::with_path(config_path)
    }

    /// Create a config manager with a specific path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            Config::default()
        };
        Ok(Self { config_path, config })
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".to_string()))?;
        Ok(config_dir.join("confab").join("config.toml"))
    }

    fn load_from_path(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get mutable access to configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(&self.config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Point the backend at a new host
    pub fn set_base_url(&mut self, url: impl Into<String>) {
        self.config.backend.base_url = Some(url.into());
    }

    pub fn set_auth_token(&mut self, token: impl Into<String>) {
        self.config.backend.auth_token = Some(token.into());
    }
}
