//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use vektra_chat::{ConfirmationPolicy, DEFAULT_GATED_TOOL, SessionConfig};

/// Configuration for vektra
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tools whose calls wait for approval
    pub confirmation_required: Option<Vec<String>>,
    /// Let the backend's tool manifest replace `confirmation_required`
    pub trust_advertised_tools: Option<bool>,
    /// Extra data sent with every user message
    pub submit_metadata: Option<serde_json::Value>,
    /// Print raw message JSON
    pub debug: Option<bool>,
    /// Default event script to replay
    pub script: Option<String>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vektra")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("VEKTRA_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Self::default()
            }),
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Parse config from TOML text
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save config to file
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let defaults = SessionConfig::default();
        let default_config = Config {
            confirmation_required: Some(vec![DEFAULT_GATED_TOOL.to_string()]),
            trust_advertised_tools: Some(defaults.trust_advertised_tools),
            submit_metadata: Some(defaults.submit_metadata),
            debug: Some(false),
            script: None,
        };

        default_config.save()?;
        Ok(path)
    }

    /// Build the session configuration, starting from library defaults
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::default();
        if let Some(ref tools) = self.confirmation_required {
            config.policy = ConfirmationPolicy::new(tools.iter().cloned());
        }
        if let Some(trust) = self.trust_advertised_tools {
            config.trust_advertised_tools = trust;
        }
        if let Some(ref metadata) = self.submit_metadata {
            config.submit_metadata = metadata.clone();
        }
        config
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# vektra configuration file
# Place at ~/.config/vektra/config.toml (Linux/Mac) or %APPDATA%\vektra\config.toml (Windows)
# or point VEKTRA_CONFIG_PATH at it

# Tools whose calls wait for /approve or /deny
confirmation_required = ["getWeatherInformation"]

# Replace the list above with the one the backend advertises, if it sends one
trust_advertised_tools = true

# Print each message as JSON after the transcript
debug = false

# Event script to replay when --script is not given
# script = "~/.config/vektra/weather.jsonl"

# Sent along with every user message
[submit_metadata.annotations]
hello = "world"
"#
}
