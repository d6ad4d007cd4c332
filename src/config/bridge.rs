//! Bridge configuration
//!
//! Loaded from an optional TOML file; command-line flags are applied on top.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::pty::TerminalSize;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings for the WebSocket terminal bridge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address to listen on, `ip:port`
    pub listen: String,
    /// HTTP path the WebSocket endpoint is served on
    pub path: String,
    /// Command line to run inside each terminal
    pub command: String,
    /// Working directory for the command
    pub working_dir: Option<PathBuf>,
    /// Viewport columns applied until the client sends its own size
    pub cols: u16,
    /// Viewport rows applied until the client sends its own size
    pub rows: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9000".to_string(),
            path: "/pty".to_string(),
            command: default_command(),
            working_dir: None,
            cols: 200,
            rows: 60,
        }
    }
}

/// The platform's interactive shell
fn default_command() -> String {
    if cfg!(windows) {
        "cmd".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Check that the configuration can actually be served
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::Invalid("command cannot be empty".to_string()));
        }
        if !self.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "path must start with '/': {}",
                self.path
            )));
        }
        if self.initial_size().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "initial size must be non-zero, got {}x{}",
                self.cols, self.rows
            )));
        }
        Ok(())
    }

    /// Viewport applied to every new session
    pub fn initial_size(&self) -> TerminalSize {
        TerminalSize::new(self.cols, self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.path, "/pty");
        assert!(!config.command.is_empty());
        assert_eq!(config.initial_size(), TerminalSize::new(200, 60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = BridgeConfig::from_toml(
            r#"
            command = "powershell -NoLogo"
            cols = 120
            "#,
        )
        .unwrap();
        assert_eq!(config.command, "powershell -NoLogo");
        assert_eq!(config.cols, 120);
        assert_eq!(config.rows, 60);
        assert_eq!(config.listen, "127.0.0.1:9000");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("webpty.toml");
        fs::write(
            &path,
            r#"
            listen = "0.0.0.0:8080"
            path = "/term"
            working_dir = "/srv/app"
            "#,
        )
        .unwrap();

        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.path, "/term");
        assert_eq!(config.working_dir, Some(PathBuf::from("/srv/app")));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let result = BridgeConfig::load(&dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::Read(_))));
    }

    #[test]
    fn test_parse_error() {
        let result = BridgeConfig::from_toml("cols = \"wide\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_rejects_zero_size() {
        let config = BridgeConfig {
            rows: 0,
            ..BridgeConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let config = BridgeConfig {
            command: "  ".to_string(),
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_path() {
        let config = BridgeConfig {
            path: "pty".to_string(),
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
