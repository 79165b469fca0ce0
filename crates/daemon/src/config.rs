//! Configuration management for the minisshd server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/minisshd/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minisshd_protocol::WindowSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionSettings;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen_address must be host:port, got {0:?}")]
    InvalidListenAddress(String),

    #[error("username must not be empty")]
    EmptyUsername,

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("term must not be empty")]
    EmptyTerm,

    #[error("default terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u32, rows: u32 },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the minisshd server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and logging configuration.
    pub server: ServerConfig,

    /// Password authentication.
    pub auth: AuthConfig,

    /// Host key location.
    pub host_key: HostKeyConfig,

    /// Channel session configuration.
    pub session: SessionConfig,
}

/// Listener and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on, as `host:port`.
    pub listen_address: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional log file. Logs go to stderr when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Password authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

/// Host key configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostKeyConfig {
    /// Path to the private host key.
    pub path: PathBuf,

    /// Passphrase for an encrypted host key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

/// Channel session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell for interactive sessions and `exec` commands.
    pub shell: String,

    /// `TERM` value when the client does not request a terminal type.
    pub term: String,

    /// Terminal width when the client does not send one.
    pub default_cols: u32,

    /// Terminal height when the client does not send one.
    pub default_rows: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "localhost:2022".to_string(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: "foo".to_string(),
            password: "bar".to_string(),
        }
    }
}

impl Default for HostKeyConfig {
    fn default() -> Self {
        Self {
            path: default_host_key_path(),
            passphrase: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            term: "xterm".to_string(),
            default_cols: 80,
            default_rows: 24,
        }
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            term: config.term.clone(),
            default_size: WindowSize::new(config.default_cols, config.default_rows),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("minisshd")
        .join("config.toml")
}

/// Returns the default host key path, `~/.ssh/id_rsa`.
fn default_host_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
        .join("id_rsa")
}

/// Returns the login shell from `$SHELL`, or `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - MINISSHD_LISTEN_ADDRESS: Override the listen address
    /// - MINISSHD_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - MINISSHD_KEY_PASSPHRASE: Passphrase for the host key
    ///
    /// Returns the names of the variables that were applied, so the caller
    /// can report them once logging is set up.
    pub fn apply_env_overrides(&mut self) -> Vec<&'static str> {
        let mut applied = Vec::new();

        if let Some(address) = non_empty_env("MINISSHD_LISTEN_ADDRESS") {
            self.server.listen_address = address;
            applied.push("MINISSHD_LISTEN_ADDRESS");
        }

        if let Some(level) = non_empty_env("MINISSHD_LOG_LEVEL") {
            self.server.log_level = level;
            applied.push("MINISSHD_LOG_LEVEL");
        }

        if let Some(passphrase) = non_empty_env("MINISSHD_KEY_PASSPHRASE") {
            self.host_key.passphrase = Some(passphrase);
            applied.push("MINISSHD_KEY_PASSPHRASE");
        }

        applied
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let address = &self.server.listen_address;
        let valid_address = address
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !valid_address {
            return Err(ConfigError::InvalidListenAddress(address.clone()));
        }

        if self.auth.username.is_empty() {
            return Err(ConfigError::EmptyUsername);
        }

        let shell_path = Path::new(&self.session.shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.session.shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
        }

        if self.session.term.is_empty() {
            return Err(ConfigError::EmptyTerm);
        }

        if self.session.default_cols == 0 || self.session.default_rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.session.default_cols,
                rows: self.session.default_rows,
            });
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Session settings derived from this configuration.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings::from(&self.session)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
