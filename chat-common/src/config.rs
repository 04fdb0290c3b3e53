//! Configuration management for the chat services.
//!
//! The relay and the CLI share one configuration file at `~/.ollama-chat/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `OLLAMA_URL` (or `NEXT_PUBLIC_OLLAMA_URL`) → ollama.base_url
//! - `CHAT_RELAY_PORT` → relay.port
//! - `CHAT_RELAY_ENDPOINT` → relay.endpoint
//! - `CHAT_BIND_ADDRESS` → network.bind
//! - `CHAT_STORE_PATH` → store.path
//! - `CHAT_LOG_LEVEL` → observability.log_level

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Address of a locally running Ollama when nothing else is configured.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".ollama-chat"),
        |dirs| dirs.home_dir().join(".ollama-chat"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Network Configuration
// ============================================================================

/// Network configuration for the relay listener.
///
/// Default is `127.0.0.1` (local only). Set to `0.0.0.0` to allow remote access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_address")]
    pub bind: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
        }
    }
}

// ============================================================================
// Relay Configuration
// ============================================================================

/// Relay service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Port the relay listens on
    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// URL clients use to reach the relay.
    /// Defaults to `http://{bind}:{port}` when unset.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Maximum accepted request body size in bytes (inline images can be large)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_relay_port(),
            endpoint: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

// ============================================================================
// Ollama Configuration
// ============================================================================

/// Inference server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Ollama API base URL
    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    /// Connect timeout in seconds. Streams themselves are never timed out.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Timeout for downloading remote image attachments
    #[serde(default = "default_image_fetch_timeout")]
    pub image_fetch_timeout_secs: u64,

    /// Largest remote image attachment that is downloaded, in bytes
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            connect_timeout_secs: default_connect_timeout(),
            image_fetch_timeout_secs: default_image_fetch_timeout(),
            max_image_bytes: default_max_image_bytes(),
        }
    }
}

// ============================================================================
// Store Configuration
// ============================================================================

/// Persistence backend for the session store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    /// One JSON file per namespace
    #[default]
    File,
    /// Key/value table in a SQLite database
    Sqlite,
}

/// Session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackendKind,

    /// Directory holding the persisted state. `~` is expanded.
    /// Defaults to the configuration directory.
    #[serde(default)]
    pub path: Option<String>,

    /// Namespace (record key) of the persisted state
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::default(),
            path: None,
            namespace: default_namespace(),
        }
    }
}

impl StoreConfig {
    /// Resolve the directory holding the persisted state.
    pub fn dir(&self) -> PathBuf {
        match &self.path {
            Some(path) => PathBuf::from(shellexpand::tilde(path).into_owned()),
            None => config_dir(),
        }
    }
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets to pin at `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// JSON Schema reference
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub ollama: OllamaConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides applied.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("OLLAMA_URL").or_else(|| lookup("NEXT_PUBLIC_OLLAMA_URL")) {
            if !url.trim().is_empty() {
                self.ollama.base_url = url;
            }
        }

        if let Some(port) = lookup("CHAT_RELAY_PORT") {
            match port.parse() {
                Ok(p) => self.relay.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid CHAT_RELAY_PORT"),
            }
        }

        if let Some(endpoint) = lookup("CHAT_RELAY_ENDPOINT") {
            self.relay.endpoint = Some(endpoint);
        }

        if let Some(bind) = lookup("CHAT_BIND_ADDRESS") {
            self.network.bind = bind;
        }

        if let Some(path) = lookup("CHAT_STORE_PATH") {
            self.store.path = Some(path);
        }

        if let Some(level) = lookup("CHAT_LOG_LEVEL") {
            self.observability.log_level = level;
        }
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        let dir = config_dir();

        if !dir.exists() {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        }

        self.save_to(&config_path())
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    /// Check the configuration for values the services cannot start with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.relay.port == 0 {
            return Err(Error::Config("relay.port must be non-zero".into()));
        }

        let base = url::Url::parse(&self.ollama.base_url).map_err(|e| {
            Error::Config(format!(
                "ollama.base_url '{}' is not a valid URL: {}",
                self.ollama.base_url, e
            ))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "ollama.base_url must be http(s), got '{}'",
                base.scheme()
            )));
        }

        if self.store.namespace.trim().is_empty() {
            return Err(Error::Config("store.namespace must not be empty".into()));
        }

        Ok(())
    }

    // =========================================================================
    // Endpoint convenience methods
    // =========================================================================

    /// Inference server base URL without a trailing slash.
    pub fn ollama_base_url(&self) -> &str {
        self.ollama.base_url.trim_end_matches('/')
    }

    /// URL clients use to reach the relay.
    pub fn relay_endpoint(&self) -> String {
        match &self.relay.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => {
                let host = if self.network.bind == "0.0.0.0" {
                    "127.0.0.1"
                } else {
                    self.network.bind.as_str()
                };
                format!("http://{}:{}", host, self.relay.port)
            }
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}
fn default_relay_port() -> u16 {
    4480
}
fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}
fn default_ollama_url() -> String {
    DEFAULT_OLLAMA_URL.into()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_image_fetch_timeout() -> u64 {
    30
}
fn default_max_image_bytes() -> usize {
    20 * 1024 * 1024
}
fn default_namespace() -> String {
    "chat-state".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.ollama_base_url(), "http://localhost:11434");
        assert_eq!(config.relay.port, 4480);
        assert_eq!(config.network.bind, "127.0.0.1");
        assert_eq!(config.store.backend, StoreBackendKind::File);
        assert_eq!(config.store.namespace, "chat-state");
        assert_eq!(config.relay_endpoint(), "http://127.0.0.1:4480");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"ollama":{"base_url":"http://gpu-box:11434/"}}"#).unwrap();
        assert_eq!(config.ollama_base_url(), "http://gpu-box:11434");
        assert_eq!(config.ollama.connect_timeout_secs, 10);
        assert_eq!(config.relay.port, 4480);
    }

    #[test]
    fn test_observability_aliases() {
        let config: Config =
            serde_json::from_str(r#"{"observability":{"level":"debug","format":"json"}}"#)
                .unwrap();
        assert_eq!(config.observability.log_level, "debug");
        assert_eq!(config.observability.log_format, "json");
    }

    #[test]
    fn test_store_backend_parsing() {
        let config: Config =
            serde_json::from_str(r#"{"store":{"backend":"sqlite","namespace":"work"}}"#).unwrap();
        assert_eq!(config.store.backend, StoreBackendKind::Sqlite);
        assert_eq!(config.store.namespace, "work");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides_from(lookup_from(&[
            ("OLLAMA_URL", "http://10.0.0.5:11434"),
            ("CHAT_RELAY_PORT", "9000"),
            ("CHAT_BIND_ADDRESS", "0.0.0.0"),
            ("CHAT_LOG_LEVEL", "trace"),
        ]));

        assert_eq!(config.ollama_base_url(), "http://10.0.0.5:11434");
        assert_eq!(config.relay.port, 9000);
        assert_eq!(config.network.bind, "0.0.0.0");
        assert_eq!(config.observability.log_level, "trace");
        assert_eq!(config.relay_endpoint(), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_legacy_ollama_env_name() {
        let mut config = Config::default();
        config.apply_overrides_from(lookup_from(&[(
            "NEXT_PUBLIC_OLLAMA_URL",
            "http://legacy:11434",
        )]));
        assert_eq!(config.ollama_base_url(), "http://legacy:11434");
    }

    #[test]
    fn test_invalid_port_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides_from(lookup_from(&[("CHAT_RELAY_PORT", "not-a-port")]));
        assert_eq!(config.relay.port, 4480);
    }

    #[test]
    fn test_explicit_relay_endpoint() {
        let mut config = Config::default();
        config.relay.endpoint = Some("https://relay.lan/".into());
        assert_eq!(config.relay_endpoint(), "https://relay.lan");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.ollama.base_url = "not a url".into();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.ollama.base_url = "ftp://localhost".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.relay.port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.store.namespace = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_store_dir_expands_tilde() {
        let mut store = StoreConfig::default();
        store.path = Some("~/chats".into());
        let dir = store.dir();
        assert!(!dir.to_string_lossy().starts_with('~'));
        assert!(dir.ends_with("chats"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");

        let mut config = Config::default();
        config.relay.port = 5555;
        config.store.backend = StoreBackendKind::Sqlite;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.relay.port, 5555);
        assert_eq!(loaded.store.backend, StoreBackendKind::Sqlite);
    }

    #[test]
    fn test_load_from_reports_parse_errors() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, "{ broken").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }
}
