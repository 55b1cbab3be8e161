//! Configuration loading for agentmesh.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Get the agentmesh home directory (~/.agentmesh).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".agentmesh"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.agentmesh/settings.json
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;

    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}. Run 'agentmesh config init' first.",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&path)?;
    let settings: Settings = serde_json::from_str(&content)?;

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

/// Write settings to ~/.agentmesh/settings.json, creating the directory if needed.
pub fn save_settings(settings: &Settings) -> Result<PathBuf> {
    validate_settings(settings)?;

    let path = get_settings_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(settings)?)?;

    tracing::info!("Saved settings to {}", path.display());
    Ok(path)
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.hub.max_pending == 0 {
        return Err(Error::Config("hub.max_pending must be at least 1".to_string()));
    }
    if settings.hub.drain_interval_ms == 0 {
        return Err(Error::Config(
            "hub.drain_interval_ms must be greater than zero".to_string(),
        ));
    }
    if settings.hub.process_timeout_secs == 0 {
        return Err(Error::Config(
            "hub.process_timeout_secs must be greater than zero".to_string(),
        ));
    }
    if settings.provider.timeout_seconds == 0 {
        return Err(Error::Config(
            "provider.timeout_seconds must be greater than zero".to_string(),
        ));
    }
    if settings.registry.monitor_interval_secs == 0 {
        return Err(Error::Config(
            "registry.monitor_interval_secs must be greater than zero".to_string(),
        ));
    }
    match settings.provider.name.as_str() {
        "ollama" | "openai" => {}
        other => {
            return Err(Error::Config(format!("Unknown provider '{}'", other)));
        }
    }
    if let Err(e) = EnvFilter::try_new(&settings.logging.level) {
        return Err(Error::Config(format!(
            "logging.level '{}' is not a valid filter: {}",
            settings.logging.level, e
        )));
    }
    Ok(())
}

/// Ingestion and load-balancing configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HubConfig {
    /// A worker with this many pending messages is no longer available.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Interval of the queue drain loop.
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    /// Deadline for a single worker attempt.
    #[serde(default = "default_process_timeout_secs")]
    pub process_timeout_secs: u64,
    /// Keywords that make a deferred message critical.
    #[serde(default = "default_urgency_keywords")]
    pub urgency_keywords: Vec<String>,
}

fn default_max_pending() -> usize {
    5
}

fn default_drain_interval_ms() -> u64 {
    100
}

fn default_process_timeout_secs() -> u64 {
    60
}

pub fn default_urgency_keywords() -> Vec<String> {
    ["blocked", "critical", "urgent", "help", "error", "broken"]
        .iter()
        .map(|k| k.to_string())
        .collect()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            drain_interval_ms: default_drain_interval_ms(),
            process_timeout_secs: default_process_timeout_secs(),
            urgency_keywords: default_urgency_keywords(),
        }
    }
}

/// Agent registry configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RegistryConfig {
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
}

fn default_monitor_interval_secs() -> u64 {
    30
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval_secs(),
        }
    }
}

/// LLM provider configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_name")]
    pub name: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_provider_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_provider_name() -> String {
    "ollama".to_string()
}

fn default_provider_timeout() -> u64 {
    45
}

fn default_provider_retries() -> u32 {
    1
}

fn default_retry_backoff_ms() -> u64 {
    600
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            model: None,
            base_url: None,
            api_key: None,
            timeout_seconds: default_provider_timeout(),
            retries: default_provider_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Storage backend selection.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
}

/// Storage configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database path; defaults to ~/.agentmesh/agentmesh.db
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("agentmesh.db")),
        }
    }
}

/// Log output configuration. `RUST_LOG` overrides `level` when set.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file directory; defaults to the platform data dir
    pub dir: Option<PathBuf>,
    /// Mirror log lines to stderr.
    #[serde(default = "default_true")]
    pub console: bool,
}

fn default_log_level() -> String {
    "info,agentmesh=debug".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            console: true,
        }
    }
}

/// agentmesh settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}
