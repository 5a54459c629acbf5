use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub tabload: TabloadConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Connection identifier -> SQLite database path
    #[serde(default)]
    pub connections: HashMap<String, PathBuf>,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub http_server: HttpServerConfig,
}

/// Service-wide settings
#[derive(Debug, Clone, Deserialize)]
pub struct TabloadConfig {
    /// Directory holding the registry mirror and uploaded files
    pub data_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Ingestion pipeline tuning
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Rows per chunk; also the size of one write statement
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Files larger than this decode on a dedicated thread
    #[serde(default = "default_isolate_threshold_bytes")]
    pub isolate_threshold_bytes: u64,
    /// How long terminal task records stay queryable
    #[serde(default = "default_task_retention_secs")]
    pub task_retention_secs: u64,
    /// Registry records older than this are dropped on load
    #[serde(default = "default_registry_horizon_hours")]
    pub registry_horizon_hours: u64,
    /// Unreferenced upload artifacts older than this are swept
    #[serde(default = "default_artifact_horizon_hours")]
    pub artifact_horizon_hours: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Capacity of the resolved-connection cache
    #[serde(default = "default_store_cache_capacity")]
    pub store_cache_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            isolate_threshold_bytes: default_isolate_threshold_bytes(),
            task_retention_secs: default_task_retention_secs(),
            registry_horizon_hours: default_registry_horizon_hours(),
            artifact_horizon_hours: default_artifact_horizon_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
            store_cache_capacity: default_store_cache_capacity(),
        }
    }
}

impl IngestConfig {
    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }

    pub fn registry_horizon(&self) -> Duration {
        Duration::from_secs(self.registry_horizon_hours * 3600)
    }

    pub fn artifact_horizon(&self) -> Duration {
        Duration::from_secs(self.artifact_horizon_hours * 3600)
    }
}

/// Table allow-list and privileged identities
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessConfig {
    /// `database.table` patterns; `*` matches any segment. Empty allows everything.
    #[serde(default)]
    pub allowed_tables: Vec<String>,
    /// Identities that see every upload and may process any file
    #[serde(default)]
    pub privileged_users: Vec<String>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_http_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_authless")]
    pub authless: bool,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
            api_key_env: default_http_api_key_env(),
            allowed_origins: default_allowed_origins(),
            authless: default_authless(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_batch_size() -> usize {
    1000
}

fn default_isolate_threshold_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_task_retention_secs() -> u64 {
    3600
}

fn default_registry_horizon_hours() -> u64 {
    24 * 7
}

fn default_artifact_horizon_hours() -> u64 {
    24
}

fn default_sweep_interval_secs() -> u64 {
    600
}

fn default_store_cache_capacity() -> usize {
    16
}

fn default_authless() -> bool {
    false
}

fn default_http_port() -> u16 {
    8080
}

fn default_http_api_key_env() -> String {
    "TABLOAD_API_KEY".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec![]
}

fn default_max_upload_bytes() -> usize {
    256 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in TABLOAD_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        // .env is optional
        let _ = dotenv::dotenv();

        let config_path = std::env::var("TABLOAD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(config_str).context("Failed to parse config.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.tabload.data_dir.exists() && !self.tabload.data_dir.is_dir() {
            anyhow::bail!(
                "data_dir must be a directory, not a file: {}",
                self.tabload.data_dir.display()
            );
        }

        if self.ingest.batch_size == 0 {
            anyhow::bail!("ingest.batch_size must be greater than 0");
        }

        // Keeps a single-field identity lookup under SQLite's bound-parameter limit
        if self.ingest.batch_size > 10_000 {
            anyhow::bail!("ingest.batch_size must be at most 10000");
        }

        if self.ingest.sweep_interval_secs == 0 {
            anyhow::bail!("ingest.sweep_interval_secs must be greater than 0");
        }

        if self.ingest.store_cache_capacity == 0 {
            anyhow::bail!("ingest.store_cache_capacity must be greater than 0");
        }

        for (name, path) in &self.connections {
            if name.trim().is_empty() {
                anyhow::bail!("connection names must not be empty");
            }
            if path.as_os_str().is_empty() {
                anyhow::bail!("connection '{}' has an empty database path", name);
            }
        }

        Ok(())
    }

    /// Get the data directory
    pub fn data_dir(&self) -> &Path {
        &self.tabload.data_dir
    }

    /// Resolve the HTTP API key (empty when running authless)
    pub fn api_key(&self) -> Result<String> {
        if self.http_server.authless {
            return Ok(String::new());
        }
        std::env::var(&self.http_server.api_key_env).with_context(|| {
            format!(
                "Environment variable {} not set. Set it in your .env file or as an environment variable, or enable authless mode.",
                self.http_server.api_key_env
            )
        })
    }
}
