//! Configuration loading and types

use std::path::{Path, PathBuf};

use nexus_core::{Group, Machine, Settings, User};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the nexus daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Shared settings, resolved once at startup
    #[serde(default)]
    pub settings: Settings,
    /// Seed inventory
    #[serde(default)]
    pub machine: Vec<Machine>,
    #[serde(default)]
    pub user: Vec<User>,
    #[serde(default)]
    pub group: Vec<Group>,
}

/// Daemon server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Admin API (plain HTTP)
    #[serde(default = "default_api_bind")]
    pub api_bind: String,
    /// Agent stream and bootstrap endpoints (TLS)
    #[serde(default = "default_agent_bind")]
    pub agent_bind: String,
    /// ACME HTTP-01 responder, used only for domain endpoints
    #[serde(default = "default_acme_http_bind")]
    pub acme_http_bind: String,
    /// Control endpoint as agents reach it; overrides `settings.external_url`
    #[serde(default)]
    pub external_url: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Bearer token for the admin API; unset means one is generated under `data_dir`
    #[serde(default)]
    pub admin_token: Option<String>,
    /// Agent binary uploaded to machines during installation
    #[serde(default)]
    pub agent_binary: Option<PathBuf>,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub acme_email: Option<String>,
    #[serde(default)]
    pub acme_staging: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            api_bind: default_api_bind(),
            agent_bind: default_agent_bind(),
            acme_http_bind: default_acme_http_bind(),
            external_url: None,
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            admin_token: None,
            agent_binary: None,
            sweep_interval_secs: default_sweep_interval(),
            acme_email: None,
            acme_staging: false,
        }
    }
}

fn default_api_bind() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_agent_bind() -> String {
    "0.0.0.0:8091".to_string()
}

fn default_acme_http_bind() -> String {
    "0.0.0.0:80".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./nexus_data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_sweep_interval() -> u64 {
    3600
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Settings with the daemon-level endpoint override applied
    pub fn effective_settings(&self) -> Settings {
        let mut settings = self.settings.clone();
        if let Some(url) = self.daemon.external_url.as_deref().filter(|u| !u.trim().is_empty()) {
            settings.external_url = Some(url.trim().to_string());
        }
        settings
    }

    /// Load from default paths or use defaults
    pub fn load_default() -> eyre::Result<Self> {
        if let Ok(path) = std::env::var("NEXUS_CONFIG") {
            return Self::load(Path::new(&path));
        }

        let mut paths = vec![
            PathBuf::from("nexus.toml"),
            PathBuf::from("/etc/nexus/nexus.toml"),
        ];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("nexus/nexus.toml"));
        }

        for path in paths {
            if path.exists() {
                tracing::info!(path = %path.display(), "loading config");
                return Self::load(&path);
            }
        }

        tracing::warn!("no config file found, using defaults");
        Ok(Config::default())
    }
}
