// Configuration management with layered configuration (file, env)

use crate::models::MAX_DURATION_SECONDS;
use crate::server::Endpoint;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the server binds: `unix:///tmp/periodic.sock`, `tcp://127.0.0.1:5000`
    /// or a bare `host:port`
    pub listen: String,
    /// Close client sessions idle for this long (0 disables)
    #[serde(default)]
    pub idle_timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreDriver {
    Memory,
    Sqlite,
    Redis,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub driver: StoreDriver,
    /// Database file of the sqlite driver
    #[serde(default)]
    pub sqlite_path: Option<String>,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Timeout applied to jobs submitted with a timeout of 0; 0 means no deadline
    pub default_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let defaults = Config::try_from(&Settings::default())?;

        let builder = Config::builder()
            .add_source(defaults)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("PERIODIC")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.server.listen.is_empty() {
            return Err("Server listen address cannot be empty".to_string());
        }
        Endpoint::parse(&self.server.listen)
            .map_err(|e| format!("Invalid server listen address: {}", e))?;

        if self.scheduler.default_timeout_seconds > MAX_DURATION_SECONDS {
            return Err(format!(
                "scheduler.default_timeout_seconds must not exceed {}",
                MAX_DURATION_SECONDS
            ));
        }

        match self.store.driver {
            StoreDriver::Memory => {}
            StoreDriver::Sqlite => {
                if self.store.sqlite_path.as_deref().unwrap_or("").is_empty() {
                    return Err("store.sqlite_path is required for the sqlite driver".to_string());
                }
            }
            StoreDriver::Redis => {
                if self.store.redis_url.as_deref().unwrap_or("").is_empty() {
                    return Err("store.redis_url is required for the redis driver".to_string());
                }
            }
            StoreDriver::Postgres => {
                if self.store.database_url.as_deref().unwrap_or("").is_empty() {
                    return Err(
                        "store.database_url is required for the postgres driver".to_string()
                    );
                }
                if self.store.max_connections == 0 {
                    return Err("store.max_connections must be greater than 0".to_string());
                }
            }
        }

        if self.observability.metrics_port == Some(0) {
            return Err("Metrics port must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen: "unix:///tmp/periodic.sock".to_string(),
                idle_timeout_seconds: 0,
            },
            store: StoreConfig {
                driver: StoreDriver::Sqlite,
                sqlite_path: Some("periodic.db".to_string()),
                redis_url: None,
                database_url: None,
                max_connections: default_max_connections(),
            },
            scheduler: SchedulerConfig {
                default_timeout_seconds: 300,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: None,
            },
        }
    }
}
