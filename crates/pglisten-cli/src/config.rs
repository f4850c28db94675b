use std::path::Path;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use pglisten::{DatabaseConfig, ListenerConfig, QueueConfig};
use serde::Deserialize;

/// Directory searched for `default.*` and `<env>.*` configuration files.
pub const CONFIG_DIR: &str = "config";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub listener: ListenerConfig,
    pub queue: QueueConfig,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Settings {
    /// Load settings for the environment named by `PGLISTEN_ENV` (default `dev`).
    pub fn new() -> Result<Self, ConfigError> {
        let env = std::env::var("PGLISTEN_ENV").unwrap_or_else(|_| "dev".to_string());
        Self::load(Path::new(CONFIG_DIR), &env)
    }

    /// Layering, lowest precedence first: built-in defaults,
    /// `<dir>/default.*`, `<dir>/<env>.*`, then `PGLISTEN_*` variables
    /// (`PGLISTEN_DATABASE__HOST`, ...). `PGLISTEN_DATABASE_URL` overrides
    /// every connection field.
    pub fn load(dir: &Path, env: &str) -> Result<Self, ConfigError> {
        let mut builder = file_layers(dir, env)?.add_source(
            Environment::with_prefix("PGLISTEN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Ok(url) = std::env::var("PGLISTEN_DATABASE_URL") {
            builder = builder.set_override("database.url", url)?;
        }

        builder.build()?.try_deserialize()
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Built-in defaults overlaid with the optional configuration files.
fn file_layers(dir: &Path, env: &str) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Ok(defaults()?
        .add_source(File::from(dir.join("default")).required(false))
        .add_source(File::from(dir.join(env.to_lowercase())).required(false)))
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let database = DatabaseConfig::default();
    let listener = ListenerConfig::default();
    let queue = QueueConfig::default();

    Config::builder()
        .set_default("database.host", database.host)?
        .set_default("database.port", database.port as i64)?
        .set_default("database.user", database.user)?
        .set_default("database.password", database.password)?
        .set_default("database.name", database.name)?
        .set_default("database.application_name", database.application_name)?
        .set_default(
            "database.connect_timeout_secs",
            database.connect_timeout_secs as i64,
        )?
        .set_default("database.autocommit", database.autocommit)?
        .set_default(
            "listener.heartbeat_interval_ms",
            listener.heartbeat_interval_ms as i64,
        )?
        .set_default("queue.capacity", queue.capacity as i64)?
        .set_default("queue.overflow", "drop_oldest")?
        .set_default("log.level", default_log_level())?
        .set_default("log.format", default_log_format())
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}
