use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use config as cfg;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolSettings {
    /// Number of worker threads. Fixed for the lifetime of a pool.
    #[serde(default = "PoolSettings::default_size")]
    pub size: usize,
    /// Optional pool name, appended to every worker thread name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "PoolSettings::default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

impl PoolSettings {
    fn default_size() -> usize {
        num_cpus::get().max(1)
    }

    fn default_thread_name_prefix() -> String {
        "atomkit-worker".to_string()
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.size > 0, "pool.size must be a positive integer");
        anyhow::ensure!(
            !self.thread_name_prefix.trim().is_empty(),
            "pool.thread_name_prefix cannot be empty"
        );
        anyhow::ensure!(
            !self.thread_name_prefix.contains('\0'),
            "pool.thread_name_prefix cannot contain NUL bytes"
        );
        if let Some(name) = &self.name {
            anyhow::ensure!(!name.contains('\0'), "pool.name cannot contain NUL bytes");
        }
        Ok(())
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: Self::default_size(),
            name: None,
            thread_name_prefix: Self::default_thread_name_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Settings {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        anyhow::ensure!(
            !self.logging.level.trim().is_empty(),
            "logging.level cannot be empty"
        );
        Ok(())
    }
}

/// Loads [`Settings`] from layered files plus `ATOMKIT__*` environment variables.
pub struct ConfigManager;

impl ConfigManager {
    pub fn default_env() -> String {
        env::var("ATOMKIT_ENV")
            .ok()
            .or_else(|| env::var("RUST_ENV").ok())
            .unwrap_or_else(|| "development".to_string())
    }

    /// First of `~/.atomkit/`, `./config/` that exists, else the current directory.
    pub fn default_config_dir() -> PathBuf {
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let dir = Self::config_dir_in(dirs::home_dir().as_deref(), &cwd);
        info!(dir = %dir.display(), "resolved config directory");
        dir
    }

    fn config_dir_in(home: Option<&Path>, cwd: &Path) -> PathBuf {
        home.map(|home| home.join(".atomkit"))
            .into_iter()
            .chain(Some(cwd.join("config")))
            .find(|candidate| candidate.is_dir())
            .unwrap_or_else(|| cwd.to_path_buf())
    }

    /// Load from the default directory and environment, then validate.
    pub fn load() -> Result<Settings> {
        let settings = Self::load_from_sources(&Self::default_config_dir(), &Self::default_env())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load_from_sources(config_dir: &Path, env_name: &str) -> Result<Settings> {
        let settings: Settings = cfg::Config::builder()
            .add_source(cfg::File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                cfg::File::from(config_dir.join(format!("{}.toml", env_name))).required(false),
            )
            .add_source(cfg::File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                cfg::Environment::with_prefix("ATOMKIT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;
        Ok(settings)
    }
}
