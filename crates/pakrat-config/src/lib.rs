//! # pakrat-config
//!
//! Configuration management for pakrat.
//!
//! Loads configuration from:
//! 1. `~/.pakrat/config.toml` (global)
//! 2. `.pakrat/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

/// Initialize tracing from `RUST_LOG`, the way the pakrat daemons do at
/// startup. Safe to call more than once (later calls are no-ops).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub maint: MaintConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.pakrat/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Load project config (.pakrat/config.toml) - overrides global
        let project_path = Path::new(".pakrat/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let contents = std::fs::read_to_string(project_path)?;
            let project_config: Config = toml::from_str(&contents)?;
            config.merge(project_config);
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse a config from TOML text (missing fields take defaults).
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Global config path: ~/.pakrat/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".pakrat/config.toml"))
    }

    /// Merge another config (project overrides)
    fn merge(&mut self, other: Config) {
        let defaults = Config::default();
        if other.cache.cache_dir != defaults.cache.cache_dir {
            self.cache.cache_dir = other.cache.cache_dir;
        }
        if other.maint.log_dir != defaults.maint.log_dir {
            self.maint.log_dir = other.maint.log_dir;
        }
        if other.maint.sink_prefix != defaults.maint.sink_prefix {
            self.maint.sink_prefix = other.maint.sink_prefix;
        }
        if other.maint.stall_timeout_secs != defaults.maint.stall_timeout_secs {
            self.maint.stall_timeout_secs = other.maint.stall_timeout_secs;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("PAKRAT_CACHE_DIR") {
            self.cache.cache_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("PAKRAT_LOG_DIR") {
            self.maint.log_dir = PathBuf::from(dir);
        }
        if let Ok(secs) = std::env::var("PAKRAT_STALL_TIMEOUT") {
            if let Ok(n) = secs.parse() {
                self.maint.stall_timeout_secs = n;
            }
        }
    }
}

/// On-disk cache layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory for cached repository files
    pub cache_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: pakrat_home().join("cache"),
        }
    }
}

/// Background maintenance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintConfig {
    /// Directory holding per-job output logs
    pub log_dir: PathBuf,
    /// Filename prefix for job output logs (`<prefix><job_id>.log`)
    pub sink_prefix: String,
    /// How long a follower waits for progress before reporting a stall
    pub stall_timeout_secs: u64,
}

impl Default for MaintConfig {
    fn default() -> Self {
        Self {
            log_dir: pakrat_home().join("log"),
            sink_prefix: "maintjob-".to_string(),
            stall_timeout_secs: 30,
        }
    }
}

impl MaintConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

fn pakrat_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".pakrat")
}
