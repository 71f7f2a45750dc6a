//! # capsule-config
//!
//! Configuration management for capsule tooling.
//!
//! Loads configuration from:
//! 1. `~/.capsule/config.toml` (global)
//! 2. `.capsule/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| {
    RwLock::new(Config::load().unwrap_or_else(|e| {
        eprintln!("[capsule-config] WARNING: Failed to load config: {}. Using defaults.", e);
        Config::default()
    }))
});

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

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Current config schema version
pub const CONFIG_VERSION: u32 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Config schema version (for forward compatibility)
    pub config_version: u32,
    pub capsule: CapsuleConfig,
    pub engine: EngineConfig,
    pub plugin_host: PluginHostConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            capsule: CapsuleConfig::default(),
            engine: EngineConfig::default(),
            plugin_host: PluginHostConfig::default(),
        }
    }
}

impl Config {
    /// Load config from standard locations (CWD-relative project config)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_for_project(Path::new("."))
    }

    /// Load config for a specific project root directory.
    /// Resolution order: global → project → env vars.
    pub fn load_for_project(project_root: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.capsule/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Load project config (<project_root>/.capsule/config.toml)
        let project_config_path = project_root.join(".capsule/config.toml");
        if project_config_path.exists() {
            debug!("Loading project config from {:?}", project_config_path);
            let contents = std::fs::read_to_string(&project_config_path)?;
            let project_config: Config = toml::from_str(&contents)?;
            config.merge(project_config);
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        // 4. Resolve capsule root to absolute path if relative and present
        if config.capsule.root.as_os_str() == "." {
            if let Ok(abs) = std::fs::canonicalize(project_root) {
                config.capsule.root = abs;
            } else {
                config.capsule.root = project_root.to_path_buf();
            }
        }

        Ok(config)
    }

    /// Global config path: ~/.capsule/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".capsule/config.toml"))
    }

    /// Merge another config (project overrides global).
    /// Non-default values from `other` replace values in `self`.
    fn merge(&mut self, other: Config) {
        let default_capsule = CapsuleConfig::default();
        if other.capsule.root != default_capsule.root {
            self.capsule.root = other.capsule.root;
        }
        if other.capsule.tool_name != default_capsule.tool_name {
            self.capsule.tool_name = other.capsule.tool_name;
        }
        if other.capsule.tool_version != default_capsule.tool_version {
            self.capsule.tool_version = other.capsule.tool_version;
        }

        let default_engine = EngineConfig::default();
        if other.engine.default_compression != default_engine.default_compression {
            self.engine.default_compression = other.engine.default_compression;
        }
        if other.engine.temp_dir != default_engine.temp_dir {
            self.engine.temp_dir = other.engine.temp_dir;
        }

        let default_plugin_host = PluginHostConfig::default();
        if !other.plugin_host.plugin_dirs.is_empty() {
            self.plugin_host.plugin_dirs = other.plugin_host.plugin_dirs;
        }
        if other.plugin_host.timeout_secs != default_plugin_host.timeout_secs {
            self.plugin_host.timeout_secs = other.plugin_host.timeout_secs;
        }
    }

    /// Apply environment variable overrides (highest priority)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("CAPSULE_ROOT") {
            self.capsule.root = PathBuf::from(root);
        }
        if let Ok(name) = std::env::var("CAPSULE_TOOL_NAME") {
            self.capsule.tool_name = name;
        }
        if let Ok(version) = std::env::var("CAPSULE_TOOL_VERSION") {
            self.capsule.tool_version = version;
        }
        if let Ok(compression) = std::env::var("CAPSULE_COMPRESSION") {
            self.engine.default_compression = compression;
        }
        if let Ok(dirs) = std::env::var("CAPSULE_PLUGIN_DIRS") {
            self.plugin_host.plugin_dirs = std::env::split_paths(&dirs).collect();
        }
        if let Ok(timeout) = std::env::var("CAPSULE_PLUGIN_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse() {
                self.plugin_host.timeout_secs = secs;
            }
        }
    }

    /// Generate TOML template for project bootstrapping.
    pub fn init_toml() -> String {
        let default = Config::default();
        format!(
            r#"# Capsule project configuration
config_version = 1

[capsule]
tool_name = "{tool_name}"
tool_version = "{tool_version}"
# root = "."  # defaults to the project root

[engine]
default_compression = "{compression}"
# temp_dir = "/var/tmp/capsule"

[plugin_host]
# plugin_dirs = ["/usr/local/lib/capsule/plugins"]
timeout_secs = {timeout_secs}
"#,
            tool_name = default.capsule.tool_name,
            tool_version = default.capsule.tool_version,
            compression = default.engine.default_compression,
            timeout_secs = default.plugin_host.timeout_secs,
        )
    }

    // ========== Convenience Accessors ==========

    /// Get the capsule's root directory
    pub fn root(&self) -> &Path {
        &self.capsule.root
    }

    /// Get the default archive compression codec name
    pub fn default_compression(&self) -> &str {
        &self.engine.default_compression
    }

    /// Get plugin search directories
    pub fn plugin_dirs(&self) -> &[PathBuf] {
        &self.plugin_host.plugin_dirs
    }

    /// Get the plugin invocation timeout
    pub fn plugin_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.plugin_host.timeout_secs)
    }
}

/// Identity of the capsule this process is operating on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CapsuleConfig {
    /// Capsule root directory (auto-resolved to absolute path)
    pub root: PathBuf,
    /// Tool name recorded in new manifests
    pub tool_name: String,
    /// Tool version recorded in new manifests
    pub tool_version: String,
}

impl Default for CapsuleConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            tool_name: "capsule".to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Export/conversion engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default archive compression codec: "xz" or "gzip"
    pub default_compression: String,
    /// Scratch directory for DERIVED-mode export pipelines (None = system default)
    pub temp_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_compression: "xz".to_string(),
            temp_dir: None,
        }
    }
}

/// Plugin host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginHostConfig {
    /// Directories scanned for `plugin.json` manifests, in order
    pub plugin_dirs: Vec<PathBuf>,
    /// Seconds a plugin invocation may run before being killed
    pub timeout_secs: u64,
}

impl Default for PluginHostConfig {
    fn default() -> Self {
        Self {
            plugin_dirs: Vec::new(),
            timeout_secs: 60,
        }
    }
}
