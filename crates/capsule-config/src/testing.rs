//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage an isolated capsule root, a source
//! tree to ingest from, and a plugin directory, all under one temp dir that
//! is cleaned up when the environment is dropped.
//!
//! # Usage
//!
//! ```ignore
//! use capsule_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let capsule = CapsuleContainer::new(&env.capsule_root, "test", "0.1.0").unwrap();
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique capsule and plugin directories.
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Isolated capsule root directory
    pub capsule_root: PathBuf,
    /// Source tree for files to be ingested
    pub source_dir: PathBuf,
    /// Directory scanned for plugin manifests
    pub plugin_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let capsule_root = root.join("capsule");
        let source_dir = root.join("source");
        let plugin_dir = root.join("plugins");

        std::fs::create_dir_all(&capsule_root)?;
        std::fs::create_dir_all(&source_dir)?;
        std::fs::create_dir_all(&plugin_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            capsule_root,
            source_dir,
            plugin_dir,
            test_id,
        })
    }

    /// Create a source file with content, returning its path.
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.source_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a source subdirectory.
    pub fn create_dir(&self, relative_path: &str) -> anyhow::Result<PathBuf> {
        let path = self.source_dir.join(relative_path);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Build a [`crate::Config`] pointed at this environment's directories.
    pub fn config(&self) -> crate::Config {
        let mut cfg = crate::Config::default();
        cfg.capsule.root = self.capsule_root.clone();
        cfg.plugin_host.plugin_dirs = vec![self.plugin_dir.clone()];
        cfg
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.capsule_root.exists());
        assert!(env.source_dir.exists());
        assert!(env.plugin_dir.exists());
    }

    #[test]
    fn test_environment_has_unique_ids() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.test_id, env2.test_id);
    }

    #[test]
    fn test_create_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_file("src/main.rs", b"fn main() {}").unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"fn main() {}");
    }

    #[test]
    fn test_config_points_at_environment_dirs() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.config();
        assert_eq!(cfg.capsule.root, env.capsule_root);
        assert_eq!(cfg.plugin_host.plugin_dirs, vec![env.plugin_dir.clone()]);
    }
}
