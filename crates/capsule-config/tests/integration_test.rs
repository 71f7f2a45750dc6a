//! Integration tests for capsule-config
//!
//! These tests verify the full config loading pipeline with real file system operations.

use std::path::PathBuf;
use tempfile::tempdir;

/// Test config loading from a real project config file
#[test]
fn test_load_project_config_from_file() {
    let temp = tempdir().unwrap();
    let capsule_dir = temp.path().join(".capsule");
    std::fs::create_dir_all(&capsule_dir).unwrap();

    let config_content = r#"
[engine]
default_compression = "gzip"

[plugin_host]
plugin_dirs = ["/opt/capsule/plugins"]
timeout_secs = 120
"#;
    std::fs::write(capsule_dir.join("config.toml"), config_content).unwrap();

    let config = capsule_config::Config::load_for_project(temp.path()).unwrap();

    assert_eq!(config.engine.default_compression, "gzip");
    assert_eq!(config.plugin_host.plugin_dirs, vec![PathBuf::from("/opt/capsule/plugins")]);
    assert_eq!(config.plugin_host.timeout_secs, 120);
}

/// Test config hierarchy: project config overrides defaults, env overrides project
#[test]
fn test_config_hierarchy_env_overrides_project() {
    let temp = tempdir().unwrap();
    let capsule_dir = temp.path().join(".capsule");
    std::fs::create_dir_all(&capsule_dir).unwrap();

    let project_config = r#"
[engine]
default_compression = "gzip"
"#;
    std::fs::write(capsule_dir.join("config.toml"), project_config).unwrap();

    std::env::set_var("CAPSULE_COMPRESSION", "xz");
    let config = capsule_config::Config::load_for_project(temp.path()).unwrap();
    std::env::remove_var("CAPSULE_COMPRESSION");

    // Env var wins over project config.
    assert_eq!(config.engine.default_compression, "xz");
}

/// Test config with environment variable override for plugin directories
#[test]
fn test_config_env_override_plugin_dirs() {
    let temp = tempdir().unwrap();
    let joined = std::env::join_paths([temp.path().join("a"), temp.path().join("b")]).unwrap();

    std::env::set_var("CAPSULE_PLUGIN_DIRS", &joined);
    let mut config = capsule_config::Config::default();
    config.apply_env_overrides();
    std::env::remove_var("CAPSULE_PLUGIN_DIRS");

    assert_eq!(config.plugin_host.plugin_dirs.len(), 2);
}

/// Test complete config serialization/deserialization cycle
#[test]
fn test_config_full_roundtrip_with_all_sections() {
    let original = capsule_config::Config::default();

    let temp = tempdir().unwrap();
    let config_path = temp.path().join("config.toml");
    let toml_str = toml::to_string_pretty(&original).unwrap();
    std::fs::write(&config_path, &toml_str).unwrap();

    let contents = std::fs::read_to_string(&config_path).unwrap();
    let loaded: capsule_config::Config = toml::from_str(&contents).unwrap();

    assert_eq!(original.engine.default_compression, loaded.engine.default_compression);
    assert_eq!(original.plugin_host.timeout_secs, loaded.plugin_host.timeout_secs);
    assert_eq!(original.capsule.tool_name, loaded.capsule.tool_name);
}

/// Test partial config with defaults filling in
#[test]
fn test_partial_config_defaults_applied() {
    let partial = r#"
[engine]
default_compression = "gzip"
"#;
    let config: capsule_config::Config = toml::from_str(partial).unwrap();

    assert_eq!(config.engine.default_compression, "gzip");
    assert_eq!(config.plugin_host.timeout_secs, 60);
    assert_eq!(config.capsule.tool_name, "capsule");
}

/// Test root resolution: a project root with no config still resolves to an
/// absolute path.
#[test]
fn test_root_resolves_to_absolute_path() {
    let temp = tempdir().unwrap();
    let config = capsule_config::Config::load_for_project(temp.path()).unwrap();
    assert!(config.capsule.root.is_absolute());
}
