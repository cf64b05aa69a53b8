//! Configuration loading and validation tests

use std::fs;

use qfleet_daemon::Config;
use tempfile::TempDir;

fn write_config(contents: &str) -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("qfleet.toml");
    fs::write(&path, contents).unwrap();
    (dir, path)
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let config = Config::load_from(Some(&dir.path().join("absent.toml"))).unwrap();

    assert_eq!(config.daemon.bind_address, "127.0.0.1:9300");
    assert!(config.postgres.enabled);
    assert_eq!(config.learning.defaults.learning_rate, 0.1);
    assert_eq!(config.learning.defaults.discount_factor, 0.95);
    assert_eq!(config.learning.defaults.flush_interval, 10);
    assert_eq!(config.retention.cleanup_interval_secs, 3600);
}

#[test]
fn test_file_overrides_and_agent_kinds() {
    let (_dir, path) = write_config(
        r#"
[daemon]
bind_address = "0.0.0.0:9400"

[postgres]
enabled = false
max_connections = 4

[learning.defaults]
learning_rate = 0.2
initial_epsilon = 0.5

[learning.agents.flaky-test-hunter]
learning_rate = 0.05
discount_factor = 0.9

[learning.agents.flaky-test-hunter.reward]
failure_penalty = 40.0

[retention]
trajectory_ttl_days = 7
"#,
    );

    let config = Config::load_from(Some(&path)).unwrap();
    assert_eq!(config.daemon.bind_address, "0.0.0.0:9400");
    assert!(!config.postgres.enabled);
    assert_eq!(config.postgres.max_connections, 4);
    assert_eq!(config.learning.defaults.learning_rate, 0.2);
    assert_eq!(config.learning.defaults.initial_epsilon, 0.5);
    // Unset fields keep their defaults
    assert_eq!(config.learning.defaults.min_epsilon, 0.01);
    assert_eq!(config.retention.trajectory_ttl_days, 7);

    let flaky = &config.learning.agents["flaky-test-hunter"];
    assert_eq!(flaky.learning_rate, 0.05);
    assert_eq!(flaky.discount_factor, 0.9);
    assert_eq!(flaky.reward.failure_penalty, 40.0);
}

#[test]
fn test_invalid_learning_rate_is_rejected() {
    let (_dir, path) = write_config(
        r#"
[learning.defaults]
learning_rate = 1.5
"#,
    );

    let err = Config::load_from(Some(&path)).unwrap_err();
    assert!(format!("{err:#}").contains("learning.defaults"));
}

#[test]
fn test_invalid_agent_override_names_the_kind() {
    let (_dir, path) = write_config(
        r#"
[learning.agents.test-generator]
min_epsilon = 0.5
initial_epsilon = 0.1
"#,
    );

    let err = Config::load_from(Some(&path)).unwrap_err();
    assert!(format!("{err:#}").contains("test-generator"));
}

#[test]
fn test_zero_ttl_is_rejected() {
    let (_dir, path) = write_config(
        r#"
[retention]
trajectory_ttl_days = 0
"#,
    );

    assert!(Config::load_from(Some(&path)).is_err());
}

#[test]
fn test_environment_overrides_file() {
    let (_dir, path) = write_config(
        r#"
[daemon]
log_level = "info"
"#,
    );

    std::env::set_var("QFLEET__DAEMON__LOG_LEVEL", "debug");
    let config = Config::load_from(Some(&path));
    std::env::remove_var("QFLEET__DAEMON__LOG_LEVEL");

    assert_eq!(config.unwrap().daemon.log_level, "debug");
}
