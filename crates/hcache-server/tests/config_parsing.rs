use std::time::Duration;
use std::{env, fs};

use hcache_core::{L2WritePolicy, LevelSettings};
use hcache_server::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    // Create a temporary TOML configuration file
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("hcache.toml");

    let toml_content = r#"
[server]
host = "127.0.0.1"
port = 8081

[logging]
level = "debug"

[near]
maximum_size = 2000
shards = 4
sweep_interval_secs = 0

[redis]
enabled = false
address = "redis://cache.internal:6379"
timeout_ms = 750
key_prefix = "svc"

[write_policy]
mode = "retry"
max_attempts = 5
initial_backoff_ms = 20
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.server.port, 8081);
    assert_eq!(cfg.logging.level.to_ascii_lowercase(), "debug");
    assert_eq!(cfg.near.maximum_size, 2000);
    assert_eq!(cfg.redis.key_prefix, "svc");

    let options = cfg.cache_options();
    assert_eq!(options.key_prefix, "svc");
    assert_eq!(options.near.shards, 4);
    assert_eq!(options.l2_timeout, Duration::from_millis(750));
    assert_eq!(options.sweep_interval, None);
    assert_eq!(
        options.write_policy,
        L2WritePolicy::Retry {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(20),
        }
    );

    // 2) Env override should win over file
    unsafe {
        env::set_var("HCACHE__NEAR__MAXIMUM_SIZE", "64");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.near.maximum_size, 64);
    // cleanup env var
    unsafe {
        env::remove_var("HCACHE__NEAR__MAXIMUM_SIZE");
    }

    // 3) Parameters without a level for each should error
    let invalid_path = dir.path().join("invalid.toml");
    let invalid_toml = r#"
[caches.products]
parameters = ["category", "brand"]
levels = [1]
"#;
    fs::write(&invalid_path, invalid_toml).expect("write invalid toml");
    let err = load_config(invalid_path.to_str()).expect_err("expected validation error");
    assert!(err.contains("caches.products"));
    assert!(err.contains("levels given for"));
}

#[test]
fn config_caches_and_levels_tables() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("caches.toml");

    let toml_content = r#"
[levels.hot]
maximum_size = 500

[levels.cold]
enable_l1 = false

[caches.users]
key = "{id}"
ttl_minutes = 30
cache_level = "hot"

[caches.products]
parameters = ["category", "brand"]
levels = [1, 2]
cache_level = "cold"
enable_l2 = false
"#;
    fs::write(&path, toml_content).expect("write toml");

    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(
        cfg.levels.get("hot"),
        Some(&LevelSettings {
            maximum_size: Some(500),
            enable_l1: true,
            enable_l2: true,
        })
    );
    assert!(!cfg.levels["cold"].enable_l1);

    let caches = cfg.cache_configurations();
    let names: Vec<&str> = caches.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["products", "users"]);

    let products = &caches[0];
    assert_eq!(products.levels, vec![1, 2]);
    assert!(!products.enable_l2);
    assert_eq!(products.ttl(), None);

    let users = &caches[1];
    assert_eq!(users.key.as_deref(), Some("{id}"));
    assert_eq!(users.ttl(), Some(Duration::from_secs(30 * 60)));
    assert_eq!(users.cache_level, "hot");
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("absent.toml");

    let cfg = load_config(path.to_str()).expect("defaults should validate");
    assert_eq!(cfg.server.port, 8080);
    assert!(!cfg.redis.enabled);
    assert!(cfg.caches.is_empty());
}
