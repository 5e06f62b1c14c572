use filterd_config::Config;
use std::path::PathBuf;

fn get_test_config_path(filename: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("test_configs");
    path.push(filename);
    path
}

#[test]
fn test_basic_config_loads() {
    let config = Config::from_file(&get_test_config_path("test_basic.yaml"))
        .expect("Failed to load basic config");

    assert_eq!(config.listen_addrs.len(), 2);
    assert_eq!(config.listen_addrs[0], "127.0.0.1:8080");
    assert_eq!(config.listen_addrs[1], "127.0.0.1:8443");

    assert_eq!(config.timeouts.read, 5);
    assert_eq!(config.timeouts.idle, 300);

    assert!(config.metrics.enabled);
    assert_eq!(config.metrics.address, "127.0.0.1:9091");

    // Optional blocks fall back to defaults
    assert_eq!(config.buffer_pool.array_size, 8192);
    assert_eq!(config.dispatcher.keep_alive, 60);
    assert!(config.filter_lists.is_empty());
    assert!(config.whitelist.is_empty());
}

#[test]
fn test_full_config_loads() {
    let config = Config::from_file(&get_test_config_path("test_full.yaml"))
        .expect("Failed to load full config");

    assert_eq!(config.timeouts.read, 10);
    assert_eq!(config.timeouts.idle, 120);

    assert_eq!(config.buffer_pool.array_size, 16384);
    assert_eq!(config.buffer_pool.max_pool_size, 262144);

    assert_eq!(config.dispatcher.max_workers, 64);
    assert_eq!(config.dispatcher.keep_alive, 30);

    assert_eq!(config.filter_lists.len(), 2);
    assert_eq!(config.filter_lists[0].name, "base");
    assert_eq!(config.filter_lists[0].patterns.len(), 2);
    assert!(!config.filter_lists[1].enabled);

    let enabled: Vec<_> = config.enabled_filter_lists().collect();
    assert_eq!(enabled.len(), 1);
    assert_eq!(enabled[0].name, "base");

    assert_eq!(config.whitelist, vec!["*.bank.example.com".to_string()]);
}

#[test]
fn test_shipped_config_loads() {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.pop(); // Go up to workspace root
    path.push("config.yaml");

    let config = Config::from_file(&path).expect("Failed to load shipped config");

    assert_eq!(config.listen_addrs, vec!["127.0.0.1:8080".to_string()]);
    assert_eq!(config.buffer_pool.max_pool_size, 1024 * 1024);
    assert_eq!(config.enabled_filter_lists().count(), 2);
    assert_eq!(config.whitelist.len(), 1);
}

#[test]
fn test_partial_buffer_pool_uses_defaults() {
    let yaml = r#"
listen_addrs:
  - "127.0.0.1:8080"
timeouts:
  read: 10
  idle: 300
metrics:
  enabled: false
  address: "127.0.0.1:9000"
buffer_pool:
  array_size: 1024
"#;

    let config = Config::parse(yaml).expect("Failed to parse config");
    assert_eq!(config.buffer_pool.array_size, 1024);
    assert_eq!(config.buffer_pool.max_pool_size, 1024 * 1024); // default
}

#[test]
fn test_filter_list_enabled_by_default() {
    let yaml = r#"
listen_addrs: []
timeouts:
  read: 10
  idle: 300
metrics:
  enabled: false
  address: "127.0.0.1:9000"
filter_lists:
  - name: "plain"
"#;

    let config = Config::parse(yaml).expect("Failed to parse config");
    assert!(config.filter_lists[0].enabled);
    assert!(config.filter_lists[0].patterns.is_empty());
}

#[test]
fn test_unnamed_filter_list_rejected() {
    let yaml = r#"
listen_addrs: []
timeouts:
  read: 10
  idle: 300
metrics:
  enabled: false
  address: "127.0.0.1:9000"
filter_lists:
  - name: ""
    patterns: ["*.a.com"]
"#;

    assert!(Config::parse(yaml).is_err());
}

#[test]
fn test_config_missing_required_field() {
    let yaml = r#"
listen_addrs:
  - "127.0.0.1:8080"
timeouts:
  idle: 300
metrics:
  enabled: true
  address: "127.0.0.1:9000"
"#;

    let result = Config::parse(yaml);
    assert!(result.is_err(), "Should fail when read timeout is missing");
}

#[test]
fn test_config_invalid_yaml() {
    let yaml = r#"
listen_addrs: [invalid
timeouts:
  - invalid
"#;

    let result = Config::parse(yaml);
    assert!(result.is_err(), "Should fail on invalid YAML");
}
