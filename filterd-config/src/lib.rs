use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// filterd configuration loaded from YAML.
///
/// Covers the inspector listener, the shared buffer pool, the dispatcher worker pool,
/// metrics, and the filter lists handed to the rule set.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// Addresses the inspector listens on (e.g., "127.0.0.1:8080")
    pub listen_addrs: Vec<String>,
    /// Timeout configuration for stream reads
    pub timeouts: Timeouts,
    /// Prometheus metrics configuration
    pub metrics: Metrics,
    /// Pooled buffer allocator settings (defaults: 8 KiB arrays, 1 MiB pool)
    #[serde(default)]
    pub buffer_pool: BufferPool,
    /// Keyed dispatcher worker pool settings
    #[serde(default)]
    pub dispatcher: Dispatcher,
    /// Filter lists with glob patterns ("*.ads.example.com", "tracker?.net")
    #[serde(default)]
    pub filter_lists: Vec<FilterList>,
    /// Hosts that are never filtered, whatever the filter lists say
    #[serde(default)]
    pub whitelist: Vec<String>,
}

/// Buffer pool configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BufferPool {
    /// Size of every pooled array in bytes (default: 8192)
    #[serde(default = "default_array_size")]
    pub array_size: usize,
    /// Upper bound of bytes retained by the free list (default: 1 MiB)
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
}

fn default_array_size() -> usize {
    8192
}

fn default_max_pool_size() -> usize {
    1024 * 1024
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            array_size: default_array_size(),
            max_pool_size: default_max_pool_size(),
        }
    }
}

/// Dispatcher worker pool configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Dispatcher {
    /// Maximum number of worker threads running dispatched tasks (default: 512)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Seconds an idle worker is kept before being reclaimed (default: 60)
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
}

fn default_max_workers() -> usize {
    512
}

fn default_keep_alive() -> u64 {
    60
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            keep_alive: default_keep_alive(),
        }
    }
}

/// A named list of glob patterns.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FilterList {
    pub name: String,
    #[serde(default = "default_list_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub patterns: Vec<String>,
}

fn default_list_enabled() -> bool {
    true
}

/// Timeout settings (all values in seconds).
#[derive(Debug, Serialize, Deserialize)]
pub struct Timeouts {
    /// Maximum time to wait for the first bytes of a connection
    pub read: u64,
    /// Maximum time a connection may stay open while being inspected
    pub idle: u64,
}

/// Prometheus metrics server configuration.
#[derive(Debug, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to enable metrics collection
    pub enabled: bool,
    /// Address to bind metrics HTTP server (e.g., "127.0.0.1:9000")
    pub address: String,
}

impl Config {
    /// Loads configuration from a YAML file.
    ///
    /// The loaded configuration is validated before it is returned.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use filterd_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("config.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parses and validates configuration from a YAML string.
    ///
    /// # Examples
    ///
    /// ```
    /// use filterd_config::Config;
    ///
    /// let yaml = r#"
    /// listen_addrs:
    ///   - "127.0.0.1:8080"
    /// timeouts:
    ///   read: 10
    ///   idle: 300
    /// metrics:
    ///   enabled: true
    ///   address: "127.0.0.1:9000"
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.listen_addrs[0], "127.0.0.1:8080");
    /// assert_eq!(config.buffer_pool.array_size, 8192);
    /// ```
    pub fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Config = serde_yaml_ng::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values serde cannot reject on its own.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.buffer_pool.array_size == 0 {
            return Err("buffer_pool.array_size must be greater than zero".into());
        }
        if self.buffer_pool.max_pool_size < self.buffer_pool.array_size {
            return Err(format!(
                "buffer_pool.max_pool_size ({}) must be at least array_size ({})",
                self.buffer_pool.max_pool_size, self.buffer_pool.array_size
            )
            .into());
        }
        if self.dispatcher.max_workers == 0 {
            return Err("dispatcher.max_workers must be greater than zero".into());
        }
        if let Some(list) = self.filter_lists.iter().find(|l| l.name.is_empty()) {
            return Err(format!("filter list with {} patterns has no name", list.patterns.len()).into());
        }
        Ok(())
    }

    /// Filter lists that take part in rule evaluation.
    pub fn enabled_filter_lists(&self) -> impl Iterator<Item = &FilterList> {
        self.filter_lists.iter().filter(|list| list.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config_parsing() {
        let yaml = r#"
listen_addrs:
  - "127.0.0.1:8080"
  - "127.0.0.1:8443"
timeouts:
  read: 10
  idle: 300
metrics:
  enabled: true
  address: "127.0.0.1:9000"
buffer_pool:
  array_size: 4096
  max_pool_size: 65536
filter_lists:
  - name: "ads"
    patterns:
      - "*.ads.example.com"
      - "tracker?.example.net"
whitelist:
  - "cdn.example.com"
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.listen_addrs.len(), 2);
        assert_eq!(config.listen_addrs[0], "127.0.0.1:8080");
        assert_eq!(config.timeouts.read, 10);
        assert_eq!(config.timeouts.idle, 300);
        assert!(config.metrics.enabled);
        assert_eq!(config.buffer_pool.array_size, 4096);
        assert_eq!(config.buffer_pool.max_pool_size, 65536);
        assert_eq!(config.filter_lists.len(), 1);
        assert!(config.filter_lists[0].enabled);
        assert_eq!(config.filter_lists[0].patterns[1], "tracker?.example.net");
        assert_eq!(config.whitelist, vec!["cdn.example.com".to_string()]);
    }

    #[test]
    fn test_defaults_applied() {
        let yaml = r#"
listen_addrs:
  - "127.0.0.1:8080"
timeouts:
  read: 5
  idle: 60
metrics:
  enabled: false
  address: "127.0.0.1:9000"
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.buffer_pool.array_size, 8192);
        assert_eq!(config.buffer_pool.max_pool_size, 1024 * 1024);
        assert_eq!(config.dispatcher.max_workers, 512);
        assert_eq!(config.dispatcher.keep_alive, 60);
        assert!(config.filter_lists.is_empty());
        assert!(config.whitelist.is_empty());
    }

    #[test]
    fn test_missing_required_field() {
        let yaml = r#"
listen_addrs:
  - "127.0.0.1:8080"
timeouts:
  idle: 60
metrics:
  enabled: false
  address: "127.0.0.1:9000"
"#;
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_invalid_yaml() {
        let yaml = "invalid: yaml: content: ::::";
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_empty_config() {
        assert!(Config::parse("").is_err());
    }

    #[test]
    fn test_zero_array_size_rejected() {
        let yaml = r#"
listen_addrs: []
timeouts:
  read: 5
  idle: 60
metrics:
  enabled: false
  address: "127.0.0.1:9000"
buffer_pool:
  array_size: 0
"#;
        let err = Config::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("array_size"));
    }

    #[test]
    fn test_pool_smaller_than_array_rejected() {
        let yaml = r#"
listen_addrs: []
timeouts:
  read: 5
  idle: 60
metrics:
  enabled: false
  address: "127.0.0.1:9000"
buffer_pool:
  array_size: 4096
  max_pool_size: 1024
"#;
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_disabled_lists_skipped() {
        let yaml = r#"
listen_addrs: []
timeouts:
  read: 5
  idle: 60
metrics:
  enabled: false
  address: "127.0.0.1:9000"
filter_lists:
  - name: "on"
    patterns: ["*.a.com"]
  - name: "off"
    enabled: false
    patterns: ["*.b.com"]
"#;
        let config = Config::parse(yaml).unwrap();
        let names: Vec<_> = config.enabled_filter_lists().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["on"]);
    }
}
