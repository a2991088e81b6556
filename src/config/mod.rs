//! Configuration System
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./ifcbus.yaml` (current directory - highest priority)
//! 2. `~/.ifcbus.yaml` (home directory)
//! 3. `~/.config/ifcbus/ifcbus.yaml` (user config directory)
//! 4. `/etc/ifcbus/ifcbus.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority files.
//!
//! # YAML Structure
//!
//! ```yaml
//! router:
//!   subnet_prefix_len: 8
//!   name_server:
//!     max_redirects: 8
//! transports:
//!   listen: ["0.0.0.0:4100"]
//! ```

mod router;
mod transport;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use router::{NameServerConfig, RouterConfig};
pub use transport::{TransportsConfig, UpstreamConfig};

/// Default config filename.
const CONFIG_FILENAME: &str = "ifcbus.yaml";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Router configuration (`router.*`).
    #[serde(default)]
    pub router: RouterConfig,

    /// Transports (`transports.*`).
    #[serde(default, skip_serializing_if = "TransportsConfig::is_empty")]
    pub transports: TransportsConfig,
}

impl Config {
    /// Create a new empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths.
    ///
    /// Returns a tuple of (config, paths_loaded) where paths_loaded contains
    /// the paths that were successfully loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let search_paths = Self::search_paths();
        Self::load_from_paths(&search_paths)
    }

    /// Load configuration from specific paths.
    ///
    /// Paths are processed in order, with later paths overriding earlier ones.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }

        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // System config (lowest priority)
        paths.push(PathBuf::from("/etc/ifcbus").join(CONFIG_FILENAME));

        // User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("ifcbus").join(CONFIG_FILENAME));
        }

        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".ifcbus.yaml"));
        }

        // Current directory (highest priority)
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` when present.
    pub fn merge(&mut self, other: Config) {
        self.router.merge(other.router);
        self.transports.merge(other.transports);
    }

    /// Serialize this configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_defaults() {
        let config = Config::new();
        assert_eq!(config.router.subnet_prefix_len(), 8);
        assert_eq!(config.router.name_server.max_redirects(), 8);
        assert_eq!(config.router.name_server.request_timeout_ms(), 5000);
        assert!(config.transports.is_empty());
    }

    #[test]
    fn test_parse_yaml_empty() {
        let config: Config = serde_yaml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
router:
  subnet_prefix_len: 4
  name_server:
    max_redirects: 3
transports:
  listen:
    - "127.0.0.1:4100"
  upstream:
    addr: "10.0.0.1:4100"
    domain: "left"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.router.subnet_prefix_len(), 4);
        assert_eq!(config.router.name_server.max_redirects(), 3);
        assert_eq!(config.router.name_server.request_timeout_ms(), 5000);
        assert_eq!(config.transports.listen, vec!["127.0.0.1:4100".to_string()]);
        let upstream = config.transports.upstream.unwrap();
        assert_eq!(upstream.addr, "10.0.0.1:4100");
        assert_eq!(upstream.domain, "left");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r#"
router:
  subnet_bits: 4
"#;
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_upstream_domain_defaults_empty() {
        let yaml = r#"
transports:
  upstream:
    addr: "10.0.0.1:4100"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.transports.upstream.unwrap().domain, "");
    }

    #[test]
    fn test_merge_configs() {
        let mut base = Config::new();
        base.router.subnet_prefix_len = Some(4);
        base.router.name_server.max_redirects = Some(2);

        let mut override_config = Config::new();
        override_config.router.subnet_prefix_len = Some(6);

        base.merge(override_config);
        assert_eq!(base.router.subnet_prefix_len(), 6);
        // Untouched values survive
        assert_eq!(base.router.name_server.max_redirects(), 2);
    }

    #[test]
    fn test_load_from_paths_merges() {
        let temp_dir = TempDir::new().unwrap();
        let low_priority = temp_dir.path().join("low.yaml");
        let high_priority = temp_dir.path().join("high.yaml");

        fs::write(
            &low_priority,
            r#"
router:
  subnet_prefix_len: 4
transports:
  listen: ["127.0.0.1:4100"]
"#,
        )
        .unwrap();
        fs::write(
            &high_priority,
            r#"
router:
  subnet_prefix_len: 12
"#,
        )
        .unwrap();

        let paths = vec![low_priority, high_priority];
        let (config, loaded) = Config::load_from_paths(&paths).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(config.router.subnet_prefix_len(), 12);
        assert_eq!(config.transports.listen.len(), 1);
    }

    #[test]
    fn test_load_skips_missing_files() {
        let temp_dir = TempDir::new().unwrap();
        let existing = temp_dir.path().join("exists.yaml");
        let missing = temp_dir.path().join("missing.yaml");
        fs::write(&existing, "router:\n  subnet_prefix_len: 2\n").unwrap();

        let (config, loaded) = Config::load_from_paths(&[missing, existing.clone()]).unwrap();
        assert_eq!(loaded, vec![existing]);
        assert_eq!(config.router.subnet_prefix_len(), 2);
    }

    #[test]
    fn test_load_file_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        fs::write(&path, "router: [unclosed").unwrap();
        assert!(matches!(
            Config::load_file(&path),
            Err(ConfigError::ParseYaml { .. })
        ));
    }

    #[test]
    fn test_search_paths_includes_expected() {
        let paths = Config::search_paths();
        assert!(paths.iter().any(|p| p.ends_with("ifcbus.yaml")));
        assert!(paths
            .iter()
            .any(|p| p.starts_with("/etc/ifcbus") && p.ends_with("ifcbus.yaml")));
    }

    #[test]
    fn test_to_yaml_omits_unset() {
        let mut config = Config::new();
        config.router.subnet_prefix_len = Some(10);
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("subnet_prefix_len: 10"));
        assert!(!yaml.contains("max_redirects"));
        assert!(!yaml.contains("transports"));
    }
}
