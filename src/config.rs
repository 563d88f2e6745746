//! Configuration management for geoallow.

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/geoallow/config.yaml";

/// RIPEstat country resource list, IPv4 as prefixes.
pub const DEFAULT_REGISTRY_URL: &str =
    "https://stat.ripe.net/data/country-resource-list/data.json?v4_format=prefix&resource={country}";

/// Placeholder substituted with the country code in `registry_url`.
pub const COUNTRY_PLACEHOLDER: &str = "{country}";

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Registry URL template, must contain `{country}`
    pub registry_url: String,

    /// Directory holding one `<CC>.json` prefix list per country
    pub lists_dir: PathBuf,

    /// Known-good snapshot file
    pub snapshot_path: PathBuf,

    /// Persisted country registry and baseline
    pub registry_path: PathBuf,

    /// Single-instance lock file
    pub lock_path: PathBuf,

    /// Per-request timeout
    pub fetch_timeout_secs: u64,

    /// Attempts per country before the fetch is reported failed
    pub fetch_retries: u32,

    /// Accepted prefix floor below which a fetch is rejected
    pub min_prefixes: usize,

    /// A new list shorter than this fraction of the stored one is rejected
    pub regression_ratio: f64,

    pub max_concurrent_fetches: usize,

    /// Local subnet to allow; detected from the default route when unset
    pub local_subnet: Option<Ipv4Net>,

    /// Re-lock INPUT/FORWARD to DROP at the end of an apply
    pub relock: bool,

    /// Journal pipeline failures to syslog
    pub syslog: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            lists_dir: PathBuf::from("/var/lib/geoallow/lists"),
            snapshot_path: PathBuf::from("/var/lib/geoallow/snapshot.json"),
            registry_path: PathBuf::from("/var/lib/geoallow/registry.yaml"),
            lock_path: PathBuf::from(crate::lock::DEFAULT_LOCK_FILE),
            fetch_timeout_secs: 30,
            fetch_retries: 3,
            min_prefixes: 100,
            regression_ratio: 0.9,
            max_concurrent_fetches: 4,
            local_subnet: None,
            relock: true,
            syslog: true,
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load `path`, or fall back to defaults when it is the default path and
    /// does not exist yet.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() && path == Path::new(DEFAULT_CONFIG_PATH) {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !self.registry_url.starts_with("https://") {
            anyhow::bail!("Registry URL must use HTTPS: {}", self.registry_url);
        }
        if !self.registry_url.contains(COUNTRY_PLACEHOLDER) {
            anyhow::bail!(
                "Registry URL must contain the {} placeholder: {}",
                COUNTRY_PLACEHOLDER,
                self.registry_url
            );
        }

        if self.fetch_timeout_secs == 0 || self.fetch_timeout_secs > 600 {
            anyhow::bail!(
                "Invalid fetch_timeout_secs {}. Must be between 1 and 600",
                self.fetch_timeout_secs
            );
        }
        if self.fetch_retries == 0 || self.fetch_retries > 10 {
            anyhow::bail!(
                "Invalid fetch_retries {}. Must be between 1 and 10",
                self.fetch_retries
            );
        }
        if self.max_concurrent_fetches == 0 {
            anyhow::bail!("max_concurrent_fetches must be at least 1");
        }
        if !(self.regression_ratio > 0.0 && self.regression_ratio <= 1.0) {
            anyhow::bail!(
                "Invalid regression_ratio {}. Must be in (0, 1]",
                self.regression_ratio
            );
        }

        for (name, path) in [
            ("lists_dir", &self.lists_dir),
            ("snapshot_path", &self.snapshot_path),
            ("registry_path", &self.registry_path),
            ("lock_path", &self.lock_path),
        ] {
            if !path.is_absolute() {
                anyhow::bail!("{} must be an absolute path: {:?}", name, path);
            }
        }

        Ok(())
    }

    /// Save configuration to YAML file atomically
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let path = path.as_ref();
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        let parent_dir = path.parent().unwrap_or(Path::new("/etc/geoallow"));
        std::fs::create_dir_all(parent_dir)
            .with_context(|| format!("Failed to create {:?}", parent_dir))?;
        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .context("Failed to create temporary file for config")?;

        temp_file.write_all(content.as_bytes())?;
        temp_file.as_file().sync_all()?;

        temp_file
            .persist(path)
            .with_context(|| format!("Failed to persist config file: {:?}", path))?;

        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.min_prefixes, 100);
        assert_eq!(config.regression_ratio, 0.9);
        assert!(config.relock);
        assert!(config.local_subnet.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "min_prefixes: 50\nrelock: false\nlocal_subnet: 10.0.0.0/8\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.min_prefixes, 50);
        assert!(!config.relock);
        assert_eq!(config.local_subnet, Some("10.0.0.0/8".parse().unwrap()));
        assert_eq!(config.registry_url, DEFAULT_REGISTRY_URL);
    }

    #[test]
    fn test_validation_http_url_rejected() {
        let config = Config {
            registry_url: "http://stat.ripe.net/x?resource={country}".into(),
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("HTTPS"));
    }

    #[test]
    fn test_validation_requires_placeholder() {
        let config = Config {
            registry_url: "https://stat.ripe.net/data.json".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_ratio_bounds() {
        for ratio in [0.0, -1.0, 1.5, f64::NAN] {
            let config = Config {
                regression_ratio: ratio,
                ..Config::default()
            };
            assert!(config.validate().is_err(), "ratio {} accepted", ratio);
        }
    }

    #[test]
    fn test_validation_relative_path_rejected() {
        let config = Config {
            lists_dir: PathBuf::from("lists"),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let config = Config {
            max_concurrent_fetches: 8,
            syslog: false,
            ..Config::default()
        };
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_missing_non_default_path_fails() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load_or_default(dir.path().join("absent.yaml")).is_err());
    }

    #[test]
    fn test_load_invalid_yaml_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "relock: [not a bool").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
