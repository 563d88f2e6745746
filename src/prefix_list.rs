//! Persisted per-country prefix lists.
//!
//! Each country's last accepted list lives at `<lists_dir>/<CC>.json`. The
//! stored `source_timestamp` is the registry's own query time, which drives
//! the freshness check on the next fetch.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::validation::CountryCode;

/// A validated list of IPv4 prefixes for one country.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixList {
    pub country_code: CountryCode,
    /// Timestamp the registry reported for this data.
    pub source_timestamp: DateTime<Utc>,
    pub prefixes: Vec<Ipv4Net>,
}

impl PrefixList {
    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

/// Directory of prefix-list files.
#[derive(Debug, Clone)]
pub struct PrefixStore {
    dir: PathBuf,
    read_only: bool,
}

impl PrefixStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            read_only: false,
        }
    }

    /// Store that reads existing lists but never writes (dry runs).
    pub fn read_only(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            read_only: true,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, country: &CountryCode) -> PathBuf {
        self.dir.join(format!("{}.json", country))
    }

    /// Load the stored list for `country`.
    ///
    /// A missing file yields `None`. An unreadable or malformed file is
    /// logged and also yields `None`, so the next fetch simply replaces it.
    pub fn load(&self, country: &CountryCode) -> Option<PrefixList> {
        let path = self.path_for(country);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Cannot read stored list {:?}: {}", path, e);
                return None;
            }
        };

        match serde_json::from_str::<PrefixList>(&content) {
            Ok(list) if &list.country_code == country => Some(list),
            Ok(list) => {
                warn!(
                    "Stored list {:?} belongs to {}, ignoring",
                    path, list.country_code
                );
                None
            }
            Err(e) => {
                warn!("Stored list {:?} is corrupt, ignoring: {}", path, e);
                None
            }
        }
    }

    /// Atomically replace the stored list for its country.
    pub fn save(&self, list: &PrefixList) -> Result<()> {
        if self.read_only {
            debug!("Dry run: not persisting list for {}", list.country_code);
            return Ok(());
        }

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create lists directory {:?}", self.dir))?;

        let path = self.path_for(&list.country_code);
        let json = serde_json::to_string(list).context("Failed to serialize prefix list")?;

        let mut temp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("Failed to create temp file in {:?}", self.dir))?;
        temp.write_all(json.as_bytes())
            .context("Failed to write prefix list")?;
        temp.as_file()
            .sync_all()
            .context("Failed to sync prefix list")?;
        temp.persist(&path)
            .with_context(|| format!("Failed to persist {:?}", path))?;

        debug!("Saved {} prefixes to {:?}", list.len(), path);
        Ok(())
    }

    /// Delete the stored list. Absent files are not an error.
    pub fn remove(&self, country: &CountryCode) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let path = self.path_for(country);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed stored list {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn sample(cc: &str, n: u8) -> PrefixList {
        PrefixList {
            country_code: cc.parse().unwrap(),
            source_timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            prefixes: (0..n)
                .map(|i| format!("10.{}.0.0/16", i).parse().unwrap())
                .collect(),
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = PrefixStore::new(dir.path());
        let list = sample("US", 3);

        store.save(&list).unwrap();
        assert!(store.path_for(&list.country_code).exists());
        assert_eq!(store.load(&list.country_code), Some(list));
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = PrefixStore::new(dir.path());
        assert!(store.load(&"FR".parse().unwrap()).is_none());
    }

    #[test]
    fn test_load_corrupt_is_none() {
        let dir = TempDir::new().unwrap();
        let store = PrefixStore::new(dir.path());
        let cc: CountryCode = "DE".parse().unwrap();
        fs::write(store.path_for(&cc), "{not json").unwrap();
        assert!(store.load(&cc).is_none());
    }

    #[test]
    fn test_load_mismatched_country_is_none() {
        let dir = TempDir::new().unwrap();
        let store = PrefixStore::new(dir.path());
        let list = sample("US", 2);
        let fr: CountryCode = "FR".parse().unwrap();
        fs::write(store.path_for(&fr), serde_json::to_string(&list).unwrap()).unwrap();
        assert!(store.load(&fr).is_none());
    }

    #[test]
    fn test_read_only_store_does_not_write() {
        let dir = TempDir::new().unwrap();
        let store = PrefixStore::read_only(dir.path());
        let list = sample("US", 1);
        store.save(&list).unwrap();
        assert!(!store.path_for(&list.country_code).exists());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = PrefixStore::new(dir.path());
        let list = sample("JP", 1);
        store.save(&list).unwrap();
        store.remove(&list.country_code).unwrap();
        store.remove(&list.country_code).unwrap();
        assert!(store.load(&list.country_code).is_none());
    }
}
