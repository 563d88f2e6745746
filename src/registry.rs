//! Persisted registry: managed countries, baseline policy, last run status.
//!
//! The core only needs a flat key-value contract. [`FileStore`] keeps the
//! map as a YAML file; [`MemoryStore`] backs tests and dry runs.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::context::Action;
use crate::firewall::Policy;
use crate::teardown::Baseline;
use crate::validation::CountryCode;

pub const FIELD_COUNTRIES: &str = "countries";
pub const FIELD_BASELINE_INPUT: &str = "baseline_input_policy";
pub const FIELD_BASELINE_FORWARD: &str = "baseline_forward_policy";
pub const FIELD_LAST_STATUS: &str = "last_run_status";
pub const FIELD_LAST_FAILED: &str = "last_failed_countries";
pub const FIELD_LAST_RUN_AT: &str = "last_run_at";

pub trait KeyValueStore {
    fn get(&self, field: &str) -> Result<Option<String>>;
    fn set(&self, field: &str, value: &str) -> Result<()>;
    fn remove(&self, field: &str) -> Result<()>;
}

/// Flat YAML mapping on disk. Every write rewrites the whole file atomically.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read registry {:?}", self.path))
            }
        };
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse registry {:?}", self.path))
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<()> {
        let dir = self.path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create registry directory {:?}", dir))?;

        let yaml = serde_yaml::to_string(map).context("Failed to serialize registry")?;
        let mut temp = NamedTempFile::new_in(dir).context("Failed to create temp file")?;
        temp.write_all(yaml.as_bytes())
            .context("Failed to write registry")?;
        temp.persist(&self.path)
            .with_context(|| format!("Failed to replace registry {:?}", self.path))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, field: &str) -> Result<Option<String>> {
        Ok(self.read_map()?.remove(field))
    }

    fn set(&self, field: &str, value: &str) -> Result<()> {
        let mut map = self.read_map()?;
        map.insert(field.to_string(), value.to_string());
        self.write_map(&map)
    }

    fn remove(&self, field: &str) -> Result<()> {
        let mut map = self.read_map()?;
        if map.remove(field).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, field: &str) -> Result<Option<String>> {
        let map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(field).cloned())
    }

    fn set(&self, field: &str, value: &str) -> Result<()> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(field.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, field: &str) -> Result<()> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(field);
        Ok(())
    }
}

/// Per-run status ledger, filled by the orchestrator and consumed once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunLedger {
    pub succeeded: Vec<CountryCode>,
    pub failed: Vec<(CountryCode, String)>,
}

impl RunLedger {
    pub fn fail(&mut self, country: CountryCode, reason: impl Into<String>) {
        self.failed.push((country, reason.into()));
    }

    pub fn failed_codes(&self) -> Vec<&CountryCode> {
        self.failed.iter().map(|(cc, _)| cc).collect()
    }
}

/// Typed view over a [`KeyValueStore`].
pub struct CountryRegistry<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> CountryRegistry<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Countries under management, sorted. Unparseable entries are skipped.
    pub fn countries(&self) -> Result<Vec<CountryCode>> {
        let raw = self.store.get(FIELD_COUNTRIES)?.unwrap_or_default();
        let mut codes = BTreeSet::new();
        for word in raw.split_whitespace() {
            match word.parse::<CountryCode>() {
                Ok(cc) => {
                    codes.insert(cc);
                }
                Err(e) => warn!("Ignoring registry entry '{}': {}", word, e),
            }
        }
        Ok(codes.into_iter().collect())
    }

    pub fn set_countries<'a>(&self, countries: impl IntoIterator<Item = &'a CountryCode>) -> Result<()> {
        let codes: BTreeSet<&str> = countries.into_iter().map(|cc| cc.as_str()).collect();
        let joined = codes.into_iter().collect::<Vec<_>>().join(" ");
        self.store.set(FIELD_COUNTRIES, &joined)
    }

    /// Recorded pre-management policies, if any.
    pub fn baseline(&self) -> Result<Option<Baseline>> {
        let input = self.store.get(FIELD_BASELINE_INPUT)?;
        let forward = self.store.get(FIELD_BASELINE_FORWARD)?;
        match (input, forward) {
            (Some(i), Some(f)) => Ok(Some(Baseline {
                input: i.parse::<Policy>()?,
                forward: f.parse::<Policy>()?,
            })),
            _ => Ok(None),
        }
    }

    /// Record `baseline` unless one is already stored. Returns the effective one.
    pub fn record_baseline_if_absent(&self, baseline: Baseline) -> Result<Baseline> {
        if let Some(existing) = self.baseline()? {
            return Ok(existing);
        }
        self.store
            .set(FIELD_BASELINE_INPUT, baseline.input.as_str())?;
        self.store
            .set(FIELD_BASELINE_FORWARD, baseline.forward.as_str())?;
        info!(
            "Recorded baseline policies INPUT={} FORWARD={}",
            baseline.input, baseline.forward
        );
        Ok(baseline)
    }

    /// Fold one run's ledger into the persisted state.
    pub fn commit(&self, action: Action, ledger: &RunLedger, status: &str) -> Result<()> {
        let mut countries: BTreeSet<CountryCode> = self.countries()?.into_iter().collect();
        match action {
            Action::Add => countries.extend(ledger.succeeded.iter().cloned()),
            Action::Remove => {
                for cc in &ledger.succeeded {
                    countries.remove(cc);
                }
            }
            Action::Update | Action::Snapshot | Action::Restore => {}
        }
        if matches!(action, Action::Add | Action::Remove) {
            self.set_countries(&countries)?;
        }

        let failed = ledger
            .failed_codes()
            .iter()
            .map(|cc| cc.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        self.store.set(FIELD_LAST_STATUS, status)?;
        self.store.set(FIELD_LAST_FAILED, &failed)?;
        self.store.set(FIELD_LAST_RUN_AT, &Utc::now().to_rfc3339())?;
        debug!("Registry updated: {} countries", countries.len());
        Ok(())
    }

    pub fn last_run(&self) -> Result<Option<(String, String, String)>> {
        let status = self.store.get(FIELD_LAST_STATUS)?;
        let Some(status) = status else {
            return Ok(None);
        };
        let failed = self.store.get(FIELD_LAST_FAILED)?.unwrap_or_default();
        let at = self.store.get(FIELD_LAST_RUN_AT)?.unwrap_or_default();
        Ok(Some((status, failed, at)))
    }
}
