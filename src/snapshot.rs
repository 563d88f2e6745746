//! Known-good snapshot: the single recovery point.
//!
//! One JSON file holds the whole filter table dump and the dumps of every
//! live suite set. It is replaced atomically after each fully successful
//! apply and only read back by [`SnapshotStore::restore`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::context::CallContext;
use crate::error::{RestoreError, SnapshotError, SnapshotSection};
use crate::firewall::{
    is_staging_set_name, restorable_rule_lines, restorable_set_lines, AddressSets, Chain,
    Firewall, PacketFilter, Policy, TagMatch, SET_PREFIX, SUITE_TAG,
};

/// Serialized firewall state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownGoodSnapshot {
    pub taken_at: DateTime<Utc>,
    /// `iptables-save` output for the filter table.
    pub rules: String,
    /// `ipset save` output for every live suite set.
    pub sets: String,
}

/// Counts of lines replayed by a restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreReport {
    pub rule_lines: usize,
    pub set_lines: usize,
}

pub struct SnapshotStore {
    firewall: Arc<dyn Firewall>,
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(firewall: Arc<dyn Firewall>, path: impl Into<PathBuf>) -> Self {
        Self {
            firewall,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored snapshot.
    pub fn load(&self) -> Result<KnownGoodSnapshot, RestoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RestoreError::Missing(self.path.clone()));
            }
            Err(e) => {
                return Err(RestoreError::Corrupt {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
        };
        serde_json::from_str(&content).map_err(|e| RestoreError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// Capture the current state and atomically replace the stored snapshot.
    pub fn snapshot(&self, ctx: &CallContext) -> Result<KnownGoodSnapshot, SnapshotError> {
        let _span = ctx.span("snapshot_store").entered();
        let fw = self.firewall.as_ref();

        let rules = fw.dump_rules()?;
        let names: Vec<String> = fw
            .list_names(SET_PREFIX)?
            .into_iter()
            .filter(|n| !is_staging_set_name(n))
            .collect();
        let sets = fw.dump(&names)?;

        let snapshot = KnownGoodSnapshot {
            taken_at: Utc::now(),
            rules,
            sets,
        };
        self.write(&snapshot)?;
        info!(
            "Snapshot saved: {} rule lines, {} sets ({} set lines)",
            restorable_rule_lines(&snapshot.rules),
            names.len(),
            restorable_set_lines(&snapshot.sets)
        );
        Ok(snapshot)
    }

    fn write(&self, snapshot: &KnownGoodSnapshot) -> Result<(), SnapshotError> {
        let io_err = |source| SnapshotError::Io {
            path: self.path.clone(),
            source,
        };
        let dir = self.path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir).map_err(io_err)?;

        let json = serde_json::to_string_pretty(snapshot)?;
        let mut temp = NamedTempFile::new_in(dir).map_err(io_err)?;
        temp.write_all(json.as_bytes()).map_err(io_err)?;
        temp.as_file().sync_all().map_err(io_err)?;
        temp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    /// Replace suite state with the stored snapshot.
    ///
    /// Replays sets before rules: the rule dump references the sets by name
    /// and the kernel refuses a rule whose set does not exist. The snapshot
    /// is trusted as-is, nothing is re-validated.
    pub fn restore(&self, ctx: &CallContext) -> Result<RestoreReport, RestoreError> {
        let _span = ctx.span("snapshot_store").entered();
        let snapshot = self.load()?;

        if restorable_rule_lines(&snapshot.rules) == 0 {
            return Err(RestoreError::EmptySection(SnapshotSection::Rules));
        }
        if restorable_set_lines(&snapshot.sets) == 0 {
            return Err(RestoreError::EmptySection(SnapshotSection::Sets));
        }

        self.clear_suite_state()?;
        let set_lines = self.restore_sets(&snapshot)?;
        let rule_lines = self.restore_rules(&snapshot)?;

        info!(
            "Restored snapshot from {}: {} rule lines, {} set lines",
            snapshot.taken_at, rule_lines, set_lines
        );
        Ok(RestoreReport {
            rule_lines,
            set_lines,
        })
    }

    /// Open INPUT, drop every tagged rule, destroy every suite set.
    fn clear_suite_state(&self) -> Result<(), RestoreError> {
        let fw = self.firewall.as_ref();
        fw.set_policy(Chain::Input, Policy::Accept)
            .map_err(RestoreError::Prepare)?;
        fw.delete_rules(TagMatch::Prefix(SUITE_TAG))
            .map_err(RestoreError::Prepare)?;
        for name in fw.list_names(SET_PREFIX).map_err(RestoreError::Prepare)? {
            fw.destroy(&name).map_err(RestoreError::Prepare)?;
        }
        Ok(())
    }

    /// Replay the address-set half.
    pub fn restore_sets(&self, snapshot: &KnownGoodSnapshot) -> Result<usize, RestoreError> {
        let lines = self
            .firewall
            .replay(&snapshot.sets)
            .map_err(|source| RestoreError::Replay {
                section: SnapshotSection::Sets,
                source,
            })?;
        if lines == 0 {
            return Err(RestoreError::EmptySection(SnapshotSection::Sets));
        }
        Ok(lines)
    }

    /// Replay the rule half.
    pub fn restore_rules(&self, snapshot: &KnownGoodSnapshot) -> Result<usize, RestoreError> {
        let lines = self
            .firewall
            .replay_rules(&snapshot.rules)
            .map_err(|source| RestoreError::Replay {
                section: SnapshotSection::Rules,
                source,
            })?;
        if lines == 0 {
            warn!("Rule replay applied nothing");
            return Err(RestoreError::EmptySection(SnapshotSection::Rules));
        }
        Ok(lines)
    }

    /// Age of the stored snapshot, if one exists.
    pub fn age(&self) -> Option<chrono::Duration> {
        self.load().ok().map(|s| Utc::now() - s.taken_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Action, Trigger};
    use crate::firewall::{Fault, Match, MemoryFirewall, Op, Rule, SetSpec, GLOBAL_TAG};
    use crate::sizer;
    use tempfile::TempDir;

    fn ctx() -> CallContext {
        CallContext::new(Action::Update, Trigger::Cron)
    }

    fn populated() -> Arc<MemoryFirewall> {
        let fw = Arc::new(MemoryFirewall::new());
        fw.seed_rule("-A INPUT -p tcp -m tcp --dport 22 -j ACCEPT");
        fw.create(&SetSpec::inet("geoallow_US", sizer::size(2))).unwrap();
        fw.bulk_load(
            "geoallow_US",
            &["1.0.0.0/8".parse().unwrap(), "2.0.0.0/8".parse().unwrap()],
        )
        .unwrap();
        fw.append_rule(&Rule::new(Chain::Input, Match::Loopback, GLOBAL_TAG))
            .unwrap();
        fw.append_rule(&Rule::new(
            Chain::Input,
            Match::SourceSet("geoallow_US".into()),
            "geoallow_US",
        ))
        .unwrap();
        fw.set_policy(Chain::Input, Policy::Drop).unwrap();
        fw.set_policy(Chain::Forward, Policy::Drop).unwrap();
        fw
    }

    fn state(fw: &MemoryFirewall) -> (String, String) {
        let names = fw.list_names(SET_PREFIX).unwrap();
        (fw.dump_rules().unwrap(), fw.dump(&names).unwrap())
    }

    #[test]
    fn test_snapshot_then_restore_round_trips_state() {
        let dir = TempDir::new().unwrap();
        let fw = populated();
        let store = SnapshotStore::new(fw.clone(), dir.path().join("snapshot.json"));
        store.snapshot(&ctx()).unwrap();
        let before = state(&fw);

        // wreck the suite state
        fw.delete_rules(TagMatch::Prefix(SUITE_TAG)).unwrap();
        fw.destroy("geoallow_US").unwrap();
        fw.create(&SetSpec::inet("geoallow_FR_new", sizer::size(2))).unwrap();
        fw.set_policy(Chain::Input, Policy::Accept).unwrap();

        let report = store.restore(&ctx()).unwrap();
        assert_eq!(report.set_lines, 3);
        assert_eq!(state(&fw), before);
        assert_eq!(fw.policy(Chain::Input).unwrap(), Policy::Drop);
        assert!(!fw.exists("geoallow_FR_new").unwrap());
    }

    #[test]
    fn test_snapshot_skips_staging_sets() {
        let dir = TempDir::new().unwrap();
        let fw = populated();
        fw.create(&SetSpec::inet("geoallow_US_new", sizer::size(2))).unwrap();
        let store = SnapshotStore::new(fw.clone(), dir.path().join("snapshot.json"));

        let snapshot = store.snapshot(&ctx()).unwrap();
        assert!(!snapshot.sets.contains("geoallow_US_new"));
        assert_eq!(store.load().unwrap(), snapshot);
    }

    #[test]
    fn test_failed_snapshot_keeps_previous_file() {
        let dir = TempDir::new().unwrap();
        let fw = populated();
        let store = SnapshotStore::new(fw.clone(), dir.path().join("snapshot.json"));
        let first = store.snapshot(&ctx()).unwrap();

        fw.inject(Fault::new(Op::DumpSets));
        assert!(store.snapshot(&ctx()).is_err());
        assert_eq!(store.load().unwrap(), first);
    }

    #[test]
    fn test_restore_missing_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(
            Arc::new(MemoryFirewall::new()),
            dir.path().join("snapshot.json"),
        );
        assert!(matches!(store.restore(&ctx()), Err(RestoreError::Missing(_))));
    }

    #[test]
    fn test_restore_corrupt_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.json");
        fs::write(&path, "{\"taken_at\": 3").unwrap();
        let store = SnapshotStore::new(Arc::new(MemoryFirewall::new()), path);
        assert!(matches!(store.restore(&ctx()), Err(RestoreError::Corrupt { .. })));
    }

    #[test]
    fn test_restore_empty_sections_are_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.json");
        let fw = Arc::new(MemoryFirewall::new());
        let store = SnapshotStore::new(fw.clone(), &path);

        let empty_sets = KnownGoodSnapshot {
            taken_at: Utc::now(),
            rules: "*filter\n:INPUT DROP [0:0]\nCOMMIT\n".into(),
            sets: String::new(),
        };
        fs::write(&path, serde_json::to_string(&empty_sets).unwrap()).unwrap();
        assert!(matches!(
            store.restore(&ctx()),
            Err(RestoreError::EmptySection(SnapshotSection::Sets))
        ));

        let empty_rules = KnownGoodSnapshot {
            rules: "# nothing\n".into(),
            sets: "create geoallow_US hash:net family inet hashsize 512 maxelem 2\n".into(),
            ..empty_sets
        };
        fs::write(&path, serde_json::to_string(&empty_rules).unwrap()).unwrap();
        assert!(matches!(
            store.restore(&ctx()),
            Err(RestoreError::EmptySection(SnapshotSection::Rules))
        ));
        // nothing was touched before the check
        assert_eq!(fw.policy(Chain::Input).unwrap(), Policy::Accept);
    }

    #[test]
    fn test_restore_attributes_replay_failure() {
        let dir = TempDir::new().unwrap();
        let fw = populated();
        let store = SnapshotStore::new(fw.clone(), dir.path().join("snapshot.json"));
        store.snapshot(&ctx()).unwrap();

        fw.inject(Fault::new(Op::ReplayRules));
        match store.restore(&ctx()) {
            Err(RestoreError::Replay { section, .. }) => assert_eq!(section, SnapshotSection::Rules),
            other => panic!("unexpected {:?}", other),
        }
    }
}
