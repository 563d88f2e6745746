//! CLI command implementations.

pub mod manage;
pub mod snapshot;
pub mod status;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::cmd_abstraction::SystemExecutor;
use crate::config::Config;
use crate::fetcher::{FetchSettings, PrefixSource};
use crate::firewall::{Firewall, IptablesFirewall, MemoryFirewall};
use crate::interfaces::{FixedSubnet, RouteProbe, SubnetProbe};
use crate::journal::{Journal, NullJournal, SyslogJournal};
use crate::orchestrator::Orchestrator;
use crate::prefix_list::PrefixStore;
use crate::scheduler::{CrontabScheduler, NoopScheduler, Scheduler};

/// Load and validate the config at `path`.
pub(crate) fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load_or_default(path)
        .with_context(|| format!("Failed to load config from {:?}", path))?;
    config.validate()?;
    Ok(config)
}

/// The wired-up pipeline for one invocation.
pub(crate) struct Runtime {
    pub orchestrator: Orchestrator,
    /// Scratch space for dry runs, removed on drop.
    _scratch: Option<TempDir>,
}

impl Runtime {
    /// Host firewall, crontab and syslog.
    pub fn live(config: &Config) -> Result<Self> {
        let firewall: Arc<dyn Firewall> = Arc::new(IptablesFirewall::new(SystemExecutor));
        let scheduler: Arc<dyn Scheduler> = Arc::new(CrontabScheduler::new(SystemExecutor));
        let journal: Arc<dyn Journal> = if config.syslog {
            match SyslogJournal::connect() {
                Ok(j) => Arc::new(j),
                Err(e) => {
                    warn!("{:#}; pipeline failures will only reach the console", e);
                    Arc::new(NullJournal)
                }
            }
        } else {
            Arc::new(NullJournal)
        };

        let source = PrefixSource::new(
            PrefixStore::new(&config.lists_dir),
            FetchSettings::from_config(config),
        )?;
        let orchestrator = Orchestrator::new(
            source,
            firewall,
            subnet_probe(config),
            &config.snapshot_path,
            &config.lock_path,
            config.relock,
        )
        .with_scheduler(scheduler)
        .with_journal(journal);

        Ok(Self {
            orchestrator,
            _scratch: None,
        })
    }

    /// In-memory firewall, read-only list store, scratch lock and snapshot.
    pub fn dry_run(config: &Config) -> Result<Self> {
        let scratch = TempDir::new().context("Failed to create dry-run directory")?;
        debug!("Dry-run scratch directory {:?}", scratch.path());

        let source = PrefixSource::new(
            PrefixStore::read_only(&config.lists_dir),
            FetchSettings::from_config(config),
        )?;
        let orchestrator = Orchestrator::new(
            source,
            Arc::new(MemoryFirewall::new()),
            subnet_probe(config),
            scratch.path().join("snapshot.json"),
            scratch.path().join("geoallow.lock"),
            config.relock,
        )
        .with_scheduler(Arc::new(NoopScheduler))
        .with_journal(Arc::new(NullJournal));

        Ok(Self {
            orchestrator,
            _scratch: Some(scratch),
        })
    }
}

fn subnet_probe(config: &Config) -> Arc<dyn SubnetProbe> {
    match config.local_subnet {
        Some(net) => Arc::new(FixedSubnet(net)),
        None => Arc::new(RouteProbe::new(SystemExecutor)),
    }
}
