//! Manual snapshot and restore commands.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use super::{load_config, Runtime};
use crate::context::{Action, CallContext, Trigger};
use crate::firewall::check_root;

/// Capture the live state as the new known-good snapshot.
pub async fn run_snapshot(trigger: Trigger, config_path: &Path) -> Result<()> {
    check_root()?;
    let config = load_config(config_path)?;
    let runtime = Runtime::live(&config)?;

    let ctx = CallContext::new(Action::Snapshot, trigger);
    runtime.orchestrator.take_snapshot(&ctx)?;
    info!("Snapshot written to {:?}", config.snapshot_path);
    Ok(())
}

/// Replace the suite's rules and sets with the stored snapshot.
pub async fn run_restore(trigger: Trigger, config_path: &Path) -> Result<()> {
    check_root()?;
    let config = load_config(config_path)?;
    let runtime = Runtime::live(&config)?;

    let ctx = CallContext::new(Action::Restore, trigger);
    let report = runtime.orchestrator.restore(&ctx)?;
    info!(
        "Restored {} rule lines and {} set lines from {:?}",
        report.rule_lines, report.set_lines, config.snapshot_path
    );
    Ok(())
}
