//! Scheduled trigger removal.
//!
//! Installing the cron/boot entries is left to packaging. The pipeline only
//! needs to remove them during a minimal teardown so a broken setup stops
//! re-running itself.

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cmd_abstraction::{args_to_strings, CommandExecutor};

/// Marker suffix on every crontab line the suite owns.
pub const CRON_MARKER: &str = "# geoallow";

pub trait Scheduler: Send + Sync {
    /// Remove every scheduled trigger. Returns how many were removed.
    fn remove_triggers(&self) -> Result<usize>;
}

/// Root crontab managed through `crontab -l` / `crontab -`.
pub struct CrontabScheduler<E: CommandExecutor> {
    executor: E,
}

impl<E: CommandExecutor> CrontabScheduler<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }
}

impl<E: CommandExecutor> Scheduler for CrontabScheduler<E> {
    fn remove_triggers(&self) -> Result<usize> {
        let current = self
            .executor
            .execute("crontab", &args_to_strings(&["-l"]))
            .context("Failed to read crontab")?;
        if !current.success {
            // "no crontab for root"
            debug!("No crontab installed: {}", current.stderr.trim());
            return Ok(0);
        }

        let (kept, removed) = strip_marked(&current.stdout);
        if removed == 0 {
            return Ok(0);
        }

        let out = self
            .executor
            .execute_with_stdin("crontab", &args_to_strings(&["-"]), &kept)
            .context("Failed to write crontab")?;
        if !out.success {
            anyhow::bail!("crontab - failed: {}", out.stderr.trim());
        }
        info!("Removed {} scheduled triggers", removed);
        Ok(removed)
    }
}

/// Scheduler with nothing installed (dry runs).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScheduler;

impl Scheduler for NoopScheduler {
    fn remove_triggers(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Split a crontab into the lines to keep and the count of marked lines.
fn strip_marked(crontab: &str) -> (String, usize) {
    let mut kept = String::new();
    let mut removed = 0;
    for line in crontab.lines() {
        if line.trim_end().ends_with(CRON_MARKER) {
            removed += 1;
        } else {
            kept.push_str(line);
            kept.push('\n');
        }
    }
    (kept, removed)
}
