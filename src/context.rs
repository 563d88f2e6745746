//! Per-run call context.
//!
//! The orchestrator builds one [`CallContext`] per invocation and hands it
//! to every component, which logs inside a span derived from it.

use chrono::Utc;
use std::fmt;
use std::str::FromStr;
use tracing::Span;

/// What a run was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Remove,
    Update,
    /// Manual snapshot of the current state.
    Snapshot,
    /// Manual restore of the stored snapshot.
    Restore,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Remove => "remove",
            Action::Update => "update",
            Action::Snapshot => "snapshot",
            Action::Restore => "restore",
        }
    }

    /// Whether this action needs fresh registry data.
    pub fn fetches(&self) -> bool {
        matches!(self, Action::Add | Action::Update)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What invoked the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Trigger {
    #[default]
    Manual,
    Cron,
    Boot,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Cron => "cron",
            Trigger::Boot => "boot",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "manual" => Ok(Trigger::Manual),
            "cron" => Ok(Trigger::Cron),
            "boot" => Ok(Trigger::Boot),
            _ => Err(format!(
                "Invalid trigger '{}'. Valid values: manual, cron, boot",
                s
            )),
        }
    }
}

/// Structured context shared by every component of one run.
#[derive(Debug, Clone)]
pub struct CallContext {
    run_id: String,
    action: Action,
    trigger: Trigger,
}

impl CallContext {
    pub fn new(action: Action, trigger: Trigger) -> Self {
        let run_id = format!(
            "{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S"),
            std::process::id()
        );
        Self {
            run_id,
            action,
            trigger,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    /// Span for one component's work within this run.
    pub fn span(&self, component: &'static str) -> Span {
        tracing::info_span!(
            "geoallow",
            run = %self.run_id,
            action = %self.action,
            trigger = %self.trigger,
            component
        )
    }

    /// Prefix for journal lines, so a syslog reader can correlate entries.
    pub fn label(&self) -> String {
        format!("[{} {} via {}]", self.run_id, self.action, self.trigger)
    }
}
