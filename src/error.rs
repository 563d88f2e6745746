//! Error types for geoallow.
//!
//! Every error maps onto a [`Severity`], which decides whether a run keeps
//! going, aborts and restores, or escalates to a teardown.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::validation::CountryCode;

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// One item failed (network, registry status, malformed data). Siblings proceed.
    Transient,
    /// One item tripped an integrity guard. Siblings proceed.
    PermanentItem,
    /// The apply step aborted with the rule chain possibly half-modified.
    PermanentPipeline,
    /// Recovery failed as well.
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Transient => "transient",
            Severity::PermanentItem => "permanent-item",
            Severity::PermanentPipeline => "permanent-pipeline",
            Severity::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-country fetch failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("{country}: {reason}")]
    Transient { country: CountryCode, reason: String },

    #[error("{country}: {reason}")]
    Permanent { country: CountryCode, reason: String },
}

impl FetchError {
    pub fn transient(country: &CountryCode, reason: impl Into<String>) -> Self {
        FetchError::Transient {
            country: country.clone(),
            reason: reason.into(),
        }
    }

    pub fn permanent(country: &CountryCode, reason: impl Into<String>) -> Self {
        FetchError::Permanent {
            country: country.clone(),
            reason: reason.into(),
        }
    }

    pub fn country(&self) -> &CountryCode {
        match self {
            FetchError::Transient { country, .. } | FetchError::Permanent { country, .. } => {
                country
            }
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            FetchError::Transient { .. } => Severity::Transient,
            FetchError::Permanent { .. } => Severity::PermanentItem,
        }
    }
}

/// Failure of a single packet-filter or address-set operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FirewallError {
    #[error("Failed to execute {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{command} failed (exit {code:?}): {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Unexpected firewall output: {0}")]
    Parse(String),

    #[error("Address set not found: {0}")]
    MissingSet(String),

    #[error("Address set {0} is referenced by a rule")]
    SetInUse(String),
}

/// Steps of an apply invocation that run inside the fail-open window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStep {
    FailOpen,
    Teardown,
    GlobalRules,
    Commit,
    Relock,
}

impl fmt::Display for ApplyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApplyStep::FailOpen => "fail-open",
            ApplyStep::Teardown => "rule teardown",
            ApplyStep::GlobalRules => "global rules",
            ApplyStep::Commit => "commit",
            ApplyStep::Relock => "re-lock",
        };
        f.write_str(name)
    }
}

/// Failure of an apply invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// Staging failed for one country; no rule was touched for it.
    #[error("staging {country} failed: {source}")]
    Staging {
        country: CountryCode,
        #[source]
        source: FirewallError,
    },

    /// An Add was requested without a validated prefix list.
    #[error("no prefix list available for {0}")]
    NoPrefixList(CountryCode),

    /// A step inside the fail-open window failed.
    #[error("{step} step failed: {source}")]
    Pipeline {
        step: ApplyStep,
        #[source]
        source: FirewallError,
    },

    #[error("local subnet detection failed: {0}")]
    Subnet(String),
}

impl ApplyError {
    pub fn severity(&self) -> Severity {
        match self {
            ApplyError::Staging { .. } | ApplyError::NoPrefixList(_) => Severity::Transient,
            ApplyError::Pipeline { .. } | ApplyError::Subnet(_) => Severity::PermanentPipeline,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() >= Severity::PermanentPipeline
    }
}

/// Failure while writing the known-good snapshot.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Failed to dump firewall state: {0}")]
    Firewall(#[from] FirewallError),

    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write snapshot {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The two halves of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSection {
    Rules,
    Sets,
}

impl fmt::Display for SnapshotSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotSection::Rules => f.write_str("rules"),
            SnapshotSection::Sets => f.write_str("address-sets"),
        }
    }
}

/// Failure while restoring from the known-good snapshot.
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("No snapshot at {0:?}")]
    Missing(PathBuf),

    #[error("Snapshot {path:?} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Snapshot has nothing to restore in its {0} section")]
    EmptySection(SnapshotSection),

    #[error("Failed to prepare firewall for restore: {0}")]
    Prepare(#[source] FirewallError),

    #[error("Replaying {section} failed: {source}")]
    Replay {
        section: SnapshotSection,
        #[source]
        source: FirewallError,
    },
}

/// Failure to take the single-instance lock.
#[derive(Error, Debug)]
pub enum LockError {
    #[error(
        "Another geoallow run holds {0:?}.\n\
         Wait for it to finish, or remove the lock file if no run is active."
    )]
    Held(PathBuf),

    #[error("Failed to open lock file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
