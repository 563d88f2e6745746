//! Durable system log for pipeline-level and fatal events.
//!
//! When recovery fails the host may become unreachable, so anything at
//! [`Severity::PermanentPipeline`] or above is written to syslog in addition
//! to the tracing output.

use std::sync::Mutex;
use syslog::{Facility, Formatter3164, Logger, LoggerBackend};
use tracing::warn;

use crate::error::Severity;

/// Sink for events that must survive the process.
pub trait Journal: Send + Sync {
    fn record(&self, severity: Severity, message: &str);
}

/// Journal backed by the local syslog daemon.
pub struct SyslogJournal {
    logger: Mutex<Logger<LoggerBackend, Formatter3164>>,
}

impl SyslogJournal {
    /// Connect to the local syslog socket.
    pub fn connect() -> anyhow::Result<Self> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_DAEMON,
            hostname: None,
            process: "geoallow".to_string(),
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow::anyhow!("Failed to connect to syslog: {}", e))?;
        Ok(Self {
            logger: Mutex::new(logger),
        })
    }
}

impl Journal for SyslogJournal {
    fn record(&self, severity: Severity, message: &str) {
        let Ok(mut logger) = self.logger.lock() else {
            warn!("Syslog journal lock poisoned, dropping: {}", message);
            return;
        };
        let result = match severity {
            Severity::Fatal => logger.crit(message),
            Severity::PermanentPipeline => logger.err(message),
            Severity::PermanentItem => logger.warning(message),
            Severity::Transient => logger.notice(message),
        };
        if let Err(e) = result {
            warn!("Failed to write syslog entry: {}", e);
        }
    }
}

/// Journal that discards everything (dry runs, syslog disabled).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJournal;

impl Journal for NullJournal {
    fn record(&self, _severity: Severity, _message: &str) {}
}

/// Journal that keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Mutex<Vec<(Severity, String)>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(Severity, String)> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn count_at_least(&self, severity: Severity) -> usize {
        self.entries().iter().filter(|(s, _)| *s >= severity).count()
    }
}

impl Journal for MemoryJournal {
    fn record(&self, severity: Severity, message: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((severity, message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_journal_records() {
        let journal = MemoryJournal::new();
        journal.record(Severity::PermanentPipeline, "apply aborted");
        journal.record(Severity::Fatal, "restore failed");
        journal.record(Severity::Transient, "fetch timeout");

        assert_eq!(journal.entries().len(), 3);
        assert_eq!(journal.count_at_least(Severity::PermanentPipeline), 2);
        assert_eq!(journal.count_at_least(Severity::Fatal), 1);
    }

    #[test]
    fn test_null_journal_is_silent() {
        NullJournal.record(Severity::Fatal, "ignored");
    }
}
