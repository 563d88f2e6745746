//! Run orchestration: fetch, apply once, snapshot, and recover on failure.
//!
//! The orchestrator owns no persistent state. It sequences the prefix
//! source, rule applier and snapshot store for one run, classifies what went
//! wrong, and reports a single [`ExitStatus`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

use crate::applier::{ApplyAction, ApplyRequest, RuleApplier};
use crate::context::{Action, CallContext};
use crate::error::{ApplyError, FetchError, Severity};
use crate::fetcher::{FetchOutcome, PrefixSource};
use crate::firewall::Firewall;
use crate::interfaces::SubnetProbe;
use crate::journal::{Journal, NullJournal};
use crate::lock::LockGuard;
use crate::prefix_list::PrefixList;
use crate::registry::RunLedger;
use crate::scheduler::{NoopScheduler, Scheduler};
use crate::snapshot::{RestoreReport, SnapshotStore};
use crate::teardown::{minimal_teardown, Baseline};
use crate::validation::CountryCode;

/// Process-level result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    /// Nothing was applied: lock held, no input, or every item failed.
    Failed,
    /// Some countries failed, the rest were applied.
    PartialFailure,
    /// Apply failed and the snapshot was restored.
    Recovered,
    /// Apply and restore both failed; the host is at its baseline policy.
    Unrecovered,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failed => 1,
            ExitStatus::PartialFailure => 2,
            ExitStatus::Recovered => 3,
            ExitStatus::Unrecovered => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitStatus::Success => "success",
            ExitStatus::Failed => "failed",
            ExitStatus::PartialFailure => "partial",
            ExitStatus::Recovered => "recovered",
            ExitStatus::Unrecovered => "unrecovered",
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the caller needs to update the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub status: ExitStatus,
    pub ledger: RunLedger,
    /// Whether the firewall was modified by this run.
    pub applied: bool,
    pub snapshot_taken: bool,
}

impl RunReport {
    fn new(status: ExitStatus, ledger: RunLedger) -> Self {
        Self {
            status,
            ledger,
            applied: false,
            snapshot_taken: false,
        }
    }
}

pub struct Orchestrator {
    source: PrefixSource,
    applier: RuleApplier,
    snapshots: SnapshotStore,
    firewall: Arc<dyn Firewall>,
    scheduler: Arc<dyn Scheduler>,
    journal: Arc<dyn Journal>,
    lock_path: PathBuf,
}

impl Orchestrator {
    pub fn new(
        source: PrefixSource,
        firewall: Arc<dyn Firewall>,
        subnet: Arc<dyn SubnetProbe>,
        snapshot_path: impl Into<PathBuf>,
        lock_path: impl Into<PathBuf>,
        relock: bool,
    ) -> Self {
        Self {
            source,
            applier: RuleApplier::new(firewall.clone(), subnet, relock),
            snapshots: SnapshotStore::new(firewall.clone(), snapshot_path),
            firewall,
            scheduler: Arc::new(NoopScheduler),
            journal: Arc::new(NullJournal),
            lock_path: lock_path.into(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn source(&self) -> &PrefixSource {
        &self.source
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn firewall(&self) -> &dyn Firewall {
        self.firewall.as_ref()
    }

    fn journal(&self, ctx: &CallContext, severity: Severity, message: &str) {
        self.journal
            .record(severity, &format!("{} {}", ctx.label(), message));
    }

    /// Read the live policies under the lock and hand them to `record`.
    ///
    /// Holding the lock keeps another run's fail-open window from being
    /// mistaken for the host's own policy.
    pub fn capture_baseline(
        &self,
        record: impl FnOnce(Baseline) -> anyhow::Result<Baseline>,
    ) -> anyhow::Result<Baseline> {
        let _lock = LockGuard::acquire(&self.lock_path)?;
        let live = Baseline::capture(self.firewall.as_ref())?;
        record(live)
    }

    /// Take the lock or log why not.
    pub fn lock(&self) -> Option<LockGuard> {
        match LockGuard::acquire(&self.lock_path) {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!("{}", e);
                None
            }
        }
    }

    /// Snapshot the live state on demand, under the lock.
    pub fn take_snapshot(&self, ctx: &CallContext) -> anyhow::Result<()> {
        let _lock = LockGuard::acquire(&self.lock_path)?;
        self.snapshots.snapshot(ctx)?;
        Ok(())
    }

    /// Restore the stored snapshot on demand, under the lock.
    pub fn restore(&self, ctx: &CallContext) -> anyhow::Result<RestoreReport> {
        let _lock = LockGuard::acquire(&self.lock_path)?;
        match self.snapshots.restore(ctx) {
            Ok(report) => Ok(report),
            Err(e) => {
                self.journal(
                    ctx,
                    Severity::PermanentPipeline,
                    &format!("manual restore failed: {}", e),
                );
                Err(e.into())
            }
        }
    }

    /// Run one action over `countries`.
    ///
    /// `baseline` is the policy pair a minimal teardown falls back to.
    pub async fn run(
        &self,
        ctx: &CallContext,
        countries: &[CountryCode],
        baseline: Baseline,
    ) -> RunReport {
        self.run_inner(ctx, countries, baseline)
            .instrument(ctx.span("orchestrator"))
            .await
    }

    async fn run_inner(
        &self,
        ctx: &CallContext,
        countries: &[CountryCode],
        baseline: Baseline,
    ) -> RunReport {
        let mut ledger = RunLedger::default();

        let Some(_lock) = self.lock() else {
            return RunReport::new(ExitStatus::Failed, ledger);
        };

        if countries.is_empty() {
            return if ctx.action() == Action::Update {
                info!("No countries under management, nothing to update");
                RunReport::new(ExitStatus::Success, ledger)
            } else {
                error!("No country codes given");
                RunReport::new(ExitStatus::Failed, ledger)
            };
        }

        // lists replaced by this run's fetches, put back if they never land
        let mut replaced: Vec<(CountryCode, Option<PrefixList>)> = Vec::new();

        let (apply_action, requests) = match ctx.action() {
            action if action.fetches() => {
                let results = self.source.fetch_many(ctx, countries).await;

                let mut requests = Vec::new();
                for (country, result) in results {
                    match result {
                        Ok(outcome) => {
                            let list = match outcome {
                                FetchOutcome::Updated { list, previous } => {
                                    replaced.push((country, previous));
                                    list
                                }
                                FetchOutcome::NotModified(list) => list,
                            };
                            requests.push(ApplyRequest::add(list));
                        }
                        Err(e) => self.record_fetch_failure(ctx, &mut ledger, country, e),
                    }
                }

                if requests.is_empty() {
                    error!("Every fetch failed, firewall left untouched");
                    return RunReport::new(ExitStatus::Failed, ledger);
                }
                if ctx.action() == Action::Update && replaced.is_empty() {
                    info!("Registry data unchanged for every country, skipping apply");
                    ledger
                        .succeeded
                        .extend(requests.into_iter().map(|r| r.country));
                    let status = partial_or(ExitStatus::Success, &ledger);
                    return RunReport::new(status, ledger);
                }
                (ApplyAction::Add, requests)
            }
            Action::Remove => {
                let requests: Vec<ApplyRequest> = countries
                    .iter()
                    .cloned()
                    .map(ApplyRequest::remove)
                    .collect();
                (ApplyAction::Remove, requests)
            }
            other => {
                error!("{} is not a pipeline action", other);
                return RunReport::new(ExitStatus::Failed, ledger);
            }
        };

        let requested: Vec<CountryCode> = requests.iter().map(|r| r.country.clone()).collect();
        match self.applier.apply(ctx, apply_action, requests) {
            Ok(report) => {
                let skipped: Vec<&CountryCode> = report.skipped.iter().map(|(c, _)| c).collect();
                self.roll_back_lists(&replaced, |c| skipped.contains(&c));
                for (country, e) in report.skipped {
                    warn!("{} skipped: {}", country, e);
                    ledger.fail(country, e.to_string());
                }
                if report.applied.is_empty() {
                    error!("No country could be staged, firewall left untouched");
                    return RunReport::new(ExitStatus::Failed, ledger);
                }
                if apply_action == ApplyAction::Remove {
                    for country in &report.applied {
                        if let Err(e) = self.source.forget(country) {
                            warn!("Failed to delete stored list for {}: {:#}", country, e);
                        }
                    }
                }
                ledger.succeeded = report.applied;

                let snapshot_taken = match self.snapshots.snapshot(ctx) {
                    Ok(_) => true,
                    Err(e) => {
                        error!("Snapshot failed, recovery point is stale: {}", e);
                        false
                    }
                };
                let status = partial_or(ExitStatus::Success, &ledger);
                info!("Run finished: {}", status);
                RunReport {
                    status,
                    ledger,
                    applied: true,
                    snapshot_taken,
                }
            }
            Err(e) => {
                for country in requested {
                    ledger.fail(country, e.to_string());
                }
                self.roll_back_lists(&replaced, |_| true);
                let status = self.recover(ctx, &e, baseline);
                RunReport {
                    status,
                    ledger,
                    applied: true,
                    snapshot_taken: false,
                }
            }
        }
    }

    /// Put back the stored lists of countries whose new data never reached
    /// the firewall, so the next Update applies it instead of seeing it as
    /// unchanged.
    fn roll_back_lists(
        &self,
        replaced: &[(CountryCode, Option<PrefixList>)],
        unapplied: impl Fn(&CountryCode) -> bool,
    ) {
        for (country, previous) in replaced.iter().filter(|(c, _)| unapplied(c)) {
            match self.source.roll_back(country, previous.as_ref()) {
                Ok(()) => info!("{}: stored list rolled back", country),
                Err(e) => warn!("Failed to roll back stored list for {}: {:#}", country, e),
            }
        }
    }

    fn record_fetch_failure(
        &self,
        ctx: &CallContext,
        ledger: &mut RunLedger,
        country: CountryCode,
        e: FetchError,
    ) {
        match e.severity() {
            Severity::Transient => warn!("Fetch failed: {}", e),
            _ => {
                error!("Integrity guard tripped: {}", e);
                self.journal(ctx, e.severity(), &e.to_string());
            }
        }
        ledger.fail(country, e.to_string());
    }

    /// Restore the snapshot; tear down to the baseline if that fails too.
    fn recover(&self, ctx: &CallContext, cause: &ApplyError, baseline: Baseline) -> ExitStatus {
        error!("Apply failed: {}", cause);
        self.journal(ctx, cause.severity(), &format!("apply failed: {}", cause));

        match self.snapshots.restore(ctx) {
            Ok(report) => {
                warn!(
                    "Recovered from snapshot ({} rule lines, {} set lines); requested change not applied",
                    report.rule_lines, report.set_lines
                );
                self.journal(
                    ctx,
                    Severity::PermanentPipeline,
                    "restored known-good snapshot",
                );
                ExitStatus::Recovered
            }
            Err(e) => {
                error!("Restore failed: {}", e);
                let report =
                    minimal_teardown(self.firewall.as_ref(), self.scheduler.as_ref(), baseline);
                self.journal(
                    ctx,
                    Severity::Fatal,
                    &format!(
                        "restore failed ({}); minimal teardown {}",
                        e,
                        if report.complete() { "complete" } else { "incomplete" }
                    ),
                );
                ExitStatus::Unrecovered
            }
        }
    }
}

fn partial_or(status: ExitStatus, ledger: &RunLedger) -> ExitStatus {
    if ledger.failed.is_empty() {
        status
    } else {
        ExitStatus::PartialFailure
    }
}
