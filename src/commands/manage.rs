//! Add, remove and update commands.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{error, info, warn};

use super::{load_config, Runtime};
use crate::context::{Action, CallContext, Trigger};
use crate::fetcher::format_count;
use crate::firewall::{check_root, AddressSets, Firewall, SET_PREFIX};
use crate::orchestrator::{ExitStatus, RunReport};
use crate::registry::{CountryRegistry, FileStore};
use crate::teardown::Baseline;
use crate::validation::parse_country_codes;

/// Run one managed action. `codes` is ignored for Update, which covers
/// every registered country.
pub async fn run(
    action: Action,
    codes: &[String],
    dry_run: bool,
    trigger: Trigger,
    config_path: &Path,
) -> Result<ExitStatus> {
    let explicit = parse_country_codes(codes)?;
    if !dry_run {
        check_root()?;
    }

    let config = load_config(config_path)?;
    let registry = CountryRegistry::new(FileStore::new(&config.registry_path));

    let countries = match action {
        Action::Update => registry.countries()?,
        _ => explicit,
    };

    let runtime = if dry_run {
        info!("Dry run: changes go to an in-memory firewall, nothing is persisted");
        Runtime::dry_run(&config)?
    } else {
        Runtime::live(&config)?
    };
    let orchestrator = &runtime.orchestrator;

    let baseline = if dry_run {
        Baseline::default()
    } else {
        match registry.baseline()? {
            Some(b) => b,
            None => orchestrator
                .capture_baseline(|live| registry.record_baseline_if_absent(live))
                .context("Failed to record pre-management chain policies")?,
        }
    };

    let ctx = CallContext::new(action, trigger);
    info!(
        "{} {} country(ies): {}",
        ctx.label(),
        countries.len(),
        join_codes(countries.iter().map(|c| c.as_str()))
    );

    let report = orchestrator.run(&ctx, &countries, baseline).await;

    // lock held or no input: nothing to record
    let untouched = report.status == ExitStatus::Failed
        && report.ledger.succeeded.is_empty()
        && report.ledger.failed.is_empty();
    if dry_run {
        print_dry_run(orchestrator.firewall(), &report);
    } else if !untouched {
        if let Err(e) = registry.commit(action, &report.ledger, report.status.as_str()) {
            error!("Failed to update registry: {:#}", e);
        }
    }

    summarize(&report);
    Ok(report.status)
}

fn join_codes<'a>(codes: impl Iterator<Item = &'a str>) -> String {
    codes.collect::<Vec<_>>().join(" ")
}

fn summarize(report: &RunReport) {
    for (country, reason) in &report.ledger.failed {
        warn!("  {} failed: {}", country, reason);
    }
    match report.status {
        ExitStatus::Success | ExitStatus::PartialFailure => info!(
            "Done ({}): {} succeeded, {} failed",
            report.status,
            report.ledger.succeeded.len(),
            report.ledger.failed.len()
        ),
        ExitStatus::Failed => error!("Run failed, firewall untouched"),
        ExitStatus::Recovered => {
            error!("Apply failed; previous known-good state was restored")
        }
        ExitStatus::Unrecovered => error!(
            "Apply and restore both failed; policies reset to baseline. Operator attention required."
        ),
    }
}

fn print_dry_run(firewall: &dyn Firewall, report: &RunReport) {
    println!();
    println!("Dry run result: {}", report.status);
    let names = firewall.list_names(SET_PREFIX).unwrap_or_default();
    if names.is_empty() {
        println!("  (no sets would be installed)");
    }
    for name in names {
        let count = firewall.count(&name).unwrap_or(0);
        println!("  {:<20} {} prefixes", name, format_count(count));
    }
    println!();
}
