//! Rule applier: stage, open the fail-open window, rebuild the tagged rules,
//! swap staged sets in, re-lock.
//!
//! Staging happens before the window opens and fails per country. Every
//! step inside the window is fatal for the whole invocation, because the
//! chain may be half-rebuilt under an ACCEPT policy; the caller is expected
//! to restore the snapshot.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::CallContext;
use crate::error::{ApplyError, ApplyStep, FirewallError};
use crate::firewall::{
    country_tag, permanent_set_name, staging_set_name, AddressSets, Chain, Firewall, Match,
    PacketFilter, PolicyWindow, Rule, SetSpec, TagMatch, GLOBAL_TAG,
};
use crate::interfaces::SubnetProbe;
use crate::prefix_list::PrefixList;
use crate::sizer::{self, SetSizing};
use crate::validation::CountryCode;

/// Which direction an apply goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    Add,
    Remove,
}

/// One country to apply, with its list for an Add.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub country: CountryCode,
    pub list: Option<PrefixList>,
}

impl ApplyRequest {
    pub fn add(list: PrefixList) -> Self {
        Self {
            country: list.country_code.clone(),
            list: Some(list),
        }
    }

    pub fn remove(country: CountryCode) -> Self {
        Self {
            country,
            list: None,
        }
    }
}

/// Outcome of an apply that did not hit a fatal step.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: Vec<CountryCode>,
    /// Countries whose staging failed; no rule was touched for them.
    pub skipped: Vec<(CountryCode, ApplyError)>,
}

type Window<'a> = PolicyWindow<'a, dyn Firewall>;

fn pipeline(step: ApplyStep) -> impl Fn(FirewallError) -> ApplyError {
    move |source| ApplyError::Pipeline { step, source }
}

pub struct RuleApplier {
    firewall: Arc<dyn Firewall>,
    subnet: Arc<dyn SubnetProbe>,
    relock: bool,
}

impl RuleApplier {
    pub fn new(firewall: Arc<dyn Firewall>, subnet: Arc<dyn SubnetProbe>, relock: bool) -> Self {
        Self {
            firewall,
            subnet,
            relock,
        }
    }

    /// Apply one batched action for all requested countries.
    pub fn apply(
        &self,
        ctx: &CallContext,
        action: ApplyAction,
        requests: Vec<ApplyRequest>,
    ) -> Result<ApplyReport, ApplyError> {
        let _span = ctx.span("rule_applier").entered();
        match action {
            ApplyAction::Add => self.apply_add(requests),
            ApplyAction::Remove => {
                let countries = requests.into_iter().map(|r| r.country).collect();
                self.apply_remove(countries)
            }
        }
    }

    fn apply_add(&self, requests: Vec<ApplyRequest>) -> Result<ApplyReport, ApplyError> {
        let mut report = ApplyReport::default();
        let mut staged: Vec<(CountryCode, SetSizing)> = Vec::new();

        for request in requests {
            let Some(list) = request.list else {
                warn!("{}: no prefix list, skipping", request.country);
                report
                    .skipped
                    .push((request.country.clone(), ApplyError::NoPrefixList(request.country)));
                continue;
            };
            match self.stage(&list) {
                Ok(sizing) => staged.push((request.country, sizing)),
                Err(e) => {
                    warn!("{}", e);
                    report.skipped.push((request.country, e));
                }
            }
        }

        if staged.is_empty() {
            info!("Nothing staged, firewall left untouched");
            return Ok(report);
        }

        let window = PolicyWindow::open(self.firewall.as_ref(), self.relock)
            .map_err(pipeline(ApplyStep::FailOpen))?;

        let mut tags = vec![GLOBAL_TAG.to_string()];
        tags.extend(staged.iter().map(|(cc, _)| country_tag(cc)));
        teardown_rules(&window, &tags)?;
        self.install_global_rules(&window)?;

        for (country, sizing) in &staged {
            commit(&window, country, *sizing)?;
            report.applied.push(country.clone());
        }

        window.close().map_err(pipeline(ApplyStep::Relock))?;
        info!("Applied {} countries", report.applied.len());
        Ok(report)
    }

    fn apply_remove(&self, countries: Vec<CountryCode>) -> Result<ApplyReport, ApplyError> {
        let mut report = ApplyReport::default();
        if countries.is_empty() {
            return Ok(report);
        }

        let window = PolicyWindow::open(self.firewall.as_ref(), self.relock)
            .map_err(pipeline(ApplyStep::FailOpen))?;

        let mut tags = vec![GLOBAL_TAG.to_string()];
        tags.extend(countries.iter().map(country_tag));
        teardown_rules(&window, &tags)?;
        self.install_global_rules(&window)?;

        let fw = window.filter();
        for country in countries {
            for name in [permanent_set_name(&country), staging_set_name(&country)] {
                if fw.exists(&name).map_err(pipeline(ApplyStep::Commit))? {
                    fw.destroy(&name).map_err(pipeline(ApplyStep::Commit))?;
                    debug!("Destroyed {}", name);
                }
            }
            info!("Removed {}", country);
            report.applied.push(country);
        }

        window.close().map_err(pipeline(ApplyStep::Relock))?;
        Ok(report)
    }

    /// Create and fill the staging set. Cleans up after itself on failure.
    fn stage(&self, list: &PrefixList) -> Result<SetSizing, ApplyError> {
        let country = &list.country_code;
        let fw = self.firewall.as_ref();
        let staging = staging_set_name(country);
        let sizing = sizer::size(list.len());
        let staging_err = |source| ApplyError::Staging {
            country: country.clone(),
            source,
        };

        if fw.exists(&staging).map_err(staging_err)? {
            debug!("Destroying leftover {}", staging);
            fw.destroy(&staging).map_err(staging_err)?;
        }

        fw.create(&SetSpec::inet(&staging, sizing))
            .map_err(staging_err)?;

        if let Err(e) = fw.bulk_load(&staging, &list.prefixes) {
            if let Err(cleanup) = fw.destroy(&staging) {
                warn!("Failed to clean up {}: {}", staging, cleanup);
            }
            return Err(staging_err(e));
        }

        info!(
            "Staged {}: {} prefixes (hashsize {}, maxelem {})",
            country,
            list.len(),
            sizing.hash_size,
            sizing.max_elements
        );
        Ok(sizing)
    }

    /// Loopback, established/related, local subnet, in that order.
    fn install_global_rules(&self, window: &Window<'_>) -> Result<(), ApplyError> {
        let fw = window.filter();
        let append = |matcher| {
            fw.append_rule(&Rule::new(Chain::Input, matcher, GLOBAL_TAG))
                .map_err(pipeline(ApplyStep::GlobalRules))
        };

        append(Match::Loopback)?;
        append(Match::Established)?;

        let subnet = self
            .subnet
            .local_subnet()
            .map_err(|e| ApplyError::Subnet(format!("{:#}", e)))?;
        append(Match::Source(subnet))?;
        debug!("Global rules installed (local subnet {})", subnet);
        Ok(())
    }
}

/// Delete every rule carrying one of `tags`.
fn teardown_rules(window: &Window<'_>, tags: &[String]) -> Result<(), ApplyError> {
    let removed = window
        .filter()
        .delete_rules(TagMatch::Exact(tags))
        .map_err(pipeline(ApplyStep::Teardown))?;
    debug!("Removed {} tagged rules", removed);
    Ok(())
}

/// Ensure the live set exists, point a rule at it, swap the staged content in.
fn commit(window: &Window<'_>, country: &CountryCode, sizing: SetSizing) -> Result<(), ApplyError> {
    let fw = window.filter();
    let perm = permanent_set_name(country);
    let staging = staging_set_name(country);
    let step = pipeline(ApplyStep::Commit);

    if !fw.exists(&perm).map_err(&step)? {
        fw.create(&SetSpec::inet(&perm, sizing)).map_err(&step)?;
    }
    fw.append_rule(&Rule::new(
        Chain::Input,
        Match::SourceSet(perm.clone()),
        country_tag(country),
    ))
    .map_err(&step)?;
    fw.swap(&staging, &perm).map_err(&step)?;
    fw.destroy(&staging).map_err(&step)?;

    info!("Committed {}", country);
    Ok(())
}
