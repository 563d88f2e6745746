//! Minimal teardown, the floor state after a failed restore.
//!
//! Puts INPUT/FORWARD back to the pre-management baseline and removes the
//! scheduled triggers. Installed artifacts, lists and the snapshot stay in
//! place for the operator to diagnose.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::firewall::{Chain, PacketFilter, Policy};
use crate::scheduler::Scheduler;

/// Chain policies recorded before the suite first touched the firewall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub input: Policy,
    pub forward: Policy,
}

impl Default for Baseline {
    fn default() -> Self {
        Self {
            input: Policy::Accept,
            forward: Policy::Accept,
        }
    }
}

impl Baseline {
    /// Read the current policies from the firewall.
    pub fn capture<F: PacketFilter + ?Sized>(filter: &F) -> Result<Self, crate::error::FirewallError> {
        Ok(Self {
            input: filter.policy(Chain::Input)?,
            forward: filter.policy(Chain::Forward)?,
        })
    }
}

/// What the teardown managed to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub policies_reset: bool,
    pub triggers_removed: Option<usize>,
}

impl TeardownReport {
    pub fn complete(&self) -> bool {
        self.policies_reset && self.triggers_removed.is_some()
    }
}

/// Best-effort: every step is attempted even if an earlier one fails.
pub fn minimal_teardown<F: PacketFilter + ?Sized>(
    filter: &F,
    scheduler: &dyn Scheduler,
    baseline: Baseline,
) -> TeardownReport {
    warn!(
        "Minimal teardown: resetting policies to baseline INPUT={} FORWARD={}",
        baseline.input, baseline.forward
    );

    let mut policies_reset = true;
    for (chain, policy) in [(Chain::Input, baseline.input), (Chain::Forward, baseline.forward)] {
        if let Err(e) = filter.set_policy(chain, policy) {
            error!("Failed to reset {} policy to {}: {}", chain, policy, e);
            policies_reset = false;
        }
    }

    let triggers_removed = match scheduler.remove_triggers() {
        Ok(n) => Some(n),
        Err(e) => {
            error!("Failed to remove scheduled triggers: {:#}", e);
            None
        }
    };

    let report = TeardownReport {
        policies_reset,
        triggers_removed,
    };
    if report.complete() {
        info!("Minimal teardown complete");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{Fault, MemoryFirewall, Op};
    use crate::scheduler::NoopScheduler;

    struct BrokenScheduler;

    impl Scheduler for BrokenScheduler {
        fn remove_triggers(&self) -> anyhow::Result<usize> {
            anyhow::bail!("crontab missing")
        }
    }

    #[test]
    fn test_teardown_restores_baseline() {
        let fw = MemoryFirewall::new();
        fw.set_policy(Chain::Input, Policy::Drop).unwrap();
        fw.set_policy(Chain::Forward, Policy::Drop).unwrap();

        let baseline = Baseline {
            input: Policy::Accept,
            forward: Policy::Drop,
        };
        let report = minimal_teardown(&fw, &NoopScheduler, baseline);

        assert!(report.complete());
        assert_eq!(fw.policy(Chain::Input).unwrap(), Policy::Accept);
        assert_eq!(fw.policy(Chain::Forward).unwrap(), Policy::Drop);
    }

    #[test]
    fn test_teardown_continues_after_failures() {
        let fw = MemoryFirewall::new();
        fw.set_policy(Chain::Forward, Policy::Drop).unwrap();
        fw.inject(Fault::new(Op::Policy).on("INPUT:ACCEPT"));

        let report = minimal_teardown(&fw, &BrokenScheduler, Baseline::default());

        assert!(!report.policies_reset);
        assert_eq!(report.triggers_removed, None);
        assert_eq!(fw.policy(Chain::Forward).unwrap(), Policy::Accept);
    }

    #[test]
    fn test_capture_reads_live_policies() {
        let fw = MemoryFirewall::new();
        fw.set_policy(Chain::Input, Policy::Drop).unwrap();
        assert_eq!(
            Baseline::capture(&fw).unwrap(),
            Baseline {
                input: Policy::Drop,
                forward: Policy::Accept
            }
        );
    }
}
