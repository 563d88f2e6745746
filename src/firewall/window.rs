//! Fail-open window guard.
//!
//! While the rule chain is being rebuilt the inbound policy is ACCEPT, so a
//! half-built chain cannot lock the operator out. The guard restores
//! deny-all on [`PolicyWindow::close`], or on drop if the apply bailed out
//! early with relock enabled.

use tracing::{debug, error, warn};

use super::{Chain, PacketFilter, Policy};
use crate::error::FirewallError;

/// Scope during which INPUT is held open.
///
/// Dropping the guard after a teardown leaves deny-all with no global allow
/// rules; the caller is expected to run recovery immediately.
pub struct PolicyWindow<'a, F: PacketFilter + ?Sized> {
    filter: &'a F,
    relock: bool,
    closed: bool,
}

impl<'a, F: PacketFilter + ?Sized> PolicyWindow<'a, F> {
    /// Set INPUT to ACCEPT and return the guard.
    pub fn open(filter: &'a F, relock: bool) -> Result<Self, FirewallError> {
        filter.set_policy(Chain::Input, Policy::Accept)?;
        debug!("Fail-open window opened (relock={})", relock);
        Ok(Self {
            filter,
            relock,
            closed: false,
        })
    }

    pub fn filter(&self) -> &'a F {
        self.filter
    }

    /// Re-lock INPUT and FORWARD to DROP, unless relock is suppressed.
    pub fn close(mut self) -> Result<(), FirewallError> {
        self.closed = true;
        if !self.relock {
            warn!("Re-lock suppressed: inbound policy left at ACCEPT");
            return Ok(());
        }
        self.filter.set_policy(Chain::Input, Policy::Drop)?;
        self.filter.set_policy(Chain::Forward, Policy::Drop)?;
        debug!("Fail-open window closed");
        Ok(())
    }
}

impl<F: PacketFilter + ?Sized> Drop for PolicyWindow<'_, F> {
    fn drop(&mut self) {
        if self.closed || !self.relock {
            return;
        }
        // Early exit: best effort only, restore will follow.
        for chain in [Chain::Input, Chain::Forward] {
            if let Err(e) = self.filter.set_policy(chain, Policy::Drop) {
                error!("Failed to re-lock {} after aborted apply: {}", chain, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{Fault, MemoryFirewall, Op};

    #[test]
    fn test_open_then_close_relocks() {
        let fw = MemoryFirewall::new();
        fw.set_policy(Chain::Input, Policy::Drop).unwrap();

        let window = PolicyWindow::open(&fw, true).unwrap();
        assert_eq!(fw.policy(Chain::Input).unwrap(), Policy::Accept);
        window.close().unwrap();

        assert_eq!(fw.policy(Chain::Input).unwrap(), Policy::Drop);
        assert_eq!(fw.policy(Chain::Forward).unwrap(), Policy::Drop);
    }

    #[test]
    fn test_close_without_relock_stays_open() {
        let fw = MemoryFirewall::new();
        let window = PolicyWindow::open(&fw, false).unwrap();
        window.close().unwrap();
        assert_eq!(fw.policy(Chain::Input).unwrap(), Policy::Accept);
    }

    #[test]
    fn test_drop_relocks_on_early_exit() {
        let fw = MemoryFirewall::new();
        {
            let _window = PolicyWindow::open(&fw, true).unwrap();
        }
        assert_eq!(fw.policy(Chain::Input).unwrap(), Policy::Drop);
    }

    #[test]
    fn test_open_failure_reports_error() {
        let fw = MemoryFirewall::new();
        fw.inject(Fault::new(Op::Policy).on("INPUT:ACCEPT"));
        assert!(PolicyWindow::open(&fw, true).is_err());
    }
}
