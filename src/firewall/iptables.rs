//! iptables + ipset adapter.

use ipnet::Ipv4Net;
use std::fmt::Write as _;
use tracing::debug;

use super::{
    restorable_rule_lines, restorable_set_lines, split_rule_line, AddressSets, Chain,
    PacketFilter, Policy, Rule, SetSpec, TagMatch,
};
use crate::cmd_abstraction::{args_to_strings, run_checked, CommandExecutor, CommandOutput};
use crate::error::FirewallError;

const IPTABLES: &str = "iptables";
const IPTABLES_SAVE: &str = "iptables-save";
const IPTABLES_RESTORE: &str = "iptables-restore";
const IPSET: &str = "ipset";

/// Drives the host's filter table and ipset through an executor.
pub struct IptablesFirewall<E: CommandExecutor> {
    executor: E,
}

impl<E: CommandExecutor> IptablesFirewall<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    fn run(&self, cmd: &str, args: &[&str]) -> Result<CommandOutput, FirewallError> {
        run_checked(&self.executor, cmd, &args_to_strings(args), None)
    }

    fn run_stdin(&self, cmd: &str, args: &[&str], stdin: &str) -> Result<CommandOutput, FirewallError> {
        run_checked(&self.executor, cmd, &args_to_strings(args), Some(stdin))
    }

    /// `iptables -S` across all filter chains, rules only.
    fn rule_lines(&self) -> Result<Vec<String>, FirewallError> {
        let out = self.run(IPTABLES, &["-w", "-S"])?;
        Ok(out
            .stdout
            .lines()
            .filter(|l| l.starts_with("-A "))
            .map(str::to_string)
            .collect())
    }
}

impl<E: CommandExecutor> PacketFilter for IptablesFirewall<E> {
    fn policy(&self, chain: Chain) -> Result<Policy, FirewallError> {
        let out = self.run(IPTABLES, &["-w", "-S", chain.as_str()])?;
        parse_policy(&out.stdout, chain)
    }

    fn set_policy(&self, chain: Chain, policy: Policy) -> Result<(), FirewallError> {
        self.run(IPTABLES, &["-w", "-P", chain.as_str(), policy.as_str()])?;
        debug!("{} policy set to {}", chain, policy);
        Ok(())
    }

    fn append_rule(&self, rule: &Rule) -> Result<(), FirewallError> {
        let mut args = args_to_strings(&["-w", "-A", rule.chain.as_str()]);
        args.extend(rule.spec_args());
        run_checked(&self.executor, IPTABLES, &args, None)?;
        Ok(())
    }

    fn delete_rules(&self, tags: TagMatch<'_>) -> Result<usize, FirewallError> {
        let mut deleted = 0;
        for line in self.rule_lines()? {
            if !tags.matches_line(&line) {
                continue;
            }
            let mut args = split_rule_line(&line);
            args[0] = "-D".to_string();
            args.insert(0, "-w".to_string());
            run_checked(&self.executor, IPTABLES, &args, None)?;
            deleted += 1;
        }
        debug!("Deleted {} tagged rules", deleted);
        Ok(deleted)
    }

    fn count_rules(&self, tags: TagMatch<'_>) -> Result<usize, FirewallError> {
        Ok(self
            .rule_lines()?
            .iter()
            .filter(|l| tags.matches_line(l))
            .count())
    }

    fn dump_rules(&self) -> Result<String, FirewallError> {
        Ok(self.run(IPTABLES_SAVE, &["-t", "filter"])?.stdout)
    }

    fn replay_rules(&self, dump: &str) -> Result<usize, FirewallError> {
        self.run_stdin(IPTABLES_RESTORE, &["-w", "-T", "filter"], dump)?;
        Ok(restorable_rule_lines(dump))
    }
}

impl<E: CommandExecutor> AddressSets for IptablesFirewall<E> {
    fn exists(&self, name: &str) -> Result<bool, FirewallError> {
        let out = self.run(IPSET, &["list", "-n"])?;
        Ok(out.stdout.lines().any(|l| l.trim() == name))
    }

    fn create(&self, spec: &SetSpec) -> Result<(), FirewallError> {
        let hash_size = spec.sizing.hash_size.to_string();
        let max_elements = spec.sizing.max_elements.to_string();
        self.run(
            IPSET,
            &[
                "create",
                &spec.name,
                "hash:net",
                "family",
                spec.family.as_str(),
                "hashsize",
                &hash_size,
                "maxelem",
                &max_elements,
            ],
        )?;
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<(), FirewallError> {
        self.run(IPSET, &["destroy", name])
            .map_err(|e| ipset_error(name, e))?;
        Ok(())
    }

    fn swap(&self, a: &str, b: &str) -> Result<(), FirewallError> {
        self.run(IPSET, &["swap", a, b])
            .map_err(|e| ipset_error(a, e))?;
        Ok(())
    }

    fn bulk_load(&self, name: &str, prefixes: &[Ipv4Net]) -> Result<usize, FirewallError> {
        let mut script = String::with_capacity(prefixes.len() * 32);
        for prefix in prefixes {
            let _ = writeln!(script, "add {} {}", name, prefix);
        }
        self.run_stdin(IPSET, &["restore", "-exist"], &script)
            .map_err(|e| ipset_error(name, e))?;
        debug!("Loaded {} prefixes into {}", prefixes.len(), name);
        Ok(prefixes.len())
    }

    fn dump(&self, names: &[String]) -> Result<String, FirewallError> {
        let mut out = String::new();
        for name in names {
            let saved = self
                .run(IPSET, &["save", name])
                .map_err(|e| ipset_error(name, e))?;
            out.push_str(&saved.stdout);
        }
        Ok(out)
    }

    fn replay(&self, dump: &str) -> Result<usize, FirewallError> {
        self.run_stdin(IPSET, &["restore", "-exist"], dump)?;
        Ok(restorable_set_lines(dump))
    }

    fn list_names(&self, prefix: &str) -> Result<Vec<String>, FirewallError> {
        let out = self.run(IPSET, &["list", "-n"])?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|n| n.starts_with(prefix))
            .map(str::to_string)
            .collect())
    }

    fn count(&self, name: &str) -> Result<usize, FirewallError> {
        let out = self
            .run(IPSET, &["list", name, "-t"])
            .map_err(|e| ipset_error(name, e))?;
        parse_entry_count(&out.stdout)
    }
}

/// Map ipset's stderr onto the set-specific error variants.
fn ipset_error(name: &str, err: FirewallError) -> FirewallError {
    if let FirewallError::Command { stderr, .. } = &err {
        if stderr.contains("in use") {
            return FirewallError::SetInUse(name.to_string());
        }
        if stderr.contains("does not exist") {
            return FirewallError::MissingSet(name.to_string());
        }
    }
    err
}

/// Extract `-P CHAIN POLICY` from `iptables -S CHAIN` output.
fn parse_policy(output: &str, chain: Chain) -> Result<Policy, FirewallError> {
    output
        .lines()
        .find_map(|line| {
            let mut words = line.split_whitespace();
            match (words.next(), words.next(), words.next()) {
                (Some("-P"), Some(c), Some(p)) if c == chain.as_str() => Some(p.parse()),
                _ => None,
            }
        })
        .unwrap_or_else(|| {
            Err(FirewallError::Parse(format!(
                "no policy line for {} in iptables output",
                chain
            )))
        })
}

/// Extract "Number of entries" from `ipset list -t` output.
fn parse_entry_count(output: &str) -> Result<usize, FirewallError> {
    output
        .lines()
        .find_map(|l| l.strip_prefix("Number of entries:"))
        .and_then(|n| n.trim().parse().ok())
        .ok_or_else(|| FirewallError::Parse("missing entry count in ipset output".to_string()))
}
