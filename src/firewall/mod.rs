//! Packet-filter and address-set control plane.
//!
//! Two capabilities are modelled separately: [`PacketFilter`] (chain
//! policies and tagged rules) and [`AddressSets`] (kernel prefix sets with
//! atomic swap). Components depend on `Arc<dyn Firewall>`, implemented by
//! [`IptablesFirewall`] on real hosts and [`MemoryFirewall`] in tests and
//! dry runs.

mod iptables;
mod memory;
mod window;

use anyhow::Result;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use iptables::IptablesFirewall;
pub use memory::{Fault, MemoryFirewall, Op};
pub use window::PolicyWindow;

use crate::error::FirewallError;
use crate::sizer::SetSizing;
use crate::validation::CountryCode;

/// Tag carried by every rule and set this suite owns.
pub const SUITE_TAG: &str = "geoallow";

/// Comment on the loopback / established / local-subnet rules.
pub const GLOBAL_TAG: &str = "geoallow_global";

/// Prefix of every address-set name this suite owns.
pub const SET_PREFIX: &str = "geoallow_";

const STAGING_SUFFIX: &str = "_new";

/// Rule comment for a country's allow rule.
pub fn country_tag(country: &CountryCode) -> String {
    format!("{}{}", SET_PREFIX, country)
}

/// Name of the live set for a country.
pub fn permanent_set_name(country: &CountryCode) -> String {
    format!("{}{}", SET_PREFIX, country)
}

/// Name of the staging set loaded before the swap.
pub fn staging_set_name(country: &CountryCode) -> String {
    format!("{}{}{}", SET_PREFIX, country, STAGING_SUFFIX)
}

pub fn is_staging_set_name(name: &str) -> bool {
    name.starts_with(SET_PREFIX) && name.ends_with(STAGING_SUFFIX)
}

/// Built-in chains whose policy the suite controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Chain {
    Input,
    Forward,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Input => "INPUT",
            Chain::Forward => "FORWARD",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = FirewallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INPUT" => Ok(Chain::Input),
            "FORWARD" => Ok(Chain::Forward),
            other => Err(FirewallError::Parse(format!("unknown chain '{}'", other))),
        }
    }
}

/// Default chain policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Policy {
    Accept,
    Drop,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Accept => "ACCEPT",
            Policy::Drop => "DROP",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = FirewallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACCEPT" => Ok(Policy::Accept),
            "DROP" => Ok(Policy::Drop),
            other => Err(FirewallError::Parse(format!("unknown policy '{}'", other))),
        }
    }
}

/// Address family of a set. Only IPv4 is populated today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Inet,
    Inet6,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Inet => "inet",
            Family::Inet6 => "inet6",
        }
    }
}

/// Parameters for creating an address set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetSpec {
    pub name: String,
    pub family: Family,
    pub sizing: SetSizing,
}

impl SetSpec {
    pub fn inet(name: impl Into<String>, sizing: SetSizing) -> Self {
        Self {
            name: name.into(),
            family: Family::Inet,
            sizing,
        }
    }

    /// Line in `ipset save` / `ipset restore` syntax.
    pub fn create_line(&self) -> String {
        format!(
            "create {} hash:net family {} hashsize {} maxelem {}",
            self.name,
            self.family.as_str(),
            self.sizing.hash_size,
            self.sizing.max_elements
        )
    }
}

/// What an allow rule matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    Loopback,
    Established,
    Source(Ipv4Net),
    SourceSet(String),
}

/// A tagged ACCEPT rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub chain: Chain,
    pub matcher: Match,
    pub tag: String,
}

impl Rule {
    pub fn new(chain: Chain, matcher: Match, tag: impl Into<String>) -> Self {
        Self {
            chain,
            matcher,
            tag: tag.into(),
        }
    }

    /// Match and target arguments, without the `-A CHAIN` prefix.
    pub fn spec_args(&self) -> Vec<String> {
        let mut args: Vec<String> = match &self.matcher {
            Match::Loopback => vec!["-i".into(), "lo".into()],
            Match::Established => vec![
                "-m".into(),
                "conntrack".into(),
                "--ctstate".into(),
                "RELATED,ESTABLISHED".into(),
            ],
            Match::Source(net) => vec!["-s".into(), net.to_string()],
            Match::SourceSet(set) => vec![
                "-m".into(),
                "set".into(),
                "--match-set".into(),
                set.clone(),
                "src".into(),
            ],
        };
        args.extend([
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            self.tag.clone(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ]);
        args
    }

    /// The rule as `iptables -S` prints it.
    pub fn to_line(&self) -> String {
        format!("-A {} {}", self.chain, self.spec_args().join(" "))
    }
}

/// Selects rules by their comment tag.
#[derive(Debug, Clone, Copy)]
pub enum TagMatch<'a> {
    Exact(&'a [String]),
    Prefix(&'a str),
}

impl TagMatch<'_> {
    pub fn matches(&self, tag: &str) -> bool {
        match self {
            TagMatch::Exact(tags) => tags.iter().any(|t| t == tag),
            TagMatch::Prefix(prefix) => tag.starts_with(prefix),
        }
    }

    /// Whether an `-A` rule line carries a selected tag.
    pub fn matches_line(&self, line: &str) -> bool {
        comment_of(line).is_some_and(|tag| self.matches(tag))
    }
}

/// Split an `iptables -S` line into arguments, dropping the quotes that
/// iptables puts around comments.
pub fn split_rule_line(line: &str) -> Vec<String> {
    line.split_whitespace()
        .map(|w| w.trim_matches('"').to_string())
        .collect()
}

/// Comment tag of a rule line, if any.
pub fn comment_of(line: &str) -> Option<&str> {
    let mut words = line.split_whitespace();
    while let Some(word) = words.next() {
        if word == "--comment" {
            return words.next().map(|w| w.trim_matches('"'));
        }
    }
    None
}

/// Set a rule line matches against, if any.
pub fn set_reference(line: &str) -> Option<&str> {
    let mut words = line.split_whitespace();
    while let Some(word) = words.next() {
        if word == "--match-set" {
            return words.next();
        }
    }
    None
}

/// Lines of an `iptables-save` dump that change state on replay.
pub fn restorable_rule_lines(dump: &str) -> usize {
    dump.lines()
        .map(str::trim)
        .filter(|l| l.starts_with(':') || l.starts_with("-A "))
        .count()
}

/// Lines of an `ipset save` dump that change state on replay.
pub fn restorable_set_lines(dump: &str) -> usize {
    dump.lines()
        .map(str::trim)
        .filter(|l| l.starts_with("create ") || l.starts_with("add "))
        .count()
}

/// Default policies and tagged rules.
pub trait PacketFilter: Send + Sync {
    fn policy(&self, chain: Chain) -> Result<Policy, FirewallError>;

    fn set_policy(&self, chain: Chain, policy: Policy) -> Result<(), FirewallError>;

    fn append_rule(&self, rule: &Rule) -> Result<(), FirewallError>;

    /// Delete every rule whose comment is selected. Returns how many went.
    fn delete_rules(&self, tags: TagMatch<'_>) -> Result<usize, FirewallError>;

    fn count_rules(&self, tags: TagMatch<'_>) -> Result<usize, FirewallError>;

    /// Replayable dump of the whole filter table.
    fn dump_rules(&self) -> Result<String, FirewallError>;

    /// Replace the filter table with a dump. Returns lines applied.
    fn replay_rules(&self, dump: &str) -> Result<usize, FirewallError>;
}

/// Kernel prefix sets.
pub trait AddressSets: Send + Sync {
    fn exists(&self, name: &str) -> Result<bool, FirewallError>;

    fn create(&self, spec: &SetSpec) -> Result<(), FirewallError>;

    /// Fails with [`FirewallError::SetInUse`] while a rule references it.
    fn destroy(&self, name: &str) -> Result<(), FirewallError>;

    /// Atomically exchange the contents of two sets.
    fn swap(&self, a: &str, b: &str) -> Result<(), FirewallError>;

    /// Add all prefixes in one batch. Returns the number loaded.
    fn bulk_load(&self, name: &str, prefixes: &[Ipv4Net]) -> Result<usize, FirewallError>;

    /// Replayable dump of the named sets.
    fn dump(&self, names: &[String]) -> Result<String, FirewallError>;

    /// Load a dump. Returns lines applied.
    fn replay(&self, dump: &str) -> Result<usize, FirewallError>;

    fn list_names(&self, prefix: &str) -> Result<Vec<String>, FirewallError>;

    fn count(&self, name: &str) -> Result<usize, FirewallError>;
}

/// Both halves of the control plane.
pub trait Firewall: PacketFilter + AddressSets {}

impl<T: PacketFilter + AddressSets> Firewall for T {}

/// Check if running as root (effective UID == 0).
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() reads the effective user ID. It has no preconditions,
    // never fails, and does not modify any state.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::bail!(
            "This operation requires root privileges. Please run with sudo.\n\
             Alternatively, use --dry-run to preview against an in-memory firewall."
        )
    }
    Ok(())
}
