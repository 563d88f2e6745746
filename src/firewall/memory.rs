//! In-memory firewall.
//!
//! Behaves like iptables + ipset for everything the pipeline relies on:
//! sets referenced by a rule cannot be destroyed, rules cannot reference a
//! missing set, sets have a hard element cap. Faults can be injected per
//! operation to exercise the recovery paths. Also backs `--dry-run`.

use ipnet::Ipv4Net;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard};

use super::{
    comment_of, restorable_rule_lines, restorable_set_lines, set_reference, AddressSets, Chain,
    Family, PacketFilter, Policy, Rule, SetSpec, TagMatch,
};
use crate::error::FirewallError;
use crate::sizer::SetSizing;

/// Operations a fault can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Target `"CHAIN:POLICY"`, e.g. `"INPUT:DROP"`.
    Policy,
    /// Target is the rule tag.
    AppendRule,
    DeleteRules,
    /// Target is the set name for the set operations below.
    CreateSet,
    DestroySet,
    /// Target is the first set name.
    SwapSets,
    /// Loads half the prefixes, then fails.
    BulkLoad,
    DumpRules,
    DumpSets,
    ReplayRules,
    ReplaySets,
    ListSets,
}

/// An injected failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    op: Op,
    target: Option<String>,
}

impl Fault {
    /// Fail every call of `op`.
    pub fn new(op: Op) -> Self {
        Self { op, target: None }
    }

    /// Only fail calls whose target equals `target`.
    pub fn on(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    fn hits(&self, op: Op, target: &str) -> bool {
        self.op == op && self.target.as_deref().map_or(true, |t| t == target)
    }
}

#[derive(Debug, Clone)]
struct MemSet {
    family: Family,
    sizing: SetSizing,
    members: BTreeSet<Ipv4Net>,
}

#[derive(Debug)]
struct State {
    input: Policy,
    forward: Policy,
    rules: Vec<String>,
    sets: BTreeMap<String, MemSet>,
    faults: Vec<Fault>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            input: Policy::Accept,
            forward: Policy::Accept,
            rules: Vec::new(),
            sets: BTreeMap::new(),
            faults: Vec::new(),
        }
    }
}

impl State {
    fn check(&self, op: Op, target: &str) -> Result<(), FirewallError> {
        if self.faults.iter().any(|f| f.hits(op, target)) {
            return Err(FirewallError::Command {
                command: format!("{:?} {}", op, target).trim().to_string(),
                code: Some(1),
                stderr: "injected fault".to_string(),
            });
        }
        Ok(())
    }

    fn require_set(&self, name: &str) -> Result<&MemSet, FirewallError> {
        self.sets
            .get(name)
            .ok_or_else(|| FirewallError::MissingSet(name.to_string()))
    }

    fn referenced(&self, name: &str) -> bool {
        self.rules.iter().any(|r| set_reference(r) == Some(name))
    }
}

/// Firewall state held in process memory.
#[derive(Debug, Default)]
pub struct MemoryFirewall {
    state: Mutex<State>,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn inject(&self, fault: Fault) {
        self.state().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    /// Append a raw rule line, e.g. an operator's own SSH rule.
    pub fn seed_rule(&self, line: impl Into<String>) {
        self.state().rules.push(line.into());
    }

    /// Current rules in `iptables -S` form.
    pub fn rules(&self) -> Vec<String> {
        self.state().rules.clone()
    }

    pub fn rules_tagged(&self, tag: &str) -> Vec<String> {
        self.state()
            .rules
            .iter()
            .filter(|r| comment_of(r) == Some(tag))
            .cloned()
            .collect()
    }

    pub fn set_names(&self) -> Vec<String> {
        self.state().sets.keys().cloned().collect()
    }

    pub fn set_members(&self, name: &str) -> Option<Vec<Ipv4Net>> {
        self.state()
            .sets
            .get(name)
            .map(|s| s.members.iter().copied().collect())
    }

    pub fn set_sizing(&self, name: &str) -> Option<SetSizing> {
        self.state().sets.get(name).map(|s| s.sizing)
    }
}

impl PacketFilter for MemoryFirewall {
    fn policy(&self, chain: Chain) -> Result<Policy, FirewallError> {
        let state = self.state();
        Ok(match chain {
            Chain::Input => state.input,
            Chain::Forward => state.forward,
        })
    }

    fn set_policy(&self, chain: Chain, policy: Policy) -> Result<(), FirewallError> {
        let mut state = self.state();
        state.check(Op::Policy, &format!("{}:{}", chain, policy))?;
        match chain {
            Chain::Input => state.input = policy,
            Chain::Forward => state.forward = policy,
        }
        Ok(())
    }

    fn append_rule(&self, rule: &Rule) -> Result<(), FirewallError> {
        let mut state = self.state();
        state.check(Op::AppendRule, &rule.tag)?;
        let line = rule.to_line();
        if let Some(set) = set_reference(&line) {
            state.require_set(set)?;
        }
        state.rules.push(line);
        Ok(())
    }

    fn delete_rules(&self, tags: TagMatch<'_>) -> Result<usize, FirewallError> {
        let mut state = self.state();
        state.check(Op::DeleteRules, "")?;
        let before = state.rules.len();
        state.rules.retain(|r| !tags.matches_line(r));
        Ok(before - state.rules.len())
    }

    fn count_rules(&self, tags: TagMatch<'_>) -> Result<usize, FirewallError> {
        Ok(self
            .state()
            .rules
            .iter()
            .filter(|r| tags.matches_line(r))
            .count())
    }

    fn dump_rules(&self) -> Result<String, FirewallError> {
        let state = self.state();
        state.check(Op::DumpRules, "")?;
        let mut out = String::from("*filter\n");
        let _ = writeln!(out, ":INPUT {} [0:0]", state.input);
        let _ = writeln!(out, ":FORWARD {} [0:0]", state.forward);
        out.push_str(":OUTPUT ACCEPT [0:0]\n");
        for rule in &state.rules {
            out.push_str(rule);
            out.push('\n');
        }
        out.push_str("COMMIT\n");
        Ok(out)
    }

    fn replay_rules(&self, dump: &str) -> Result<usize, FirewallError> {
        let mut state = self.state();
        state.check(Op::ReplayRules, "")?;

        let mut input = state.input;
        let mut forward = state.forward;
        let mut rules = Vec::new();
        for line in dump.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || line.starts_with('*') || line == "COMMIT"
            {
                continue;
            }
            if let Some(header) = line.strip_prefix(':') {
                let mut parts = header.split_whitespace();
                let chain = parts.next().unwrap_or_default();
                let policy: Policy = parts.next().unwrap_or_default().parse()?;
                match chain {
                    "INPUT" => input = policy,
                    "FORWARD" => forward = policy,
                    _ => {}
                }
            } else if line.starts_with("-A ") {
                if let Some(set) = set_reference(line) {
                    state.require_set(set)?;
                }
                rules.push(line.to_string());
            } else {
                return Err(FirewallError::Parse(format!("unexpected rule line '{}'", line)));
            }
        }

        // iptables-restore commits the table atomically
        state.input = input;
        state.forward = forward;
        state.rules = rules;
        Ok(restorable_rule_lines(dump))
    }
}

impl AddressSets for MemoryFirewall {
    fn exists(&self, name: &str) -> Result<bool, FirewallError> {
        Ok(self.state().sets.contains_key(name))
    }

    fn create(&self, spec: &SetSpec) -> Result<(), FirewallError> {
        let mut state = self.state();
        state.check(Op::CreateSet, &spec.name)?;
        if state.sets.contains_key(&spec.name) {
            return Err(FirewallError::Command {
                command: format!("ipset create {}", spec.name),
                code: Some(1),
                stderr: "set with the same name already exists".to_string(),
            });
        }
        state.sets.insert(
            spec.name.clone(),
            MemSet {
                family: spec.family,
                sizing: spec.sizing,
                members: BTreeSet::new(),
            },
        );
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<(), FirewallError> {
        let mut state = self.state();
        state.check(Op::DestroySet, name)?;
        state.require_set(name)?;
        if state.referenced(name) {
            return Err(FirewallError::SetInUse(name.to_string()));
        }
        state.sets.remove(name);
        Ok(())
    }

    fn swap(&self, a: &str, b: &str) -> Result<(), FirewallError> {
        let mut state = self.state();
        state.check(Op::SwapSets, a)?;
        state.require_set(a)?;
        state.require_set(b)?;
        if a == b {
            return Ok(());
        }
        if let (Some(first), Some(second)) = (state.sets.remove(a), state.sets.remove(b)) {
            state.sets.insert(a.to_string(), second);
            state.sets.insert(b.to_string(), first);
        }
        Ok(())
    }

    fn bulk_load(&self, name: &str, prefixes: &[Ipv4Net]) -> Result<usize, FirewallError> {
        let mut state = self.state();
        let failing = state.check(Op::BulkLoad, name);
        let set = state
            .sets
            .get_mut(name)
            .ok_or_else(|| FirewallError::MissingSet(name.to_string()))?;

        let take = if failing.is_err() {
            prefixes.len() / 2
        } else {
            prefixes.len()
        };
        for prefix in &prefixes[..take] {
            if set.members.len() as u64 >= u64::from(set.sizing.max_elements)
                && !set.members.contains(prefix)
            {
                return Err(FirewallError::Command {
                    command: format!("ipset restore {}", name),
                    code: Some(1),
                    stderr: "Hash is full, cannot add more elements".to_string(),
                });
            }
            set.members.insert(*prefix);
        }
        failing?;
        Ok(take)
    }

    fn dump(&self, names: &[String]) -> Result<String, FirewallError> {
        let state = self.state();
        state.check(Op::DumpSets, "")?;
        let mut out = String::new();
        for name in names {
            let set = state.require_set(name)?;
            let spec = SetSpec {
                name: name.clone(),
                family: set.family,
                sizing: set.sizing,
            };
            out.push_str(&spec.create_line());
            out.push('\n');
            for member in &set.members {
                let _ = writeln!(out, "add {} {}", name, member);
            }
        }
        Ok(out)
    }

    fn replay(&self, dump: &str) -> Result<usize, FirewallError> {
        let mut state = self.state();
        state.check(Op::ReplaySets, "")?;

        for line in dump.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let words: Vec<&str> = line.split_whitespace().collect();
            match words.as_slice() {
                ["create", name, "hash:net", rest @ ..] => {
                    let sizing = parse_create_options(rest)?;
                    state.sets.entry(name.to_string()).or_insert(MemSet {
                        family: Family::Inet,
                        sizing,
                        members: BTreeSet::new(),
                    });
                }
                ["add", name, member, ..] => {
                    let net: Ipv4Net = member
                        .parse()
                        .or_else(|_| member.parse::<std::net::Ipv4Addr>().map(Ipv4Net::from))
                        .map_err(|_| FirewallError::Parse(format!("bad member '{}'", member)))?;
                    let set = state
                        .sets
                        .get_mut(*name)
                        .ok_or_else(|| FirewallError::MissingSet(name.to_string()))?;
                    set.members.insert(net);
                }
                _ => {
                    return Err(FirewallError::Parse(format!("unexpected set line '{}'", line)));
                }
            }
        }
        Ok(restorable_set_lines(dump))
    }

    fn list_names(&self, prefix: &str) -> Result<Vec<String>, FirewallError> {
        let state = self.state();
        state.check(Op::ListSets, prefix)?;
        Ok(state
            .sets
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn count(&self, name: &str) -> Result<usize, FirewallError> {
        Ok(self.state().require_set(name)?.members.len())
    }
}

fn parse_create_options(options: &[&str]) -> Result<SetSizing, FirewallError> {
    let mut sizing = SetSizing {
        hash_size: 1024,
        max_elements: 65536,
    };
    for pair in options.chunks(2) {
        if let [key, value] = pair {
            let parsed = || {
                value
                    .parse::<u32>()
                    .map_err(|_| FirewallError::Parse(format!("bad {} '{}'", key, value)))
            };
            match *key {
                "hashsize" => sizing.hash_size = parsed()?,
                "maxelem" => sizing.max_elements = parsed()?,
                _ => {}
            }
        }
    }
    Ok(sizing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{Match, GLOBAL_TAG, SET_PREFIX};
    use crate::sizer;

    fn nets(list: &[&str]) -> Vec<Ipv4Net> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn set_rule(set: &str) -> Rule {
        Rule::new(Chain::Input, Match::SourceSet(set.into()), set)
    }

    #[test]
    fn test_defaults_open() {
        let fw = MemoryFirewall::new();
        assert_eq!(fw.policy(Chain::Input).unwrap(), Policy::Accept);
        assert_eq!(fw.policy(Chain::Forward).unwrap(), Policy::Accept);
        assert!(fw.rules().is_empty());
    }

    #[test]
    fn test_rule_requires_existing_set() {
        let fw = MemoryFirewall::new();
        let err = fw.append_rule(&set_rule("geoallow_US")).unwrap_err();
        assert_eq!(err, FirewallError::MissingSet("geoallow_US".into()));
    }

    #[test]
    fn test_destroy_referenced_set_fails() {
        let fw = MemoryFirewall::new();
        fw.create(&SetSpec::inet("geoallow_US", sizer::size(10))).unwrap();
        fw.append_rule(&set_rule("geoallow_US")).unwrap();

        assert_eq!(
            fw.destroy("geoallow_US").unwrap_err(),
            FirewallError::SetInUse("geoallow_US".into())
        );

        let tags = vec!["geoallow_US".to_string()];
        assert_eq!(fw.delete_rules(TagMatch::Exact(&tags)).unwrap(), 1);
        fw.destroy("geoallow_US").unwrap();
        assert!(!fw.exists("geoallow_US").unwrap());
    }

    #[test]
    fn test_swap_exchanges_contents() {
        let fw = MemoryFirewall::new();
        fw.create(&SetSpec::inet("a", sizer::size(4))).unwrap();
        fw.create(&SetSpec::inet("b", sizer::size(4))).unwrap();
        fw.bulk_load("a", &nets(&["1.0.0.0/8"])).unwrap();
        fw.bulk_load("b", &nets(&["2.0.0.0/8", "3.0.0.0/8"])).unwrap();

        fw.swap("a", "b").unwrap();
        assert_eq!(fw.count("a").unwrap(), 2);
        assert_eq!(fw.set_members("b").unwrap(), nets(&["1.0.0.0/8"]));
    }

    #[test]
    fn test_bulk_load_respects_max_elements() {
        let fw = MemoryFirewall::new();
        fw.create(&SetSpec::inet("small", sizer::size(2))).unwrap();
        let err = fw
            .bulk_load("small", &nets(&["1.0.0.0/8", "2.0.0.0/8", "3.0.0.0/8"]))
            .unwrap_err();
        assert!(matches!(err, FirewallError::Command { .. }));
    }

    #[test]
    fn test_bulk_load_fault_loads_partially() {
        let fw = MemoryFirewall::new();
        fw.create(&SetSpec::inet("s", sizer::size(4))).unwrap();
        fw.inject(Fault::new(Op::BulkLoad).on("s"));
        let prefixes = nets(&["1.0.0.0/8", "2.0.0.0/8", "3.0.0.0/8", "4.0.0.0/8"]);
        assert!(fw.bulk_load("s", &prefixes).is_err());
        assert_eq!(fw.count("s").unwrap(), 2);
    }

    #[test]
    fn test_fault_targeting() {
        let fw = MemoryFirewall::new();
        fw.inject(Fault::new(Op::Policy).on("INPUT:DROP"));
        fw.set_policy(Chain::Input, Policy::Accept).unwrap();
        fw.set_policy(Chain::Forward, Policy::Drop).unwrap();
        assert!(fw.set_policy(Chain::Input, Policy::Drop).is_err());

        fw.clear_faults();
        fw.set_policy(Chain::Input, Policy::Drop).unwrap();
    }

    #[test]
    fn test_rule_dump_replay_reproduces_state() {
        let fw = MemoryFirewall::new();
        fw.seed_rule("-A INPUT -p tcp -m tcp --dport 22 -j ACCEPT");
        fw.append_rule(&Rule::new(Chain::Input, Match::Loopback, GLOBAL_TAG))
            .unwrap();
        fw.set_policy(Chain::Input, Policy::Drop).unwrap();
        let dump = fw.dump_rules().unwrap();

        fw.delete_rules(TagMatch::Prefix("geoallow")).unwrap();
        fw.set_policy(Chain::Input, Policy::Accept).unwrap();
        fw.seed_rule("-A INPUT -s 6.6.6.6/32 -j ACCEPT");

        assert_eq!(fw.replay_rules(&dump).unwrap(), 5);
        assert_eq!(fw.dump_rules().unwrap(), dump);
    }

    #[test]
    fn test_replay_rules_rejects_missing_set_atomically() {
        let fw = MemoryFirewall::new();
        fw.seed_rule("-A INPUT -i lo -j ACCEPT");
        let dump = "*filter\n:INPUT DROP [0:0]\n-A INPUT -m set --match-set geoallow_XX src -j ACCEPT\nCOMMIT\n";
        assert!(fw.replay_rules(dump).is_err());
        assert_eq!(fw.rules(), vec!["-A INPUT -i lo -j ACCEPT".to_string()]);
        assert_eq!(fw.policy(Chain::Input).unwrap(), Policy::Accept);
    }

    #[test]
    fn test_set_dump_replay() {
        let fw = MemoryFirewall::new();
        fw.create(&SetSpec::inet("geoallow_US", sizer::size(3))).unwrap();
        fw.bulk_load("geoallow_US", &nets(&["1.0.0.0/8", "2.0.0.0/8"]))
            .unwrap();
        let names = fw.list_names(SET_PREFIX).unwrap();
        let dump = fw.dump(&names).unwrap();
        assert_eq!(restorable_set_lines(&dump), 3);

        fw.destroy("geoallow_US").unwrap();
        assert_eq!(fw.replay(&dump).unwrap(), 3);
        assert_eq!(fw.count("geoallow_US").unwrap(), 2);
        assert_eq!(fw.set_sizing("geoallow_US"), Some(sizer::size(3)));
    }
}
