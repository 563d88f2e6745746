//! Local subnet detection.
//!
//! The apply step always allows the host's own LAN so an operator on the
//! local network keeps access whatever the country lists say.

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

use crate::cmd_abstraction::{args_to_strings, CommandExecutor};

const PROC_NET_ROUTE: &str = "/proc/net/route";

/// Source of the local subnet to allow.
pub trait SubnetProbe: Send + Sync {
    fn local_subnet(&self) -> Result<Ipv4Net>;
}

/// Operator-supplied subnet (config `local_subnet`).
#[derive(Debug, Clone, Copy)]
pub struct FixedSubnet(pub Ipv4Net);

impl SubnetProbe for FixedSubnet {
    fn local_subnet(&self) -> Result<Ipv4Net> {
        Ok(self.0)
    }
}

/// Detects the subnet of the default-route interface.
pub struct RouteProbe<E: CommandExecutor> {
    executor: E,
    route_table: PathBuf,
}

impl<E: CommandExecutor> RouteProbe<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            route_table: PathBuf::from(PROC_NET_ROUTE),
        }
    }

    /// Read the routing table from another file instead of `/proc/net/route`.
    pub fn with_route_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.route_table = path.into();
        self
    }

    fn default_interface(&self) -> Result<String> {
        if let Ok(content) = fs::read_to_string(&self.route_table) {
            if let Some(iface) = parse_proc_route(&content) {
                return Ok(iface);
            }
        }

        // Fallback: `ip route`
        let out = self
            .executor
            .execute("ip", &args_to_strings(&["-4", "route", "show", "default"]))
            .context("Failed to query default route")?;
        if !out.success {
            anyhow::bail!("ip route failed: {}", out.stderr.trim());
        }
        parse_ip_route(&out.stdout).context("No IPv4 default route")
    }
}

impl<E: CommandExecutor> SubnetProbe for RouteProbe<E> {
    fn local_subnet(&self) -> Result<Ipv4Net> {
        let iface = self.default_interface()?;
        let out = self
            .executor
            .execute("ip", &args_to_strings(&["-4", "-o", "addr", "show", "dev", &iface]))
            .with_context(|| format!("Failed to query addresses of {}", iface))?;
        if !out.success {
            anyhow::bail!("ip addr failed for {}: {}", iface, out.stderr.trim());
        }
        let subnet = parse_ip_addr(&out.stdout)
            .with_context(|| format!("No IPv4 address on {}", iface))?;
        debug!("Local subnet {} on {}", subnet, iface);
        Ok(subnet)
    }
}

/// Interface of the `00000000` destination in `/proc/net/route`.
pub fn parse_proc_route(content: &str) -> Option<String> {
    content.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [iface, "00000000", ..] => Some(iface.to_string()),
            _ => None,
        }
    })
}

/// Interface after `dev` in `ip route show default` output.
pub fn parse_ip_route(output: &str) -> Option<String> {
    let mut words = output.split_whitespace();
    while let Some(word) = words.next() {
        if word == "dev" {
            return words.next().map(str::to_string);
        }
    }
    None
}

/// First `inet A.B.C.D/N` in `ip -o addr` output, truncated to its network.
pub fn parse_ip_addr(output: &str) -> Option<Ipv4Net> {
    let mut words = output.split_whitespace();
    while let Some(word) = words.next() {
        if word == "inet" {
            return words
                .next()
                .and_then(|a| a.parse::<Ipv4Net>().ok())
                .map(|net| net.trunc());
        }
    }
    None
}
