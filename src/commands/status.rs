//! Status command implementation.

use anyhow::Result;
use std::path::Path;

use super::{load_config, Runtime};
use crate::fetcher::format_count;
use crate::firewall::{
    country_tag, permanent_set_name, AddressSets, Chain, Firewall, PacketFilter, TagMatch,
};
use crate::registry::{CountryRegistry, FileStore};

/// Run the status command
pub async fn run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let registry = CountryRegistry::new(FileStore::new(&config.registry_path));
    let runtime = Runtime::live(&config)?;
    let firewall = runtime.orchestrator.firewall();

    println!();
    println!("geoallow {}", env!("CARGO_PKG_VERSION"));
    println!();

    let countries = registry.countries()?;
    if countries.is_empty() {
        println!("Countries:  none managed");
        println!();
        println!("Run 'geoallow add <CC>...' to start.");
    } else {
        println!("Countries:  {}", countries.len());
        for cc in &countries {
            println!("  {}  {}", cc, describe_country(firewall, cc));
        }
    }
    println!();

    let policy = |chain| {
        firewall
            .policy(chain)
            .map(|p| p.to_string())
            .unwrap_or_else(|e| format!("unknown ({})", e))
    };
    println!("Policy:     INPUT {}, FORWARD {}", policy(Chain::Input), policy(Chain::Forward));
    match registry.baseline()? {
        Some(b) => println!("Baseline:   INPUT {}, FORWARD {}", b.input, b.forward),
        None => println!("Baseline:   not recorded"),
    }

    let snapshots = runtime.orchestrator.snapshots();
    match snapshots.age() {
        Some(age) => println!(
            "Snapshot:   {} ({} ago)",
            snapshots.path().display(),
            format_age(age)
        ),
        None => println!("Snapshot:   none"),
    }

    match registry.last_run()? {
        Some((status, failed, at)) => {
            let failed = if failed.is_empty() {
                String::new()
            } else {
                format!(", failed: {}", failed)
            };
            println!("Last run:   {} at {}{}", status, at, failed);
        }
        None => println!("Last run:   never"),
    }
    println!();

    Ok(())
}

fn describe_country(firewall: &dyn Firewall, cc: &crate::validation::CountryCode) -> String {
    let set = permanent_set_name(cc);
    let entries = match firewall.exists(&set) {
        Ok(true) => firewall
            .count(&set)
            .map(|n| format!("{} prefixes", format_count(n)))
            .unwrap_or_else(|_| "set unreadable".to_string()),
        Ok(false) => "set MISSING".to_string(),
        Err(e) => format!("set unknown ({})", e),
    };
    let tag = [country_tag(cc)];
    let rule = match firewall.count_rules(TagMatch::Exact(&tag)) {
        Ok(1) => "rule active".to_string(),
        Ok(0) => "rule MISSING".to_string(),
        Ok(n) => format!("{} rules (expected 1)", n),
        Err(_) => "rule unknown".to_string(),
    };
    format!("{}, {}", entries, rule)
}

fn format_age(age: chrono::Duration) -> String {
    let minutes = age.num_minutes().max(0);
    if minutes < 60 {
        format!("{}m", minutes)
    } else if minutes < 60 * 48 {
        format!("{}h {}m", minutes / 60, minutes % 60)
    } else {
        format!("{}d", minutes / (60 * 24))
    }
}
