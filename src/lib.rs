//! # geoallow - Country-based allow-list firewall manager
//!
//! Fetches per-country IPv4 prefix lists from RIPEstat, loads them into
//! `ipset` sets and allows them with tagged `iptables` rules, keeping a
//! known-good snapshot to fall back on when an update goes wrong.
//!
//! ## Pipeline
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Orchestrator (lock, classify, recover)                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  PrefixSource (reqwest + rustls)                            │
//! │    └── fetch → validate → freshness / regression guards     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RuleApplier                                                │
//! │    ├── stage sized set (sizer)                              │
//! │    ├── PolicyWindow: INPUT ACCEPT ... re-lock DROP          │
//! │    └── teardown → global rules → swap → destroy staging     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SnapshotStore                                              │
//! │    └── snapshot after success, restore on fatal failure     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Firewall (PacketFilter + AddressSets)                      │
//! │    ├── IptablesFirewall (iptables / ipset)                  │
//! │    └── MemoryFirewall (tests, --dry-run)                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! If the restore fails too, a minimal teardown puts INPUT/FORWARD back to
//! the recorded pre-management baseline and removes the cron triggers.
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use geoallow::cmd_abstraction::SystemExecutor;
//! use geoallow::context::{Action, CallContext, Trigger};
//! use geoallow::fetcher::{FetchSettings, PrefixSource};
//! use geoallow::firewall::IptablesFirewall;
//! use geoallow::interfaces::RouteProbe;
//! use geoallow::orchestrator::Orchestrator;
//! use geoallow::prefix_list::PrefixStore;
//! use geoallow::teardown::Baseline;
//! use geoallow::validation::CountryCode;
//! use geoallow::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("/etc/geoallow/config.yaml")?;
//!     let source = PrefixSource::new(
//!         PrefixStore::new(&config.lists_dir),
//!         FetchSettings::from_config(&config),
//!     )?;
//!     let orchestrator = Orchestrator::new(
//!         source,
//!         Arc::new(IptablesFirewall::new(SystemExecutor)),
//!         Arc::new(RouteProbe::new(SystemExecutor)),
//!         &config.snapshot_path,
//!         &config.lock_path,
//!         config.relock,
//!     );
//!
//!     let ctx = CallContext::new(Action::Add, Trigger::Manual);
//!     let countries: Vec<CountryCode> = vec!["US".parse().map_err(anyhow::Error::msg)?];
//!     let report = orchestrator.run(&ctx, &countries, Baseline::default()).await;
//!     std::process::exit(report.status.code());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`applier`] - Staging, fail-open window, atomic swap
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - External process seam
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`context`] - Per-run call context and tracing spans
//! - [`error`] - Error types and severities
//! - [`fetcher`] - Registry client and prefix list guards
//! - [`firewall`] - Packet filter and address set abstraction
//! - [`interfaces`] - Local subnet detection
//! - [`journal`] - Durable syslog journal
//! - [`lock`] - File locking for concurrent execution prevention
//! - [`orchestrator`] - Run sequencing and recovery
//! - [`prefix_list`] - On-disk prefix lists
//! - [`registry`] - Persisted country registry
//! - [`scheduler`] - Scheduled trigger removal
//! - [`sizer`] - Address set sizing
//! - [`snapshot`] - Known-good snapshot
//! - [`teardown`] - Minimal teardown to baseline
//! - [`validation`] - Country code and CIDR validation

pub mod applier;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod fetcher;
pub mod firewall;
pub mod interfaces;
pub mod journal;
pub mod lock;
pub mod orchestrator;
pub mod prefix_list;
pub mod registry;
pub mod scheduler;
pub mod sizer;
pub mod snapshot;
pub mod teardown;
pub mod validation;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use orchestrator::{ExitStatus, Orchestrator};
