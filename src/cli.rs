//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;
use crate::context::Trigger;

#[derive(Parser)]
#[command(name = "geoallow")]
#[command(author, version, about = "Country-based allow-list firewall manager")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Quiet mode (for cron)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// What invoked this run (manual, cron, boot)
    #[arg(long, default_value = "manual", global = true)]
    pub trigger: Trigger,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch and allow one or more countries
    Add {
        /// ISO 3166 alpha-2 codes, e.g. US DE
        #[arg(required = true)]
        countries: Vec<String>,

        /// Run the pipeline against an in-memory firewall
        #[arg(long)]
        dry_run: bool,
    },

    /// Stop allowing one or more countries
    Remove {
        #[arg(required = true)]
        countries: Vec<String>,
    },

    /// Refresh every managed country (cron and boot entry point)
    Update {
        /// Run the pipeline against an in-memory firewall
        #[arg(long)]
        dry_run: bool,
    },

    /// Show managed countries, sets, policies and last run
    Status,

    /// Save the current state as the known-good snapshot
    Snapshot,

    /// Restore the known-good snapshot
    Restore,
}
