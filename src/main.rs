//! geoallow - country-based allow-list firewall manager.

use clap::Parser;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

use geoallow::cli::{Cli, Commands};
use geoallow::context::Action;
use geoallow::orchestrator::ExitStatus;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {}", e);
    }

    // Execute command
    let result = match cli.command {
        Commands::Add { countries, dry_run } => {
            geoallow::commands::manage::run(Action::Add, &countries, dry_run, cli.trigger, &cli.config)
                .await
        }
        Commands::Remove { countries } => {
            geoallow::commands::manage::run(Action::Remove, &countries, false, cli.trigger, &cli.config)
                .await
        }
        Commands::Update { dry_run } => {
            geoallow::commands::manage::run(Action::Update, &[], dry_run, cli.trigger, &cli.config)
                .await
        }
        Commands::Status => geoallow::commands::status::run(&cli.config)
            .await
            .map(|_| ExitStatus::Success),
        Commands::Snapshot => geoallow::commands::snapshot::run_snapshot(cli.trigger, &cli.config)
            .await
            .map(|_| ExitStatus::Success),
        Commands::Restore => geoallow::commands::snapshot::run_restore(cli.trigger, &cli.config)
            .await
            .map(|_| ExitStatus::Success),
    };

    let code = match result {
        Ok(status) => status.code(),
        Err(e) => {
            error!("{:#}", e);
            ExitStatus::Failed.code()
        }
    };
    std::process::exit(code);
}
