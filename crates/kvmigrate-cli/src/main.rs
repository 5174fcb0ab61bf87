//! kvmigrate - apply, revert, and inspect metadata store migrations.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kvmigrate_cli::{run, Args};

fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kvmigrate_cli=info,kvmigrate_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = args.into_config();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_path = %config.storage.path.display(),
        command = ?config.command,
        "starting kvmigrate"
    );

    let mut stdout = std::io::stdout().lock();
    if let Err(e) = run(config, &mut stdout) {
        tracing::error!(error = %e, "kvmigrate failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
