//! Kiln - supervised source package builds
//!
//! Runs the fetch, build and merge stages of one package under a single
//! supervisor: build directory locking, the build-script command channel,
//! grace-then-kill exit handling and bounded concurrent fetching.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Re-executed fork helpers run their entry point and exit here.
    if let Some(code) = convenient_task::child_main(&convenient_ebuild::entry_points()) {
        std::process::exit(code);
    }

    // Logs go to stderr; stdout carries process output and IPC replies.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln=info,convenient_task=info,convenient_ebuild=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = commands::Cli::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let code = runtime.block_on(commands::run(cli))?;
    drop(runtime);

    std::process::exit(code);
}
