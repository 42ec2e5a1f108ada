//! Rivulet CLI
//!
//! Downloads a single torrent to a local directory.

mod commands;

use clap::Parser;
use rivulet_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "rivulet")]
#[command(about = "A BitTorrent client")]
#[command(version)]
struct Cli {
    /// Console log verbosity (RUST_LOG overrides)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info, global = true)]
    log_level: CliLogLevel,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_level.as_tracing_level(), None) {
        eprintln!("Failed to initialize logging: {e}");
    }

    commands::handle_command(cli.command)
        .await
        .map_err(commands::into_report)
}
