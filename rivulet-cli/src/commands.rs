//! CLI command implementations

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Subcommand;
use rivulet_core::config::RivuletConfig;
use rivulet_core::torrent::{BencodeTorrentParser, TorrentError, TorrentParser, TorrentSession};
use rivulet_core::{RivuletError, StorageError};
use tokio::sync::watch;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Download a torrent described by a .torrent file
    Download {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Directory receiving the downloaded files
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// Directory for resume logs (defaults to the output directory)
        #[arg(long)]
        resume_dir: Option<PathBuf>,
        /// TCP port for incoming peer connections
        #[arg(short, long)]
        port: Option<u16>,
        /// Extra peer to connect to (repeatable)
        #[arg(long = "peer")]
        peers: Vec<SocketAddr>,
        /// Keep uploading after the download completes
        #[arg(long)]
        seed: bool,
    },
    /// Print what a .torrent file describes
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the underlying error with context for the command that failed
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Download {
            torrent,
            output,
            resume_dir,
            port,
            peers,
            seed,
        } => {
            if output.is_file() {
                return Err(RivuletError::Configuration {
                    reason: format!("output path {} is a file", output.display()),
                }
                .into());
            }

            let mut config = RivuletConfig::from_env();
            config.storage.output_dir = output;
            config.storage.resume_dir = resume_dir;
            config.torrent.seed_after_complete = seed;
            if let Some(port) = port {
                config.network.listen_port = port;
            }
            download(torrent, config, peers).await
        }
        Commands::Info { torrent } => show_info(torrent).await,
    }
}

/// Download a torrent until it completes or Ctrl-C is pressed.
///
/// # Errors
/// - Descriptor cannot be read or parsed
/// - Output files or the resume log cannot be created
/// - The listening port cannot be bound
pub async fn download(
    torrent: PathBuf,
    config: RivuletConfig,
    peers: Vec<SocketAddr>,
) -> anyhow::Result<()> {
    let metadata = BencodeTorrentParser::new()
        .parse_torrent_file(&torrent)
        .await
        .with_context(|| format!("failed to load {}", torrent.display()))?;

    println!("Downloading {} ({})", metadata.name, metadata.info_hash);
    println!(
        "  {} pieces, {:.2} MB",
        metadata.num_pieces(),
        metadata.total_length as f64 / 1_048_576.0
    );

    let session = TorrentSession::new(metadata, config)
        .context("failed to prepare download")?
        .with_peers(peers);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let summary = session.run(shutdown_rx).await.context("download failed")?;

    println!(
        "{}/{} pieces verified, {:.2} MB downloaded, {:.2} MB uploaded",
        summary.completed_pieces,
        summary.total_pieces,
        summary.downloaded as f64 / 1_048_576.0,
        summary.uploaded as f64 / 1_048_576.0
    );
    if summary.writer.failed > 0 {
        anyhow::bail!("{} pieces could not be written to disk", summary.writer.failed);
    }
    if summary.is_complete() {
        println!("Download complete");
    } else {
        println!("Download incomplete; run again to resume");
    }

    Ok(())
}

/// Print descriptor contents.
///
/// # Errors
/// - Descriptor cannot be read or parsed
pub async fn show_info(torrent: PathBuf) -> anyhow::Result<()> {
    let metadata = BencodeTorrentParser::new()
        .parse_torrent_file(&torrent)
        .await
        .with_context(|| format!("failed to load {}", torrent.display()))?;

    println!("Name:         {}", metadata.name);
    println!("Info hash:    {}", metadata.info_hash);
    println!("Piece length: {}", metadata.piece_length);
    println!("Pieces:       {}", metadata.num_pieces());
    println!("Total size:   {} bytes", metadata.total_length);
    println!("Files:");
    for file in &metadata.files {
        println!("  {} ({} bytes)", file.path.join("/"), file.length);
    }
    println!("Trackers:");
    for url in &metadata.announce_urls {
        println!("  {url}");
    }

    Ok(())
}

/// Rewrites core failures into their user-facing message, keeping the
/// command context. Other errors pass through unchanged.
pub fn into_report(error: anyhow::Error) -> anyhow::Error {
    let top = error.to_string();
    let (core, inner) = match error.downcast::<RivuletError>() {
        Ok(core) => {
            let inner = core.to_string();
            (core, inner)
        }
        Err(error) => match error.downcast::<TorrentError>() {
            Ok(torrent) => {
                let inner = torrent.to_string();
                (RivuletError::from(torrent), inner)
            }
            Err(error) => match error.downcast::<StorageError>() {
                Ok(storage) => {
                    let inner = storage.to_string();
                    (RivuletError::from(storage), inner)
                }
                Err(error) => return error,
            },
        },
    };
    let context = (top != inner).then_some(top);

    tracing::debug!(error = ?core, "Command failed");
    let mut message = match context {
        Some(context) => format!("{context}: {}", core.user_message()),
        None => core.user_message(),
    };
    if core.is_user_error() {
        message.push_str("\nCheck the .torrent file and command-line arguments");
    }
    anyhow::anyhow!(message)
}
