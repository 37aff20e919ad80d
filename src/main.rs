use anyhow::Context;
use clap::Parser;
use rs_torrent_engine::{Config, EngineEvent, Session, TorrentFile};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Download a torrent to completion.
#[derive(Debug, Parser)]
#[command(name = "rste", version, about)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Directory the content is written under
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// TCP port advertised to trackers and used for inbound peers
    #[arg(long, default_value_t = 6881)]
    port: u16,

    /// Disable the DHT and rely on trackers alone
    #[arg(long)]
    no_dht: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let bytes = std::fs::read(&args.torrent)
        .with_context(|| format!("reading {}", args.torrent.display()))?;
    let torrent = TorrentFile::from_bytes(&bytes).context("parsing torrent file")?;

    let config = Config {
        listen_port: args.port,
        enable_dht: !args.no_dht,
        download_dir: args.output,
        ..Config::default()
    };

    let mut session = Session::start(torrent, config).await?;
    let status = session.status();
    tracing::info!(
        name = %status.name,
        info_hash = %status.info_hash,
        bytes = status.total_bytes,
        "download started"
    );

    loop {
        tokio::select! {
            event = session.next_event() => match event {
                Some(EngineEvent::PieceVerified { .. }) => {
                    let status = session.status();
                    tracing::info!(
                        "{:.1}% ({} / {} bytes, {} peers)",
                        status.piece_fraction * 100.0,
                        status.downloaded_bytes,
                        status.total_bytes,
                        status.peer_count,
                    );
                }
                Some(EngineEvent::Completed) => {
                    tracing::info!("download complete");
                    break;
                }
                Some(EngineEvent::Fatal { error }) => {
                    session.shutdown().await;
                    anyhow::bail!("download failed: {error}");
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
