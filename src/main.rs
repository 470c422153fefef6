use std::process::ExitCode;

use clap::Parser;
use maelstrom::client::Client;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// A BitTorrent client.
#[derive(Parser, Debug)]
#[command(name = "maelstrom", version, about, long_about = None)]
struct Args {
    /// Path to a .torrent file or a magnet link, wrapped in quotes.
    source: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut client = match Client::start(&args.source).await {
        Ok(client) => client,
        Err(e) => {
            error!("could not start the client: {e}");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = client.wait() => match result {
            Ok(()) => {
                info!("download complete");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("download failed: {e}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            client.stop().await;
            ExitCode::SUCCESS
        }
    }
}
