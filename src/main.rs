use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use dkm::keymgr::KeyMgr;
use dkm::server::{self, AppState};
use dkm::store::sqlite::SqliteStore;

const DB_FILE_NAME: &str = "dkm.db";

#[derive(Parser)]
#[command(name = "dkm")]
#[command(about = "Key manager: custodies a master key and mints delegate keys for pups")]
#[command(version)]
struct Cli {
    /// Storage directory for the key database.
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Address to bind the web API to.
    #[arg(long, default_value = "0.0.0.0:8089")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("dkm=info,tower_http=warn")),
        )
        .init();

    if let Err(e) = run(cli).await {
        tracing::error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    if !cli.dir.is_dir() {
        return Err(format!("--dir: not a directory: {}", cli.dir.display()).into());
    }

    let shutdown = CancellationToken::new();
    let store = SqliteStore::open(&cli.dir.join(DB_FILE_NAME), shutdown.clone())?;
    let state = AppState {
        keymgr: Arc::new(KeyMgr::new(store)),
    };

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            signal.cancel();
        }
    });

    server::serve(state, cli.bind, shutdown).await?;
    Ok(())
}
