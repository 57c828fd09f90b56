use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use browserpilot::server::{build_router, OpenAiModelFactory, ServeState};
use browserpilot::storage::{FileStore, InMemoryStore, SessionStore};

#[derive(Parser)]
#[command(name = "browserpilot", version, about = "Session orchestrator for LLM-driven browser automation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP orchestrator.
    Serve {
        /// Port to listen on.
        #[arg(long, default_value_t = 8787)]
        port: u16,
        /// Persist sessions under this directory; in-memory when omitted.
        #[arg(long)]
        storage_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { port, storage_dir } => serve(port, storage_dir).await,
    }
}

async fn serve(port: u16, storage_dir: Option<PathBuf>) -> Result<()> {
    let store: Arc<dyn SessionStore> = match storage_dir {
        Some(dir) => {
            info!(path = %dir.display(), "using file-backed session store");
            Arc::new(FileStore::new(dir))
        }
        None => {
            info!("using in-memory session store");
            Arc::new(InMemoryStore::new())
        }
    };

    let state = ServeState::new(store, Arc::new(OpenAiModelFactory));
    let router = build_router(state);

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "browserpilot listening");
    axum::serve(listener, router.into_make_service())
        .await
        .context("serving HTTP")?;
    Ok(())
}
