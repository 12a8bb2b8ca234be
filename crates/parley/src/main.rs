use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parley::api::{create_router, AppState, StreamTimings};
use parley::auth::AuthState;
use parley::chat::ChatRepository;
use parley::config::Config;
use parley::db;
use parley::provider::{HttpProvider, ModelProvider};
use parley::run::{RecoverySweep, RunEventBus, RunExecutor, RunRepository};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Parley - chat backend with connection-independent AI runs.",
    propagate_version = true
)]
struct Cli {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server.
    Serve {
        /// Override the configured listen address.
        #[arg(long)]
        listen: Option<String>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { listen } => serve(config, listen).await,
    }
}

async fn serve(config: Config, listen: Option<String>) -> Result<()> {
    let pool = db::open_pool(&config.database_path).await?;
    let runs = RunRepository::new(pool.clone());
    let chats = ChatRepository::new(pool);

    // Runs orphaned by a previous process must be failed before clients can
    // attach to them.
    RecoverySweep::new().ensure(&runs).await?;

    let bus = RunEventBus::new();
    let provider: Arc<dyn ModelProvider> = Arc::new(HttpProvider::new(config.provider.clone()));
    let executor = RunExecutor::new(
        runs.clone(),
        chats.clone(),
        bus.clone(),
        Arc::clone(&provider),
        &config.executor,
        config.provider.system_prompt.clone(),
    );

    let state = AppState {
        runs,
        chats,
        bus,
        executor,
        provider,
        auth: AuthState::new(config.auth.clone()),
        timings: StreamTimings::default(),
    };

    let addr: SocketAddr = listen
        .unwrap_or(config.listen_addr)
        .parse()
        .context("parsing listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(%addr, database = %config.database_path.display(), "parley listening");

    axum::serve(listener, create_router(state))
        .await
        .context("serving HTTP")?;
    Ok(())
}
