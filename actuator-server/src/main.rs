use std::{path::PathBuf, sync::Arc};

use actuator_server::{
    adapters::LoggingResultApplier,
    config::{ConfigLoad, ConfigLoader, ConfigSource},
    routes::{AppState, router},
    startup::{build_runtime, connect_database},
};
use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "actuator-server")]
#[command(about = "Execution runtime for approved agent intents")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Configuration file (TOML or JSON); overrides ACTUATOR_CONFIG_PATH
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// PostgreSQL connection string (overrides config)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actuator=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&cli.serve)?;

    match cli.command {
        Some(Command::Migrate) => {
            let url = config
                .database
                .url
                .as_deref()
                .context("DATABASE_URL is required to run migrations")?;
            let mut database = config.database.clone();
            database.run_migrations = true;
            connect_database(&database, url).await?;
            info!("migrations complete");
            Ok(())
        }
        None => serve(config).await,
    }
}

fn load_config(args: &ServeArgs) -> anyhow::Result<actuator_server::config::Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_path(path);
    }
    let ConfigLoad {
        mut config,
        source,
        env_file_loaded,
    } = loader.load().context("failed to load configuration")?;

    if env_file_loaded {
        info!("loaded .env file");
    }
    match &source {
        ConfigSource::EnvPath(path) => info!(path = %path.display(), "configuration loaded from file"),
        ConfigSource::EnvInline => info!("configuration loaded from inline environment json"),
        ConfigSource::Defaults => info!("no configuration source found; using defaults"),
    }

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host.clone() {
        config.server.host = host;
    }
    if let Some(url) = args.database_url.clone() {
        config.database.url = Some(url);
    }
    Ok(config)
}

async fn serve(config: actuator_server::config::Config) -> anyhow::Result<()> {
    let addr = config.bind_addr()?;
    if config.platforms.is_empty() {
        warn!("no platforms configured; every job will fail with a missing adapter");
    }

    let applier = Arc::new(LoggingResultApplier::default());
    let runtime = Arc::new(build_runtime(&config, applier).await?);
    runtime
        .start()
        .await
        .context("failed to start execution runtime")?;

    let app = router(AppState::new(Arc::clone(&runtime)));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, platforms = ?config.platforms, "actuator server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    runtime.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
