use anyhow::Result;
use clap::{Parser, Subcommand};
use flockraft::{create_raft_router, create_router, FlockDaemon, NodeConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "flockraft")]
#[command(about = "Replicated key-value daemon with snapshot compaction")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[arg(short, long, default_value = "flockraft.toml")]
        config: PathBuf,

        /// Start a new single-member cluster, overriding the config file.
        #[arg(long)]
        bootstrap: bool,
    },
    Init {
        #[arg(short, long, default_value = "flockraft.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flockraft=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config: config_path,
            bootstrap,
        } => {
            run_daemon(config_path, bootstrap).await?;
        }
        Commands::Init { config: config_path } => {
            init_config(config_path)?;
        }
    }

    Ok(())
}

async fn run_daemon(config_path: PathBuf, bootstrap: bool) -> Result<()> {
    let mut config = if config_path.exists() {
        info!("Loading config from {:?}", config_path);
        NodeConfig::load(&config_path)?
    } else {
        info!("Config file not found, using defaults");
        NodeConfig::default()
    };
    config.bootstrap |= bootstrap;

    let daemon = Arc::new(FlockDaemon::new(config.clone()).await?);

    let api_router = create_router(daemon.clone());
    let raft_router = create_raft_router(daemon.server().clone());
    let router = api_router.merge(raft_router);

    let listener = TcpListener::bind(&config.listen_addr()).await?;
    info!("API server listening on {}", config.listen_addr());

    let api_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("API server error: {}", e);
        }
    });

    let daemon_clone = daemon.clone();
    let daemon_handle = tokio::spawn(async move {
        if let Err(e) = daemon_clone.run().await {
            error!("Daemon error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    daemon.shutdown();

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = daemon_handle.await;
    })
    .await;
    api_handle.abort();

    Ok(())
}

fn init_config(config_path: PathBuf) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("Config file already exists: {:?}", config_path);
    }

    let config = NodeConfig::default();
    config.save(&config_path)?;
    println!("Created config file: {:?}", config_path);
    println!("\nEdit the config file to:");
    println!("  - Set a unique node_name and advertise_addr");
    println!("  - Set bootstrap = true on the first node, or list seeds to join");
    println!("  - Tune the [raft] timeouts and snapshot_threshold");

    Ok(())
}
