use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, EnvFilter};

use hypernode_node::{
    config::NodeConfig,
    telemetry::{detect_capability, NvidiaSmi},
    NodeAgent,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the node configuration file.
    #[clap(short, long, value_parser, default_value = "config/node.toml", global = true)]
    config: PathBuf,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the node agent (default).
    Run,
    /// Print the detected capability descriptor as JSON.
    Detect {
        /// First GPU index to consider.
        #[clap(long, default_value_t = 0)]
        gpu_index: u32,
    },
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    match args.command.unwrap_or(Command::Run) {
        Command::Detect { gpu_index } => {
            init_tracing(None);
            let capability = detect_capability(&NvidiaSmi::default(), gpu_index).await;
            println!("{}", serde_json::to_string_pretty(&capability)?);
            Ok(())
        }
        Command::CheckConfig => {
            let config = NodeConfig::load(&args.config)
                .with_context(|| format!("Invalid configuration in {:?}", args.config))?;
            println!(
                "Configuration OK: wallet {}, backend {}, {} concurrent job(s), {:?} sandbox",
                config.wallet_pubkey,
                config.backend_url,
                config.max_jobs_concurrent,
                config.sandbox.backend
            );
            Ok(())
        }
        Command::Run => run(args.config).await,
    }
}

fn init_tracing(log_level: Option<&str>) {
    let log_level_str = log_level.unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level_str))
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    fmt::Subscriber::builder().with_env_filter(filter).init();
}

async fn run(config_path: PathBuf) -> Result<()> {
    let config = NodeConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {:?}", config_path))?;
    init_tracing(config.log_level.as_deref());

    info!("Starting Hypernode agent...");
    info!("Wallet: {}", config.wallet_pubkey);
    info!("Coordinator: {}", config.backend_url);

    let agent = NodeAgent::from_config(config)
        .await
        .context("Failed to initialize node agent")?;

    let shutdown = CancellationToken::new();
    let running = agent.start(shutdown.clone()).await;

    shutdown_signal().await;
    shutdown.cancel();

    running.wait().await?;
    info!("Hypernode agent stopped.");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM. A listener that cannot be installed is logged
/// and left pending, so the node keeps running on the other one.
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal (Ctrl+C)."),
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received shutdown signal (SIGTERM).");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
