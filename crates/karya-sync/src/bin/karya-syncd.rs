//! Karya sync daemon.
//!
//! Runs sync cycles against the configured upstream peers at a fixed
//! interval until interrupted. With a listen address it also serves its
//! downstream nodes over HTTP.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;

use karya_sync::{init_logging, CycleOutcome, Node, NodeConfig, NodeError};

#[derive(Debug, Parser)]
#[command(name = "karya-syncd", version, about = "Karya multi-tier sync daemon")]
struct Cli {
    /// JSON config file. Without it, configuration is read from KARYA_* variables.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Run a single cycle against every peer and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, NodeError> {
    let config = match &cli.config {
        Some(path) => NodeConfig::from_json_file(path)?,
        None => NodeConfig::from_env()?,
    };
    tracing::info!(config = ?config, "starting karya-syncd");

    let node = Node::open(config).await?;

    if cli.once {
        let mut clean = true;
        for (peer, outcome) in node.sync_all().await {
            match outcome {
                CycleOutcome::Completed(report) => {
                    clean &= report.is_clean();
                    tracing::info!(
                        peer = %peer,
                        sent = report.rows_sent,
                        received = report.rows_received,
                        "cycle completed"
                    );
                }
                CycleOutcome::Aborted(reason) => {
                    clean = false;
                    tracing::warn!(peer = %peer, "cycle aborted: {}", reason);
                }
                CycleOutcome::AlreadyRunning => {}
            }
        }
        return Ok(if clean { ExitCode::SUCCESS } else { ExitCode::FAILURE });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = match node.config().listen_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr).await?;
            let mut stop = shutdown_rx.clone();
            let endpoint = node.endpoint().clone();
            Some(tokio::spawn(async move {
                let shutdown = async move {
                    let _ = stop.wait_for(|stopped| *stopped).await;
                };
                karya_sync::engine::serve(endpoint, listener, shutdown).await
            }))
        }
        None => None,
    };
    let scheduler = node.scheduler().spawn(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    scheduler
        .await
        .map_err(|e| NodeError::Task(e.to_string()))?;
    if let Some(server) = server {
        server.await.map_err(|e| NodeError::Task(e.to_string()))??;
    }
    Ok(ExitCode::SUCCESS)
}
