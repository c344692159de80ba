// Muxpool gateway binary
//
// Decision: stdin/stdout carry JSON-RPC; logs go to stderr
// Decision: Ctrl-C, SIGTERM and stdin EOF all lead to the same graceful pool shutdown
// Decision: on a signal, requests already read still get a response line

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use muxpool_gateway::{init_tracing, Cli, Gateway};
use muxpool_pool::Pool;
use tokio::io::BufReader;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = cli.load_config().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        worker = %config.pool.worker.program.display(),
        min_instances = config.pool.min_instances,
        max_instances = config.pool.max_instances,
        "Starting muxpool gateway"
    );

    let pool = Arc::new(
        Pool::with_retry_policy(config.pool.clone(), config.retry.clone())
            .context("Failed to create worker pool")?,
    );
    pool.start().await.context("Failed to start worker pool")?;

    let gateway = Arc::new(Gateway::new(pool.clone(), config.breaker.clone()));
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
            _ = terminate_signal() => info!("Received SIGTERM, shutting down"),
        }
    };
    let served = gateway.serve_until(stdin, stdout, shutdown).await;

    pool.shutdown().await;

    if let Err(e) = &served {
        error!(error = %e, "Gateway stopped with an error");
    }
    served.context("Gateway failed")?;
    info!("Muxpool gateway stopped");
    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}
