use anyhow::{anyhow, Context, Result};
use clap::Parser;
use nexus_sms_simulator::{http_server, Cli, Simulator};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = cli.simulator_config().map_err(|e| anyhow!(e))?;
    let addr = cli.bind_addr().map_err(|e| anyhow!(e))?;
    info!(
        system_number = %config.system_number,
        webhook_configured = config.webhook.url.is_some(),
        "starting SMS simulator"
    );

    let sim = Arc::new(Simulator::new(config));
    let (local, server) = http_server::start(sim.clone(), addr)
        .await
        .map_err(|e| anyhow!(e))?;
    info!("listening on http://{local}");

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
        }
        _ = server => {
            info!("HTTP server stopped");
        }
    }

    sim.shutdown();
    Ok(())
}
