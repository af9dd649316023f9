use anyhow::Result;
use tokio::time::interval;
use tracing::info;
use tracing_subscriber::EnvFilter;

use exchange_sessions::{build_client, log_status, shutdown_signal, STATUS_INTERVAL};
use xchg_core::config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load()?;
    info!(?cfg, "loaded config");

    let client = build_client(cfg)?;
    let offset = client.connect().await?;
    info!(exchange = client.exchange(), clock_offset_ms = offset, "session ready");

    let mut status = interval(STATUS_INTERVAL);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            }
            _ = status.tick() => log_status(client.as_ref()),
        }
    }

    info!("shutting down");
    client.close().await?;
    Ok(())
}
