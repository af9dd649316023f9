use std::{sync::Arc, time::Duration};

use agents::{registry, PrivateClient};
use anyhow::{anyhow, Context, Result};
use tracing::info;
use xchg_core::{config::Config, tls};

/// How often the runner logs a summary of the account view.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Resolve the configured exchange in the registry and build its client.
pub fn build_client(cfg: &Config) -> Result<Arc<dyn PrivateClient>> {
    agents::register_all();
    let factory = registry::get_client(&cfg.exchange).ok_or_else(|| {
        anyhow!(
            "no client registered for exchange {:?} (available: {:?})",
            cfg.exchange,
            registry::registered()
        )
    })?;
    let tls = tls::build_tls_config(cfg.ca_bundle.as_deref(), &cfg.cert_pins)
        .context("building TLS config")?;
    factory(cfg, Some(tls))
}

/// Log one line describing the client's session and account view.
pub fn log_status(client: &dyn PrivateClient) {
    let balances = client.balances();
    let open = client.open_orders(None);
    info!(
        exchange = client.exchange(),
        state = %client.state(),
        balances = balances.len(),
        open_orders = open.len(),
        "session status"
    );
}

/// Resolve once SIGINT or SIGTERM is received.
pub async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("waiting for ctrl-c")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    Ok(())
}
