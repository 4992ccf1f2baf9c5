//! DCloud DHCP Controller
//!
//! Cluster-hosted DHCPv4/DHCPv6 server for VM workloads on secondary
//! networks. Three controllers (subnet, pod, service) reconcile cluster
//! declarations into per-interface responders serving fixed, pre-assigned
//! leases; the addresses themselves come from upstream IPAM.

mod app;
mod backoff;
mod cache;
mod error;
mod events;
mod leader;
mod metrics;
mod pod;
mod service;
mod store;
mod subnet;
mod util;
mod worker;

use std::env;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app::App;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (filter, bad_loglevel) = match env::var("LOGLEVEL") {
        Ok(level) => match EnvFilter::try_new(&level) {
            Ok(filter) => (filter, false),
            Err(_) => (EnvFilter::new("info"), true),
        },
        Err(_) => (EnvFilter::new("info"), false),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("(main) starting dcloud-dhcp-controller");
    if bad_loglevel {
        warn!("(main) cannot determine loglevel, leaving it on info");
    }

    for key in ["POD_NAME", "POD_NAMESPACE"] {
        if env::var(key).is_err() {
            anyhow::bail!("the environment variable [{}] must be defined", key);
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("(main) received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let app = App::init().await?;
    app.run(shutdown_rx).await?;

    Ok(())
}
