//! SDN Controller
//!
//! Reconciles cluster networking against a logical network control plane:
//! - Vpc: logical router and static routes
//! - Subnet: address pool and logical switch
//! - Node and Pod: switch ports with allocated addresses
//! - Namespace: subnet binding annotations
//! - Service and NetworkPolicy: load balancer VIPs and port group ACLs
//!
//! Addresses are allocated in-process; `IP` records persist them across
//! restarts.

mod annotations;
mod backoff;
mod bootstrap;
mod config;
mod controller;
mod error;
mod keymutex;
mod kube_store;
mod leader;
mod queues;
mod reconciler;
mod resync;
mod router;
mod routes;
mod store;
mod worker;
mod workqueue;

#[cfg(test)]
mod mock_store;
#[cfg(test)]
mod test_utils;

use crate::config::Configuration;
use crate::controller::Controller;
use crate::kube_store::KubeStore;
use crate::leader::{LeaderElector, LeaseElector, StandaloneElector};
use kube::Client;
use sdn_client::NbctlClient;
use std::sync::Arc;
use tracing::{error, info};

/// Initialize logging from `RUST_LOG` (default `info`); `RUST_LOG_FORMAT=json` selects JSON output.
fn initialize_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }
}

async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                result?;
            }
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received SIGINT, shutting down");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    initialize_logging();
    // Configure rustls crypto provider before any TLS client is built
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting SDN Controller");

    let config = Configuration::from_env()?;
    config.log();

    let client = Client::try_default().await?;
    let cluster = Arc::new(KubeStore::new(client.clone()));
    let sdn = Arc::new(NbctlClient::new(config.ovn_nb_addr.clone(), config.ovn_timeout));
    let elector: Arc<dyn LeaderElector> = if config.enable_leader_election {
        Arc::new(LeaseElector::new(client, config.lease.clone()))
    } else {
        info!("Leader election disabled, running as the only instance");
        Arc::new(StandaloneElector)
    };

    let controller = Controller::new(config, cluster, sdn, elector);
    tokio::select! {
        result = controller.run() => {
            if let Err(e) = &result {
                error!("SDN Controller stopped: {}", e);
            }
            result?;
        }
        result = wait_for_signal() => {
            controller.shutdown();
            result?;
        }
    }

    info!("SDN Controller stopped");
    Ok(())
}
