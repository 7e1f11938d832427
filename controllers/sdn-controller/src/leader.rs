//! Leader election.
//!
//! Only the active instance runs bootstrap and workers. `LeaseElector` uses a
//! coordination.k8s.io Lease through `kube-lease-manager`; `StandaloneElector`
//! is always active (single replica deployments, tests).

use crate::error::ControllerError;
use kube::Client;
use kube_lease_manager::{LeaseManager, LeaseManagerBuilder, LeaseManagerError};
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Leader election capability
#[async_trait::async_trait]
pub trait LeaderElector: Send + Sync {
    /// Blocks until this instance is the active one.
    async fn acquire(&self) -> Result<(), ControllerError>;

    /// Whether this instance currently leads.
    fn is_active(&self) -> bool;

    /// Resolves once leadership is lost.
    async fn lost(&self);
}

/// Always-active elector
#[derive(Debug, Clone, Copy, Default)]
pub struct StandaloneElector;

#[async_trait::async_trait]
impl LeaderElector for StandaloneElector {
    async fn acquire(&self) -> Result<(), ControllerError> {
        Ok(())
    }

    fn is_active(&self) -> bool {
        true
    }

    async fn lost(&self) {
        std::future::pending::<()>().await;
    }
}

/// Lease parameters
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub name: String,
    pub namespace: String,
    pub identity: String,
    pub duration_seconds: u64,
    pub grace_seconds: u64,
}

type LeaseTask = JoinHandle<Result<LeaseManager, LeaseManagerError>>;

/// Lease based elector
pub struct LeaseElector {
    client: Client,
    settings: LeaseSettings,
    state: Mutex<Option<(watch::Receiver<bool>, LeaseTask)>>,
}

impl std::fmt::Debug for LeaseElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseElector")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl LeaseElector {
    pub fn new(client: Client, settings: LeaseSettings) -> Self {
        Self {
            client,
            settings,
            state: Mutex::new(None),
        }
    }

    fn receiver(&self) -> Option<watch::Receiver<bool>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(rx, _)| rx.clone())
    }
}

impl Drop for LeaseElector {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, task)) = state.take() {
            task.abort();
        }
    }
}

#[async_trait::async_trait]
impl LeaderElector for LeaseElector {
    async fn acquire(&self) -> Result<(), ControllerError> {
        info!(
            lease_name = %self.settings.name,
            lease_namespace = %self.settings.namespace,
            identity = %self.settings.identity,
            lease_duration_secs = self.settings.duration_seconds,
            "Leader election enabled, waiting to acquire leadership"
        );

        let manager = LeaseManagerBuilder::new(self.client.clone(), &self.settings.name)
            .with_namespace(&self.settings.namespace)
            .with_identity(&self.settings.identity)
            .with_duration(self.settings.duration_seconds)
            .with_grace(self.settings.grace_seconds)
            .build()
            .await
            .map_err(|e| ControllerError::LeaderElection(e.to_string()))?;

        let (leader_rx, lease_task) = manager.watch().await;
        let mut rx = leader_rx.clone();
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some((leader_rx, lease_task));

        while !*rx.borrow_and_update() {
            rx.changed()
                .await
                .map_err(|e| ControllerError::LeaderElection(e.to_string()))?;
        }
        info!("Leadership acquired as {}", self.settings.identity);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.receiver().is_some_and(|rx| *rx.borrow())
    }

    async fn lost(&self) {
        let Some(mut rx) = self.receiver() else {
            return;
        };
        loop {
            if rx.changed().await.is_err() {
                warn!("Lease manager stopped");
                return;
            }
            if !*rx.borrow() {
                warn!("Leadership lost");
                return;
            }
        }
    }
}
