//! Main controller implementation.
//!
//! `Controller` owns the allocator, queues and reconciler, runs the bootstrap
//! sequence and then waits for shutdown or loss of leadership.

use crate::config::Configuration;
use crate::error::{BootstrapPhase, ControllerError};
use crate::leader::LeaderElector;
use crate::queues::Queues;
use crate::reconciler::Reconciler;
use crate::store::ClusterClient;
use ipam::Ipam;
use sdn_client::SdnClientTrait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Main controller for SDN resource management.
pub struct Controller {
    pub(crate) config: Configuration,
    pub(crate) cluster: Arc<dyn ClusterClient>,
    pub(crate) sdn: Arc<dyn SdnClientTrait>,
    pub(crate) elector: Arc<dyn LeaderElector>,
    pub(crate) ipam: Arc<Ipam>,
    pub(crate) queues: Arc<Queues>,
    pub(crate) reconciler: Arc<Reconciler>,
    pub(crate) token: CancellationToken,
    phase: Mutex<BootstrapPhase>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a new controller instance.
    pub fn new(
        config: Configuration,
        cluster: Arc<dyn ClusterClient>,
        sdn: Arc<dyn SdnClientTrait>,
        elector: Arc<dyn LeaderElector>,
    ) -> Self {
        info!("Initializing SDN Controller");
        let token = CancellationToken::new();
        let ipam = Arc::new(Ipam::new());
        let queues = Arc::new(Queues::new(&config.backoff(), &token, config.key_lock_buckets));
        let reconciler = Arc::new(Reconciler::new(
            config.clone(),
            Arc::clone(&cluster),
            Arc::clone(&sdn),
            Arc::clone(&ipam),
            Arc::clone(&queues),
        ));
        Self {
            config,
            cluster,
            sdn,
            elector,
            ipam,
            queues,
            reconciler,
            token,
            phase: Mutex::new(BootstrapPhase::AwaitLeadership),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Current bootstrap phase.
    pub fn phase(&self) -> BootstrapPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn enter(&self, phase: BootstrapPhase) {
        info!("Bootstrap phase {}", phase);
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    pub(crate) fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bootstraps, then runs until `shutdown` is called or leadership is lost.
    pub async fn run(&self) -> Result<(), ControllerError> {
        let result = self.run_inner().await;
        self.stop();
        result
    }

    async fn run_inner(&self) -> Result<(), ControllerError> {
        self.bootstrap().await?;
        info!("SDN Controller running");

        tokio::select! {
            () = self.token.cancelled() => {
                info!("Shutdown requested, stopping workers");
                Ok(())
            }
            () = self.elector.lost() => {
                warn!("Leadership lost, stopping workers");
                Err(ControllerError::LeaderElection("leadership lost".to_string()))
            }
        }
    }

    /// Requests shutdown; `run` returns once the workers are stopped.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    fn stop(&self) {
        self.token.cancel();
        self.queues.shutdown_all();
        // In-flight keys are abandoned
        for task in self.tasks().drain(..) {
            task.abort();
        }
    }
}
