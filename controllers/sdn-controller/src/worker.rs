//! Worker pool
//!
//! Each worker pops a key, takes the key lock of the queue's kind, runs the
//! reconciler and reports the outcome back to the queue.

use crate::error::ErrorClass;
use crate::queues::{QueueId, Queues};
use crate::reconciler::Reconciler;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Starts `count` workers on queue `id`.
pub fn spawn_workers(
    reconciler: &Arc<Reconciler>,
    queues: &Arc<Queues>,
    id: QueueId,
    count: usize,
) -> Vec<JoinHandle<()>> {
    debug!("Starting {} workers for queue {}", count, id);
    (0..count.max(1))
        .map(|index| {
            let reconciler = Arc::clone(reconciler);
            let queues = Arc::clone(queues);
            tokio::spawn(async move { run_worker(reconciler, queues, id, index).await })
        })
        .collect()
}

async fn run_worker(reconciler: Arc<Reconciler>, queues: Arc<Queues>, id: QueueId, index: usize) {
    let queue = queues.get(id);
    while let Some(key) = queue.pop().await {
        let result = {
            let _guard = queues.lock_for(id).lock(&key).await;
            reconciler.reconcile(id, &key).await
        };

        match result {
            Ok(()) => queue.mark_done(&key),
            Err(e) => {
                let previous_failures = queue.num_requeues(&key);
                let delay = queue.mark_failed(&key);
                match e.class() {
                    ErrorClass::Fatal => error!("{} {} failed: {}", id, key, e),
                    // Repeated failures of the same key stay quiet
                    _ if previous_failures == 0 => {
                        warn!("{} {} failed, retrying in {:?}: {}", id, key, delay, e);
                    }
                    _ => debug!(
                        "{} {} failed again ({} times), retrying in {:?}: {}",
                        id, key, previous_failures + 1, delay, e
                    ),
                }
            }
        }
    }
    debug!("Worker {} of queue {} stopped", index, id);
}
