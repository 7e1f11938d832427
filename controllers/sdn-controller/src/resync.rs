//! Periodic resync passes.
//!
//! Each pass runs on its own interval until the shutdown token fires. The
//! passes only enqueue keys (or sweep ports); reconcilers do the real work.

use crate::annotations;
use crate::config::Configuration;
use crate::queues::QueueId;
use crate::reconciler::Reconciler;
use crate::reconciler::subnet::usage_differs;
use crate::router::object_key;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A periodic pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Subnets whose status counters disagree with the allocator
    SubnetStatus,
    /// Pods without an address
    Pods,
    /// Nodes without an address
    Nodes,
    /// Mark-and-clean of orphaned switch ports
    PortGc,
}

impl Pass {
    pub const ALL: [Pass; 4] = [Pass::SubnetStatus, Pass::Pods, Pass::Nodes, Pass::PortGc];

    fn period(self, config: &Configuration) -> Duration {
        let period = match self {
            Pass::SubnetStatus => config.subnet_resync,
            Pass::Pods => config.pod_resync,
            Pass::Nodes => config.node_resync,
            Pass::PortGc => config.port_gc_interval,
        };
        period.max(Duration::from_secs(1))
    }
}

/// Starts every pass; the first run of each happens immediately.
pub fn spawn_resync(reconciler: &Arc<Reconciler>, token: &CancellationToken) -> Vec<JoinHandle<()>> {
    Pass::ALL
        .into_iter()
        .map(|pass| {
            let reconciler = Arc::clone(reconciler);
            let token = token.clone();
            let period = pass.period(&reconciler.config);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = interval.tick() => run_pass(&reconciler, pass).await,
                    }
                }
                debug!("Resync pass {:?} stopped", pass);
            })
        })
        .collect()
}

async fn run_pass(reconciler: &Reconciler, pass: Pass) {
    let queued = match pass {
        Pass::SubnetStatus => reconciler.resync_subnet_status(),
        Pass::Pods => reconciler.resync_pods(),
        Pass::Nodes => reconciler.resync_nodes(),
        Pass::PortGc => match reconciler.port_gc_pass().await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Port garbage collection failed: {}", e);
                0
            }
        },
    };
    if queued > 0 {
        info!("Resync {:?}: {} objects", pass, queued);
    }
}

impl Reconciler {
    /// Enqueues a status update for every subnet whose counters are stale.
    pub fn resync_subnet_status(&self) -> usize {
        let mut queued = 0;
        for subnet in self.cluster.subnets() {
            let Some(name) = subnet.metadata.name.as_deref() else {
                continue;
            };
            let Ok(snapshot) = self.ipam.snapshot(name) else {
                continue;
            };
            if usage_differs(subnet.status.as_ref(), &snapshot) {
                self.queues.enqueue(QueueId::UpdateSubnetStatus, name);
                queued += 1;
            }
        }
        queued
    }

    /// Enqueues every live, non host-network pod that has no address yet.
    pub fn resync_pods(&self) -> usize {
        let mut queued = 0;
        for pod in self.cluster.pods() {
            if annotations::is_host_network(&pod)
                || annotations::is_terminating(&pod)
                || annotations::is_allocated(pod.metadata.annotations.as_ref())
            {
                continue;
            }
            self.queues.enqueue(QueueId::AddPod, &object_key(pod.as_ref()));
            queued += 1;
        }
        queued
    }

    /// Enqueues every node that has no address yet.
    pub fn resync_nodes(&self) -> usize {
        let mut queued = 0;
        for node in self.cluster.nodes() {
            if annotations::is_allocated(node.metadata.annotations.as_ref()) {
                continue;
            }
            if let Some(name) = node.metadata.name.as_deref() {
                self.queues.enqueue(QueueId::AddNode, name);
                queued += 1;
            }
        }
        queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[tokio::test]
    async fn test_resync_pods_skips_allocated_and_host_network() {
        let (reconciler, cluster, _) = test_reconciler();
        cluster.add_pod(create_test_pod("default", "pending", Some("worker-1")));

        let mut done = create_test_pod("default", "done", Some("worker-1"));
        set_annotation(&mut done.metadata, annotations::ALLOCATED, "true");
        cluster.add_pod(done);

        let mut host = create_test_pod("kube-system", "proxy", Some("worker-1"));
        if let Some(spec) = host.spec.as_mut() {
            spec.host_network = Some(true);
        }
        cluster.add_pod(host);

        assert_eq!(reconciler.resync_pods(), 1);
        let queue = reconciler.queues.get(QueueId::AddPod);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().await.as_deref(), Some("default/pending"));
    }

    #[tokio::test]
    async fn test_resync_nodes() {
        let (reconciler, cluster, _) = test_reconciler();
        cluster.add_node(create_test_node("worker-1", "192.168.0.11"));
        let mut ready = create_test_node("worker-2", "192.168.0.12");
        set_annotation(&mut ready.metadata, annotations::ALLOCATED, "true");
        cluster.add_node(ready);

        assert_eq!(reconciler.resync_nodes(), 1);
        assert_eq!(
            reconciler.queues.get(QueueId::AddNode).pop().await.as_deref(),
            Some("worker-1")
        );
    }

    #[tokio::test]
    async fn test_resync_subnet_status_only_for_stale_counters() {
        let (reconciler, cluster, sdn) = test_reconciler();
        with_default_subnet(&reconciler, &cluster, &sdn).await;
        reconciler.reconcile_subnet_status("ovn-default").await.unwrap();

        assert_eq!(reconciler.resync_subnet_status(), 0);

        reconciler.ipam.allocate("default/web", "ovn-default", None, None).unwrap();
        assert_eq!(reconciler.resync_subnet_status(), 1);
    }

    #[tokio::test]
    async fn test_resync_stops_on_cancel() {
        let (reconciler, _, _) = test_reconciler();
        let token = CancellationToken::new();
        let handles = spawn_resync(&Arc::new(reconciler), &token);
        token.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        }
    }
}
