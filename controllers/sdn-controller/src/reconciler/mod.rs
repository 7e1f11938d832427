//! Reconciliation logic, one file per resource kind.
//!
//! - `vpc`: Vpc → logical router, static routes, Vpc status
//! - `subnet`: Subnet → allocator pool, logical switch, Subnet status
//! - `node`: Node → join switch port and address
//! - `namespace`: Namespace → subnet binding annotations
//! - `pod`: Pod → switch port, address, EIP
//! - `service`: Service/Endpoints → load balancer VIPs
//! - `network_policy`: NetworkPolicy → port group and ACLs
//! - `gc`: removal of objects whose owner is gone
//!
//! Every reconciler takes only the queue key, reads current state from the
//! cluster cache and is safe to run again after a partial failure.

pub mod gc;
pub mod namespace;
pub mod network_policy;
pub mod node;
pub mod pod;
pub mod service;
pub mod subnet;
pub mod vpc;

use crate::config::Configuration;
use crate::error::ControllerError;
use crate::keymutex::KeyGuard;
use crate::queues::{QueueId, Queues};
use crate::store::ClusterClient;
use crds::{IP, IPSpec, NODE_IP_PREFIX};
use ipam::{Allocation, Ipam};
use sdn_client::SdnClientTrait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use service::ProgrammedVip;

/// Reconciles SDN state for every watched kind.
pub struct Reconciler {
    pub(crate) config: Configuration,
    pub(crate) cluster: Arc<dyn ClusterClient>,
    pub(crate) sdn: Arc<dyn SdnClientTrait>,
    pub(crate) ipam: Arc<Ipam>,
    pub(crate) queues: Arc<Queues>,
    /// VIPs programmed per service key, consulted on delete
    service_vips: Mutex<HashMap<String, Vec<ProgrammedVip>>>,
    /// Ports found orphaned by the previous port GC pass
    orphan_ports: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Reconciler {
    pub fn new(
        config: Configuration,
        cluster: Arc<dyn ClusterClient>,
        sdn: Arc<dyn SdnClientTrait>,
        ipam: Arc<Ipam>,
        queues: Arc<Queues>,
    ) -> Self {
        Self {
            config,
            cluster,
            sdn,
            ipam,
            queues,
            service_vips: Mutex::new(HashMap::new()),
            orphan_ports: Mutex::new(HashSet::new()),
        }
    }

    /// Runs the reconciler behind queue `id` for `key`.
    pub async fn reconcile(&self, id: QueueId, key: &str) -> Result<(), ControllerError> {
        match id {
            QueueId::AddOrUpdateVpc => self.reconcile_vpc(key).await,
            QueueId::DeleteVpc => self.reconcile_delete_vpc(key).await,
            QueueId::UpdateVpcStatus => self.reconcile_vpc_status(key).await,
            QueueId::AddOrUpdateSubnet => self.reconcile_subnet(key).await,
            QueueId::DeleteSubnet => self.reconcile_delete_subnet(key).await,
            QueueId::UpdateSubnetStatus => self.reconcile_subnet_status(key).await,
            QueueId::AddNode | QueueId::UpdateNode => self.reconcile_node(key).await,
            QueueId::DeleteNode => self.reconcile_delete_node(key).await,
            QueueId::AddNamespace => self.reconcile_namespace(key).await,
            QueueId::AddPod => self.reconcile_pod(key).await,
            QueueId::UpdatePod => self.reconcile_pod_update(key).await,
            QueueId::DeletePod => self.reconcile_delete_pod(key).await,
            QueueId::UpdateService => self.reconcile_service(key).await,
            QueueId::DeleteService => self.reconcile_delete_service(key).await,
            QueueId::UpdateNp => self.reconcile_network_policy(key).await,
            QueueId::DeleteNp => self.reconcile_delete_network_policy(key).await,
        }
    }

    /// Logical router backing a VPC.
    pub(crate) fn router_for_vpc<'a>(&'a self, vpc: &'a str) -> &'a str {
        if vpc == self.config.default_vpc {
            &self.config.cluster_router
        } else {
            vpc
        }
    }

    /// Router of the VPC a subnet belongs to; the cluster router when the subnet is unknown.
    pub(crate) fn router_for_subnet(&self, subnet: &str) -> String {
        match self.cluster.subnet(subnet) {
            Some(s) => self.router_for_vpc(s.vpc_or(&self.config.default_vpc)).to_string(),
            None => self.config.cluster_router.clone(),
        }
    }

    /// Whether the pod or node behind an owner key still exists.
    pub(crate) fn owner_alive(&self, owner: &str) -> bool {
        if let Some(node) = node_of_owner(owner) {
            return self.cluster.node(node).is_some();
        }
        match owner.split_once('/') {
            Some((namespace, name)) => self
                .cluster
                .pod(namespace, name)
                .is_some_and(|pod| !crate::annotations::is_terminating(&pod)),
            None => false,
        }
    }

    pub(crate) fn service_vips(&self) -> MutexGuard<'_, HashMap<String, Vec<ProgrammedVip>>> {
        lock(&self.service_vips)
    }

    /// Takes the key lock the pod or node workers hold for `owner`.
    pub(crate) async fn lock_owner(&self, owner: &str) -> KeyGuard<'_> {
        match node_of_owner(owner) {
            Some(node) => self.queues.lock_for(QueueId::AddNode).lock(node).await,
            None => self.queues.lock_for(QueueId::AddPod).lock(owner).await,
        }
    }

    pub(crate) fn orphan_ports(&self) -> MutexGuard<'_, HashSet<String>> {
        lock(&self.orphan_ports)
    }
}

/// Node name behind a node owner key, `None` for pod keys.
fn node_of_owner(owner: &str) -> Option<&str> {
    owner.strip_prefix(NODE_IP_PREFIX).filter(|_| !owner.contains('/'))
}

/// Persisted record of `allocation` for the pod or node named `pod_name`.
pub(crate) fn ip_record(
    record_name: &str,
    pod_name: &str,
    namespace: &str,
    node_name: &str,
    allocation: &Allocation,
) -> IP {
    IP::new(
        record_name,
        IPSpec {
            pod_name: pod_name.to_string(),
            namespace: namespace.to_string(),
            subnet: allocation.subnet.clone(),
            node_name: node_name.to_string(),
            ip_address: allocation.ip_string(),
            v4_ip_address: allocation.v4_string(),
            v6_ip_address: allocation.v6_string(),
            mac_address: allocation.mac.clone().unwrap_or_default(),
        },
    )
}

/// Addresses of an allocation as strings, v4 first.
pub(crate) fn allocation_ips(allocation: &Allocation) -> Vec<String> {
    allocation
        .v4
        .iter()
        .chain(allocation.v6.iter())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn test_router_for_vpc() {
        let (reconciler, _, _) = test_reconciler();
        assert_eq!(reconciler.router_for_vpc("ovn-cluster"), "ovn-cluster-router");
        assert_eq!(reconciler.router_for_vpc("blue"), "blue");
    }

    #[test]
    fn test_owner_alive() {
        let (reconciler, cluster, _) = test_reconciler();
        cluster.add_pod(create_test_pod("default", "web", None));
        cluster.add_node(create_test_node("worker-1", "192.168.0.11"));

        assert!(reconciler.owner_alive("default/web"));
        assert!(!reconciler.owner_alive("default/gone"));
        assert!(reconciler.owner_alive("node-worker-1"));
        assert!(!reconciler.owner_alive("node-worker-2"));
    }
}
