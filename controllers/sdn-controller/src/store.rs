//! Resource store and status writer.
//!
//! Reads come from local caches kept current by watches; writes go to the
//! API server. The watches feed the event routers once `start` is called.

use crate::annotations::AnnotationPatch;
use crate::error::ControllerError;
use crate::queues::Queues;
use crds::{IP, Subnet, SubnetStatus, Vpc, VpcStatus};
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Node, Pod, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Optional kinds to watch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSet {
    /// Services and Endpoints (load balancer support)
    pub services: bool,
    /// NetworkPolicies
    pub network_policies: bool,
}

/// Cluster resource access used by bootstrap, reconcilers and resync.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Starts the watches, routing their events into `queues`.
    async fn start(
        &self,
        queues: Arc<Queues>,
        watch: WatchSet,
        token: CancellationToken,
    ) -> Result<(), ControllerError>;

    /// Waits until every started watch delivered its first full list.
    async fn wait_synced(&self) -> Result<(), ControllerError>;

    // Cache reads
    fn vpcs(&self) -> Vec<Arc<Vpc>>;
    fn vpc(&self, name: &str) -> Option<Arc<Vpc>>;
    fn subnets(&self) -> Vec<Arc<Subnet>>;
    fn subnet(&self, name: &str) -> Option<Arc<Subnet>>;
    fn ips(&self) -> Vec<Arc<IP>>;
    fn ip(&self, name: &str) -> Option<Arc<IP>>;
    fn nodes(&self) -> Vec<Arc<Node>>;
    fn node(&self, name: &str) -> Option<Arc<Node>>;
    fn namespaces(&self) -> Vec<Arc<Namespace>>;
    fn namespace(&self, name: &str) -> Option<Arc<Namespace>>;
    fn pods(&self) -> Vec<Arc<Pod>>;
    fn pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>>;
    fn services(&self) -> Vec<Arc<Service>>;
    fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>>;
    fn endpoints(&self, namespace: &str, name: &str) -> Option<Arc<Endpoints>>;
    fn network_policies(&self) -> Vec<Arc<NetworkPolicy>>;
    fn network_policy(&self, namespace: &str, name: &str) -> Option<Arc<NetworkPolicy>>;

    // Writes
    /// Creates a Vpc; an existing one is left untouched.
    async fn create_vpc(&self, vpc: &Vpc) -> Result<(), ControllerError>;
    /// Creates a Subnet; an existing one is left untouched.
    async fn create_subnet(&self, subnet: &Subnet) -> Result<(), ControllerError>;
    /// Creates or replaces an IP record.
    async fn apply_ip(&self, ip: &IP) -> Result<(), ControllerError>;
    /// Deletes an IP record; missing records are fine.
    async fn delete_ip(&self, name: &str) -> Result<(), ControllerError>;
    async fn patch_vpc_status(&self, name: &str, status: &VpcStatus) -> Result<(), ControllerError>;
    async fn patch_subnet_status(&self, name: &str, status: &SubnetStatus) -> Result<(), ControllerError>;
    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &AnnotationPatch,
    ) -> Result<(), ControllerError>;
    async fn patch_node_annotations(&self, name: &str, annotations: &AnnotationPatch) -> Result<(), ControllerError>;
    async fn patch_namespace_annotations(
        &self,
        name: &str,
        annotations: &AnnotationPatch,
    ) -> Result<(), ControllerError>;
}
