//! In-memory `ClusterClient` for tests
//!
//! Objects live in shared maps; status and annotation writes mutate them the
//! way the API server would, so reconcilers observe their own writes.

use crate::annotations::AnnotationPatch;
use crate::error::ControllerError;
use crate::queues::Queues;
use crate::store::{ClusterClient, WatchSet};
use crds::{IP, Subnet, SubnetStatus, Vpc, VpcStatus};
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Node, Pod, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct State {
    vpcs: BTreeMap<String, Arc<Vpc>>,
    subnets: BTreeMap<String, Arc<Subnet>>,
    ips: BTreeMap<String, Arc<IP>>,
    nodes: BTreeMap<String, Arc<Node>>,
    namespaces: BTreeMap<String, Arc<Namespace>>,
    pods: BTreeMap<String, Arc<Pod>>,
    services: BTreeMap<String, Arc<Service>>,
    endpoints: BTreeMap<String, Arc<Endpoints>>,
    network_policies: BTreeMap<String, Arc<NetworkPolicy>>,
    status_patches: usize,
    annotation_patches: usize,
    started: Option<WatchSet>,
    never_synced: bool,
}

/// Shared in-memory cluster; clones see the same objects
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for MockCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCluster").finish_non_exhaustive()
    }
}

fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

fn meta_key(meta: &ObjectMeta) -> String {
    match meta.namespace.as_deref() {
        Some(ns) => key(ns, meta.name.as_deref().unwrap_or_default()),
        None => meta.name.clone().unwrap_or_default(),
    }
}

fn apply_patch(meta: &mut ObjectMeta, patch: &AnnotationPatch) {
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    for (k, v) in patch {
        match v {
            Some(value) => {
                annotations.insert(k.clone(), value.clone());
            }
            None => {
                annotations.remove(k);
            }
        }
    }
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_vpc(&self, vpc: Vpc) {
        self.state().vpcs.insert(meta_key(&vpc.metadata), Arc::new(vpc));
    }

    pub fn add_subnet(&self, subnet: Subnet) {
        self.state().subnets.insert(meta_key(&subnet.metadata), Arc::new(subnet));
    }

    pub fn remove_subnet(&self, name: &str) {
        self.state().subnets.remove(name);
    }

    pub fn add_ip(&self, ip: IP) {
        self.state().ips.insert(meta_key(&ip.metadata), Arc::new(ip));
    }

    pub fn add_node(&self, node: Node) {
        self.state().nodes.insert(meta_key(&node.metadata), Arc::new(node));
    }

    pub fn remove_node(&self, name: &str) {
        self.state().nodes.remove(name);
    }

    pub fn add_namespace(&self, namespace: Namespace) {
        self.state().namespaces.insert(meta_key(&namespace.metadata), Arc::new(namespace));
    }

    pub fn add_pod(&self, pod: Pod) {
        self.state().pods.insert(meta_key(&pod.metadata), Arc::new(pod));
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.state().pods.remove(&key(namespace, name));
    }

    pub fn add_service(&self, service: Service) {
        self.state().services.insert(meta_key(&service.metadata), Arc::new(service));
    }

    pub fn remove_service(&self, namespace: &str, name: &str) {
        self.state().services.remove(&key(namespace, name));
    }

    pub fn add_endpoints(&self, endpoints: Endpoints) {
        self.state().endpoints.insert(meta_key(&endpoints.metadata), Arc::new(endpoints));
    }

    pub fn add_network_policy(&self, policy: NetworkPolicy) {
        self.state().network_policies.insert(meta_key(&policy.metadata), Arc::new(policy));
    }

    pub fn remove_network_policy(&self, namespace: &str, name: &str) {
        self.state().network_policies.remove(&key(namespace, name));
    }

    /// Makes `wait_synced` block forever.
    pub fn never_sync(&self) {
        self.state().never_synced = true;
    }

    /// Watch set passed to `start`, if it was called.
    pub fn started(&self) -> Option<WatchSet> {
        self.state().started
    }

    pub fn vpc_status(&self, name: &str) -> Option<VpcStatus> {
        self.state().vpcs.get(name).and_then(|v| v.status.clone())
    }

    pub fn subnet_status(&self, name: &str) -> Option<SubnetStatus> {
        self.state().subnets.get(name).and_then(|s| s.status.clone())
    }

    pub fn status_patch_count(&self) -> usize {
        self.state().status_patches
    }

    pub fn annotation_patch_count(&self) -> usize {
        self.state().annotation_patches
    }

    pub fn ip_record(&self, name: &str) -> Option<IP> {
        self.state().ips.get(name).map(|ip| ip.as_ref().clone())
    }

    pub fn pod_annotations(&self, namespace: &str, name: &str) -> BTreeMap<String, String> {
        self.state()
            .pods
            .get(&key(namespace, name))
            .and_then(|p| p.metadata.annotations.clone())
            .unwrap_or_default()
    }

    pub fn remove_pod_annotation(&self, namespace: &str, name: &str, annotation: &str) {
        let mut state = self.state();
        if let Some(pod) = state.pods.get_mut(&key(namespace, name)) {
            let pod = Arc::make_mut(pod);
            if let Some(annotations) = pod.metadata.annotations.as_mut() {
                annotations.remove(annotation);
            }
        }
    }

    pub fn node_annotations(&self, name: &str) -> BTreeMap<String, String> {
        self.state()
            .nodes
            .get(name)
            .and_then(|n| n.metadata.annotations.clone())
            .unwrap_or_default()
    }

    pub fn namespace_annotations(&self, name: &str) -> BTreeMap<String, String> {
        self.state()
            .namespaces
            .get(name)
            .and_then(|n| n.metadata.annotations.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ClusterClient for MockCluster {
    async fn start(&self, _queues: Arc<Queues>, watch: WatchSet, _token: CancellationToken) -> Result<(), ControllerError> {
        self.state().started = Some(watch);
        Ok(())
    }

    async fn wait_synced(&self) -> Result<(), ControllerError> {
        let never_synced = self.state().never_synced;
        if never_synced {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn vpcs(&self) -> Vec<Arc<Vpc>> {
        self.state().vpcs.values().cloned().collect()
    }

    fn vpc(&self, name: &str) -> Option<Arc<Vpc>> {
        self.state().vpcs.get(name).cloned()
    }

    fn subnets(&self) -> Vec<Arc<Subnet>> {
        self.state().subnets.values().cloned().collect()
    }

    fn subnet(&self, name: &str) -> Option<Arc<Subnet>> {
        self.state().subnets.get(name).cloned()
    }

    fn ips(&self) -> Vec<Arc<IP>> {
        self.state().ips.values().cloned().collect()
    }

    fn ip(&self, name: &str) -> Option<Arc<IP>> {
        self.state().ips.get(name).cloned()
    }

    fn nodes(&self) -> Vec<Arc<Node>> {
        self.state().nodes.values().cloned().collect()
    }

    fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.state().nodes.get(name).cloned()
    }

    fn namespaces(&self) -> Vec<Arc<Namespace>> {
        self.state().namespaces.values().cloned().collect()
    }

    fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.state().namespaces.get(name).cloned()
    }

    fn pods(&self) -> Vec<Arc<Pod>> {
        self.state().pods.values().cloned().collect()
    }

    fn pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.state().pods.get(&key(namespace, name)).cloned()
    }

    fn services(&self) -> Vec<Arc<Service>> {
        self.state().services.values().cloned().collect()
    }

    fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.state().services.get(&key(namespace, name)).cloned()
    }

    fn endpoints(&self, namespace: &str, name: &str) -> Option<Arc<Endpoints>> {
        self.state().endpoints.get(&key(namespace, name)).cloned()
    }

    fn network_policies(&self) -> Vec<Arc<NetworkPolicy>> {
        self.state().network_policies.values().cloned().collect()
    }

    fn network_policy(&self, namespace: &str, name: &str) -> Option<Arc<NetworkPolicy>> {
        self.state().network_policies.get(&key(namespace, name)).cloned()
    }

    async fn create_vpc(&self, vpc: &Vpc) -> Result<(), ControllerError> {
        self.state()
            .vpcs
            .entry(meta_key(&vpc.metadata))
            .or_insert_with(|| Arc::new(vpc.clone()));
        Ok(())
    }

    async fn create_subnet(&self, subnet: &Subnet) -> Result<(), ControllerError> {
        self.state()
            .subnets
            .entry(meta_key(&subnet.metadata))
            .or_insert_with(|| Arc::new(subnet.clone()));
        Ok(())
    }

    async fn apply_ip(&self, ip: &IP) -> Result<(), ControllerError> {
        self.add_ip(ip.clone());
        Ok(())
    }

    async fn delete_ip(&self, name: &str) -> Result<(), ControllerError> {
        self.state().ips.remove(name);
        Ok(())
    }

    async fn patch_vpc_status(&self, name: &str, status: &VpcStatus) -> Result<(), ControllerError> {
        let mut state = self.state();
        let vpc = state
            .vpcs
            .get_mut(name)
            .ok_or_else(|| ControllerError::NotFound(format!("Vpc {}", name)))?;
        Arc::make_mut(vpc).status = Some(status.clone());
        state.status_patches += 1;
        Ok(())
    }

    async fn patch_subnet_status(&self, name: &str, status: &SubnetStatus) -> Result<(), ControllerError> {
        let mut state = self.state();
        let subnet = state
            .subnets
            .get_mut(name)
            .ok_or_else(|| ControllerError::NotFound(format!("Subnet {}", name)))?;
        Arc::make_mut(subnet).status = Some(status.clone());
        state.status_patches += 1;
        Ok(())
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &AnnotationPatch,
    ) -> Result<(), ControllerError> {
        let mut state = self.state();
        let pod = state
            .pods
            .get_mut(&key(namespace, name))
            .ok_or_else(|| ControllerError::NotFound(format!("Pod {}/{}", namespace, name)))?;
        apply_patch(&mut Arc::make_mut(pod).metadata, annotations);
        state.annotation_patches += 1;
        Ok(())
    }

    async fn patch_node_annotations(&self, name: &str, annotations: &AnnotationPatch) -> Result<(), ControllerError> {
        let mut state = self.state();
        let node = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| ControllerError::NotFound(format!("Node {}", name)))?;
        apply_patch(&mut Arc::make_mut(node).metadata, annotations);
        state.annotation_patches += 1;
        Ok(())
    }

    async fn patch_namespace_annotations(
        &self,
        name: &str,
        annotations: &AnnotationPatch,
    ) -> Result<(), ControllerError> {
        let mut state = self.state();
        let namespace = state
            .namespaces
            .get_mut(name)
            .ok_or_else(|| ControllerError::NotFound(format!("Namespace {}", name)))?;
        apply_patch(&mut Arc::make_mut(namespace).metadata, annotations);
        state.annotation_patches += 1;
        Ok(())
    }
}
