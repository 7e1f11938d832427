//! `ClusterClient` backed by the Kubernetes API.
//!
//! One reflector store per kind serves reads. `start` spawns a watcher per
//! kind that keeps its store current and hands every event to that kind's
//! `EventRouter`.

use crate::annotations::AnnotationPatch;
use crate::error::ControllerError;
use crate::queues::Queues;
use crate::router::EventRouter;
use crate::routes;
use crate::store::{ClusterClient, WatchSet};
use crds::{IP, Subnet, SubnetStatus, Vpc, VpcStatus};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Node, Pod, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use kube_runtime::reflector::{self, ObjectRef, Store, store::Writer};
use kube_runtime::{WatchStreamExt, watcher};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Field manager for server-side apply
const FIELD_MANAGER: &str = "sdn-controller";

struct Writers {
    vpcs: Writer<Vpc>,
    subnets: Writer<Subnet>,
    ips: Writer<IP>,
    nodes: Writer<Node>,
    namespaces: Writer<Namespace>,
    pods: Writer<Pod>,
    services: Writer<Service>,
    endpoints: Writer<Endpoints>,
    network_policies: Writer<NetworkPolicy>,
}

/// Kubernetes backed resource store
pub struct KubeStore {
    client: Client,
    vpcs: Store<Vpc>,
    subnets: Store<Subnet>,
    ips: Store<IP>,
    nodes: Store<Node>,
    namespaces: Store<Namespace>,
    pods: Store<Pod>,
    services: Store<Service>,
    endpoints: Store<Endpoints>,
    network_policies: Store<NetworkPolicy>,
    writers: Mutex<Option<Writers>>,
    watching: Mutex<WatchSet>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    /// Creates empty caches; nothing is watched until `start`.
    pub fn new(client: Client) -> Self {
        let (vpcs, vpc_writer) = reflector::store();
        let (subnets, subnet_writer) = reflector::store();
        let (ips, ip_writer) = reflector::store();
        let (nodes, node_writer) = reflector::store();
        let (namespaces, namespace_writer) = reflector::store();
        let (pods, pod_writer) = reflector::store();
        let (services, service_writer) = reflector::store();
        let (endpoints, endpoints_writer) = reflector::store();
        let (network_policies, np_writer) = reflector::store();
        Self {
            client,
            vpcs,
            subnets,
            ips,
            nodes,
            namespaces,
            pods,
            services,
            endpoints,
            network_policies,
            writers: Mutex::new(Some(Writers {
                vpcs: vpc_writer,
                subnets: subnet_writer,
                ips: ip_writer,
                nodes: node_writer,
                namespaces: namespace_writer,
                pods: pod_writer,
                services: service_writer,
                endpoints: endpoints_writer,
                network_policies: np_writer,
            })),
            watching: Mutex::new(WatchSet::default()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource,
        K::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }

    fn namespaced_api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl Drop for KubeStore {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Runs one watch until `token` is cancelled, feeding the store and the router.
fn spawn_watch<K>(
    kind: &'static str,
    api: Api<K>,
    writer: Writer<K>,
    router: EventRouter<K>,
    token: CancellationToken,
) -> JoinHandle<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    tokio::spawn(async move {
        info!("Starting {} watcher", kind);
        let stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer);
        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        let was_synced = router.has_synced();
                        router.handle(event);
                        if !was_synced && router.has_synced() {
                            info!("{} watcher synced with {} objects", kind, router.len());
                        }
                    }
                    Some(Err(e)) => warn!("{} watch error (retrying): {}", kind, e),
                    None => {
                        warn!("{} watch stream ended", kind);
                        break;
                    }
                },
            }
        }
        debug!("{} watcher stopped", kind);
    })
}

fn get_cluster<K>(store: &Store<K>, name: &str) -> Option<Arc<K>>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    store.get(&ObjectRef::new(name))
}

fn get_namespaced<K>(store: &Store<K>, namespace: &str, name: &str) -> Option<Arc<K>>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    store.get(&ObjectRef::new(name).within(namespace))
}

/// Treats "already exists" as success.
fn ignore_conflict<T>(result: Result<T, kube::Error>) -> Result<(), ControllerError> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Treats "not found" as success.
fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), ControllerError> {
    match result.map_err(ControllerError::from) {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

fn not_ready(kind: &str, e: impl std::fmt::Display) -> ControllerError {
    ControllerError::Watch(format!("{} cache never became ready: {}", kind, e))
}

#[async_trait::async_trait]
impl ClusterClient for KubeStore {
    async fn start(
        &self,
        queues: Arc<Queues>,
        watch: WatchSet,
        token: CancellationToken,
    ) -> Result<(), ControllerError> {
        let writers = self
            .writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ControllerError::Watch("watches already started".to_string()))?;
        *self.watching.lock().unwrap_or_else(PoisonError::into_inner) = watch;

        let mut tasks = vec![
            spawn_watch(
                "Vpc",
                self.api(),
                writers.vpcs,
                EventRouter::new("Vpc", &routes::VPC, Arc::clone(&queues)),
                token.clone(),
            ),
            spawn_watch(
                "Subnet",
                self.api(),
                writers.subnets,
                EventRouter::new("Subnet", &routes::SUBNET, Arc::clone(&queues)),
                token.clone(),
            ),
            spawn_watch(
                "IP",
                self.api(),
                writers.ips,
                EventRouter::new("IP", &routes::IP_RECORD, Arc::clone(&queues)),
                token.clone(),
            ),
            spawn_watch(
                "Node",
                self.api(),
                writers.nodes,
                EventRouter::new("Node", &routes::NODE, Arc::clone(&queues)),
                token.clone(),
            ),
            spawn_watch(
                "Namespace",
                self.api(),
                writers.namespaces,
                EventRouter::new("Namespace", &routes::NAMESPACE, Arc::clone(&queues)),
                token.clone(),
            ),
            spawn_watch(
                "Pod",
                self.api(),
                writers.pods,
                EventRouter::new("Pod", &routes::POD, Arc::clone(&queues)),
                token.clone(),
            ),
        ];
        if watch.services {
            tasks.push(spawn_watch(
                "Service",
                self.api(),
                writers.services,
                EventRouter::new("Service", &routes::SERVICE, Arc::clone(&queues)),
                token.clone(),
            ));
            tasks.push(spawn_watch(
                "Endpoints",
                self.api(),
                writers.endpoints,
                EventRouter::new("Endpoints", &routes::ENDPOINTS, Arc::clone(&queues)),
                token.clone(),
            ));
        }
        if watch.network_policies {
            tasks.push(spawn_watch(
                "NetworkPolicy",
                self.api(),
                writers.network_policies,
                EventRouter::new("NetworkPolicy", &routes::NETWORK_POLICY, Arc::clone(&queues)),
                token.clone(),
            ));
        }
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
        Ok(())
    }

    async fn wait_synced(&self) -> Result<(), ControllerError> {
        let watch = *self.watching.lock().unwrap_or_else(PoisonError::into_inner);
        self.vpcs.wait_until_ready().await.map_err(|e| not_ready("Vpc", e))?;
        self.subnets.wait_until_ready().await.map_err(|e| not_ready("Subnet", e))?;
        self.ips.wait_until_ready().await.map_err(|e| not_ready("IP", e))?;
        self.nodes.wait_until_ready().await.map_err(|e| not_ready("Node", e))?;
        self.namespaces.wait_until_ready().await.map_err(|e| not_ready("Namespace", e))?;
        self.pods.wait_until_ready().await.map_err(|e| not_ready("Pod", e))?;
        if watch.services {
            self.services.wait_until_ready().await.map_err(|e| not_ready("Service", e))?;
            self.endpoints.wait_until_ready().await.map_err(|e| not_ready("Endpoints", e))?;
        }
        if watch.network_policies {
            self.network_policies
                .wait_until_ready()
                .await
                .map_err(|e| not_ready("NetworkPolicy", e))?;
        }
        Ok(())
    }

    fn vpcs(&self) -> Vec<Arc<Vpc>> {
        self.vpcs.state()
    }

    fn vpc(&self, name: &str) -> Option<Arc<Vpc>> {
        get_cluster(&self.vpcs, name)
    }

    fn subnets(&self) -> Vec<Arc<Subnet>> {
        self.subnets.state()
    }

    fn subnet(&self, name: &str) -> Option<Arc<Subnet>> {
        get_cluster(&self.subnets, name)
    }

    fn ips(&self) -> Vec<Arc<IP>> {
        self.ips.state()
    }

    fn ip(&self, name: &str) -> Option<Arc<IP>> {
        get_cluster(&self.ips, name)
    }

    fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.state()
    }

    fn node(&self, name: &str) -> Option<Arc<Node>> {
        get_cluster(&self.nodes, name)
    }

    fn namespaces(&self) -> Vec<Arc<Namespace>> {
        self.namespaces.state()
    }

    fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        get_cluster(&self.namespaces, name)
    }

    fn pods(&self) -> Vec<Arc<Pod>> {
        self.pods.state()
    }

    fn pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        get_namespaced(&self.pods, namespace, name)
    }

    fn services(&self) -> Vec<Arc<Service>> {
        self.services.state()
    }

    fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        get_namespaced(&self.services, namespace, name)
    }

    fn endpoints(&self, namespace: &str, name: &str) -> Option<Arc<Endpoints>> {
        get_namespaced(&self.endpoints, namespace, name)
    }

    fn network_policies(&self) -> Vec<Arc<NetworkPolicy>> {
        self.network_policies.state()
    }

    fn network_policy(&self, namespace: &str, name: &str) -> Option<Arc<NetworkPolicy>> {
        get_namespaced(&self.network_policies, namespace, name)
    }

    async fn create_vpc(&self, vpc: &Vpc) -> Result<(), ControllerError> {
        ignore_conflict(self.api::<Vpc>().create(&PostParams::default(), vpc).await)
    }

    async fn create_subnet(&self, subnet: &Subnet) -> Result<(), ControllerError> {
        ignore_conflict(self.api::<Subnet>().create(&PostParams::default(), subnet).await)
    }

    async fn apply_ip(&self, ip: &IP) -> Result<(), ControllerError> {
        let name = ip
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::InvalidResource {
                resource: "IP".to_string(),
                reason: "missing name".to_string(),
            })?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        self.api::<IP>().patch(name, &pp, &Patch::Apply(ip)).await?;
        Ok(())
    }

    async fn delete_ip(&self, name: &str) -> Result<(), ControllerError> {
        ignore_not_found(self.api::<IP>().delete(name, &DeleteParams::default()).await)
    }

    async fn patch_vpc_status(&self, name: &str, status: &VpcStatus) -> Result<(), ControllerError> {
        let status_patch = json!({ "status": status });
        let pp = PatchParams::default();
        self.api::<Vpc>()
            .patch_status(name, &pp, &Patch::Merge(&status_patch))
            .await?;
        Ok(())
    }

    async fn patch_subnet_status(&self, name: &str, status: &SubnetStatus) -> Result<(), ControllerError> {
        let status_patch = json!({ "status": status });
        let pp = PatchParams::default();
        self.api::<Subnet>()
            .patch_status(name, &pp, &Patch::Merge(&status_patch))
            .await?;
        Ok(())
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &AnnotationPatch,
    ) -> Result<(), ControllerError> {
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.namespaced_api::<Pod>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_node_annotations(&self, name: &str, annotations: &AnnotationPatch) -> Result<(), ControllerError> {
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.api::<Node>()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_namespace_annotations(
        &self,
        name: &str,
        annotations: &AnnotationPatch,
    ) -> Result<(), ControllerError> {
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.api::<Namespace>()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
