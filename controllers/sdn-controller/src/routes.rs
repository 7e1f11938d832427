//! Static dispatch tables, one per watched kind.

use crate::annotations::{is_allocated, is_host_network, is_terminating};
use crate::queues::{QueueId, Queues};
use crate::router::{EventHandlers, content_fingerprint, full_fingerprint, object_key};
use crds::{IP, Subnet, Vpc};
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Node, Pod, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use std::hash::{DefaultHasher, Hash, Hasher};

fn ignore<K>(_: &Queues, _: &K) {}

// Vpc

fn vpc_add(queues: &Queues, vpc: &Vpc) {
    queues.enqueue(QueueId::AddOrUpdateVpc, &object_key(vpc));
}

fn vpc_update(queues: &Queues, _old: &Vpc, new: &Vpc) {
    vpc_add(queues, new);
}

fn vpc_delete(queues: &Queues, vpc: &Vpc) {
    queues.enqueue(QueueId::DeleteVpc, &object_key(vpc));
}

/// Vpc routing
pub static VPC: EventHandlers<Vpc> = EventHandlers {
    add: vpc_add,
    update: vpc_update,
    delete: vpc_delete,
    fingerprint: content_fingerprint::<Vpc>,
};

// Subnet

fn subnet_add(queues: &Queues, subnet: &Subnet) {
    queues.enqueue(QueueId::AddOrUpdateSubnet, &object_key(subnet));
}

fn subnet_update(queues: &Queues, old: &Subnet, new: &Subnet) {
    // Moving between VPCs: the old VPC must drop it from its status
    if old.spec.vpc != new.spec.vpc
        && let Some(vpc) = old.spec.vpc.as_deref().filter(|v| !v.is_empty())
    {
        queues.enqueue(QueueId::UpdateVpcStatus, vpc);
    }
    subnet_add(queues, new);
}

fn subnet_delete(queues: &Queues, subnet: &Subnet) {
    queues.enqueue(QueueId::DeleteSubnet, &object_key(subnet));
}

/// Subnet routing
pub static SUBNET: EventHandlers<Subnet> = EventHandlers {
    add: subnet_add,
    update: subnet_update,
    delete: subnet_delete,
    fingerprint: content_fingerprint::<Subnet>,
};

// IP records only feed subnet usage counters

fn ip_changed(queues: &Queues, ip: &IP) {
    if !ip.spec.subnet.is_empty() {
        queues.enqueue(QueueId::UpdateSubnetStatus, &ip.spec.subnet);
    }
}

fn ip_update(queues: &Queues, old: &IP, new: &IP) {
    if old.spec.subnet != new.spec.subnet {
        ip_changed(queues, old);
    }
    ip_changed(queues, new);
}

/// IP routing
pub static IP_RECORD: EventHandlers<IP> = EventHandlers {
    add: ip_changed,
    update: ip_update,
    delete: ip_changed,
    fingerprint: content_fingerprint::<IP>,
};

// Node

fn node_add(queues: &Queues, node: &Node) {
    queues.enqueue(QueueId::AddNode, &object_key(node));
}

fn node_update(queues: &Queues, _old: &Node, new: &Node) {
    if is_allocated(new.metadata.annotations.as_ref()) {
        queues.enqueue(QueueId::UpdateNode, &object_key(new));
    } else {
        node_add(queues, new);
    }
}

fn node_delete(queues: &Queues, node: &Node) {
    queues.enqueue(QueueId::DeleteNode, &object_key(node));
}

/// Spec and metadata plus the reported addresses.
fn node_fingerprint(node: &Node) -> u64 {
    let mut hasher = DefaultHasher::new();
    content_fingerprint(node).hash(&mut hasher);
    for address in node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_deref())
        .unwrap_or_default()
    {
        address.type_.hash(&mut hasher);
        address.address.hash(&mut hasher);
    }
    hasher.finish()
}

/// Node routing
pub static NODE: EventHandlers<Node> = EventHandlers {
    add: node_add,
    update: node_update,
    delete: node_delete,
    fingerprint: node_fingerprint,
};

// Namespace

fn namespace_add(queues: &Queues, namespace: &Namespace) {
    queues.enqueue(QueueId::AddNamespace, &object_key(namespace));
}

fn namespace_update(queues: &Queues, _old: &Namespace, new: &Namespace) {
    namespace_add(queues, new);
}

/// Namespace routing; deletes need no work
pub static NAMESPACE: EventHandlers<Namespace> = EventHandlers {
    add: namespace_add,
    update: namespace_update,
    delete: ignore::<Namespace>,
    fingerprint: content_fingerprint::<Namespace>,
};

// Pod

fn pod_add(queues: &Queues, pod: &Pod) {
    if is_host_network(pod) {
        return;
    }
    let key = object_key(pod);
    if is_terminating(pod) {
        queues.enqueue(QueueId::DeletePod, &key);
    } else {
        queues.enqueue(QueueId::AddPod, &key);
    }
}

fn pod_update(queues: &Queues, _old: &Pod, new: &Pod) {
    if is_host_network(new) {
        return;
    }
    let key = object_key(new);
    if is_terminating(new) {
        queues.enqueue(QueueId::DeletePod, &key);
    } else if !is_allocated(new.metadata.annotations.as_ref()) {
        queues.enqueue(QueueId::AddPod, &key);
    } else {
        queues.enqueue(QueueId::UpdatePod, &key);
    }
}

fn pod_delete(queues: &Queues, pod: &Pod) {
    if !is_host_network(pod) {
        queues.enqueue(QueueId::DeletePod, &object_key(pod));
    }
}

/// Spec and metadata plus the phase, which marks completed pods.
fn pod_fingerprint(pod: &Pod) -> u64 {
    let mut hasher = DefaultHasher::new();
    content_fingerprint(pod).hash(&mut hasher);
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .hash(&mut hasher);
    hasher.finish()
}

/// Pod routing; host-network pods are ignored
pub static POD: EventHandlers<Pod> = EventHandlers {
    add: pod_add,
    update: pod_update,
    delete: pod_delete,
    fingerprint: pod_fingerprint,
};

// Service and Endpoints

fn service_add(queues: &Queues, service: &Service) {
    queues.enqueue(QueueId::UpdateService, &object_key(service));
}

fn service_update(queues: &Queues, _old: &Service, new: &Service) {
    service_add(queues, new);
}

fn service_delete(queues: &Queues, service: &Service) {
    queues.enqueue(QueueId::DeleteService, &object_key(service));
}

/// Service routing
pub static SERVICE: EventHandlers<Service> = EventHandlers {
    add: service_add,
    update: service_update,
    delete: service_delete,
    fingerprint: content_fingerprint::<Service>,
};

fn endpoints_add(queues: &Queues, endpoints: &Endpoints) {
    // Endpoints share their Service's key
    queues.enqueue(QueueId::UpdateService, &object_key(endpoints));
}

fn endpoints_update(queues: &Queues, _old: &Endpoints, new: &Endpoints) {
    endpoints_add(queues, new);
}

/// Endpoints routing; the Service delete covers removal
pub static ENDPOINTS: EventHandlers<Endpoints> = EventHandlers {
    add: endpoints_add,
    update: endpoints_update,
    delete: ignore::<Endpoints>,
    fingerprint: full_fingerprint::<Endpoints>,
};

// NetworkPolicy

fn np_add(queues: &Queues, np: &NetworkPolicy) {
    queues.enqueue(QueueId::UpdateNp, &object_key(np));
}

fn np_update(queues: &Queues, _old: &NetworkPolicy, new: &NetworkPolicy) {
    np_add(queues, new);
}

fn np_delete(queues: &Queues, np: &NetworkPolicy) {
    queues.enqueue(QueueId::DeleteNp, &object_key(np));
}

/// NetworkPolicy routing
pub static NETWORK_POLICY: EventHandlers<NetworkPolicy> = EventHandlers {
    add: np_add,
    update: np_update,
    delete: np_delete,
    fingerprint: content_fingerprint::<NetworkPolicy>,
};

