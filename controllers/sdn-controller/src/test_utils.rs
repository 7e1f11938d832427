//! Test utilities for unit testing reconcilers
//!
//! Builders for cluster objects plus a `Reconciler` wired to `MockCluster`
//! and `MockSdnClient`.

use crate::config::Configuration;
use crate::mock_store::MockCluster;
use crate::queues::Queues;
use crate::reconciler::Reconciler;
use crds::*;
use ipam::Ipam;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Namespace, Node, NodeAddress, NodeStatus, Pod,
    PodSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicySpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use sdn_client::{LbProtocol, MockSdnClient, SdnClientTrait, owned_by};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Configuration with defaults, except a distinct cluster router name.
pub fn test_config() -> Configuration {
    Configuration::from_lookup(|name| match name {
        "CLUSTER_ROUTER" => Some("ovn-cluster-router".to_string()),
        "QUEUE_BACKOFF_MAX_SECONDS" => Some("1".to_string()),
        _ => None,
    })
    .unwrap()
}

/// Reconciler over fresh mocks; the returned mocks share state with it.
pub fn test_reconciler() -> (Reconciler, MockCluster, MockSdnClient) {
    let config = test_config();
    let cluster = MockCluster::new();
    let sdn = MockSdnClient::new();
    let queues = Arc::new(Queues::new(
        &config.backoff(),
        &CancellationToken::new(),
        config.key_lock_buckets,
    ));
    let reconciler = Reconciler::new(
        config,
        Arc::new(cluster.clone()),
        Arc::new(sdn.clone()),
        Arc::new(Ipam::new()),
        queues,
    );
    (reconciler, cluster, sdn)
}

fn meta(namespace: Option<&str>, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

pub fn set_annotation(meta: &mut ObjectMeta, key: &str, value: &str) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

pub fn set_label(meta: &mut ObjectMeta, key: &str, value: &str) {
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

pub fn create_test_vpc(name: &str) -> Vpc {
    Vpc {
        metadata: meta(None, name),
        spec: VpcSpec::default(),
        status: None,
    }
}

pub fn create_test_subnet(name: &str, cidr: &str, vpc: Option<&str>) -> Subnet {
    Subnet {
        metadata: meta(None, name),
        spec: SubnetSpec {
            vpc: vpc.map(str::to_string),
            cidr_block: cidr.to_string(),
            ..Default::default()
        },
        status: None,
    }
}

pub fn create_test_ip(namespace: &str, pod: &str, subnet: &str, ip: &str) -> IP {
    IP::new(
        &pod_ip_name(namespace, pod),
        IPSpec {
            pod_name: pod.to_string(),
            namespace: namespace.to_string(),
            subnet: subnet.to_string(),
            ip_address: ip.to_string(),
            v4_ip_address: ip.to_string(),
            ..Default::default()
        },
    )
}

pub fn create_test_pod(namespace: &str, name: &str, node: Option<&str>) -> Pod {
    Pod {
        metadata: meta(Some(namespace), name),
        spec: Some(PodSpec {
            node_name: node.map(str::to_string),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn create_test_node(name: &str, internal_ip: &str) -> Node {
    Node {
        metadata: meta(None, name),
        status: Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                type_: "InternalIP".to_string(),
                address: internal_ip.to_string(),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn create_test_namespace(name: &str) -> Namespace {
    Namespace {
        metadata: meta(None, name),
        ..Default::default()
    }
}

/// Service with `cluster_ips` and `(name, port, protocol)` ports.
pub fn create_test_service(namespace: &str, name: &str, cluster_ips: &[&str], ports: &[(&str, i32, &str)]) -> Service {
    Service {
        metadata: meta(Some(namespace), name),
        spec: Some(ServiceSpec {
            cluster_ip: cluster_ips.first().map(|ip| (*ip).to_string()),
            cluster_ips: Some(cluster_ips.iter().map(|ip| (*ip).to_string()).collect()),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port, protocol)| ServicePort {
                        name: Some((*port_name).to_string()),
                        port: *port,
                        protocol: Some((*protocol).to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Endpoints with one subset of `ips` and `(name, port)` ports.
pub fn create_test_endpoints(namespace: &str, name: &str, ips: &[&str], ports: &[(&str, i32)]) -> Endpoints {
    Endpoints {
        metadata: meta(Some(namespace), name),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: (*ip).to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| EndpointPort {
                        name: Some((*port_name).to_string()),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }]),
    }
}

/// Policy selecting pods with all of `labels` (every pod when empty).
pub fn create_test_network_policy(namespace: &str, name: &str, labels: &[(&str, &str)]) -> NetworkPolicy {
    let match_labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    NetworkPolicy {
        metadata: meta(Some(namespace), name),
        spec: Some(NetworkPolicySpec {
            pod_selector: Some(LabelSelector {
                match_labels: (!match_labels.is_empty()).then_some(match_labels),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

pub async fn sdn_router(sdn: &MockSdnClient, name: &str) {
    sdn.create_logical_router(name, &owned_by(name)).await.unwrap();
}

/// Default Vpc in the cluster and its router in the SDN.
pub async fn with_default_vpc(cluster: &MockCluster, sdn: &MockSdnClient) {
    cluster.add_vpc(create_test_vpc("ovn-cluster"));
    sdn_router(sdn, "ovn-cluster-router").await;
}

/// Default subnet `ovn-default` (10.16.0.0/16) reconciled into the allocator and SDN.
pub async fn with_default_subnet(reconciler: &Reconciler, cluster: &MockCluster, sdn: &MockSdnClient) {
    with_default_vpc(cluster, sdn).await;
    let mut subnet = create_test_subnet("ovn-default", "10.16.0.0/16", None);
    subnet.spec.default = true;
    cluster.add_subnet(subnet);
    reconciler.reconcile_subnet("ovn-default").await.unwrap();
}

/// Node subnet `join` (100.64.0.0/16) reconciled into the allocator and SDN.
pub async fn with_node_switch(reconciler: &Reconciler, cluster: &MockCluster, sdn: &MockSdnClient) {
    with_default_vpc(cluster, sdn).await;
    cluster.add_subnet(create_test_subnet("join", "100.64.0.0/16", None));
    reconciler.reconcile_subnet("join").await.unwrap();
}

pub async fn with_load_balancers(sdn: &MockSdnClient) {
    sdn.create_load_balancer("cluster-tcp-loadbalancer", LbProtocol::Tcp).await.unwrap();
    sdn.create_load_balancer("cluster-udp-loadbalancer", LbProtocol::Udp).await.unwrap();
}
