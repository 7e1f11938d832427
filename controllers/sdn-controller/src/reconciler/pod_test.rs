use super::*;
use crate::error::ErrorClass;
use crate::test_utils::*;
use k8s_openapi::api::core::v1::{PodSpec, PodStatus};

#[tokio::test]
async fn test_pod_gets_address_port_and_record() {
    let (reconciler, cluster, sdn) = test_reconciler();
    with_default_subnet(&reconciler, &cluster, &sdn).await;
    cluster.add_pod(create_test_pod("default", "web", Some("worker-1")));

    reconciler.reconcile_pod("default/web").await.unwrap();

    let pod_annotations = cluster.pod_annotations("default", "web");
    assert_eq!(pod_annotations[annotations::ALLOCATED], "true");
    assert_eq!(pod_annotations[annotations::IP_ADDRESS], "10.16.0.2");
    assert_eq!(pod_annotations[annotations::CIDR], "10.16.0.0/16");
    assert_eq!(pod_annotations[annotations::GATEWAY], "10.16.0.1");
    assert_eq!(pod_annotations[annotations::LOGICAL_SWITCH], "ovn-default");

    let port = sdn.port("web.default").unwrap();
    assert_eq!(port.switch, "ovn-default");
    assert_eq!(port.ips, vec!["10.16.0.2"]);
    assert_eq!(owner_of(&port.external_ids), Some("default/web"));

    let record = cluster.ip_record("web.default").unwrap();
    assert_eq!(record.spec.node_name, "worker-1");
    assert_eq!(record.spec.owner_key(), "default/web");
    assert_eq!(record.spec.mac_address, pod_annotations[annotations::MAC_ADDRESS]);
}

#[tokio::test]
async fn test_requested_address_is_honoured() {
    let (reconciler, cluster, sdn) = test_reconciler();
    with_default_subnet(&reconciler, &cluster, &sdn).await;
    let mut pod = create_test_pod("default", "db", None);
    set_annotation(&mut pod.metadata, annotations::IP_ADDRESS, "10.16.0.50");
    set_annotation(&mut pod.metadata, annotations::MAC_ADDRESS, "00:00:00:AA:BB:CC");
    cluster.add_pod(pod);

    reconciler.reconcile_pod("default/db").await.unwrap();

    let port = sdn.port("db.default").unwrap();
    assert_eq!(port.ips, vec!["10.16.0.50"]);
    assert_eq!(port.mac, "00:00:00:aa:bb:cc");
}

#[tokio::test]
async fn test_requested_address_outside_subnet_is_invariant_violation() {
    let (reconciler, cluster, sdn) = test_reconciler();
    with_default_subnet(&reconciler, &cluster, &sdn).await;
    let mut pod = create_test_pod("default", "db", None);
    set_annotation(&mut pod.metadata, annotations::IP_ADDRESS, "192.168.1.5");
    cluster.add_pod(pod);

    let err = reconciler.reconcile_pod("default/db").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvariantViolation);
    assert!(sdn.port("db.default").is_none());
}

#[tokio::test]
async fn test_pod_placed_by_namespace_binding() {
    let (reconciler, cluster, sdn) = test_reconciler();
    with_default_subnet(&reconciler, &cluster, &sdn).await;
    let mut shop = create_test_subnet("shop", "10.1.0.0/24", None);
    shop.spec.namespaces = vec!["shop".to_string()];
    cluster.add_subnet(shop);
    reconciler.reconcile_subnet("shop").await.unwrap();
    cluster.add_namespace(create_test_namespace("shop"));
    cluster.add_pod(create_test_pod("shop", "cart", None));

    reconciler.reconcile_pod("shop/cart").await.unwrap();

    assert_eq!(sdn.port("cart.shop").unwrap().ips, vec!["10.1.0.2"]);
}

#[tokio::test]
async fn test_exhausted_subnet_is_reported_on_its_status() {
    let (reconciler, cluster, sdn) = test_reconciler();
    with_default_subnet(&reconciler, &cluster, &sdn).await;
    let mut tiny = create_test_subnet("tiny", "10.2.0.0/30", None);
    tiny.spec.namespaces = vec!["tiny".to_string()];
    cluster.add_subnet(tiny);
    reconciler.reconcile_subnet("tiny").await.unwrap();
    cluster.add_namespace(create_test_namespace("tiny"));
    cluster.add_pod(create_test_pod("tiny", "a", None));
    cluster.add_pod(create_test_pod("tiny", "b", None));

    reconciler.reconcile_pod("tiny/a").await.unwrap();
    let err = reconciler.reconcile_pod("tiny/b").await.unwrap_err();

    assert_eq!(err.class(), ErrorClass::InvariantViolation);
    let status = cluster.subnet_status("tiny").unwrap();
    let ready = status.conditions.iter().find(|c| c.type_ == "Ready").unwrap();
    assert_eq!(ready.status, "False");
    assert_eq!(ready.reason, "AddressSpaceExhausted");
}

#[tokio::test]
async fn test_host_network_and_missing_pods_are_skipped() {
    let (reconciler, cluster, sdn) = test_reconciler();
    with_default_subnet(&reconciler, &cluster, &sdn).await;
    let mut pod = create_test_pod("kube-system", "proxy", None);
    pod.spec = Some(PodSpec {
        host_network: Some(true),
        ..Default::default()
    });
    cluster.add_pod(pod);

    reconciler.reconcile_pod("kube-system/proxy").await.unwrap();
    reconciler.reconcile_pod("default/gone").await.unwrap();

    assert!(sdn.port("proxy.kube-system").is_none());
    assert!(reconciler.ipam.get_allocation("kube-system/proxy").is_none());
}

#[tokio::test]
async fn test_pod_waits_for_its_subnet() {
    let (reconciler, cluster, _) = test_reconciler();
    cluster.add_pod(create_test_pod("default", "web", None));

    let err = reconciler.reconcile_pod("default/web").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Transient);
}

#[tokio::test]
async fn test_eip_follows_annotation() {
    let (reconciler, cluster, sdn) = test_reconciler();
    with_default_subnet(&reconciler, &cluster, &sdn).await;
    let mut pod = create_test_pod("default", "web", None);
    set_annotation(&mut pod.metadata, annotations::EIP, "172.20.0.10");
    cluster.add_pod(pod);

    reconciler.reconcile_pod("default/web").await.unwrap();
    let rules = sdn.nat_rules();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].router, "ovn-cluster-router");
    assert_eq!(rules[0].external_ip, "172.20.0.10");
    assert_eq!(rules[0].logical_ip, "10.16.0.2");

    cluster.remove_pod_annotation("default", "web", annotations::EIP);
    reconciler.reconcile_pod_update("default/web").await.unwrap();
    assert!(sdn.nat_rules().is_empty());
}

#[tokio::test]
async fn test_update_repairs_lost_annotations() {
    let (reconciler, cluster, sdn) = test_reconciler();
    with_default_subnet(&reconciler, &cluster, &sdn).await;
    cluster.add_pod(create_test_pod("default", "web", None));
    reconciler.reconcile_pod("default/web").await.unwrap();

    cluster.remove_pod_annotation("default", "web", annotations::IP_ADDRESS);
    reconciler.reconcile_pod_update("default/web").await.unwrap();

    // Same owner keeps its address
    assert_eq!(cluster.pod_annotations("default", "web")[annotations::IP_ADDRESS], "10.16.0.2");
    assert_eq!(reconciler.ipam.owners("ovn-default").len(), 1);
}

#[tokio::test]
async fn test_delete_releases_finished_pod() {
    let (reconciler, cluster, sdn) = test_reconciler();
    with_default_subnet(&reconciler, &cluster, &sdn).await;
    let mut pod = create_test_pod("default", "job", None);
    set_annotation(&mut pod.metadata, annotations::EIP, "172.20.0.10");
    cluster.add_pod(pod.clone());
    reconciler.reconcile_pod("default/job").await.unwrap();

    pod.status = Some(PodStatus {
        phase: Some("Succeeded".to_string()),
        ..Default::default()
    });
    cluster.add_pod(pod);
    reconciler.reconcile_delete_pod("default/job").await.unwrap();

    assert!(sdn.port("job.default").is_none());
    assert!(sdn.nat_rules().is_empty());
    assert!(cluster.ip_record("job.default").is_none());
    assert!(reconciler.ipam.get_allocation("default/job").is_none());

    // The address goes back to the pool
    cluster.add_pod(create_test_pod("default", "next", None));
    reconciler.reconcile_pod("default/next").await.unwrap();
    assert_eq!(sdn.port("next.default").unwrap().ips, vec!["10.16.0.2"]);
}

#[tokio::test]
async fn test_delete_skips_live_pod() {
    let (reconciler, cluster, sdn) = test_reconciler();
    with_default_subnet(&reconciler, &cluster, &sdn).await;
    cluster.add_pod(create_test_pod("default", "web", None));
    reconciler.reconcile_pod("default/web").await.unwrap();

    reconciler.reconcile_delete_pod("default/web").await.unwrap();

    assert!(sdn.port("web.default").is_some());
    assert!(reconciler.ipam.get_allocation("default/web").is_some());
}
