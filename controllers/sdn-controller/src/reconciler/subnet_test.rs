use super::*;
use crate::error::ErrorClass;
use crate::test_utils::*;

#[test]
fn test_subnet_gateway_derivation() {
    let subnet = create_test_subnet("a", "10.0.0.0/24", None);
    assert_eq!(subnet_gateway(&subnet).unwrap(), "10.0.0.1");

    let mut dual = create_test_subnet("b", "10.1.0.0/24,fd00:1::/64", None);
    dual.spec.gateway = "10.1.0.254".to_string();
    assert_eq!(subnet_gateway(&dual).unwrap(), "10.1.0.254,fd00:1::1");

    let excludes = subnet_excludes(&dual, "10.1.0.254,fd00:1::1");
    assert_eq!(excludes, vec!["10.1.0.254", "fd00:1::1"]);
}

#[tokio::test]
async fn test_reconcile_subnet_creates_switch_and_pool() {
    let (reconciler, cluster, sdn) = test_reconciler();
    with_default_vpc(&cluster, &sdn).await;
    let mut subnet = create_test_subnet("blue", "10.0.0.0/24", None);
    subnet.spec.exclude_ips = vec!["10.0.0.2..10.0.0.10".to_string()];
    subnet.spec.namespaces = vec!["shop".to_string()];
    cluster.add_subnet(subnet);

    reconciler.reconcile_subnet("blue").await.unwrap();

    let switch = sdn.switch("blue").unwrap();
    assert_eq!(switch.gateway, "10.0.0.1");
    assert_eq!(switch.external_ids.get(EXTERNAL_ID_ROUTER).unwrap(), "ovn-cluster-router");
    assert!(!switch.gateway_mac.is_empty());

    // Gateway and exclude range are never handed out
    let allocation = reconciler.ipam.allocate("default/web", "blue", None, None).unwrap();
    assert_eq!(allocation.ip_string(), "10.0.0.11");

    let status = cluster.subnet_status("blue").unwrap();
    assert!(status.conditions.iter().all(Condition::is_true));
    assert_eq!(reconciler.queues.get(QueueId::AddNamespace).len(), 1);
    assert_eq!(reconciler.queues.get(QueueId::UpdateVpcStatus).len(), 1);

    // The router port MAC survives a second pass
    reconciler.reconcile_subnet("blue").await.unwrap();
    assert_eq!(sdn.switch("blue").unwrap().gateway_mac, switch.gateway_mac);
}

#[tokio::test]
async fn test_subnet_with_missing_vpc_is_transient() {
    let (reconciler, cluster, _) = test_reconciler();
    cluster.add_subnet(create_test_subnet("blue", "10.0.0.0/24", Some("nowhere")));

    let err = reconciler.reconcile_subnet("blue").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Transient);
    assert!(!reconciler.ipam.contains_subnet("blue"));
}

#[tokio::test]
async fn test_invalid_subnets_are_rejected() {
    let (reconciler, cluster, sdn) = test_reconciler();
    with_default_vpc(&cluster, &sdn).await;

    cluster.add_subnet(create_test_subnet("bad-cidr", "10.0.0.0/33", None));
    let mut outside = create_test_subnet("bad-gw", "10.1.0.0/24", None);
    outside.spec.gateway = "10.2.0.1".to_string();
    cluster.add_subnet(outside);
    let mut mismatch = create_test_subnet("bad-proto", "10.3.0.0/24", None);
    mismatch.spec.protocol = Some(SubnetProtocol::IPv6);
    cluster.add_subnet(mismatch);

    for (name, reason) in [
        ("bad-cidr", "InvalidCIDR"),
        ("bad-gw", "InvalidGateway"),
        ("bad-proto", "ProtocolMismatch"),
    ] {
        let err = reconciler.reconcile_subnet(name).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvariantViolation, "{}", name);
        let status = cluster.subnet_status(name).unwrap();
        assert_eq!(status.conditions[0].reason, reason);
        assert!(sdn.switch(name).is_none());
    }
}

#[tokio::test]
async fn test_overlapping_subnets_in_same_vpc_conflict() {
    let (reconciler, cluster, sdn) = test_reconciler();
    with_default_vpc(&cluster, &sdn).await;
    cluster.add_vpc(create_test_vpc("blue"));
    sdn_router(&sdn, "blue").await;

    cluster.add_subnet(create_test_subnet("a", "10.0.0.0/16", None));
    cluster.add_subnet(create_test_subnet("b", "10.0.1.0/24", None));
    cluster.add_subnet(create_test_subnet("c", "10.0.1.0/24", Some("blue")));

    let err = reconciler.reconcile_subnet("b").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvariantViolation);
    assert_eq!(cluster.subnet_status("b").unwrap().conditions[0].reason, "CIDRConflict");

    // Same block in another VPC is fine
    reconciler.reconcile_subnet("c").await.unwrap();
    assert!(sdn.switch("c").is_some());
}

#[tokio::test]
async fn test_subnet_status_counts_usage_once() {
    let (reconciler, cluster, sdn) = test_reconciler();
    with_default_vpc(&cluster, &sdn).await;
    cluster.add_subnet(create_test_subnet("blue", "10.0.0.0/29", None));
    reconciler.reconcile_subnet("blue").await.unwrap();
    reconciler.ipam.allocate("default/web", "blue", None, None).unwrap();

    reconciler.reconcile_subnet_status("blue").await.unwrap();
    let status = cluster.subnet_status("blue").unwrap();
    // 6 usable addresses, one gateway, one allocated
    assert!((status.v4_using_ips - 1.0).abs() < f64::EPSILON);
    assert!((status.v4_available_ips - 4.0).abs() < f64::EPSILON);
    assert!(status.last_reconciled.is_some());

    let patches = cluster.status_patch_count();
    reconciler.reconcile_subnet_status("blue").await.unwrap();
    assert_eq!(cluster.status_patch_count(), patches);
}

#[tokio::test]
async fn test_delete_subnet_removes_switch_and_pool() {
    let (reconciler, cluster, sdn) = test_reconciler();
    with_default_vpc(&cluster, &sdn).await;
    cluster.add_subnet(create_test_subnet("blue", "10.0.0.0/24", None));
    reconciler.reconcile_subnet("blue").await.unwrap();

    cluster.remove_subnet("blue");
    reconciler.reconcile_delete_subnet("blue").await.unwrap();

    assert!(sdn.switch("blue").is_none());
    assert!(!reconciler.ipam.contains_subnet("blue"));
}

#[tokio::test]
async fn test_delete_subnet_leaves_foreign_switch() {
    let (reconciler, _, sdn) = test_reconciler();
    sdn.add_switch(LogicalSwitch {
        name: "manual".to_string(),
        cidr: "192.168.0.0/24".to_string(),
        gateway: "192.168.0.1".to_string(),
        exclude_ips: Vec::new(),
        gateway_mac: String::new(),
        external_ids: Default::default(),
    });

    reconciler.reconcile_delete_subnet("manual").await.unwrap();
    assert!(sdn.switch("manual").is_some());
}
