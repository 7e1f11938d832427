use super::*;
use crate::config::Configuration;
use crate::error::ErrorClass;
use crate::leader::StandaloneElector;
use crate::mock_store::MockCluster;
use crate::store::ClusterClient;
use crate::test_utils::*;
use sdn_client::{LogicalSwitchPort, MockSdnClient};
use std::time::Duration;

fn fast_config() -> Configuration {
    let mut config = test_config();
    config.readiness_poll = Duration::from_millis(10);
    config.cache_sync_timeout = Duration::from_secs(5);
    config
}

fn test_controller(config: Configuration) -> (Arc<Controller>, MockCluster, MockSdnClient) {
    let cluster = MockCluster::new();
    let sdn = MockSdnClient::new();
    let controller = Controller::new(
        config,
        Arc::new(cluster.clone()),
        Arc::new(sdn.clone()),
        Arc::new(StandaloneElector),
    );
    (Arc::new(controller), cluster, sdn)
}

async fn wait_running(controller: &Controller) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while controller.phase() != BootstrapPhase::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_bootstrap_builds_topology_and_restores_addresses() {
    let (controller, cluster, sdn) = test_controller(fast_config());
    cluster.add_node(create_test_node("worker-1", "192.168.0.11"));

    let mut pod = create_test_pod("default", "web", Some("worker-1"));
    set_annotation(&mut pod.metadata, annotations::ALLOCATED, "true");
    set_annotation(&mut pod.metadata, annotations::IP_ADDRESS, "10.16.0.7");
    cluster.add_pod(pod);
    cluster.add_ip(create_test_ip("default", "web", "ovn-default", "10.16.0.7"));

    sdn.add_port(LogicalSwitchPort {
        name: "gone.default".to_string(),
        switch: "ovn-default".to_string(),
        mac: "00:00:00:aa:bb:cc".to_string(),
        ips: vec!["10.16.0.9".to_string()],
        external_ids: owned_by("default/gone"),
    });

    let running = Arc::clone(&controller);
    let handle = tokio::spawn(async move { running.run().await });
    wait_running(&controller).await;

    assert_eq!(
        cluster.started(),
        Some(WatchSet {
            services: true,
            network_policies: true
        })
    );
    assert!(cluster.vpc("ovn-cluster").is_some());
    assert!(sdn.router("ovn-cluster-router").is_some());
    assert!(sdn.switch("ovn-default").is_some());
    assert!(sdn.switch("join").is_some());
    assert!(sdn.load_balancer("cluster-tcp-loadbalancer").is_some());
    assert!(sdn.load_balancer("cluster-udp-loadbalancer").is_some());

    // Replayed record keeps its address; the orphaned port is collected
    let restored = controller.ipam.get_allocation("default/web").unwrap();
    assert_eq!(restored.ip_string(), "10.16.0.7");
    assert!(sdn.port("gone.default").is_none());

    // Workers were gated on every node having an address
    let node = cluster.node_annotations("worker-1");
    assert_eq!(node.get(annotations::ALLOCATED).map(String::as_str), Some("true"));
    assert_eq!(node.get(annotations::IP_ADDRESS).map(String::as_str), Some("100.64.0.2"));

    controller.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_bootstrap_without_load_balancers() {
    let mut config = fast_config();
    config.enable_lb = false;
    let (controller, cluster, sdn) = test_controller(config);

    controller.bootstrap().await.unwrap();

    assert_eq!(controller.phase(), BootstrapPhase::Running);
    assert_eq!(
        cluster.started(),
        Some(WatchSet {
            services: false,
            network_policies: true
        })
    );
    assert!(sdn.load_balancer("cluster-tcp-loadbalancer").is_none());
    controller.shutdown();
}

#[tokio::test]
async fn test_cache_sync_timeout_is_fatal() {
    let mut config = fast_config();
    config.cache_sync_timeout = Duration::from_millis(20);
    let (controller, cluster, _) = test_controller(config);
    cluster.never_sync();

    let err = controller.bootstrap().await.unwrap_err();

    assert!(matches!(
        err,
        ControllerError::Bootstrap {
            phase: BootstrapPhase::SyncCaches,
            ..
        }
    ));
    assert_eq!(err.class(), ErrorClass::Fatal);
    assert_eq!(controller.phase(), BootstrapPhase::SyncCaches);
}

#[tokio::test]
async fn test_ip_replay_failures_over_budget_are_fatal() {
    let mut config = fast_config();
    config.ipam_init_max_failures = 1;
    let (controller, cluster, _) = test_controller(config);
    cluster.add_ip(create_test_ip("default", "a", "missing", "10.99.0.2"));
    cluster.add_ip(create_test_ip("default", "b", "missing", "10.99.0.3"));

    let err = controller.bootstrap().await.unwrap_err();

    assert!(matches!(
        err,
        ControllerError::Bootstrap {
            phase: BootstrapPhase::InitIpam,
            ..
        }
    ));
}

#[tokio::test]
async fn test_ip_replay_failures_within_budget_are_skipped() {
    let (controller, cluster, _) = test_controller(fast_config());
    cluster.add_pod(create_test_pod("default", "a", None));
    cluster.add_ip(create_test_ip("default", "a", "missing", "10.99.0.2"));

    controller.bootstrap().await.unwrap();

    assert!(controller.ipam.get_allocation("default/a").is_none());
    controller.shutdown();
}

#[tokio::test]
async fn test_shutdown_interrupts_readiness_gate() {
    let (controller, cluster, _) = test_controller(fast_config());
    cluster.add_node(create_test_node("worker-1", "192.168.0.11"));

    controller.shutdown();
    let err = controller.wait_for_nodes().await.unwrap_err();

    assert!(matches!(
        err,
        ControllerError::Bootstrap {
            phase: BootstrapPhase::StartWorkers,
            ..
        }
    ));
    assert_eq!(controller.queues.get(QueueId::AddNode).len(), 1);
}
