//! Garbage collection
//!
//! Removes SDN objects and IP records whose owning resource is gone. The
//! full pass runs once during bootstrap; ports are additionally swept by a
//! periodic mark-and-clean pass.

use super::Reconciler;
use super::subnet::EXTERNAL_ID_ROUTER;
use crate::error::ControllerError;
use crate::router::split_key;
use sdn_client::owner_of;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Objects removed by a garbage collection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Logical switches of deleted Subnets
    pub switches: usize,
    /// Logical routers of deleted Vpcs
    pub routers: usize,
    /// Ports of deleted pods and nodes
    pub ports: usize,
    /// IP records of deleted pods and nodes
    pub ip_records: usize,
    /// Load balancer VIPs no service wants
    pub vips: usize,
    /// Port groups of deleted NetworkPolicies
    pub port_groups: usize,
}

fn log_step(step: &str, result: Result<usize, ControllerError>) -> usize {
    match result {
        Ok(count) => {
            if count > 0 {
                info!("Garbage collection removed {} {}", count, step);
            }
            count
        }
        Err(e) => {
            warn!("Garbage collection of {} failed: {}", step, e);
            0
        }
    }
}

impl Reconciler {
    /// Full garbage collection. Each step runs even if an earlier one failed.
    pub async fn garbage_collect(&self) -> GcReport {
        GcReport {
            switches: log_step("logical switches", self.gc_switches().await),
            routers: log_step("logical routers", self.gc_routers().await),
            ports: log_step("logical switch ports", self.gc_ports().await),
            ip_records: log_step("IP records", self.gc_ip_records().await),
            vips: log_step("load balancer VIPs", self.gc_load_balancers().await),
            port_groups: log_step("port groups", self.gc_port_groups().await),
        }
    }

    async fn gc_switches(&self) -> Result<usize, ControllerError> {
        let mut removed = 0;
        for switch in self.sdn.list_logical_switches().await? {
            let Some(owner) = owner_of(&switch.external_ids) else {
                continue;
            };
            if self.cluster.subnet(owner).is_some() {
                continue;
            }
            let router = switch
                .external_ids
                .get(EXTERNAL_ID_ROUTER)
                .cloned()
                .unwrap_or_else(|| self.config.cluster_router.clone());
            debug!("Removing logical switch {} of deleted Subnet {}", switch.name, owner);
            self.sdn.delete_logical_switch(&switch.name, &router).await?;
            self.ipam.delete_subnet(owner);
            removed += 1;
        }
        Ok(removed)
    }

    async fn gc_routers(&self) -> Result<usize, ControllerError> {
        let mut removed = 0;
        for router in self.sdn.list_logical_routers().await? {
            let Some(owner) = owner_of(&router.external_ids) else {
                continue;
            };
            if router.name == self.config.cluster_router || self.cluster.vpc(owner).is_some() {
                continue;
            }
            debug!("Removing logical router {} of deleted Vpc {}", router.name, owner);
            self.sdn.delete_logical_router(&router.name).await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn gc_ports(&self) -> Result<usize, ControllerError> {
        let mut removed = 0;
        for port in self.sdn.list_logical_switch_ports(None).await? {
            let Some(owner) = owner_of(&port.external_ids) else {
                continue;
            };
            if self.owner_alive(owner) {
                continue;
            }
            debug!("Removing logical switch port {} of {}", port.name, owner);
            self.sdn.delete_logical_switch_port(&port.name).await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn gc_ip_records(&self) -> Result<usize, ControllerError> {
        let mut removed = 0;
        for record in self.cluster.ips() {
            let owner = record.spec.owner_key();
            if self.owner_alive(&owner) {
                continue;
            }
            let Some(name) = record.metadata.name.as_deref() else {
                continue;
            };
            let _guard = self.lock_owner(&owner).await;
            if self.owner_alive(&owner) {
                continue;
            }
            debug!("Removing IP record {} of {}", name, owner);
            self.cluster.delete_ip(name).await?;
            self.ipam.release(&owner);
            removed += 1;
        }
        Ok(removed)
    }

    async fn gc_load_balancers(&self) -> Result<usize, ControllerError> {
        if !self.config.enable_lb {
            return Ok(0);
        }
        let desired = self.all_desired_vips();
        let managed = [&self.config.cluster_tcp_loadbalancer, &self.config.cluster_udp_loadbalancer];
        let mut removed = 0;
        for lb in self.sdn.list_load_balancers().await? {
            if !managed.contains(&&lb.name) {
                continue;
            }
            for vip in lb.vips.keys() {
                let wanted = desired
                    .iter()
                    .any(|d| d.lb == lb.name && &d.vip == vip);
                if !wanted {
                    debug!("Removing VIP {} from {}", vip, lb.name);
                    self.sdn.delete_load_balancer_vip(&lb.name, vip).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn gc_port_groups(&self) -> Result<usize, ControllerError> {
        if !self.config.enable_np {
            return Ok(0);
        }
        let mut removed = 0;
        for group in self.sdn.list_port_groups().await? {
            let Some(owner) = owner_of(&group.external_ids) else {
                continue;
            };
            let (namespace, name) = split_key(owner);
            if self.cluster.network_policy(namespace, name).is_some() {
                continue;
            }
            debug!("Removing port group {} of deleted NetworkPolicy {}", group.name, owner);
            self.sdn.delete_port_group(&group.name).await?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Mark-and-clean sweep of switch ports.
    ///
    /// A port whose owner is gone is only deleted when the previous pass
    /// already found it orphaned, so ports of pods still being created are
    /// not removed. Returns the number of ports deleted. Confirmed orphans
    /// left unprocessed by a failure stay marked for the next pass.
    pub async fn port_gc_pass(&self) -> Result<usize, ControllerError> {
        let orphans: Vec<(String, String)> = self
            .sdn
            .list_logical_switch_ports(None)
            .await?
            .into_iter()
            .filter_map(|port| {
                let owner = owner_of(&port.external_ids)?.to_string();
                (!self.owner_alive(&owner)).then_some((port.name, owner))
            })
            .collect();
        let previous = self.orphan_ports().clone();

        let mut marked = HashSet::new();
        let mut confirmed = Vec::new();
        for (port, owner) in orphans {
            if previous.contains(&port) {
                confirmed.push((port, owner));
            } else {
                marked.insert(port);
            }
        }
        if !marked.is_empty() {
            debug!("Marked {} orphaned ports for the next pass", marked.len());
        }

        let mut removed = 0;
        let mut pending = confirmed.into_iter();
        while let Some((port, owner)) = pending.next() {
            match self.remove_orphan_port(&port, &owner).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    marked.insert(port);
                    marked.extend(pending.map(|(port, _)| port));
                    *self.orphan_ports() = marked;
                    return Err(e);
                }
            }
        }
        *self.orphan_ports() = marked;
        Ok(removed)
    }

    /// Deletes one orphaned port under its owner's key lock. Returns false
    /// when the owner came back in the meantime.
    async fn remove_orphan_port(&self, port: &str, owner: &str) -> Result<bool, ControllerError> {
        let _guard = self.lock_owner(owner).await;
        if self.owner_alive(owner) {
            debug!("Keeping logical switch port {}, {} is back", port, owner);
            return Ok(false);
        }
        info!("Removing orphaned logical switch port {} of {}", port, owner);
        self.sdn.delete_logical_switch_port(port).await?;
        self.cluster.delete_ip(port).await?;
        self.ipam.release(owner);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::queues::QueueId;
    use crate::test_utils::*;
    use sdn_client::{LogicalSwitch, LogicalSwitchPort, SdnClientTrait, SdnError, owned_by};
    use std::time::Duration;

    fn orphan_port(name: &str, owner: &str) -> LogicalSwitchPort {
        LogicalSwitchPort {
            name: name.to_string(),
            switch: "ovn-default".to_string(),
            mac: "00:00:00:00:00:01".to_string(),
            ips: vec!["10.16.0.9".to_string()],
            external_ids: owned_by(owner),
        }
    }

    #[tokio::test]
    async fn test_garbage_collect_removes_dead_owners() {
        let (reconciler, cluster, sdn) = test_reconciler();
        with_default_subnet(&reconciler, &cluster, &sdn).await;
        cluster.add_pod(create_test_pod("default", "live", None));
        reconciler.reconcile_pod("default/live").await.unwrap();

        sdn.add_port(orphan_port("dead.default", "default/dead"));
        cluster.add_ip(create_test_ip("default", "dead", "ovn-default", "10.16.0.9"));
        sdn_router(&sdn, "stale-vpc").await;
        sdn.add_switch(LogicalSwitch {
            name: "stale".to_string(),
            cidr: "10.99.0.0/24".to_string(),
            gateway: "10.99.0.1".to_string(),
            exclude_ips: Vec::new(),
            gateway_mac: String::new(),
            external_ids: owned_by("stale"),
        });

        let report = reconciler.garbage_collect().await;

        assert_eq!(report.ports, 1);
        assert_eq!(report.ip_records, 1);
        assert_eq!(report.switches, 1);
        assert_eq!(report.routers, 1);
        assert!(sdn.port("live.default").is_some());
        assert!(sdn.port("dead.default").is_none());
        assert!(cluster.ip_record("dead.default").is_none());
        assert!(sdn.switch("ovn-default").is_some());
        assert!(sdn.router("ovn-cluster-router").is_some());
    }

    #[tokio::test]
    async fn test_garbage_collect_removes_unwanted_vips() {
        let (reconciler, cluster, sdn) = test_reconciler();
        with_load_balancers(&sdn).await;
        cluster.add_service(create_test_service("default", "web", &["10.96.0.20"], &[("http", 80, "TCP")]));
        sdn.set_load_balancer_vip("cluster-tcp-loadbalancer", "10.96.0.20:80", &[]).await.unwrap();
        sdn.set_load_balancer_vip("cluster-tcp-loadbalancer", "10.96.0.99:80", &[]).await.unwrap();

        let report = reconciler.garbage_collect().await;

        assert_eq!(report.vips, 1);
        let vips = sdn.load_balancer("cluster-tcp-loadbalancer").unwrap().vips;
        assert!(vips.contains_key("10.96.0.20:80"));
        assert!(!vips.contains_key("10.96.0.99:80"));
    }

    #[tokio::test]
    async fn test_port_gc_needs_two_passes() {
        let (reconciler, cluster, sdn) = test_reconciler();
        with_default_subnet(&reconciler, &cluster, &sdn).await;
        sdn.add_port(orphan_port("dead.default", "default/dead"));

        assert_eq!(reconciler.port_gc_pass().await.unwrap(), 0);
        assert!(sdn.port("dead.default").is_some());

        assert_eq!(reconciler.port_gc_pass().await.unwrap(), 1);
        assert!(sdn.port("dead.default").is_none());
        assert!(reconciler.orphan_ports().is_empty());
    }

    #[tokio::test]
    async fn test_port_gc_forgets_owners_that_came_back() {
        let (reconciler, cluster, sdn) = test_reconciler();
        with_default_subnet(&reconciler, &cluster, &sdn).await;
        sdn.add_port(orphan_port("late.default", "default/late"));

        reconciler.port_gc_pass().await.unwrap();
        cluster.add_pod(create_test_pod("default", "late", None));
        assert_eq!(reconciler.port_gc_pass().await.unwrap(), 0);

        assert!(sdn.port("late.default").is_some());
        assert!(reconciler.orphan_ports().is_empty());
    }

    #[tokio::test]
    async fn test_port_gc_rechecks_owner_under_key_lock() {
        let (reconciler, cluster, sdn) = test_reconciler();
        with_default_subnet(&reconciler, &cluster, &sdn).await;
        reconciler.ipam.allocate("default/web", "ovn-default", None, None).unwrap();
        sdn.add_port(orphan_port("web.default", "default/web"));
        assert_eq!(reconciler.port_gc_pass().await.unwrap(), 0);

        // The pod worker holds the key while the pod is re-created
        let guard = reconciler.queues.lock_for(QueueId::AddPod).lock("default/web").await;
        let restarted = cluster.clone();
        let restart = async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            restarted.add_pod(create_test_pod("default", "web", None));
            drop(guard);
        };
        let (removed, ()) = tokio::join!(reconciler.port_gc_pass(), restart);

        assert_eq!(removed.unwrap(), 0);
        assert!(reconciler.ipam.get_allocation("default/web").is_some());
        assert!(sdn.port("web.default").is_some());
    }

    #[tokio::test]
    async fn test_port_gc_blocks_while_owner_key_is_held() {
        let (reconciler, cluster, sdn) = test_reconciler();
        with_default_subnet(&reconciler, &cluster, &sdn).await;
        reconciler.ipam.allocate("default/web", "ovn-default", None, None).unwrap();
        sdn.add_port(orphan_port("web.default", "default/web"));
        reconciler.port_gc_pass().await.unwrap();

        {
            let _guard = reconciler.queues.lock_for(QueueId::AddPod).lock("default/web").await;
            let blocked =
                tokio::time::timeout(Duration::from_millis(50), reconciler.port_gc_pass()).await;
            assert!(blocked.is_err());
            assert!(reconciler.ipam.get_allocation("default/web").is_some());
        }

        assert_eq!(reconciler.port_gc_pass().await.unwrap(), 1);
        assert!(reconciler.ipam.get_allocation("default/web").is_none());
    }

    #[tokio::test]
    async fn test_ip_record_gc_keeps_owner_that_came_back() {
        let (reconciler, cluster, sdn) = test_reconciler();
        with_default_subnet(&reconciler, &cluster, &sdn).await;
        cluster.add_ip(create_test_ip("default", "db", "ovn-default", "10.16.0.9"));

        let guard = reconciler.queues.lock_for(QueueId::AddPod).lock("default/db").await;
        let restarted = cluster.clone();
        let restart = async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            restarted.add_pod(create_test_pod("default", "db", None));
            drop(guard);
        };
        let (report, ()) = tokio::join!(reconciler.garbage_collect(), restart);

        assert_eq!(report.ip_records, 0);
        assert!(cluster.ip_record("db.default").is_some());
    }

    #[tokio::test]
    async fn test_port_gc_keeps_confirmed_marks_after_failure() {
        let (reconciler, cluster, sdn) = test_reconciler();
        with_default_subnet(&reconciler, &cluster, &sdn).await;
        sdn.add_port(orphan_port("a.default", "default/a"));
        sdn.add_port(orphan_port("b.default", "default/b"));
        assert_eq!(reconciler.port_gc_pass().await.unwrap(), 0);

        sdn.fail_next("delete_logical_switch_port", SdnError::Timeout(Duration::from_secs(1)));
        assert!(reconciler.port_gc_pass().await.is_err());
        assert_eq!(reconciler.orphan_ports().len(), 2);

        assert_eq!(reconciler.port_gc_pass().await.unwrap(), 2);
        assert!(sdn.port("a.default").is_none());
        assert!(sdn.port("b.default").is_none());
    }
}
