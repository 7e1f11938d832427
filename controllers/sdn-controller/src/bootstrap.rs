//! Bootstrap sequence.
//!
//! Runs once per leadership term, phase by phase. A failing phase aborts the
//! sequence with `ControllerError::Bootstrap`, except garbage collection
//! which only logs.

use crate::annotations;
use crate::controller::Controller;
use crate::error::{BootstrapPhase, ControllerError};
use crate::queues::QueueId;
use crate::reconciler::subnet::{ipam_strategy, subnet_excludes, subnet_gateway};
use crate::resync::spawn_resync;
use crate::store::WatchSet;
use crate::worker::spawn_workers;
use crds::{IP, Subnet, SubnetSpec, Vpc, VpcSpec};
use ipam::AllocationStrategy;
use sdn_client::{LbProtocol, owned_by};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Queues started once the VPC and subnet topology can be reconciled.
const TOPOLOGY_QUEUES: [QueueId; 4] = [
    QueueId::AddOrUpdateVpc,
    QueueId::DeleteVpc,
    QueueId::UpdateVpcStatus,
    QueueId::AddOrUpdateSubnet,
];

const NODE_QUEUES: [QueueId; 3] = [QueueId::AddNode, QueueId::UpdateNode, QueueId::DeleteNode];

const POD_QUEUES: [QueueId; 5] = [
    QueueId::AddPod,
    QueueId::UpdatePod,
    QueueId::DeletePod,
    QueueId::DeleteSubnet,
    QueueId::UpdateSubnetStatus,
];

impl Controller {
    /// Runs every bootstrap phase up to `Running`.
    pub async fn bootstrap(&self) -> Result<(), ControllerError> {
        self.enter(BootstrapPhase::AwaitLeadership);
        self.elector
            .acquire()
            .await
            .map_err(|e| ControllerError::bootstrap(BootstrapPhase::AwaitLeadership, e))?;

        self.enter(BootstrapPhase::SyncCaches);
        self.sync_caches().await?;

        self.enter(BootstrapPhase::InitDefaultVpc);
        self.cluster
            .create_vpc(&Vpc::new(&self.config.default_vpc, VpcSpec::default()))
            .await
            .map_err(|e| ControllerError::bootstrap(BootstrapPhase::InitDefaultVpc, e))?;

        self.enter(BootstrapPhase::InitTopology);
        self.init_topology()
            .await
            .map_err(|e| ControllerError::bootstrap(BootstrapPhase::InitTopology, e))?;

        self.enter(BootstrapPhase::InitIpam);
        self.init_ipam()?;

        self.enter(BootstrapPhase::GarbageCollect);
        let report = self.reconciler.garbage_collect().await;
        info!("Garbage collection finished: {:?}", report);

        self.enter(BootstrapPhase::StartWorkers);
        self.start_workers().await?;

        self.enter(BootstrapPhase::Running);
        Ok(())
    }

    async fn sync_caches(&self) -> Result<(), ControllerError> {
        let watch = WatchSet {
            services: self.config.enable_lb,
            network_policies: self.config.enable_np,
        };
        self.cluster
            .start(Arc::clone(&self.queues), watch, self.token.clone())
            .await
            .map_err(|e| ControllerError::bootstrap(BootstrapPhase::SyncCaches, e))?;

        match tokio::time::timeout(self.config.cache_sync_timeout, self.cluster.wait_synced()).await {
            Ok(result) => result.map_err(|e| ControllerError::bootstrap(BootstrapPhase::SyncCaches, e)),
            Err(_) => Err(ControllerError::bootstrap(
                BootstrapPhase::SyncCaches,
                format!("caches not synced within {:?}", self.config.cache_sync_timeout),
            )),
        }
    }

    fn builtin_subnet(&self, name: &str, cidr: &str, gateway: &str, excludes: Vec<String>, default: bool) -> Subnet {
        Subnet::new(
            name,
            SubnetSpec {
                vpc: Some(self.config.default_vpc.clone()),
                default,
                cidr_block: cidr.to_string(),
                gateway: gateway.to_string(),
                exclude_ips: excludes,
                ..Default::default()
            },
        )
    }

    /// Cluster router, default and node subnets, cluster load balancers.
    async fn init_topology(&self) -> Result<(), ControllerError> {
        let config = &self.config;
        self.sdn
            .create_logical_router(&config.cluster_router, &owned_by(&config.default_vpc))
            .await?;

        let default_subnet = self.builtin_subnet(
            &config.default_logical_switch,
            &config.default_cidr,
            &config.default_gateway,
            config.default_exclude_ips.clone(),
            true,
        );
        let node_subnet = self.builtin_subnet(
            &config.node_switch,
            &config.node_switch_cidr,
            &config.node_switch_gateway,
            vec![config.node_switch_gateway.clone()],
            false,
        );
        self.cluster.create_subnet(&default_subnet).await?;
        self.cluster.create_subnet(&node_subnet).await?;

        if config.enable_lb {
            self.sdn
                .create_load_balancer(&config.cluster_tcp_loadbalancer, LbProtocol::Tcp)
                .await?;
            self.sdn
                .create_load_balancer(&config.cluster_udp_loadbalancer, LbProtocol::Udp)
                .await?;
        }

        self.queues.enqueue(QueueId::AddOrUpdateVpc, &config.default_vpc);
        self.queues.enqueue(QueueId::AddOrUpdateSubnet, &config.default_logical_switch);
        self.queues.enqueue(QueueId::AddOrUpdateSubnet, &config.node_switch);
        Ok(())
    }

    /// Loads every subnet into the allocator, then replays the IP records.
    fn init_ipam(&self) -> Result<(), ControllerError> {
        for subnet in self.cluster.subnets() {
            let Some(name) = subnet.metadata.name.as_deref() else {
                continue;
            };
            if let Err(e) = self.load_subnet(&subnet) {
                // The subnet reconciler reports it on the resource
                warn!("Skipping subnet {} during IPAM init: {}", name, e);
            }
        }

        let node_excludes = vec![self.config.node_switch_gateway.clone()];
        let builtin = [
            (&self.config.default_logical_switch, &self.config.default_cidr, &self.config.default_exclude_ips),
            (&self.config.node_switch, &self.config.node_switch_cidr, &node_excludes),
        ];
        for (name, cidr, excludes) in builtin {
            if !self.ipam.contains_subnet(name) {
                self.ipam
                    .add_or_update_subnet(name, cidr, excludes, AllocationStrategy::Sequential)
                    .map_err(|e| ControllerError::bootstrap(BootstrapPhase::InitIpam, e))?;
            }
        }

        let records = self.cluster.ips();
        let mut failures = 0usize;
        for record in &records {
            if let Err(e) = self.replay_ip(record) {
                failures += 1;
                warn!(
                    "Failed to restore IP {}: {}",
                    record.metadata.name.as_deref().unwrap_or_default(),
                    e
                );
                if failures > self.config.ipam_init_max_failures {
                    return Err(ControllerError::bootstrap(
                        BootstrapPhase::InitIpam,
                        format!("more than {} IP records failed to load", self.config.ipam_init_max_failures),
                    ));
                }
            }
        }
        info!(
            "IPAM initialized: {} subnets, {} of {} IP records restored",
            self.ipam.subnet_names().len(),
            records.len() - failures,
            records.len()
        );
        Ok(())
    }

    fn load_subnet(&self, subnet: &Subnet) -> Result<(), ControllerError> {
        let name = subnet.metadata.name.as_deref().unwrap_or_default();
        let gateway = subnet_gateway(subnet)?;
        self.ipam.add_or_update_subnet(
            name,
            &subnet.spec.cidr_block,
            &subnet_excludes(subnet, &gateway),
            ipam_strategy(subnet.spec.allocation_strategy),
        )?;
        Ok(())
    }

    fn replay_ip(&self, record: &IP) -> Result<(), ControllerError> {
        let spec = &record.spec;
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let address = non_empty(&spec.ip_address);
        let mac = non_empty(&spec.mac_address);
        let allocation = self.ipam.allocate(
            &spec.owner_key(),
            &spec.subnet,
            address.as_deref(),
            mac.as_deref(),
        )?;
        debug!("Restored {} -> {}", spec.owner_key(), allocation.ip_string());
        Ok(())
    }

    async fn start_workers(&self) -> Result<(), ControllerError> {
        let workers = self.config.worker_num;
        self.tasks().extend(spawn_resync(&self.reconciler, &self.token));

        self.spawn(&TOPOLOGY_QUEUES, workers);
        self.wait_for_switches().await?;

        self.spawn(&NODE_QUEUES, workers);
        self.wait_for_nodes().await?;

        self.spawn(&[QueueId::AddNamespace], 1);
        self.spawn(&POD_QUEUES, workers);
        if self.config.enable_lb {
            self.spawn(&[QueueId::UpdateService], workers);
            self.spawn(&[QueueId::DeleteService], 1);
        }
        if self.config.enable_np {
            self.spawn(&[QueueId::UpdateNp, QueueId::DeleteNp], workers);
        }
        Ok(())
    }

    fn spawn(&self, ids: &[QueueId], count: usize) {
        let mut tasks = self.tasks();
        for &id in ids {
            tasks.extend(spawn_workers(&self.reconciler, &self.queues, id, count));
        }
    }

    async fn wait_for_switches(&self) -> Result<(), ControllerError> {
        let switches = [&self.config.default_logical_switch, &self.config.node_switch];
        loop {
            let mut missing = Vec::new();
            for &switch in &switches {
                match self.sdn.logical_switch_exists(switch).await {
                    Ok(true) => {}
                    Ok(false) => missing.push(switch.as_str()),
                    Err(e) => {
                        debug!("Checking logical switch {} failed: {}", switch, e);
                        missing.push(switch.as_str());
                    }
                }
            }
            if missing.is_empty() {
                return Ok(());
            }
            info!("Waiting for logical switches {:?}", missing);
            self.pause().await?;
        }
    }

    async fn wait_for_nodes(&self) -> Result<(), ControllerError> {
        loop {
            let pending: Vec<String> = self
                .cluster
                .nodes()
                .iter()
                .filter(|node| !annotations::is_allocated(node.metadata.annotations.as_ref()))
                .filter_map(|node| node.metadata.name.clone())
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            info!("Waiting for {} nodes to get an address", pending.len());
            for node in &pending {
                self.queues.enqueue(QueueId::AddNode, node);
            }
            self.pause().await?;
        }
    }

    async fn pause(&self) -> Result<(), ControllerError> {
        tokio::select! {
            () = self.token.cancelled() => Err(ControllerError::bootstrap(
                BootstrapPhase::StartWorkers,
                "shutdown requested",
            )),
            () = tokio::time::sleep(self.config.readiness_poll) => Ok(()),
        }
    }
}

#[cfg(test)]
#[path = "bootstrap_test.rs"]
mod bootstrap_test;
