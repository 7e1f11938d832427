//! Subnet reconciler
//!
//! Handles: Subnet add/update/delete and usage status

use super::Reconciler;
use crate::error::ControllerError;
use crate::queues::QueueId;
use chrono::Utc;
use crds::{
    AllocationStrategy, CONDITION_READY, CONDITION_VALIDATED, Condition, Subnet, SubnetProtocol,
    SubnetStatus, conditions_differ, set_condition,
};
use ipam::net::{append_gateway, check_cidrs, check_protocol, cidr_conflict, cidr_contains_ip, derive_gateway, generate_mac};
use ipam::{PoolSnapshot, Protocol};
use sdn_client::{LogicalSwitch, owned_by, owner_of};
use tracing::{debug, info, warn};

/// `external_ids` key recording the router a switch is attached to
pub const EXTERNAL_ID_ROUTER: &str = "router";

/// Allocator strategy for a Subnet's declared strategy.
pub fn ipam_strategy(strategy: AllocationStrategy) -> ipam::AllocationStrategy {
    match strategy {
        AllocationStrategy::Sequential => ipam::AllocationStrategy::Sequential,
        AllocationStrategy::Random => ipam::AllocationStrategy::Random,
    }
}

/// Gateway of a subnet: the declared one (completed for dual stack) or the first usable address(es).
pub fn subnet_gateway(subnet: &Subnet) -> Result<String, ipam::IpamError> {
    let cidr = &subnet.spec.cidr_block;
    let gateway = subnet.spec.gateway.trim();
    if gateway.is_empty() {
        return derive_gateway(cidr);
    }
    let gateway_protocol = check_protocol(gateway)?;
    if gateway_protocol != Protocol::Dual && check_protocol(cidr)? == Protocol::Dual {
        return append_gateway(gateway, cidr);
    }
    Ok(gateway.to_string())
}

/// Exclude list handed to the allocator: declared excludes plus the gateway(s).
pub fn subnet_excludes(subnet: &Subnet, gateway: &str) -> Vec<String> {
    let mut excludes = subnet.spec.exclude_ips.clone();
    for member in gateway.split(',').filter(|m| !m.is_empty()) {
        if !excludes.iter().any(|e| e == member) {
            excludes.push(member.to_string());
        }
    }
    excludes
}

fn protocol_matches(declared: SubnetProtocol, actual: Protocol) -> bool {
    matches!(
        (declared, actual),
        (SubnetProtocol::IPv4, Protocol::IPv4)
            | (SubnetProtocol::IPv6, Protocol::IPv6)
            | (SubnetProtocol::Dual, Protocol::Dual)
    )
}

/// Status counters as reported on the Subnet.
#[allow(clippy::cast_precision_loss, reason = "counters are reported as floating point")]
pub fn usage_status(snapshot: &PoolSnapshot, current: &SubnetStatus) -> SubnetStatus {
    SubnetStatus {
        v4_available_ips: snapshot.v4_available as f64,
        v4_using_ips: snapshot.v4_using as f64,
        v6_available_ips: snapshot.v6_available as f64,
        v6_using_ips: snapshot.v6_using as f64,
        conditions: current.conditions.clone(),
        last_reconciled: current.last_reconciled,
    }
}

/// True when the usage counters of `status` disagree with `snapshot`.
pub fn usage_differs(status: Option<&SubnetStatus>, snapshot: &PoolSnapshot) -> bool {
    let current = status.cloned().unwrap_or_default();
    let desired = usage_status(snapshot, &current);
    #[allow(clippy::float_cmp, reason = "both sides come from the same integer conversion")]
    let differs = current.v4_available_ips != desired.v4_available_ips
        || current.v4_using_ips != desired.v4_using_ips
        || current.v6_available_ips != desired.v6_available_ips
        || current.v6_using_ips != desired.v6_using_ips;
    differs
}

impl Reconciler {
    /// Validates a Subnet, loads it into the allocator and ensures its logical switch.
    pub async fn reconcile_subnet(&self, name: &str) -> Result<(), ControllerError> {
        let Some(subnet) = self.cluster.subnet(name) else {
            debug!("Subnet {} no longer exists, skipping", name);
            return Ok(());
        };
        info!("Reconciling Subnet {}", name);

        let gateway = match self.validate_subnet(name, &subnet) {
            Ok(gateway) => gateway,
            Err((reason, message)) => {
                warn!("Subnet {} is invalid: {}", name, message);
                self.write_subnet_condition(name, Condition::new(CONDITION_VALIDATED, false, reason, &message))
                    .await?;
                return Err(ControllerError::InvalidResource {
                    resource: format!("Subnet {}", name),
                    reason: message,
                });
            }
        };

        let vpc = subnet.vpc_or(&self.config.default_vpc).to_string();
        if self.cluster.vpc(&vpc).is_none() {
            return Err(ControllerError::NotFound(format!("Vpc {} of Subnet {}", vpc, name)));
        }
        let router = self.router_for_vpc(&vpc).to_string();

        let excludes = subnet_excludes(&subnet, &gateway);
        self.ipam.add_or_update_subnet(
            name,
            &subnet.spec.cidr_block,
            &excludes,
            ipam_strategy(subnet.spec.allocation_strategy),
        )?;

        // Keep the router port MAC stable across reconciliations
        let gateway_mac = self
            .sdn
            .list_logical_switches()
            .await?
            .into_iter()
            .find(|s| s.name == name && !s.gateway_mac.is_empty())
            .map_or_else(generate_mac, |s| s.gateway_mac);
        let mut external_ids = owned_by(name);
        external_ids.insert(EXTERNAL_ID_ROUTER.to_string(), router.clone());
        let switch = LogicalSwitch {
            name: name.to_string(),
            cidr: subnet.spec.cidr_block.clone(),
            gateway: gateway.clone(),
            exclude_ips: ipam::net::expand_exclude_ips(&excludes, &subnet.spec.cidr_block),
            gateway_mac,
            external_ids,
        };
        self.sdn.create_logical_switch(&switch, &router).await?;

        self.write_subnet_conditions(
            name,
            &[
                Condition::new(CONDITION_VALIDATED, true, "Validated", ""),
                Condition::new(CONDITION_READY, true, "Reconciled", format!("switch {} on router {}", name, router)),
            ],
        )
        .await?;

        self.queues.enqueue(QueueId::UpdateSubnetStatus, name);
        self.queues.enqueue(QueueId::UpdateVpcStatus, &vpc);
        for namespace in &subnet.spec.namespaces {
            self.queues.enqueue(QueueId::AddNamespace, namespace);
        }
        Ok(())
    }

    /// Returns the gateway, or (reason, message) describing why the subnet is rejected.
    fn validate_subnet(&self, name: &str, subnet: &Subnet) -> Result<String, (&'static str, String)> {
        let cidr = &subnet.spec.cidr_block;
        check_cidrs(cidr).map_err(|e| ("InvalidCIDR", e.to_string()))?;
        let protocol = check_protocol(cidr).map_err(|e| ("InvalidCIDR", e.to_string()))?;
        if let Some(declared) = subnet.spec.protocol
            && !protocol_matches(declared, protocol)
        {
            return Err((
                "ProtocolMismatch",
                format!("protocol {:?} does not match CIDR {} ({})", declared, cidr, protocol),
            ));
        }

        let gateway = subnet_gateway(subnet).map_err(|e| ("InvalidGateway", e.to_string()))?;
        if !cidr_contains_ip(cidr, &gateway) {
            return Err(("InvalidGateway", format!("gateway {} is outside {}", gateway, cidr)));
        }

        let vpc = subnet.vpc_or(&self.config.default_vpc);
        for other in self.cluster.subnets().iter() {
            let Some(other_name) = other.metadata.name.as_deref() else {
                continue;
            };
            if other_name == name || other.vpc_or(&self.config.default_vpc) != vpc {
                continue;
            }
            if cidr_conflict(cidr, &other.spec.cidr_block) {
                return Err((
                    "CIDRConflict",
                    format!("{} conflicts with Subnet {} ({}) in Vpc {}", cidr, other_name, other.spec.cidr_block, vpc),
                ));
            }
        }
        Ok(gateway)
    }

    pub(crate) async fn write_subnet_condition(&self, name: &str, condition: Condition) -> Result<(), ControllerError> {
        self.write_subnet_conditions(name, &[condition]).await
    }

    async fn write_subnet_conditions(&self, name: &str, conditions: &[Condition]) -> Result<(), ControllerError> {
        let Some(subnet) = self.cluster.subnet(name) else {
            return Ok(());
        };
        let mut status = subnet.status.clone().unwrap_or_default();
        let before = status.conditions.clone();
        for condition in conditions {
            set_condition(&mut status.conditions, condition.clone());
        }
        if conditions_differ(&before, &status.conditions) {
            status.last_reconciled = Some(Utc::now());
            self.cluster.patch_subnet_status(name, &status).await?;
        }
        Ok(())
    }

    /// Writes the allocator's usage counters to the Subnet status when they changed.
    pub async fn reconcile_subnet_status(&self, name: &str) -> Result<(), ControllerError> {
        let Some(subnet) = self.cluster.subnet(name) else {
            return Ok(());
        };
        if !self.ipam.contains_subnet(name) {
            debug!("Subnet {} not loaded into IPAM yet, skipping status", name);
            return Ok(());
        }
        let snapshot = self.ipam.snapshot(name)?;
        if !usage_differs(subnet.status.as_ref(), &snapshot) {
            return Ok(());
        }
        let current = subnet.status.clone().unwrap_or_default();
        let mut status = usage_status(&snapshot, &current);
        status.last_reconciled = Some(Utc::now());
        debug!(
            "Subnet {} usage: v4 {}/{} v6 {}/{}",
            name, snapshot.v4_using, snapshot.v4_available, snapshot.v6_using, snapshot.v6_available
        );
        self.cluster.patch_subnet_status(name, &status).await?;
        Ok(())
    }

    /// Drops the pool and logical switch of a deleted Subnet.
    pub async fn reconcile_delete_subnet(&self, name: &str) -> Result<(), ControllerError> {
        if self.cluster.subnet(name).is_some() {
            debug!("Subnet {} was recreated, skipping delete", name);
            return Ok(());
        }
        info!("Deleting Subnet {}", name);

        let switch = self
            .sdn
            .list_logical_switches()
            .await?
            .into_iter()
            .find(|s| s.name == name);
        if let Some(switch) = switch {
            if owner_of(&switch.external_ids).is_none() {
                warn!("Logical switch {} is not managed by this controller, leaving it", name);
            } else {
                let router = switch
                    .external_ids
                    .get(EXTERNAL_ID_ROUTER)
                    .cloned()
                    .unwrap_or_else(|| self.config.cluster_router.clone());
                self.sdn.delete_logical_switch(name, &router).await?;
            }
        }
        self.ipam.delete_subnet(name);

        for vpc in self.cluster.vpcs() {
            if let Some(vpc_name) = vpc.metadata.name.as_deref() {
                self.queues.enqueue(QueueId::UpdateVpcStatus, vpc_name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "subnet_test.rs"]
mod subnet_test;
