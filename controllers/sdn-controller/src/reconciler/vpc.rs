//! Vpc reconciler
//!
//! Handles: Vpc add/update/delete and status

use super::Reconciler;
use crate::error::ControllerError;
use crds::{CONDITION_READY, Condition, VpcStatus, conditions_differ, set_condition};
use sdn_client::{StaticRoute, owned_by};
use tracing::{debug, info, warn};

impl Reconciler {
    /// Ensures the VPC's router and static routes exist, then refreshes status.
    pub async fn reconcile_vpc(&self, name: &str) -> Result<(), ControllerError> {
        let Some(vpc) = self.cluster.vpc(name) else {
            debug!("Vpc {} no longer exists, skipping", name);
            return Ok(());
        };
        info!("Reconciling Vpc {}", name);

        let router = self.router_for_vpc(name).to_string();
        self.sdn.create_logical_router(&router, &owned_by(name)).await?;

        let routes: Vec<StaticRoute> = vpc
            .spec
            .static_routes
            .iter()
            .map(|r| StaticRoute {
                ip_prefix: r.cidr.clone(),
                nexthop: r.next_hop_ip.clone(),
            })
            .collect();
        for route in &routes {
            if ipam::net::check_cidrs(&route.ip_prefix).is_err() || !ipam::net::is_valid_ip(&route.nexthop) {
                let message = format!("invalid static route {} via {}", route.ip_prefix, route.nexthop);
                self.write_vpc_condition(name, Condition::new(CONDITION_READY, false, "InvalidStaticRoute", &message))
                    .await?;
                return Err(ControllerError::InvalidResource {
                    resource: format!("Vpc {}", name),
                    reason: message,
                });
            }
        }
        self.sdn.set_static_routes(&router, &routes).await?;

        self.reconcile_vpc_status(name).await
    }

    /// Recomputes the Vpc status from the current subnets.
    pub async fn reconcile_vpc_status(&self, name: &str) -> Result<(), ControllerError> {
        let Some(vpc) = self.cluster.vpc(name) else {
            return Ok(());
        };
        let current = vpc.status.clone().unwrap_or_default();
        let desired = self.desired_vpc_status(name, &current);
        if vpc_status_differs(&current, &desired) {
            debug!("Updating Vpc {} status: {} subnets", name, desired.subnets.len());
            self.cluster.patch_vpc_status(name, &desired).await?;
        }
        Ok(())
    }

    fn desired_vpc_status(&self, name: &str, current: &VpcStatus) -> VpcStatus {
        let is_default = name == self.config.default_vpc;
        let mut subnets: Vec<_> = self
            .cluster
            .subnets()
            .iter()
            .filter(|s| s.vpc_or(&self.config.default_vpc) == name)
            .filter_map(|s| s.metadata.name.clone())
            .collect();
        subnets.sort();

        let default_logical_switch = if is_default {
            self.config.default_logical_switch.clone()
        } else {
            self.cluster
                .subnets()
                .iter()
                .filter(|s| s.spec.default && s.vpc_or(&self.config.default_vpc) == name)
                .find_map(|s| s.metadata.name.clone())
                .unwrap_or_default()
        };

        let mut conditions = current.conditions.clone();
        set_condition(&mut conditions, Condition::new(CONDITION_READY, true, "Reconciled", ""));
        VpcStatus {
            default: is_default,
            router: self.router_for_vpc(name).to_string(),
            default_logical_switch,
            subnets,
            conditions,
        }
    }

    async fn write_vpc_condition(&self, name: &str, condition: Condition) -> Result<(), ControllerError> {
        let Some(vpc) = self.cluster.vpc(name) else {
            return Ok(());
        };
        let mut status = vpc.status.clone().unwrap_or_default();
        let before = status.conditions.clone();
        set_condition(&mut status.conditions, condition);
        if conditions_differ(&before, &status.conditions) {
            self.cluster.patch_vpc_status(name, &status).await?;
        }
        Ok(())
    }

    /// Removes the router of a deleted VPC. The default VPC's router is kept.
    pub async fn reconcile_delete_vpc(&self, name: &str) -> Result<(), ControllerError> {
        if name == self.config.default_vpc {
            warn!("Default Vpc {} deleted; it is recreated on the next restart", name);
            return Ok(());
        }
        if self.cluster.vpc(name).is_some() {
            debug!("Vpc {} was recreated, skipping delete", name);
            return Ok(());
        }
        info!("Deleting logical router of Vpc {}", name);
        self.sdn.delete_logical_router(self.router_for_vpc(name)).await?;
        Ok(())
    }
}

fn vpc_status_differs(a: &VpcStatus, b: &VpcStatus) -> bool {
    a.default != b.default
        || a.router != b.router
        || a.default_logical_switch != b.default_logical_switch
        || a.subnets != b.subnets
        || conditions_differ(&a.conditions, &b.conditions)
}
