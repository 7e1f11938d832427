//! Pod reconciler
//!
//! Handles: Pod address allocation, switch port, IP record, EIP and release

use super::subnet::subnet_gateway;
use super::{Reconciler, allocation_ips, ip_record};
use crate::annotations::{self, AnnotationPatch};
use crate::error::ControllerError;
use crate::queues::QueueId;
use crate::router::split_key;
use crds::{CONDITION_READY, Condition, pod_ip_name};
use ipam::{Allocation, IpamError};
use k8s_openapi::api::core::v1::Pod;
use sdn_client::{EXTERNAL_ID_SWITCH, LogicalSwitchPort, NatRule, NatType, owned_by, owner_of};
use tracing::{debug, info, warn};

impl Reconciler {
    /// Subnet a pod is placed in.
    ///
    /// Precedence: the pod's own `logical_switch` annotation, then the first
    /// subnet bound to its namespace, then the default subnet.
    pub(crate) fn subnet_for_pod(&self, pod: &Pod) -> String {
        if let Some(switch) = annotations::get(pod.metadata.annotations.as_ref(), annotations::LOGICAL_SWITCH) {
            return switch.to_string();
        }
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let from_namespace = self.cluster.namespace(namespace).and_then(|ns| {
            annotations::get(ns.metadata.annotations.as_ref(), annotations::LOGICAL_SWITCH)
                .and_then(|list| list.split(',').next())
                .map(str::to_string)
        });
        from_namespace.unwrap_or_else(|| {
            self.subnets_for_namespace(namespace)
                .into_iter()
                .next()
                .map_or_else(|| self.config.default_logical_switch.clone(), |(name, _)| name)
        })
    }

    /// Allocates a pod's address and wires up its port, IP record, annotations and EIP.
    pub async fn reconcile_pod(&self, key: &str) -> Result<(), ControllerError> {
        let (namespace, name) = split_key(key);
        let Some(pod) = self.cluster.pod(namespace, name) else {
            debug!("Pod {} no longer exists, skipping", key);
            return Ok(());
        };
        if annotations::is_host_network(&pod) || annotations::is_terminating(&pod) {
            return Ok(());
        }

        let subnet_name = self.subnet_for_pod(&pod);
        let Some(subnet) = self.cluster.subnet(&subnet_name) else {
            return Err(ControllerError::NotFound(format!("Subnet {} for Pod {}", subnet_name, key)));
        };
        if !self.ipam.contains_subnet(&subnet_name) {
            return Err(ControllerError::NotFound(format!("Subnet {} not loaded into IPAM", subnet_name)));
        }
        info!("Reconciling Pod {} in Subnet {}", key, subnet_name);

        let pod_annotations = pod.metadata.annotations.as_ref();
        let allocation = match self.ipam.allocate(
            key,
            &subnet_name,
            annotations::get(pod_annotations, annotations::IP_ADDRESS),
            annotations::get(pod_annotations, annotations::MAC_ADDRESS),
        ) {
            Ok(allocation) => allocation,
            Err(e @ IpamError::AddressSpaceExhausted(_)) => {
                warn!("Subnet {} has no free address for Pod {}", subnet_name, key);
                let condition = Condition::new(CONDITION_READY, false, "AddressSpaceExhausted", e.to_string());
                self.write_subnet_condition(&subnet_name, condition).await?;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        let mac = allocation.mac.clone().unwrap_or_default();

        let port_name = pod_ip_name(namespace, name);
        let mut external_ids = owned_by(key);
        external_ids.insert(EXTERNAL_ID_SWITCH.to_string(), subnet_name.clone());
        self.sdn
            .create_logical_switch_port(&LogicalSwitchPort {
                name: port_name.clone(),
                switch: subnet_name.clone(),
                mac: mac.clone(),
                ips: allocation_ips(&allocation),
                external_ids,
            })
            .await?;

        let node_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default();
        self.cluster
            .apply_ip(&ip_record(&port_name, name, namespace, &node_name, &allocation))
            .await?;

        let desired = [
            (annotations::ALLOCATED, "true".to_string()),
            (annotations::IP_ADDRESS, allocation.ip_string()),
            (annotations::MAC_ADDRESS, mac),
            (annotations::CIDR, subnet.spec.cidr_block.clone()),
            (annotations::GATEWAY, subnet_gateway(&subnet)?),
            (annotations::LOGICAL_SWITCH, subnet_name.clone()),
        ];
        let patch: AnnotationPatch = desired
            .into_iter()
            .filter(|(k, v)| annotations::get(pod_annotations, k) != Some(v.as_str()))
            .map(|(k, v)| (k.to_string(), Some(v)))
            .collect();
        if !patch.is_empty() {
            self.cluster.patch_pod_annotations(namespace, name, &patch).await?;
        }

        self.sync_pod_eip(key, &pod, &allocation).await?;

        self.queues.enqueue(QueueId::UpdateSubnetStatus, &subnet_name);
        self.enqueue_network_policies();
        Ok(())
    }

    /// Re-runs allocation if the annotations and allocator disagree, otherwise refreshes the EIP.
    pub async fn reconcile_pod_update(&self, key: &str) -> Result<(), ControllerError> {
        let (namespace, name) = split_key(key);
        let Some(pod) = self.cluster.pod(namespace, name) else {
            return Ok(());
        };
        if annotations::is_host_network(&pod) || annotations::is_terminating(&pod) {
            return Ok(());
        }

        let annotated = annotations::get(pod.metadata.annotations.as_ref(), annotations::IP_ADDRESS);
        match self.ipam.get_allocation(key) {
            Some(allocation) if annotated == Some(allocation.ip_string().as_str()) => {
                self.sync_pod_eip(key, &pod, &allocation).await
            }
            _ => {
                debug!("Pod {} allocation out of sync with annotations", key);
                self.reconcile_pod(key).await
            }
        }
    }

    /// Adds or removes the pod's DNAT/SNAT rule following its `eip` annotation.
    async fn sync_pod_eip(&self, key: &str, pod: &Pod, allocation: &Allocation) -> Result<(), ControllerError> {
        let router = self.router_for_subnet(&allocation.subnet);
        let eip = annotations::get(pod.metadata.annotations.as_ref(), annotations::EIP);
        let logical_ip = allocation.v4_string();

        let stale: Vec<NatRule> = self
            .sdn
            .list_nat_rules(&router)
            .await?
            .into_iter()
            .filter(|r| r.nat_type == NatType::DnatAndSnat && owner_of(&r.external_ids) == Some(key))
            .filter(|r| eip != Some(r.external_ip.as_str()) || r.logical_ip != logical_ip)
            .collect();
        for rule in stale {
            debug!("Removing EIP {} of Pod {}", rule.external_ip, key);
            self.sdn.delete_nat_rule(&router, rule.nat_type, &rule.logical_ip).await?;
        }

        if let Some(eip) = eip
            && !logical_ip.is_empty()
        {
            self.sdn
                .add_nat_rule(&NatRule {
                    router,
                    nat_type: NatType::DnatAndSnat,
                    external_ip: eip.to_string(),
                    logical_ip,
                    external_ids: owned_by(key),
                })
                .await?;
        }
        Ok(())
    }

    /// Releases the address, port, NAT rules and IP record of a deleted or finished pod.
    pub async fn reconcile_delete_pod(&self, key: &str) -> Result<(), ControllerError> {
        let (namespace, name) = split_key(key);
        if let Some(pod) = self.cluster.pod(namespace, name)
            && !annotations::is_terminating(&pod)
        {
            debug!("Pod {} is alive, skipping delete", key);
            return Ok(());
        }
        info!("Releasing Pod {}", key);

        if let Some(allocation) = self.ipam.get_allocation(key) {
            let router = self.router_for_subnet(&allocation.subnet);
            let owned: Vec<NatRule> = match self.sdn.list_nat_rules(&router).await {
                Ok(rules) => rules
                    .into_iter()
                    .filter(|r| owner_of(&r.external_ids) == Some(key))
                    .collect(),
                Err(sdn_client::SdnError::NotFound(_)) => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            for rule in owned {
                self.sdn.delete_nat_rule(&router, rule.nat_type, &rule.logical_ip).await?;
            }
        }

        let port_name = pod_ip_name(namespace, name);
        self.sdn.delete_logical_switch_port(&port_name).await?;
        self.cluster.delete_ip(&port_name).await?;
        for released in self.ipam.release(key) {
            self.queues.enqueue(QueueId::UpdateSubnetStatus, &released.subnet);
        }
        self.enqueue_network_policies();
        Ok(())
    }
}

#[cfg(test)]
#[path = "pod_test.rs"]
mod pod_test;
