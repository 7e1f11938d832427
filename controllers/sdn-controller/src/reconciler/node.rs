//! Node reconciler
//!
//! Gives every node an address and port on the node (join) switch so the
//! host can reach pod networks.

use super::{Reconciler, allocation_ips, ip_record};
use crate::annotations::{self, AnnotationPatch};
use crate::error::ControllerError;
use crate::queues::QueueId;
use crds::node_ip_name;
use sdn_client::{EXTERNAL_ID_SWITCH, LogicalSwitchPort, owned_by};
use tracing::{debug, info};

impl Reconciler {
    /// Allocates the node's join address, ensures its port and IP record, annotates the node.
    ///
    /// Used for both add and update; an allocated node keeps its address.
    pub async fn reconcile_node(&self, name: &str) -> Result<(), ControllerError> {
        let Some(node) = self.cluster.node(name) else {
            debug!("Node {} no longer exists, skipping", name);
            return Ok(());
        };
        let switch = self.config.node_switch.as_str();
        if !self.ipam.contains_subnet(switch) {
            return Err(ControllerError::NotFound(format!("node subnet {} not loaded", switch)));
        }
        info!("Reconciling Node {}", name);

        let node_annotations = node.metadata.annotations.as_ref();
        let owner = node_ip_name(name);
        let allocation = self.ipam.allocate(
            &owner,
            switch,
            annotations::get(node_annotations, annotations::IP_ADDRESS),
            annotations::get(node_annotations, annotations::MAC_ADDRESS),
        )?;
        let mac = allocation.mac.clone().unwrap_or_default();

        let mut external_ids = owned_by(&owner);
        external_ids.insert(EXTERNAL_ID_SWITCH.to_string(), switch.to_string());
        self.sdn
            .create_logical_switch_port(&LogicalSwitchPort {
                name: owner.clone(),
                switch: switch.to_string(),
                mac: mac.clone(),
                ips: allocation_ips(&allocation),
                external_ids,
            })
            .await?;
        self.cluster
            .apply_ip(&ip_record(&owner, name, "", name, &allocation))
            .await?;

        let desired = [
            (annotations::ALLOCATED, "true".to_string()),
            (annotations::IP_ADDRESS, allocation.ip_string()),
            (annotations::MAC_ADDRESS, mac),
            (annotations::CIDR, self.config.node_switch_cidr.clone()),
            (annotations::GATEWAY, self.config.node_switch_gateway.clone()),
            (annotations::LOGICAL_SWITCH, switch.to_string()),
        ];
        let patch: AnnotationPatch = desired
            .into_iter()
            .filter(|(key, value)| annotations::get(node_annotations, key) != Some(value.as_str()))
            .map(|(key, value)| (key.to_string(), Some(value)))
            .collect();
        if !patch.is_empty() {
            debug!("Annotating Node {} with {} keys", name, patch.len());
            self.cluster.patch_node_annotations(name, &patch).await?;
        }

        self.queues.enqueue(QueueId::UpdateSubnetStatus, switch);
        Ok(())
    }

    /// Releases a deleted node's address, port and IP record.
    pub async fn reconcile_delete_node(&self, name: &str) -> Result<(), ControllerError> {
        if self.cluster.node(name).is_some() {
            debug!("Node {} was recreated, skipping delete", name);
            return Ok(());
        }
        info!("Deleting Node {}", name);

        let owner = node_ip_name(name);
        self.sdn.delete_logical_switch_port(&owner).await?;
        self.cluster.delete_ip(&owner).await?;
        for released in self.ipam.release(&owner) {
            self.queues.enqueue(QueueId::UpdateSubnetStatus, &released.subnet);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::annotations;
    use crate::error::ErrorClass;
    use crate::test_utils::*;

    #[tokio::test]
    async fn test_node_gets_join_address() {
        let (reconciler, cluster, sdn) = test_reconciler();
        with_node_switch(&reconciler, &cluster, &sdn).await;
        cluster.add_node(create_test_node("worker-1", "192.168.0.11"));

        reconciler.reconcile_node("worker-1").await.unwrap();

        let annotations = cluster.node_annotations("worker-1");
        assert_eq!(annotations[annotations::ALLOCATED], "true");
        assert_eq!(annotations[annotations::IP_ADDRESS], "100.64.0.2");
        assert_eq!(annotations[annotations::GATEWAY], "100.64.0.1");
        assert_eq!(annotations[annotations::LOGICAL_SWITCH], "join");

        let port = sdn.port("node-worker-1").unwrap();
        assert_eq!(port.ips, vec!["100.64.0.2"]);
        assert_eq!(port.mac, annotations[annotations::MAC_ADDRESS]);

        let record = cluster.ip_record("node-worker-1").unwrap();
        assert_eq!(record.spec.pod_name, "worker-1");
        assert_eq!(record.spec.owner_key(), "node-worker-1");
    }

    #[tokio::test]
    async fn test_node_reconcile_is_idempotent() {
        let (reconciler, cluster, sdn) = test_reconciler();
        with_node_switch(&reconciler, &cluster, &sdn).await;
        cluster.add_node(create_test_node("worker-1", "192.168.0.11"));

        reconciler.reconcile_node("worker-1").await.unwrap();
        let first = cluster.node_annotations("worker-1");
        reconciler.reconcile_node("worker-1").await.unwrap();

        assert_eq!(cluster.node_annotations("worker-1"), first);
        assert_eq!(reconciler.ipam.owners("join").len(), 1);
    }

    #[tokio::test]
    async fn test_node_waits_for_join_subnet() {
        let (reconciler, cluster, _) = test_reconciler();
        cluster.add_node(create_test_node("worker-1", "192.168.0.11"));

        let err = reconciler.reconcile_node("worker-1").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn test_delete_node_releases_everything() {
        let (reconciler, cluster, sdn) = test_reconciler();
        with_node_switch(&reconciler, &cluster, &sdn).await;
        cluster.add_node(create_test_node("worker-1", "192.168.0.11"));
        reconciler.reconcile_node("worker-1").await.unwrap();

        cluster.remove_node("worker-1");
        reconciler.reconcile_delete_node("worker-1").await.unwrap();

        assert!(sdn.port("node-worker-1").is_none());
        assert!(cluster.ip_record("node-worker-1").is_none());
        assert!(reconciler.ipam.get_allocation("node-worker-1").is_none());
        // Releasing again is a no-op
        reconciler.reconcile_delete_node("worker-1").await.unwrap();
    }
}
