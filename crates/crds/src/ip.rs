//! IP CRD
//!
//! Persists one address allocation so the allocator can be rebuilt after a restart.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[kube(
    group = "sdn.microscaler.io",
    version = "v1",
    kind = "IP",
    printcolumn = r#"{"name":"Address", "type":"string", "jsonPath":".spec.ipAddress"}"#,
    printcolumn = r#"{"name":"Subnet", "type":"string", "jsonPath":".spec.subnet"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IPSpec {
    /// Pod (or node) name
    pub pod_name: String,

    /// Pod namespace; empty for node records
    #[serde(default)]
    pub namespace: String,

    /// Subnet the address was allocated from
    pub subnet: String,

    /// Node hosting the pod
    #[serde(default)]
    pub node_name: String,

    /// Allocated address(es), "v4,v6" when dual stack
    pub ip_address: String,

    /// IPv4 member
    #[serde(default)]
    pub v4_ip_address: String,

    /// IPv6 member
    #[serde(default)]
    pub v6_ip_address: String,

    /// MAC address bound to the port
    #[serde(default)]
    pub mac_address: String,
}

/// Prefix used for IP records belonging to nodes
pub const NODE_IP_PREFIX: &str = "node-";

/// Name of the IP record for a pod.
pub fn pod_ip_name(namespace: &str, name: &str) -> String {
    format!("{}.{}", name, namespace)
}

/// Name of the IP record for a node.
pub fn node_ip_name(node: &str) -> String {
    format!("{}{}", NODE_IP_PREFIX, node)
}

impl IPSpec {
    /// Owner key the allocator uses for this record.
    ///
    /// Pods are keyed `namespace/name`, nodes `node-<name>`.
    pub fn owner_key(&self) -> String {
        if self.namespace.is_empty() {
            node_ip_name(&self.pod_name)
        } else {
            format!("{}/{}", self.namespace, self.pod_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_key_for_pod_and_node() {
        let pod = IPSpec {
            pod_name: "web-0".to_string(),
            namespace: "shop".to_string(),
            subnet: "ovn-default".to_string(),
            ip_address: "10.16.0.2".to_string(),
            ..Default::default()
        };
        assert_eq!(pod.owner_key(), "shop/web-0");
        assert_eq!(pod_ip_name("shop", "web-0"), "web-0.shop");

        let node = IPSpec {
            pod_name: "worker-1".to_string(),
            subnet: "join".to_string(),
            ip_address: "100.64.0.2".to_string(),
            ..Default::default()
        };
        assert_eq!(node.owner_key(), "node-worker-1");
    }
}
