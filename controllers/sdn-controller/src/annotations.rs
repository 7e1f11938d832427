//! Annotation contract on pods, nodes and namespaces.
//!
//! Before allocation a pod may carry `ip_address`, `mac_address` and
//! `logical_switch` as requests; once `allocated` is "true" the same keys
//! hold the result.

use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;

/// Set to "true" once addresses were assigned
pub const ALLOCATED: &str = "sdn.microscaler.io/allocated";
/// Assigned (or requested) address, "v4,v6" for dual stack
pub const IP_ADDRESS: &str = "sdn.microscaler.io/ip_address";
/// Assigned (or requested) MAC address
pub const MAC_ADDRESS: &str = "sdn.microscaler.io/mac_address";
/// CIDR of the subnet the address came from
pub const CIDR: &str = "sdn.microscaler.io/cidr";
/// Gateway of that subnet
pub const GATEWAY: &str = "sdn.microscaler.io/gateway";
/// Subnet / logical switch name; comma separated list on namespaces
pub const LOGICAL_SWITCH: &str = "sdn.microscaler.io/logical_switch";
/// External address SNATed to the pod
pub const EIP: &str = "sdn.microscaler.io/eip";

/// Annotation changes for a merge patch; `None` removes the key.
pub type AnnotationPatch = BTreeMap<String, Option<String>>;

/// True when `allocated` is "true".
pub fn is_allocated(annotations: Option<&BTreeMap<String, String>>) -> bool {
    get(annotations, ALLOCATED) == Some("true")
}

/// Non-empty annotation value.
pub fn get<'a>(annotations: Option<&'a BTreeMap<String, String>>, key: &str) -> Option<&'a str> {
    annotations
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Pods sharing the node's network namespace get no address.
pub fn is_host_network(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.host_network)
        .unwrap_or(false)
}

/// Pod is being deleted or has run to completion.
pub fn is_terminating(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}
