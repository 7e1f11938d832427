//! NetworkPolicy reconciler
//!
//! Each policy becomes a port group holding the ports of the pods it selects,
//! with a default-drop ACL per enforced direction and allow ACLs per rule.

use super::Reconciler;
use crate::annotations;
use crate::error::ControllerError;
use crate::queues::QueueId;
use crate::router::{object_key, split_key};
use crds::pod_ip_name;
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicyPeer, NetworkPolicyPort};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use sdn_client::{Acl, AclAction, AclDirection, PortGroup, owned_by};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Priority of the per-direction default drop
pub const DEFAULT_DROP_PRIORITY: u16 = 1000;
/// Priority of allow rules, above the drop
pub const ALLOW_PRIORITY: u16 = 1001;

/// Port group name of a policy; only `[a-z0-9_]` survive in northbound names.
pub fn port_group_name(namespace: &str, name: &str) -> String {
    format!("np_{}_{}", namespace, name).replace(['-', '.'], "_")
}

/// Label selector evaluation (`matchLabels` and `matchExpressions`).
pub fn selector_matches(selector: &LabelSelector, labels: Option<&BTreeMap<String, String>>) -> bool {
    let value = |key: &str| labels.and_then(|l| l.get(key));
    let labels_ok = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| value(k) == Some(v));
    let expressions_ok = selector.match_expressions.iter().flatten().all(|expr| {
        let values = expr.values.as_deref().unwrap_or_default();
        match expr.operator.as_str() {
            "In" => value(&expr.key).is_some_and(|v| values.contains(v)),
            "NotIn" => value(&expr.key).is_none_or(|v| !values.contains(v)),
            "Exists" => value(&expr.key).is_some(),
            "DoesNotExist" => value(&expr.key).is_none(),
            _ => false,
        }
    });
    labels_ok && expressions_ok
}

/// Direction-specific pieces of an ACL match.
struct Side {
    direction: AclDirection,
    /// `outport` for ingress, `inport` for egress
    port_field: &'static str,
    /// `src` for ingress, `dst` for egress
    peer_field: &'static str,
}

const INGRESS: Side = Side {
    direction: AclDirection::ToLport,
    port_field: "outport",
    peer_field: "src",
};

const EGRESS: Side = Side {
    direction: AclDirection::FromLport,
    port_field: "inport",
    peer_field: "dst",
};

/// `ip4.src == {a, b}` style terms for a set of addresses, one per family.
fn address_terms(field: &str, addresses: &[String]) -> Vec<String> {
    let (v4, v6): (Vec<&String>, Vec<&String>) = addresses.iter().partition(|a| !a.contains(':'));
    let mut terms = Vec::new();
    for (family, list) in [("ip4", v4), ("ip6", v6)] {
        if list.is_empty() {
            continue;
        }
        let joined = list.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(", ");
        terms.push(format!("{}.{} == {{{}}}", family, field, joined));
    }
    terms
}

/// Port restriction terms; a single empty term means any port.
fn port_terms(ports: Option<&[NetworkPolicyPort]>) -> Vec<String> {
    let Some(ports) = ports.filter(|p| !p.is_empty()) else {
        return vec![String::new()];
    };
    ports
        .iter()
        .map(|p| {
            let protocol = p.protocol.as_deref().unwrap_or("TCP").to_lowercase();
            match (&p.port, p.end_port) {
                (Some(IntOrString::Int(start)), Some(end)) => {
                    format!("{0}.dst >= {1} && {0}.dst <= {2}", protocol, start, end)
                }
                (Some(IntOrString::Int(port)), None) => format!("{}.dst == {}", protocol, port),
                // Named ports are matched by protocol only
                _ => protocol,
            }
        })
        .collect()
}

impl Reconciler {
    /// Allocated addresses of pods in `namespace` matching `selector`.
    fn selected_pod_ips(&self, namespace: &str, selector: Option<&LabelSelector>) -> Vec<String> {
        self.cluster
            .pods()
            .iter()
            .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
            .filter(|p| annotations::is_allocated(p.metadata.annotations.as_ref()))
            .filter(|p| selector.is_none_or(|s| selector_matches(s, p.metadata.labels.as_ref())))
            .filter_map(|p| annotations::get(p.metadata.annotations.as_ref(), annotations::IP_ADDRESS))
            .flat_map(|ips| ips.split(',').map(str::to_string).collect::<Vec<_>>())
            .collect()
    }

    /// Address match terms of one peer; empty when the peer selects nothing.
    fn peer_terms(&self, policy_namespace: &str, peer: &NetworkPolicyPeer, field: &str) -> Vec<String> {
        if let Some(block) = &peer.ip_block {
            let family = if block.cidr.contains(':') { "ip6" } else { "ip4" };
            let mut term = format!("{}.{} == {}", family, field, block.cidr);
            if let Some(except) = block.except.as_ref().filter(|e| !e.is_empty()) {
                term = format!("{} && {}.{} != {{{}}}", term, family, field, except.join(", "));
            }
            return vec![term];
        }

        let namespaces: Vec<String> = match &peer.namespace_selector {
            Some(selector) => self
                .cluster
                .namespaces()
                .iter()
                .filter(|ns| selector_matches(selector, ns.metadata.labels.as_ref()))
                .filter_map(|ns| ns.metadata.name.clone())
                .collect(),
            None => vec![policy_namespace.to_string()],
        };
        let mut addresses: Vec<String> = namespaces
            .iter()
            .flat_map(|ns| self.selected_pod_ips(ns, peer.pod_selector.as_ref()))
            .collect();
        addresses.sort();
        addresses.dedup();
        address_terms(field, &addresses)
    }

    /// ACLs for one direction: default drop plus one allow per (rule, port).
    fn direction_acls(
        &self,
        namespace: &str,
        group: &str,
        side: &Side,
        rules: &[(Option<&[NetworkPolicyPeer]>, Option<&[NetworkPolicyPort]>)],
    ) -> Vec<Acl> {
        let base = format!("{} == @{}", side.port_field, group);
        let mut acls = vec![Acl {
            direction: side.direction,
            priority: DEFAULT_DROP_PRIORITY,
            match_expr: format!("{} && ip", base),
            action: AclAction::Drop,
        }];

        for (peers, ports) in rules {
            let peer_terms: Vec<String> = match peers.filter(|p| !p.is_empty()) {
                None => vec![String::new()],
                Some(peers) => {
                    let terms: Vec<String> = peers
                        .iter()
                        .flat_map(|peer| self.peer_terms(namespace, peer, side.peer_field))
                        .collect();
                    if terms.is_empty() {
                        // Peers select nothing: the rule allows no traffic
                        continue;
                    }
                    terms
                }
            };
            for peer in &peer_terms {
                for port in port_terms(*ports) {
                    let match_expr = [base.as_str(), peer.as_str(), port.as_str()]
                        .into_iter()
                        .filter(|t| !t.is_empty())
                        .collect::<Vec<_>>()
                        .join(" && ");
                    acls.push(Acl {
                        direction: side.direction,
                        priority: ALLOW_PRIORITY,
                        match_expr,
                        action: AclAction::AllowRelated,
                    });
                }
            }
        }
        acls.dedup();
        acls
    }

    /// Desired port group of a policy.
    pub(crate) fn desired_port_group(&self, policy: &NetworkPolicy) -> PortGroup {
        let key = object_key(policy);
        let (namespace, name) = split_key(&key);
        let group = port_group_name(namespace, name);
        let spec = policy.spec.clone().unwrap_or_default();

        let mut ports: Vec<String> = self
            .cluster
            .pods()
            .iter()
            .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
            .filter(|p| !annotations::is_host_network(p))
            .filter(|p| annotations::is_allocated(p.metadata.annotations.as_ref()))
            .filter(|p| {
                spec.pod_selector
                    .as_ref()
                    .is_none_or(|s| selector_matches(s, p.metadata.labels.as_ref()))
            })
            .filter_map(|p| p.metadata.name.as_deref().map(|n| pod_ip_name(namespace, n)))
            .collect();
        ports.sort();

        let types = spec.policy_types.clone().unwrap_or_else(|| {
            let mut types = vec!["Ingress".to_string()];
            if spec.egress.is_some() {
                types.push("Egress".to_string());
            }
            types
        });

        let mut acls = Vec::new();
        if types.iter().any(|t| t == "Ingress") {
            let rules: Vec<_> = spec
                .ingress
                .iter()
                .flatten()
                .map(|r| (r.from.as_deref(), r.ports.as_deref()))
                .collect();
            acls.extend(self.direction_acls(namespace, &group, &INGRESS, &rules));
        }
        if types.iter().any(|t| t == "Egress") {
            let rules: Vec<_> = spec
                .egress
                .iter()
                .flatten()
                .map(|r| (r.to.as_deref(), r.ports.as_deref()))
                .collect();
            acls.extend(self.direction_acls(namespace, &group, &EGRESS, &rules));
        }

        PortGroup {
            name: group,
            ports,
            acls,
            external_ids: owned_by(&key),
        }
    }

    /// Writes a policy's port group and ACLs.
    pub async fn reconcile_network_policy(&self, key: &str) -> Result<(), ControllerError> {
        if !self.config.enable_np {
            return Ok(());
        }
        let (namespace, name) = split_key(key);
        let Some(policy) = self.cluster.network_policy(namespace, name) else {
            debug!("NetworkPolicy {} no longer exists, skipping", key);
            return Ok(());
        };
        let group = self.desired_port_group(&policy);
        info!(
            "Reconciling NetworkPolicy {}: {} ports, {} ACLs",
            key,
            group.ports.len(),
            group.acls.len()
        );
        self.sdn.apply_port_group(&group).await?;
        Ok(())
    }

    /// Removes the port group of a deleted policy.
    pub async fn reconcile_delete_network_policy(&self, key: &str) -> Result<(), ControllerError> {
        if !self.config.enable_np {
            return Ok(());
        }
        let (namespace, name) = split_key(key);
        if self.cluster.network_policy(namespace, name).is_some() {
            debug!("NetworkPolicy {} was recreated, skipping delete", key);
            return Ok(());
        }
        info!("Deleting NetworkPolicy {}", key);
        self.sdn.delete_port_group(&port_group_name(namespace, name)).await?;
        Ok(())
    }

    /// Requeues every policy; pod membership and peer addresses may have changed.
    pub(crate) fn enqueue_network_policies(&self) {
        if !self.config.enable_np {
            return;
        }
        for policy in self.cluster.network_policies() {
            self.queues.enqueue(QueueId::UpdateNp, &object_key(policy.as_ref()));
        }
    }
}

#[cfg(test)]
#[path = "network_policy_test.rs"]
mod network_policy_test;
