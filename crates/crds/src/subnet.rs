//! Subnet CRD
//!
//! Defines an address block (single or dual stack) served by one logical switch.

use crate::condition::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "sdn.microscaler.io",
    version = "v1",
    kind = "Subnet",
    status = "SubnetStatus",
    printcolumn = r#"{"name":"CIDR", "type":"string", "jsonPath":".spec.cidrBlock"}"#,
    printcolumn = r#"{"name":"Gateway", "type":"string", "jsonPath":".spec.gateway"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// Owning VPC (defaults to the cluster VPC)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<String>,

    /// Whether this is the cluster default subnet
    #[serde(default)]
    pub default: bool,

    /// Declared protocol; derived from `cidr_block` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<SubnetProtocol>,

    /// One CIDR, or "v4,v6" for dual stack
    pub cidr_block: String,

    /// Gateway address(es) in the same family order as `cidr_block`
    #[serde(default)]
    pub gateway: String,

    /// Addresses or "start..end" ranges withheld from allocation
    #[serde(default)]
    pub exclude_ips: Vec<String>,

    /// Namespaces bound to this subnet
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Allocation strategy
    #[serde(default)]
    pub allocation_strategy: AllocationStrategy,

    /// Masquerade traffic leaving the VPC
    #[serde(default)]
    pub nat_outgoing: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum SubnetProtocol {
    /// Single stack IPv4
    IPv4,

    /// Single stack IPv6
    IPv6,

    /// IPv4 and IPv6 paired
    Dual,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationStrategy {
    /// Lowest free address first
    #[default]
    Sequential,

    /// Random IPv4 address (IPv6 stays sequential)
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubnetStatus {
    /// Free IPv4 addresses
    #[serde(default)]
    pub v4_available_ips: f64,

    /// Allocated IPv4 addresses
    #[serde(default)]
    pub v4_using_ips: f64,

    /// Free IPv6 addresses
    #[serde(default)]
    pub v6_available_ips: f64,

    /// Allocated IPv6 addresses
    #[serde(default)]
    pub v6_using_ips: f64,

    /// Reconciliation conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Last reconciliation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<chrono::DateTime<chrono::Utc>>,
}

impl Subnet {
    /// VPC this subnet belongs to, falling back to `default_vpc`.
    pub fn vpc_or<'a>(&'a self, default_vpc: &'a str) -> &'a str {
        self.spec.vpc.as_deref().filter(|v| !v.is_empty()).unwrap_or(default_vpc)
    }
}
