//! Vpc CRD
//!
//! Defines a virtual network: one logical router plus the subnets attached to it.

use crate::condition::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "sdn.microscaler.io",
    version = "v1",
    kind = "Vpc",
    status = "VpcStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VpcSpec {
    /// Namespaces whose pods default into this VPC
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Static routes programmed on the VPC router
    #[serde(default)]
    pub static_routes: Vec<StaticRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StaticRoute {
    /// Destination CIDR
    pub cidr: String,

    /// Next hop address
    pub next_hop_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VpcStatus {
    /// Whether this is the cluster default VPC
    #[serde(default)]
    pub default: bool,

    /// Logical router backing this VPC
    #[serde(default)]
    pub router: String,

    /// Default logical switch for pods in this VPC
    #[serde(default)]
    pub default_logical_switch: String,

    /// Subnets currently attached to this VPC
    #[serde(default)]
    pub subnets: Vec<String>,

    /// Reconciliation conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
