//! Logical network models
//!
//! These mirror the OVN northbound tables the controller manages. Every
//! object created by the controller carries `external_ids` naming the
//! vendor and the owning resource key, which is what garbage collection
//! matches on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// `external_ids` key marking objects created by this controller
pub const EXTERNAL_ID_VENDOR: &str = "vendor";
/// Value stored under `EXTERNAL_ID_VENDOR`
pub const VENDOR: &str = "sdn-controller";
/// `external_ids` key holding the owning resource key (e.g. `ns/pod`)
pub const EXTERNAL_ID_OWNER: &str = "owner";
/// `external_ids` key holding the logical switch of a port
pub const EXTERNAL_ID_SWITCH: &str = "logical_switch";

/// Free-form key/value pairs attached to northbound rows
pub type ExternalIds = BTreeMap<String, String>;

/// `external_ids` for an object owned by `owner`.
pub fn owned_by(owner: &str) -> ExternalIds {
    let mut ids = ExternalIds::new();
    ids.insert(EXTERNAL_ID_VENDOR.to_string(), VENDOR.to_string());
    ids.insert(EXTERNAL_ID_OWNER.to_string(), owner.to_string());
    ids
}

/// Owner key recorded in `external_ids`, if the object was created by this controller.
pub fn owner_of(ids: &ExternalIds) -> Option<&str> {
    match ids.get(EXTERNAL_ID_VENDOR).map(String::as_str) {
        Some(VENDOR) => ids.get(EXTERNAL_ID_OWNER).map(String::as_str),
        _ => None,
    }
}

/// Logical switch (one per Subnet)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalSwitch {
    pub name: String,
    /// CIDR specifier, possibly dual-stack (`"<v4>,<v6>"`)
    pub cidr: String,
    /// Gateway specifier matching `cidr`
    pub gateway: String,
    pub exclude_ips: Vec<String>,
    /// MAC of the router port connecting the switch to its router
    pub gateway_mac: String,
    pub external_ids: ExternalIds,
}

/// Static route on a logical router
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StaticRoute {
    pub ip_prefix: String,
    pub nexthop: String,
}

/// Logical router (one per Vpc)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalRouter {
    pub name: String,
    pub static_routes: Vec<StaticRoute>,
    pub external_ids: ExternalIds,
}

/// Logical switch port (one per pod or node)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalSwitchPort {
    pub name: String,
    /// Switch the port is attached to
    pub switch: String,
    pub mac: String,
    /// Addresses without masks
    pub ips: Vec<String>,
    pub external_ids: ExternalIds,
}

impl LogicalSwitchPort {
    /// `addresses` column value: `"<mac> <ip> [<ip>]"`.
    pub fn addresses(&self) -> String {
        std::iter::once(self.mac.as_str())
            .chain(self.ips.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// NAT rule type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    Snat,
    DnatAndSnat,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatType::Snat => write!(f, "snat"),
            NatType::DnatAndSnat => write!(f, "dnat_and_snat"),
        }
    }
}

/// NAT rule on a logical router (pod EIPs and subnet outgoing NAT)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRule {
    pub router: String,
    pub nat_type: NatType,
    pub external_ip: String,
    pub logical_ip: String,
    pub external_ids: ExternalIds,
}

/// Load balancer protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LbProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for LbProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LbProtocol::Tcp => write!(f, "tcp"),
            LbProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// Cluster load balancer with its VIP table (`"ip:port"` → backends)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub name: String,
    pub protocol: LbProtocol,
    pub vips: BTreeMap<String, Vec<String>>,
}

/// ACL direction relative to the port group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AclDirection {
    /// Traffic entering the logical network from a port (egress policy)
    FromLport,
    /// Traffic delivered to a port (ingress policy)
    ToLport,
}

impl fmt::Display for AclDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclDirection::FromLport => write!(f, "from-lport"),
            AclDirection::ToLport => write!(f, "to-lport"),
        }
    }
}

/// ACL verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AclAction {
    AllowRelated,
    Drop,
}

impl fmt::Display for AclAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclAction::AllowRelated => write!(f, "allow-related"),
            AclAction::Drop => write!(f, "drop"),
        }
    }
}

/// ACL attached to a port group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Acl {
    pub direction: AclDirection,
    pub priority: u16,
    #[serde(rename = "match")]
    pub match_expr: String,
    pub action: AclAction,
}

/// Port group (one per NetworkPolicy)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortGroup {
    pub name: String,
    pub ports: Vec<String>,
    pub acls: Vec<Acl>,
    pub external_ids: ExternalIds,
}
