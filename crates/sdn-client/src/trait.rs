//! SdnClient trait for mocking
//!
//! This trait abstracts the logical network control plane so reconcilers can
//! be tested against an in-memory implementation. Creates are idempotent
//! (`may-exist`) and deletes of missing objects succeed (`if-exists`).

use crate::error::SdnError;
use crate::models::*;

/// Trait for logical network control plane operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait SdnClientTrait: Send + Sync {
    // Logical switches
    async fn list_logical_switches(&self) -> Result<Vec<LogicalSwitch>, SdnError>;
    async fn logical_switch_exists(&self, name: &str) -> Result<bool, SdnError>;
    /// Creates or updates a switch and connects it to `router`.
    async fn create_logical_switch(&self, switch: &LogicalSwitch, router: &str) -> Result<(), SdnError>;
    /// Deletes a switch, its ports and its router port on `router`.
    async fn delete_logical_switch(&self, name: &str, router: &str) -> Result<(), SdnError>;

    // Logical routers
    async fn list_logical_routers(&self) -> Result<Vec<LogicalRouter>, SdnError>;
    async fn create_logical_router(&self, name: &str, external_ids: &ExternalIds) -> Result<(), SdnError>;
    async fn delete_logical_router(&self, name: &str) -> Result<(), SdnError>;
    /// Replaces the router's static routes with `routes`.
    async fn set_static_routes(&self, router: &str, routes: &[StaticRoute]) -> Result<(), SdnError>;

    // Logical switch ports
    /// Ports of `switch`, or of every switch when `None`.
    async fn list_logical_switch_ports(&self, switch: Option<&str>) -> Result<Vec<LogicalSwitchPort>, SdnError>;
    async fn create_logical_switch_port(&self, port: &LogicalSwitchPort) -> Result<(), SdnError>;
    async fn delete_logical_switch_port(&self, name: &str) -> Result<(), SdnError>;

    // NAT
    async fn list_nat_rules(&self, router: &str) -> Result<Vec<NatRule>, SdnError>;
    async fn add_nat_rule(&self, rule: &NatRule) -> Result<(), SdnError>;
    async fn delete_nat_rule(&self, router: &str, nat_type: NatType, logical_ip: &str) -> Result<(), SdnError>;

    // Load balancers
    async fn list_load_balancers(&self) -> Result<Vec<LoadBalancer>, SdnError>;
    async fn create_load_balancer(&self, name: &str, protocol: LbProtocol) -> Result<(), SdnError>;
    /// Sets `vip` (`"ip:port"`) to `backends`, replacing previous backends.
    async fn set_load_balancer_vip(&self, name: &str, vip: &str, backends: &[String]) -> Result<(), SdnError>;
    async fn delete_load_balancer_vip(&self, name: &str, vip: &str) -> Result<(), SdnError>;

    // Port groups
    async fn list_port_groups(&self) -> Result<Vec<PortGroup>, SdnError>;
    /// Creates or replaces a port group with its ports and ACLs.
    async fn apply_port_group(&self, group: &PortGroup) -> Result<(), SdnError>;
    async fn delete_port_group(&self, name: &str) -> Result<(), SdnError>;
}
