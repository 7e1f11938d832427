//! Mock SdnClient for unit testing
//!
//! This module provides an in-memory implementation of SdnClientTrait that can
//! be used in unit tests without a running control plane.
//!
//! - `topology.rs` - switches, routers and switch ports
//! - `services.rs` - NAT rules, load balancers and port groups

mod services;
mod topology;

use crate::error::SdnError;
use crate::models::*;
use crate::sdn_trait::SdnClientTrait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Mock SdnClient for testing
///
/// Stores objects in memory and records every mutating call. A failure can be
/// injected for the next call of a named operation.
#[derive(Debug, Clone, Default)]
pub struct MockSdnClient {
    pub(crate) switches: Arc<Mutex<BTreeMap<String, LogicalSwitch>>>,
    pub(crate) routers: Arc<Mutex<BTreeMap<String, LogicalRouter>>>,
    pub(crate) ports: Arc<Mutex<BTreeMap<String, LogicalSwitchPort>>>,
    pub(crate) nat_rules: Arc<Mutex<Vec<NatRule>>>,
    pub(crate) load_balancers: Arc<Mutex<BTreeMap<String, LoadBalancer>>>,
    pub(crate) port_groups: Arc<Mutex<BTreeMap<String, PortGroup>>>,
    // Operation name -> error returned by its next call
    pub(crate) failures: Arc<Mutex<HashMap<String, SdnError>>>,
    pub(crate) calls: Arc<Mutex<Vec<String>>>,
}

impl MockSdnClient {
    /// Create a new, empty mock client
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `operation` (trait method name) fail with `error`
    pub fn fail_next(&self, operation: &str, error: SdnError) {
        self.failures.lock().unwrap().insert(operation.to_string(), error);
    }

    /// Mutating calls made so far, as `"<operation> <name>"`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Add a logical switch port directly (for test setup)
    pub fn add_port(&self, port: LogicalSwitchPort) {
        self.ports.lock().unwrap().insert(port.name.clone(), port);
    }

    /// Add a logical switch directly (for test setup)
    pub fn add_switch(&self, switch: LogicalSwitch) {
        self.switches.lock().unwrap().insert(switch.name.clone(), switch);
    }

    /// Look up a port by name
    pub fn port(&self, name: &str) -> Option<LogicalSwitchPort> {
        self.ports.lock().unwrap().get(name).cloned()
    }

    /// Look up a switch by name
    pub fn switch(&self, name: &str) -> Option<LogicalSwitch> {
        self.switches.lock().unwrap().get(name).cloned()
    }

    /// Look up a router by name
    pub fn router(&self, name: &str) -> Option<LogicalRouter> {
        self.routers.lock().unwrap().get(name).cloned()
    }

    /// Look up a port group by name
    pub fn port_group(&self, name: &str) -> Option<PortGroup> {
        self.port_groups.lock().unwrap().get(name).cloned()
    }

    /// Look up a load balancer by name
    pub fn load_balancer(&self, name: &str) -> Option<LoadBalancer> {
        self.load_balancers.lock().unwrap().get(name).cloned()
    }

    /// Every NAT rule across routers
    pub fn nat_rules(&self) -> Vec<NatRule> {
        self.nat_rules.lock().unwrap().clone()
    }

    /// Records a call and returns an injected failure, if any.
    pub(crate) fn enter(&self, operation: &str, name: &str) -> Result<(), SdnError> {
        if let Some(error) = self.failures.lock().unwrap().remove(operation) {
            return Err(error);
        }
        self.calls.lock().unwrap().push(format!("{} {}", operation, name));
        Ok(())
    }
}

#[async_trait::async_trait]
impl SdnClientTrait for MockSdnClient {
    async fn list_logical_switches(&self) -> Result<Vec<LogicalSwitch>, SdnError> {
        topology::list_logical_switches(self).await
    }

    async fn logical_switch_exists(&self, name: &str) -> Result<bool, SdnError> {
        topology::logical_switch_exists(self, name).await
    }

    async fn create_logical_switch(&self, switch: &LogicalSwitch, router: &str) -> Result<(), SdnError> {
        topology::create_logical_switch(self, switch, router).await
    }

    async fn delete_logical_switch(&self, name: &str, router: &str) -> Result<(), SdnError> {
        topology::delete_logical_switch(self, name, router).await
    }

    async fn list_logical_routers(&self) -> Result<Vec<LogicalRouter>, SdnError> {
        topology::list_logical_routers(self).await
    }

    async fn create_logical_router(&self, name: &str, external_ids: &ExternalIds) -> Result<(), SdnError> {
        topology::create_logical_router(self, name, external_ids).await
    }

    async fn delete_logical_router(&self, name: &str) -> Result<(), SdnError> {
        topology::delete_logical_router(self, name).await
    }

    async fn set_static_routes(&self, router: &str, routes: &[StaticRoute]) -> Result<(), SdnError> {
        topology::set_static_routes(self, router, routes).await
    }

    async fn list_logical_switch_ports(&self, switch: Option<&str>) -> Result<Vec<LogicalSwitchPort>, SdnError> {
        topology::list_logical_switch_ports(self, switch).await
    }

    async fn create_logical_switch_port(&self, port: &LogicalSwitchPort) -> Result<(), SdnError> {
        topology::create_logical_switch_port(self, port).await
    }

    async fn delete_logical_switch_port(&self, name: &str) -> Result<(), SdnError> {
        topology::delete_logical_switch_port(self, name).await
    }

    async fn list_nat_rules(&self, router: &str) -> Result<Vec<NatRule>, SdnError> {
        services::list_nat_rules(self, router).await
    }

    async fn add_nat_rule(&self, rule: &NatRule) -> Result<(), SdnError> {
        services::add_nat_rule(self, rule).await
    }

    async fn delete_nat_rule(&self, router: &str, nat_type: NatType, logical_ip: &str) -> Result<(), SdnError> {
        services::delete_nat_rule(self, router, nat_type, logical_ip).await
    }

    async fn list_load_balancers(&self) -> Result<Vec<LoadBalancer>, SdnError> {
        services::list_load_balancers(self).await
    }

    async fn create_load_balancer(&self, name: &str, protocol: LbProtocol) -> Result<(), SdnError> {
        services::create_load_balancer(self, name, protocol).await
    }

    async fn set_load_balancer_vip(&self, name: &str, vip: &str, backends: &[String]) -> Result<(), SdnError> {
        services::set_load_balancer_vip(self, name, vip, backends).await
    }

    async fn delete_load_balancer_vip(&self, name: &str, vip: &str) -> Result<(), SdnError> {
        services::delete_load_balancer_vip(self, name, vip).await
    }

    async fn list_port_groups(&self) -> Result<Vec<PortGroup>, SdnError> {
        services::list_port_groups(self).await
    }

    async fn apply_port_group(&self, group: &PortGroup) -> Result<(), SdnError> {
        services::apply_port_group(self, group).await
    }

    async fn delete_port_group(&self, name: &str) -> Result<(), SdnError> {
        services::delete_port_group(self, name).await
    }
}
