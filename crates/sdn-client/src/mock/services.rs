//! NAT, load balancer and port group operations for MockSdnClient

use super::MockSdnClient;
use crate::error::SdnError;
use crate::models::*;
use std::collections::BTreeMap;

pub async fn list_nat_rules(client: &MockSdnClient, router: &str) -> Result<Vec<NatRule>, SdnError> {
    if !client.routers.lock().unwrap().contains_key(router) {
        return Err(SdnError::NotFound(format!("logical router {}", router)));
    }
    Ok(client
        .nat_rules
        .lock()
        .unwrap()
        .iter()
        .filter(|rule| rule.router == router)
        .cloned()
        .collect())
}

pub async fn add_nat_rule(client: &MockSdnClient, rule: &NatRule) -> Result<(), SdnError> {
    client.enter("add_nat_rule", &rule.logical_ip)?;
    let mut rules = client.nat_rules.lock().unwrap();
    rules.retain(|r| {
        !(r.router == rule.router && r.nat_type == rule.nat_type && r.logical_ip == rule.logical_ip)
    });
    rules.push(rule.clone());
    Ok(())
}

pub async fn delete_nat_rule(client: &MockSdnClient, router: &str, nat_type: NatType, logical_ip: &str) -> Result<(), SdnError> {
    client.enter("delete_nat_rule", logical_ip)?;
    client
        .nat_rules
        .lock()
        .unwrap()
        .retain(|r| !(r.router == router && r.nat_type == nat_type && r.logical_ip == logical_ip));
    Ok(())
}

pub async fn list_load_balancers(client: &MockSdnClient) -> Result<Vec<LoadBalancer>, SdnError> {
    Ok(client.load_balancers.lock().unwrap().values().cloned().collect())
}

pub async fn create_load_balancer(client: &MockSdnClient, name: &str, protocol: LbProtocol) -> Result<(), SdnError> {
    client.enter("create_load_balancer", name)?;
    client
        .load_balancers
        .lock()
        .unwrap()
        .entry(name.to_string())
        .or_insert_with(|| LoadBalancer {
            name: name.to_string(),
            protocol,
            vips: BTreeMap::new(),
        });
    Ok(())
}

pub async fn set_load_balancer_vip(client: &MockSdnClient, name: &str, vip: &str, backends: &[String]) -> Result<(), SdnError> {
    client.enter("set_load_balancer_vip", vip)?;
    let mut lbs = client.load_balancers.lock().unwrap();
    let lb = lbs
        .get_mut(name)
        .ok_or_else(|| SdnError::NotFound(format!("load balancer {}", name)))?;
    lb.vips.insert(vip.to_string(), backends.to_vec());
    Ok(())
}

pub async fn delete_load_balancer_vip(client: &MockSdnClient, name: &str, vip: &str) -> Result<(), SdnError> {
    client.enter("delete_load_balancer_vip", vip)?;
    if let Some(lb) = client.load_balancers.lock().unwrap().get_mut(name) {
        lb.vips.remove(vip);
    }
    Ok(())
}

pub async fn list_port_groups(client: &MockSdnClient) -> Result<Vec<PortGroup>, SdnError> {
    Ok(client.port_groups.lock().unwrap().values().cloned().collect())
}

pub async fn apply_port_group(client: &MockSdnClient, group: &PortGroup) -> Result<(), SdnError> {
    client.enter("apply_port_group", &group.name)?;
    client
        .port_groups
        .lock()
        .unwrap()
        .insert(group.name.clone(), group.clone());
    Ok(())
}

pub async fn delete_port_group(client: &MockSdnClient, name: &str) -> Result<(), SdnError> {
    client.enter("delete_port_group", name)?;
    client.port_groups.lock().unwrap().remove(name);
    Ok(())
}
