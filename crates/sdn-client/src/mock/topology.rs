//! Switch, router and port operations for MockSdnClient

use super::MockSdnClient;
use crate::error::SdnError;
use crate::models::*;

pub async fn list_logical_switches(client: &MockSdnClient) -> Result<Vec<LogicalSwitch>, SdnError> {
    Ok(client.switches.lock().unwrap().values().cloned().collect())
}

pub async fn logical_switch_exists(client: &MockSdnClient, name: &str) -> Result<bool, SdnError> {
    Ok(client.switches.lock().unwrap().contains_key(name))
}

pub async fn create_logical_switch(client: &MockSdnClient, switch: &LogicalSwitch, router: &str) -> Result<(), SdnError> {
    client.enter("create_logical_switch", &switch.name)?;
    if switch.name.is_empty() {
        return Err(SdnError::InvalidRequest("logical switch name is empty".to_string()));
    }
    if !client.routers.lock().unwrap().contains_key(router) {
        return Err(SdnError::NotFound(format!("logical router {}", router)));
    }
    client.switches.lock().unwrap().insert(switch.name.clone(), switch.clone());
    Ok(())
}

pub async fn delete_logical_switch(client: &MockSdnClient, name: &str, _router: &str) -> Result<(), SdnError> {
    client.enter("delete_logical_switch", name)?;
    client.switches.lock().unwrap().remove(name);
    client.ports.lock().unwrap().retain(|_, port| port.switch != name);
    Ok(())
}

pub async fn list_logical_routers(client: &MockSdnClient) -> Result<Vec<LogicalRouter>, SdnError> {
    Ok(client.routers.lock().unwrap().values().cloned().collect())
}

pub async fn create_logical_router(client: &MockSdnClient, name: &str, external_ids: &ExternalIds) -> Result<(), SdnError> {
    client.enter("create_logical_router", name)?;
    let mut routers = client.routers.lock().unwrap();
    let router = routers.entry(name.to_string()).or_insert_with(|| LogicalRouter {
        name: name.to_string(),
        static_routes: Vec::new(),
        external_ids: ExternalIds::new(),
    });
    router.external_ids.extend(external_ids.clone());
    Ok(())
}

pub async fn delete_logical_router(client: &MockSdnClient, name: &str) -> Result<(), SdnError> {
    client.enter("delete_logical_router", name)?;
    client.routers.lock().unwrap().remove(name);
    Ok(())
}

pub async fn set_static_routes(client: &MockSdnClient, router: &str, routes: &[StaticRoute]) -> Result<(), SdnError> {
    client.enter("set_static_routes", router)?;
    let mut routers = client.routers.lock().unwrap();
    let entry = routers
        .get_mut(router)
        .ok_or_else(|| SdnError::NotFound(format!("logical router {}", router)))?;
    let mut routes = routes.to_vec();
    routes.sort();
    entry.static_routes = routes;
    Ok(())
}

pub async fn list_logical_switch_ports(client: &MockSdnClient, switch: Option<&str>) -> Result<Vec<LogicalSwitchPort>, SdnError> {
    Ok(client
        .ports
        .lock()
        .unwrap()
        .values()
        .filter(|port| switch.is_none_or(|s| port.switch == s))
        .cloned()
        .collect())
}

pub async fn create_logical_switch_port(client: &MockSdnClient, port: &LogicalSwitchPort) -> Result<(), SdnError> {
    client.enter("create_logical_switch_port", &port.name)?;
    if !client.switches.lock().unwrap().contains_key(&port.switch) {
        return Err(SdnError::NotFound(format!("logical switch {}", port.switch)));
    }
    client.ports.lock().unwrap().insert(port.name.clone(), port.clone());
    Ok(())
}

pub async fn delete_logical_switch_port(client: &MockSdnClient, name: &str) -> Result<(), SdnError> {
    client.enter("delete_logical_switch_port", name)?;
    client.ports.lock().unwrap().remove(name);
    Ok(())
}
