//! Service reconciler
//!
//! Programs one VIP per (cluster IP, port) on the cluster TCP or UDP load
//! balancer, with the ready endpoint addresses as backends.

use super::Reconciler;
use crate::error::ControllerError;
use crate::router::split_key;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::{debug, info};

/// A VIP written to a load balancer on behalf of a service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgrammedVip {
    /// Load balancer name
    pub lb: String,
    /// `ip:port`, `[ip]:port` for IPv6
    pub vip: String,
}

/// Renders `ip:port`, bracketing IPv6 addresses.
pub fn format_vip(ip: &IpAddr, port: i32) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}:{}", v4, port),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
    }
}

/// Cluster IPs of a service; empty for headless services.
fn cluster_ips(service: &Service) -> Vec<IpAddr> {
    let Some(spec) = service.spec.as_ref() else {
        return Vec::new();
    };
    let listed = spec.cluster_ips.clone().unwrap_or_default();
    let ips = if listed.is_empty() {
        spec.cluster_ip.iter().cloned().collect()
    } else {
        listed
    };
    ips.iter().filter_map(|ip| ip.parse().ok()).collect()
}

/// Backend addresses for a service port: ready endpoint addresses of the same family.
fn backends(endpoints: Option<&Endpoints>, port_name: Option<&str>, family_v4: bool) -> Vec<String> {
    let mut out = Vec::new();
    for subset in endpoints.and_then(|e| e.subsets.as_ref()).into_iter().flatten() {
        let ports = subset.ports.as_deref().unwrap_or_default();
        let target = ports
            .iter()
            .find(|p| p.name.as_deref().filter(|n| !n.is_empty()) == port_name.filter(|n| !n.is_empty()))
            .or_else(|| ports.first().filter(|_| ports.len() == 1));
        let Some(target) = target else {
            continue;
        };
        for address in subset.addresses.as_deref().unwrap_or_default() {
            if let Ok(ip) = address.ip.parse::<IpAddr>()
                && ip.is_ipv4() == family_v4
            {
                out.push(format_vip(&ip, target.port));
            }
        }
    }
    out.sort();
    out.dedup();
    out
}

impl Reconciler {
    fn load_balancer_for(&self, protocol: Option<&str>) -> Option<&str> {
        match protocol.unwrap_or("TCP") {
            "TCP" => Some(self.config.cluster_tcp_loadbalancer.as_str()),
            "UDP" => Some(self.config.cluster_udp_loadbalancer.as_str()),
            _ => None,
        }
    }

    /// VIPs and backends a service should have.
    pub(crate) fn desired_vips(&self, service: &Service, endpoints: Option<&Endpoints>) -> Vec<(ProgrammedVip, Vec<String>)> {
        let ips = cluster_ips(service);
        let ports = service
            .spec
            .as_ref()
            .and_then(|s| s.ports.clone())
            .unwrap_or_default();
        let mut desired = Vec::new();
        for ip in &ips {
            for port in &ports {
                let Some(lb) = self.load_balancer_for(port.protocol.as_deref()) else {
                    continue;
                };
                desired.push((
                    ProgrammedVip {
                        lb: lb.to_string(),
                        vip: format_vip(ip, port.port),
                    },
                    backends(endpoints, port.name.as_deref(), ip.is_ipv4()),
                ));
            }
        }
        desired
    }

    /// Every VIP that some live service wants, used by garbage collection.
    pub(crate) fn all_desired_vips(&self) -> HashSet<ProgrammedVip> {
        self.cluster
            .services()
            .iter()
            .flat_map(|service| {
                let namespace = service.metadata.namespace.as_deref().unwrap_or_default();
                let name = service.metadata.name.as_deref().unwrap_or_default();
                let endpoints = self.cluster.endpoints(namespace, name);
                self.desired_vips(service, endpoints.as_deref())
            })
            .map(|(vip, _)| vip)
            .collect()
    }

    /// Writes a service's VIPs and drops the ones it no longer has.
    pub async fn reconcile_service(&self, key: &str) -> Result<(), ControllerError> {
        if !self.config.enable_lb {
            return Ok(());
        }
        let (namespace, name) = split_key(key);
        let Some(service) = self.cluster.service(namespace, name) else {
            return self.remove_service_vips(key).await;
        };
        if cluster_ips(&service).is_empty() {
            debug!("Service {} is headless", key);
            return self.remove_service_vips(key).await;
        }
        info!("Reconciling Service {}", key);

        let endpoints = self.cluster.endpoints(namespace, name);
        let desired = self.desired_vips(&service, endpoints.as_deref());
        for (vip, backends) in &desired {
            self.sdn.set_load_balancer_vip(&vip.lb, &vip.vip, backends).await?;
        }

        let keep: HashSet<&ProgrammedVip> = desired.iter().map(|(v, _)| v).collect();
        let previous = self.service_vips().get(key).cloned().unwrap_or_default();
        for stale in previous.iter().filter(|v| !keep.contains(v)) {
            debug!("Removing stale VIP {} of Service {}", stale.vip, key);
            self.sdn.delete_load_balancer_vip(&stale.lb, &stale.vip).await?;
        }
        self.service_vips()
            .insert(key.to_string(), desired.into_iter().map(|(v, _)| v).collect());
        Ok(())
    }

    /// Removes a deleted service's VIPs.
    pub async fn reconcile_delete_service(&self, key: &str) -> Result<(), ControllerError> {
        if !self.config.enable_lb {
            return Ok(());
        }
        let (namespace, name) = split_key(key);
        if let Some(service) = self.cluster.service(namespace, name)
            && !cluster_ips(&service).is_empty()
        {
            debug!("Service {} was recreated, skipping delete", key);
            return Ok(());
        }
        self.remove_service_vips(key).await
    }

    async fn remove_service_vips(&self, key: &str) -> Result<(), ControllerError> {
        let programmed = self.service_vips().get(key).cloned().unwrap_or_default();
        if !programmed.is_empty() {
            info!("Removing {} VIPs of Service {}", programmed.len(), key);
        }
        for vip in &programmed {
            self.sdn.delete_load_balancer_vip(&vip.lb, &vip.vip).await?;
        }
        self.service_vips().remove(key);
        Ok(())
    }
}
