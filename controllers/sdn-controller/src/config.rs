//! Controller configuration, read from environment variables.

use crate::backoff::ExponentialBackoff;
use crate::error::ControllerError;
use crate::keymutex::DEFAULT_BUCKETS;
use crate::leader::LeaseSettings;
use ipam::net::{check_cidrs, check_protocol, derive_gateway};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Workers per queue (namespace and service-delete queues always run one)
    pub worker_num: usize,
    pub default_vpc: String,
    pub cluster_router: String,
    pub default_logical_switch: String,
    pub default_cidr: String,
    pub default_gateway: String,
    pub default_exclude_ips: Vec<String>,
    pub node_switch: String,
    pub node_switch_cidr: String,
    pub node_switch_gateway: String,
    pub enable_lb: bool,
    pub enable_np: bool,
    pub cluster_tcp_loadbalancer: String,
    pub cluster_udp_loadbalancer: String,
    pub enable_leader_election: bool,
    pub lease: LeaseSettings,
    /// Northbound database address; `None` uses the local socket
    pub ovn_nb_addr: Option<String>,
    pub ovn_timeout: Duration,
    pub cache_sync_timeout: Duration,
    /// IP records that may fail to load before bootstrap gives up
    pub ipam_init_max_failures: usize,
    pub subnet_resync: Duration,
    pub pod_resync: Duration,
    pub node_resync: Duration,
    pub port_gc_interval: Duration,
    /// Poll interval of bootstrap readiness gates
    pub readiness_poll: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub key_lock_buckets: usize,
}

fn parse<T: FromStr>(name: &str, value: Option<String>, default: T) -> Result<T, ControllerError> {
    match value.filter(|v| !v.trim().is_empty()) {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| {
            ControllerError::InvalidConfig(format!("{} has invalid value {:?}", name, v))
        }),
    }
}

fn validate_cidr(name: &str, cidr: &str) -> Result<(), ControllerError> {
    check_cidrs(cidr).map_err(|e| ControllerError::InvalidConfig(format!("{}: {}", name, e)))
}

/// Gateway given in `value`, or the first usable address(es) of `cidr`.
fn gateway_for(name: &str, value: Option<String>, cidr: &str) -> Result<String, ControllerError> {
    let gateway = match value.filter(|v| !v.is_empty()) {
        Some(gw) => gw,
        None => derive_gateway(cidr).map_err(|e| ControllerError::InvalidConfig(format!("{}: {}", name, e)))?,
    };
    let gw_protocol = check_protocol(&gateway)
        .map_err(|e| ControllerError::InvalidConfig(format!("{}: {}", name, e)))?;
    let cidr_protocol = check_protocol(cidr)
        .map_err(|e| ControllerError::InvalidConfig(format!("{}: {}", name, e)))?;
    if gw_protocol != cidr_protocol {
        return Err(ControllerError::InvalidConfig(format!(
            "{} {} is {} but the CIDR {} is {}",
            name, gateway, gw_protocol, cidr, cidr_protocol
        )));
    }
    Ok(gateway)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Configuration {
    /// Reads the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |name: &str, default: &str| lookup(name).filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string());
        let seconds = |name: &str, default: u64| parse(name, lookup(name), default).map(Duration::from_secs);

        let worker_num: usize = parse("WORKER_NUM", lookup("WORKER_NUM"), 3)?;
        if worker_num == 0 {
            return Err(ControllerError::InvalidConfig("WORKER_NUM must be at least 1".to_string()));
        }

        let default_cidr = string("DEFAULT_CIDR", "10.16.0.0/16");
        validate_cidr("DEFAULT_CIDR", &default_cidr)?;
        let default_gateway = gateway_for("DEFAULT_GATEWAY", lookup("DEFAULT_GATEWAY"), &default_cidr)?;
        let default_exclude_ips = match lookup("DEFAULT_EXCLUDE_IPS").filter(|v| !v.is_empty()) {
            Some(list) => split_list(&list),
            None => split_list(&default_gateway),
        };

        let node_switch_cidr = string("NODE_SWITCH_CIDR", "100.64.0.0/16");
        validate_cidr("NODE_SWITCH_CIDR", &node_switch_cidr)?;
        let node_switch_gateway = gateway_for("NODE_SWITCH_GATEWAY", lookup("NODE_SWITCH_GATEWAY"), &node_switch_cidr)?;

        let pod_name = lookup("POD_NAME")
            .or_else(|| lookup("HOSTNAME"))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "sdn-controller".to_string());
        let lease_namespace = lookup("LEASE_NAMESPACE")
            .or_else(|| lookup("POD_NAMESPACE"))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "kube-system".to_string());
        let lease = LeaseSettings {
            name: string("LEASE_NAME", "sdn-controller"),
            namespace: lease_namespace,
            identity: pod_name,
            duration_seconds: parse("LEASE_DURATION_SECONDS", lookup("LEASE_DURATION_SECONDS"), 15)?,
            grace_seconds: parse("LEASE_GRACE_SECONDS", lookup("LEASE_GRACE_SECONDS"), 5)?,
        };
        if lease.grace_seconds >= lease.duration_seconds {
            return Err(ControllerError::InvalidConfig(format!(
                "LEASE_GRACE_SECONDS ({}) must be below LEASE_DURATION_SECONDS ({})",
                lease.grace_seconds, lease.duration_seconds
            )));
        }

        let backoff_base = Duration::from_millis(parse("QUEUE_BACKOFF_BASE_MS", lookup("QUEUE_BACKOFF_BASE_MS"), 5)?);
        let backoff_max = seconds("QUEUE_BACKOFF_MAX_SECONDS", 1000)?;
        if backoff_base.is_zero() || backoff_base > backoff_max {
            return Err(ControllerError::InvalidConfig(
                "QUEUE_BACKOFF_BASE_MS must be positive and below QUEUE_BACKOFF_MAX_SECONDS".to_string(),
            ));
        }

        Ok(Self {
            worker_num,
            default_vpc: string("DEFAULT_VPC", "ovn-cluster"),
            cluster_router: string("CLUSTER_ROUTER", "ovn-cluster"),
            default_logical_switch: string("DEFAULT_LOGICAL_SWITCH", "ovn-default"),
            default_cidr,
            default_gateway,
            default_exclude_ips,
            node_switch: string("NODE_SWITCH", "join"),
            node_switch_cidr,
            node_switch_gateway,
            enable_lb: parse("ENABLE_LB", lookup("ENABLE_LB"), true)?,
            enable_np: parse("ENABLE_NP", lookup("ENABLE_NP"), true)?,
            cluster_tcp_loadbalancer: string("CLUSTER_TCP_LOADBALANCER", "cluster-tcp-loadbalancer"),
            cluster_udp_loadbalancer: string("CLUSTER_UDP_LOADBALANCER", "cluster-udp-loadbalancer"),
            enable_leader_election: parse("ENABLE_LEADER_ELECTION", lookup("ENABLE_LEADER_ELECTION"), true)?,
            lease,
            ovn_nb_addr: lookup("OVN_NB_ADDR").filter(|v| !v.is_empty()),
            ovn_timeout: seconds("OVN_TIMEOUT_SECONDS", 60)?,
            cache_sync_timeout: seconds("CACHE_SYNC_TIMEOUT_SECONDS", 300)?,
            ipam_init_max_failures: parse("IPAM_INIT_MAX_FAILURES", lookup("IPAM_INIT_MAX_FAILURES"), 50)?,
            subnet_resync: seconds("SUBNET_RESYNC_SECONDS", 30)?,
            pod_resync: seconds("POD_RESYNC_SECONDS", 60)?,
            node_resync: seconds("NODE_RESYNC_SECONDS", 60)?,
            port_gc_interval: seconds("PORT_GC_RESYNC_SECONDS", 360)?,
            readiness_poll: seconds("READINESS_POLL_SECONDS", 3)?,
            backoff_base,
            backoff_max,
            key_lock_buckets: parse("KEY_LOCK_BUCKETS", lookup("KEY_LOCK_BUCKETS"), DEFAULT_BUCKETS)?,
        })
    }

    /// Per-queue retry policy.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.backoff_base, self.backoff_max)
    }

    /// Logs the effective configuration.
    pub fn log(&self) {
        info!("Configuration:");
        info!("  Workers per queue: {}", self.worker_num);
        info!("  Default VPC: {} (router {})", self.default_vpc, self.cluster_router);
        info!(
            "  Default subnet: {} {} gateway {}",
            self.default_logical_switch, self.default_cidr, self.default_gateway
        );
        info!(
            "  Node subnet: {} {} gateway {}",
            self.node_switch, self.node_switch_cidr, self.node_switch_gateway
        );
        info!("  Load balancers: {}, network policies: {}", self.enable_lb, self.enable_np);
        info!(
            "  Leader election: {} (lease {}/{})",
            self.enable_leader_election, self.lease.namespace, self.lease.name
        );
        info!("  Northbound: {}", self.ovn_nb_addr.as_deref().unwrap_or("local socket"));
    }
}
