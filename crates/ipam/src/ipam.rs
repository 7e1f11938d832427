//! Multi-subnet allocator
//!
//! `Ipam` owns every `Subnet` pool behind one internal lock. It is an
//! explicitly owned object shared by the controller through an `Arc`; there
//! is no process-wide state.

use crate::error::{IpamError, Result};
use crate::subnet::{Allocation, AllocationStrategy, PoolSnapshot, Subnet};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Address allocator over all known subnets
#[derive(Debug, Default)]
pub struct Ipam {
    subnets: RwLock<HashMap<String, Subnet>>,
}

impl Ipam {
    /// Creates an allocator with no subnets.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Subnet>> {
        self.subnets.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Subnet>> {
        self.subnets.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subnet, or rebuilds an existing one keeping its allocations.
    pub fn add_or_update_subnet(
        &self,
        name: &str,
        cidr: &str,
        excludes: &[String],
        strategy: AllocationStrategy,
    ) -> Result<()> {
        let mut subnets = self.write();
        if let Some(existing) = subnets.get_mut(name) {
            let unchanged = existing.cidr() == cidr
                && existing.strategy() == strategy
                && existing.excludes() == crate::net::expand_exclude_ips(excludes, cidr);
            if !unchanged {
                info!("Updating IPAM subnet {} with CIDR {}", name, cidr);
                existing.update(cidr, excludes, strategy)?;
            }
            return Ok(());
        }
        let subnet = Subnet::new(name, cidr, excludes, strategy)?;
        info!("Adding IPAM subnet {} with CIDR {}", name, cidr);
        subnets.insert(name.to_string(), subnet);
        Ok(())
    }

    /// Forgets a subnet and all of its allocations; returns whether it existed.
    pub fn delete_subnet(&self, name: &str) -> bool {
        let removed = self.write().remove(name).is_some();
        if removed {
            info!("Deleted IPAM subnet {}", name);
        }
        removed
    }

    /// Whether a subnet is registered.
    pub fn contains_subnet(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Names of all registered subnets.
    pub fn subnet_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Allocates for `owner` in `subnet`; see `Subnet::allocate`.
    ///
    /// Once the new allocation succeeds, anything the owner held in other
    /// subnets is released, so an owner lives in at most one subnet.
    pub fn allocate(
        &self,
        owner: &str,
        subnet: &str,
        preferred_ip: Option<&str>,
        preferred_mac: Option<&str>,
    ) -> Result<Allocation> {
        let mut subnets = self.write();
        let allocation = subnets
            .get_mut(subnet)
            .ok_or_else(|| IpamError::SubnetNotFound(subnet.to_string()))?
            .allocate(owner, preferred_ip, preferred_mac)?;

        for (name, other) in subnets.iter_mut() {
            if name != subnet && other.release(owner).is_some() {
                debug!("Released {} from subnet {} after moving to {}", owner, name, subnet);
            }
        }
        Ok(allocation)
    }

    /// Releases `owner` everywhere; empty when the owner held nothing.
    pub fn release(&self, owner: &str) -> Vec<Allocation> {
        self.write()
            .values_mut()
            .filter_map(|subnet| subnet.release(owner))
            .collect()
    }

    /// Releases `owner` in one subnet; `Ok(None)` when the owner held nothing there.
    pub fn release_in_subnet(&self, owner: &str, subnet: &str) -> Result<Option<Allocation>> {
        self.write()
            .get_mut(subnet)
            .map(|s| s.release(owner))
            .ok_or_else(|| IpamError::SubnetNotFound(subnet.to_string()))
    }

    /// Current allocation of `owner`, in whichever subnet holds it.
    pub fn get_allocation(&self, owner: &str) -> Option<Allocation> {
        self.read()
            .values()
            .find_map(|subnet| subnet.get(owner).cloned())
    }

    /// Usage counters of one subnet.
    pub fn snapshot(&self, subnet: &str) -> Result<PoolSnapshot> {
        self.read()
            .get(subnet)
            .map(Subnet::snapshot)
            .ok_or_else(|| IpamError::SubnetNotFound(subnet.to_string()))
    }

    /// Owner keys holding an allocation in `subnet`.
    pub fn owners(&self, subnet: &str) -> Vec<String> {
        self.read()
            .get(subnet)
            .map(|s| s.allocations().map(|a| a.owner.clone()).collect())
            .unwrap_or_default()
    }
}
