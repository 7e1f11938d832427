//! Per-subnet address pool
//!
//! A `Subnet` owns one `FamilyPool` per configured family and the ledger of
//! owner allocations. The free view of each family is the usable range
//! `[first_usable, last_usable]` minus the exclude ranges minus every
//! allocated address; it is always recomputable from those three inputs.

use crate::error::{IpamError, Result};
use crate::net::{
    self, Family, Protocol, address_count, expand_exclude_ips, first_usable, int_to_ip,
    ip_to_int, last_usable, parse_exclude_entry,
};
use crate::range::IpRangeList;
use ipnet::IpNet;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Random candidates drawn before a random allocation gives up.
pub const RANDOM_RETRY_BUDGET: usize = 256;

/// Attempts at generating a MAC not already used in the subnet.
const MAC_RETRY_BUDGET: usize = 64;

/// How free addresses are picked when the caller has no preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationStrategy {
    /// Lowest free address first
    #[default]
    Sequential,
    /// Uniformly random free address (IPv4 only; IPv6 stays sequential)
    Random,
}

/// Addresses granted to one owner in one subnet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Owner key (e.g. `namespace/pod` or `node-<name>`)
    pub owner: String,
    /// Subnet name
    pub subnet: String,
    /// IPv4 member, if the subnet has an IPv4 block
    pub v4: Option<IpAddr>,
    /// IPv6 member, if the subnet has an IPv6 block
    pub v6: Option<IpAddr>,
    /// MAC address
    pub mac: Option<String>,
}

impl Allocation {
    /// Address specifier in dual-stack string form (`"<v4>,<v6>"`).
    pub fn ip_string(&self) -> String {
        match (self.v4, self.v6) {
            (Some(v4), Some(v6)) => format!("{},{}", v4, v6),
            (Some(v4), None) => v4.to_string(),
            (None, Some(v6)) => v6.to_string(),
            (None, None) => String::new(),
        }
    }

    /// IPv4 member as text, empty when absent.
    pub fn v4_string(&self) -> String {
        self.v4.map(|ip| ip.to_string()).unwrap_or_default()
    }

    /// IPv6 member as text, empty when absent.
    pub fn v6_string(&self) -> String {
        self.v6.map(|ip| ip.to_string()).unwrap_or_default()
    }

    fn addresses(&self) -> impl Iterator<Item = IpAddr> {
        self.v4.into_iter().chain(self.v6)
    }
}

/// Derived usage counters of a subnet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Subnet name
    pub subnet: String,
    /// Free IPv4 addresses
    pub v4_available: u128,
    /// Allocated IPv4 addresses
    pub v4_using: u128,
    /// Free IPv6 addresses
    pub v6_available: u128,
    /// Allocated IPv6 addresses
    pub v6_using: u128,
    /// Allocated IPv4 addresses, ascending
    pub v4_using_ips: Vec<String>,
    /// Allocated IPv6 addresses, ascending
    pub v6_using_ips: Vec<String>,
}

/// One family's block, exclusions and free view
#[derive(Debug, Clone)]
pub struct FamilyPool {
    cidr: IpNet,
    excludes: Vec<String>,
    excluded: IpRangeList,
    free: IpRangeList,
}

impl FamilyPool {
    fn new(cidr: IpNet, excludes: Vec<String>) -> Self {
        let mut excluded = IpRangeList::new();
        for entry in &excludes {
            if let Ok((_, start, end)) = parse_exclude_entry(entry) {
                excluded.insert(start, end);
            }
        }

        let mut free = IpRangeList::new();
        if address_count(&cidr) > 0 {
            free.insert(ip_to_int(first_usable(&cidr)), ip_to_int(last_usable(&cidr)));
        }
        for (start, end) in excluded.iter() {
            free.remove(start, end);
        }

        Self {
            cidr,
            excludes,
            excluded,
            free,
        }
    }

    fn family(&self) -> Family {
        Family::of_net(&self.cidr)
    }

    /// The CIDR block.
    pub fn cidr(&self) -> &IpNet {
        &self.cidr
    }

    /// Normalized exclude entries of this family.
    pub fn excludes(&self) -> &[String] {
        &self.excludes
    }

    fn is_usable(&self, value: u128) -> bool {
        address_count(&self.cidr) > 0
            && ip_to_int(first_usable(&self.cidr)) <= value
            && value <= ip_to_int(last_usable(&self.cidr))
    }

    fn is_excluded(&self, value: u128) -> bool {
        self.excluded.contains(value)
    }

    fn take_sequential(&mut self) -> Option<u128> {
        let value = self.free.first()?;
        self.free.remove_one(value);
        Some(value)
    }

    fn take_random(&mut self) -> Option<u128> {
        if self.free.is_empty() {
            return None;
        }
        for _ in 0..RANDOM_RETRY_BUDGET {
            let candidate = ip_to_int(net::random_address(&self.cidr));
            if self.free.remove_one(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Returns an address to the free view unless it is excluded or outside the block.
    fn give_back(&mut self, value: u128) {
        if self.is_usable(value) && !self.is_excluded(value) {
            self.free.insert(value, value);
        }
    }
}

/// Address pool of one subnet
#[derive(Debug, Clone)]
pub struct Subnet {
    name: String,
    cidr: String,
    protocol: Protocol,
    strategy: AllocationStrategy,
    v4: Option<FamilyPool>,
    v6: Option<FamilyPool>,
    allocations: HashMap<String, Allocation>,
    ip_owners: HashMap<IpAddr, String>,
    mac_owners: HashMap<String, String>,
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.cidr)
    }
}

impl Subnet {
    /// Builds an empty pool for `cidr` (one or two comma-joined blocks).
    pub fn new(
        name: &str,
        cidr: &str,
        excludes: &[String],
        strategy: AllocationStrategy,
    ) -> Result<Self> {
        let (protocol, v4, v6) = build_pools(cidr, excludes)?;
        Ok(Self {
            name: name.to_string(),
            cidr: cidr.to_string(),
            protocol,
            strategy,
            v4,
            v6,
            allocations: HashMap::new(),
            ip_owners: HashMap::new(),
            mac_owners: HashMap::new(),
        })
    }

    /// Subnet name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// CIDR specifier the pool was built from.
    pub fn cidr(&self) -> &str {
        &self.cidr
    }

    /// Configured protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Allocation strategy.
    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    /// Normalized exclude entries, v4 first.
    pub fn excludes(&self) -> Vec<String> {
        self.pools()
            .flat_map(|pool| pool.excludes().iter().cloned())
            .collect()
    }

    /// Rebuilds the pools for a new CIDR/exclude/strategy, keeping live allocations.
    ///
    /// Allocated addresses that fall outside the new blocks stay owned until
    /// released; they are simply never handed out again.
    pub fn update(
        &mut self,
        cidr: &str,
        excludes: &[String],
        strategy: AllocationStrategy,
    ) -> Result<()> {
        let (protocol, v4, v6) = build_pools(cidr, excludes)?;
        self.cidr = cidr.to_string();
        self.protocol = protocol;
        self.strategy = strategy;
        self.v4 = v4;
        self.v6 = v6;

        let owned: Vec<IpAddr> = self.ip_owners.keys().copied().collect();
        for ip in owned {
            if !self.contains(&ip) {
                warn!(
                    "Allocated address {} is outside subnet {} after update",
                    ip, self.name
                );
                continue;
            }
            if let Some(pool) = self.pool_mut(Family::of(&ip)) {
                pool.free.remove_one(ip_to_int(ip));
            }
        }
        Ok(())
    }

    fn pools(&self) -> impl Iterator<Item = &FamilyPool> {
        self.v4.iter().chain(self.v6.iter())
    }

    fn pool(&self, family: Family) -> Option<&FamilyPool> {
        match family {
            Family::V4 => self.v4.as_ref(),
            Family::V6 => self.v6.as_ref(),
        }
    }

    fn pool_mut(&mut self, family: Family) -> Option<&mut FamilyPool> {
        match family {
            Family::V4 => self.v4.as_mut(),
            Family::V6 => self.v6.as_mut(),
        }
    }

    fn families(&self) -> Vec<Family> {
        self.pools().map(FamilyPool::family).collect()
    }

    /// Allocation held by `owner`.
    pub fn get(&self, owner: &str) -> Option<&Allocation> {
        self.allocations.get(owner)
    }

    /// Owner of an address, if allocated.
    pub fn owner_of(&self, ip: &IpAddr) -> Option<&str> {
        self.ip_owners.get(ip).map(String::as_str)
    }

    /// Every live allocation.
    pub fn allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.values()
    }

    /// Number of owners holding an allocation.
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    /// Whether no owner holds an allocation.
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Grants addresses (and a MAC) to `owner`.
    ///
    /// With a preferred address the request must match the subnet protocol
    /// (both members for dual-stack) and every member must be usable, not
    /// excluded and not held by another owner. Repeating a request is
    /// idempotent. Without a preference an existing allocation is kept,
    /// completed with a free address for any family the subnet gained since
    /// and stripped of a family it lost. Dual-stack allocation is
    /// all-or-nothing.
    pub fn allocate(
        &mut self,
        owner: &str,
        preferred_ip: Option<&str>,
        preferred_mac: Option<&str>,
    ) -> Result<Allocation> {
        let mac = self.resolve_mac(owner, preferred_mac)?;
        let existing = self.allocations.get(owner).cloned();

        let preferred_ip = preferred_ip.map(str::trim).filter(|s| !s.is_empty());
        let (v4, v6) = match (preferred_ip, existing.as_ref()) {
            (Some(requested), _) => self.reserve_requested(owner, requested, existing.as_ref())?,
            (None, Some(current)) => self.complete_existing(owner, current)?,
            (None, None) => self.reserve_free(owner, (None, None))?,
        };

        if let Some(old) = &existing {
            for ip in old.addresses() {
                if Some(ip) != v4 && Some(ip) != v6 {
                    self.release_address(ip);
                }
            }
            if let Some(old_mac) = &old.mac
                && Some(old_mac) != mac.as_ref()
            {
                self.mac_owners.remove(old_mac);
            }
        }

        if let Some(mac) = &mac {
            self.mac_owners.insert(mac.clone(), owner.to_string());
        }
        let allocation = Allocation {
            owner: owner.to_string(),
            subnet: self.name.clone(),
            v4,
            v6,
            mac,
        };
        if existing.as_ref() != Some(&allocation) {
            debug!(
                "Allocated {} to {} in subnet {}",
                allocation.ip_string(),
                owner,
                self.name
            );
        }
        self.allocations.insert(owner.to_string(), allocation.clone());
        Ok(allocation)
    }

    /// Returns the owner's addresses to the free view; `None` when the owner held nothing.
    pub fn release(&mut self, owner: &str) -> Option<Allocation> {
        let allocation = self.allocations.remove(owner)?;
        for ip in allocation.addresses() {
            self.release_address(ip);
        }
        if let Some(mac) = &allocation.mac {
            self.mac_owners.remove(mac);
        }
        debug!(
            "Released {} from {} in subnet {}",
            allocation.ip_string(),
            owner,
            self.name
        );
        Some(allocation)
    }

    /// Usage counters derived from the current ledger.
    pub fn snapshot(&self) -> PoolSnapshot {
        let mut v4_using: Vec<IpAddr> = Vec::new();
        let mut v6_using: Vec<IpAddr> = Vec::new();
        for ip in self.ip_owners.keys() {
            match Family::of(ip) {
                Family::V4 => v4_using.push(*ip),
                Family::V6 => v6_using.push(*ip),
            }
        }
        v4_using.sort_unstable();
        v6_using.sort_unstable();

        let available = |pool: &Option<FamilyPool>| pool.as_ref().map_or(0, |p| p.free.count());
        PoolSnapshot {
            subnet: self.name.clone(),
            v4_available: available(&self.v4),
            v4_using: v4_using.len() as u128,
            v6_available: available(&self.v6),
            v6_using: v6_using.len() as u128,
            v4_using_ips: v4_using.iter().map(ToString::to_string).collect(),
            v6_using_ips: v6_using.iter().map(ToString::to_string).collect(),
        }
    }

    fn resolve_mac(&self, owner: &str, preferred: Option<&str>) -> Result<Option<String>> {
        if let Some(requested) = preferred.map(str::trim).filter(|s| !s.is_empty()) {
            let mac = net::normalize_mac(requested)?;
            return match self.mac_owners.get(&mac) {
                Some(holder) if holder != owner => Err(IpamError::AddressConflict(format!(
                    "MAC {} is already used by {} in subnet {}",
                    mac, holder, self.name
                ))),
                _ => Ok(Some(mac)),
            };
        }
        if let Some(mac) = self.allocations.get(owner).and_then(|a| a.mac.clone()) {
            return Ok(Some(mac));
        }
        for _ in 0..MAC_RETRY_BUDGET {
            let mac = net::generate_mac();
            if !self.mac_owners.contains_key(&mac) {
                return Ok(Some(mac));
            }
        }
        Err(IpamError::AddressSpaceExhausted(format!(
            "no unique MAC address left in subnet {}",
            self.name
        )))
    }

    fn parse_requested(&self, requested: &str) -> Result<Vec<IpAddr>> {
        let protocol = net::check_protocol(requested)?;
        if protocol != self.protocol {
            return Err(IpamError::ProtocolMismatch(format!(
                "{} is {} but subnet {} is {}",
                requested, protocol, self.name, self.protocol
            )));
        }
        requested
            .split(',')
            .map(|part| net::parse_ip(part.split('/').next().unwrap_or(part)))
            .collect()
    }

    fn reserve_requested(
        &mut self,
        owner: &str,
        requested: &str,
        existing: Option<&Allocation>,
    ) -> Result<(Option<IpAddr>, Option<IpAddr>)> {
        let addresses = self.parse_requested(requested)?;

        let mut reserved: Vec<IpAddr> = Vec::new();
        let mut result = (None, None);
        for ip in addresses {
            let already_held = existing.is_some_and(|a| a.addresses().any(|held| held == ip));
            if !already_held
                && let Err(e) = self.reserve_address(owner, ip)
            {
                for undo in reserved {
                    self.release_address(undo);
                }
                return Err(e);
            }
            if !already_held {
                reserved.push(ip);
            }
            match Family::of(&ip) {
                Family::V4 => result.0 = Some(ip),
                Family::V6 => result.1 = Some(ip),
            }
        }
        Ok(result)
    }

    fn reserve_address(&mut self, owner: &str, ip: IpAddr) -> Result<()> {
        let name = self.name.clone();
        if let Some(holder) = self.ip_owners.get(&ip)
            && holder != owner
        {
            return Err(IpamError::AddressConflict(format!(
                "{} is already allocated to {} in subnet {}",
                ip, holder, name
            )));
        }
        let pool = self.pool_mut(Family::of(&ip)).ok_or_else(|| {
            IpamError::ProtocolMismatch(format!("subnet {} has no block for {}", name, ip))
        })?;
        let value = ip_to_int(ip);
        if !pool.is_usable(value) {
            return Err(IpamError::InvalidAddress(format!(
                "{} is not a usable address of {}",
                ip, pool.cidr
            )));
        }
        if pool.is_excluded(value) {
            return Err(IpamError::AddressConflict(format!(
                "{} is excluded in subnet {}",
                ip, name
            )));
        }
        pool.free.remove_one(value);
        self.ip_owners.insert(ip, owner.to_string());
        Ok(())
    }

    /// Fits an existing allocation to the current families: members of a
    /// dropped family are left out and a missing family gets a free address.
    fn complete_existing(
        &mut self,
        owner: &str,
        current: &Allocation,
    ) -> Result<(Option<IpAddr>, Option<IpAddr>)> {
        let v4 = current.v4.filter(|_| self.v4.is_some());
        let v6 = current.v6.filter(|_| self.v6.is_some());
        self.reserve_free(owner, (v4, v6))
    }

    /// Reserves a free address for every family not already present in `held`.
    /// On failure only the addresses reserved by this call are rolled back.
    fn reserve_free(
        &mut self,
        owner: &str,
        held: (Option<IpAddr>, Option<IpAddr>),
    ) -> Result<(Option<IpAddr>, Option<IpAddr>)> {
        let mut result = held;
        let mut reserved: Vec<IpAddr> = Vec::new();
        for family in self.families() {
            let present = match family {
                Family::V4 => result.0.is_some(),
                Family::V6 => result.1.is_some(),
            };
            if present {
                continue;
            }
            let strategy = self.strategy;
            let name = self.name.clone();
            let taken = self.pool_mut(family).and_then(|pool| match (strategy, family) {
                (AllocationStrategy::Random, Family::V4) => pool.take_random(),
                _ => pool.take_sequential(),
            });
            let Some(value) = taken else {
                for ip in reserved {
                    self.release_address(ip);
                }
                return Err(IpamError::AddressSpaceExhausted(name));
            };
            let ip = int_to_ip(value, family);
            self.ip_owners.insert(ip, owner.to_string());
            reserved.push(ip);
            match family {
                Family::V4 => result.0 = Some(ip),
                Family::V6 => result.1 = Some(ip),
            }
        }
        Ok(result)
    }

    fn release_address(&mut self, ip: IpAddr) {
        self.ip_owners.remove(&ip);
        if let Some(pool) = self.pool_mut(Family::of(&ip)) {
            pool.give_back(ip_to_int(ip));
        }
    }

    /// Whether `ip` lies in one of the subnet's blocks.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.pool(Family::of(ip))
            .is_some_and(|pool| pool.cidr.contains(ip))
    }
}

type Pools = (Protocol, Option<FamilyPool>, Option<FamilyPool>);

fn build_pools(cidr: &str, excludes: &[String]) -> Result<Pools> {
    net::check_cidrs(cidr)?;
    let protocol = net::check_protocol(cidr)?;
    let expanded = expand_exclude_ips(excludes, cidr);
    let (v4_excludes, v6_excludes) = net::split_ips_by_protocol(&expanded);

    let mut v4 = None;
    let mut v6 = None;
    for block in cidr.split(',') {
        let block = net::parse_cidr(block)?.trunc();
        match Family::of_net(&block) {
            Family::V4 => v4 = Some(FamilyPool::new(block, v4_excludes.clone())),
            Family::V6 => v6 = Some(FamilyPool::new(block, v6_excludes.clone())),
        }
    }
    Ok((protocol, v4, v6))
}

#[cfg(test)]
#[path = "subnet_test.rs"]
mod subnet_test;
