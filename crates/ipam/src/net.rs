//! Address engine
//!
//! Pure functions over IP and CIDR values. Addresses are converted to `u128`
//! (IPv4 occupies the low 32 bits) so arithmetic is exact for both families.
//! Multi-block arguments use the dual-stack string form `"<v4>,<v6>"`.

use crate::error::{IpamError, Result};
use ipnet::IpNet;
use rand::Rng;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, warn};

/// Separator between the start and end of an exclude range
pub const RANGE_SEPARATOR: &str = "..";

/// Address family of a single address or block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl Family {
    /// Family of an address.
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Family of a CIDR block.
    pub fn of_net(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        }
    }

    /// Address width in bits.
    pub fn bits(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    /// Largest address value of the family.
    pub fn max_value(self) -> u128 {
        match self {
            Family::V4 => u128::from(u32::MAX),
            Family::V6 => u128::MAX,
        }
    }
}

/// Protocol of an address specifier, which may be a dual-stack pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Single stack IPv4
    IPv4,
    /// Single stack IPv6
    IPv6,
    /// IPv4 and IPv6 pair
    Dual,
}

impl From<Family> for Protocol {
    fn from(family: Family) -> Self {
        match family {
            Family::V4 => Protocol::IPv4,
            Family::V6 => Protocol::IPv6,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::IPv4 => write!(f, "IPv4"),
            Protocol::IPv6 => write!(f, "IPv6"),
            Protocol::Dual => write!(f, "Dual"),
        }
    }
}

fn strip_mask(s: &str) -> &str {
    s.split('/').next().unwrap_or(s).trim()
}

/// Parses a single address (no mask).
pub fn parse_ip(s: &str) -> Result<IpAddr> {
    s.trim()
        .parse::<IpAddr>()
        .map_err(|e| IpamError::InvalidAddress(format!("{}: {}", s, e)))
}

/// Parses a single CIDR block. Host bits are kept; use `network_address` for the prefix.
pub fn parse_cidr(s: &str) -> Result<IpNet> {
    s.trim()
        .parse::<IpNet>()
        .map_err(|e| IpamError::InvalidCidr(format!("{}: {}", s, e)))
}

/// True when `s` is a single valid address.
pub fn is_valid_ip(s: &str) -> bool {
    parse_ip(s).is_ok()
}

/// Canonical text form of an address (e.g. `fd00:0::1` becomes `fd00::1`).
pub fn canonical_ip(s: &str) -> Result<String> {
    parse_ip(strip_mask(s)).map(|ip| ip.to_string())
}

/// Numeric value of an address.
pub fn ip_to_int(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Address for a numeric value, saturating at the family's largest address.
pub fn int_to_ip(value: u128, family: Family) -> IpAddr {
    match family {
        Family::V4 => {
            let v = u32::try_from(value).unwrap_or(u32::MAX);
            IpAddr::V4(Ipv4Addr::from(v))
        }
        Family::V6 => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

/// Protocol of an address or CIDR specifier.
///
/// `"10.0.0.1"` is IPv4, `"fd00::1/64"` is IPv6 and `"10.0.0.1,fd00::1"` is
/// Dual. A pair must list the IPv4 member first.
pub fn check_protocol(address: &str) -> Result<Protocol> {
    let parts: Vec<&str> = address.split(',').collect();
    match parts.as_slice() {
        [single] => {
            let ip = parse_ip(strip_mask(single))?;
            Ok(Family::of(&ip).into())
        }
        [first, second] => {
            let v4 = parse_ip(strip_mask(first))?;
            let v6 = parse_ip(strip_mask(second))?;
            if Family::of(&v4) == Family::V4 && Family::of(&v6) == Family::V6 {
                Ok(Protocol::Dual)
            } else {
                Err(IpamError::ProtocolMismatch(format!(
                    "{} must be an IPv4 member followed by an IPv6 member",
                    address
                )))
            }
        }
        _ => Err(IpamError::InvalidAddress(format!(
            "{} has more than two members",
            address
        ))),
    }
}

/// Validates every block of a (possibly dual-stack) CIDR specifier.
pub fn check_cidrs(cidr: &str) -> Result<()> {
    let blocks: Vec<&str> = cidr.split(',').collect();
    if blocks.len() > 2 {
        return Err(IpamError::InvalidCidr(format!(
            "{} has more than two blocks",
            cidr
        )));
    }
    for block in &blocks {
        parse_cidr(block)?;
    }
    if blocks.len() == 2 {
        check_protocol(cidr).map_err(|e| IpamError::InvalidCidr(e.to_string()))?;
    }
    Ok(())
}

/// Number of host bits of a block.
pub fn host_bits(net: &IpNet) -> u8 {
    net.max_prefix_len() - net.prefix_len()
}

/// Network address of a block.
pub fn network_address(net: &IpNet) -> IpAddr {
    net.network()
}

/// Broadcast (last) address of a block: network + 2^(bits - maskLen) - 1.
pub fn broadcast_address(net: &IpNet) -> IpAddr {
    net.broadcast()
}

/// Network address + 1.
///
/// Not special-cased for /31, /32, /127 and /128 blocks; callers check
/// `address_count` first.
pub fn first_usable(net: &IpNet) -> IpAddr {
    let family = Family::of_net(net);
    let value = ip_to_int(net.network()).saturating_add(1).min(family.max_value());
    int_to_ip(value, family)
}

/// Broadcast address - 1. Same caveat as `first_usable`.
pub fn last_usable(net: &IpNet) -> IpAddr {
    let value = ip_to_int(net.broadcast()).saturating_sub(1);
    int_to_ip(value, Family::of_net(net))
}

/// Usable addresses in a block: 2^hostBits - 2, or 0 with fewer than 2 host bits.
pub fn address_count(net: &IpNet) -> u128 {
    match host_bits(net) {
        0 | 1 => 0,
        128 => u128::MAX - 1,
        bits => (1u128 << bits) - 2,
    }
}

/// Whether any block of `a` overlaps a same-family block of `b`.
///
/// Two blocks conflict when either contains the other's network address.
/// Malformed input never conflicts.
pub fn cidr_conflict(a: &str, b: &str) -> bool {
    let (Ok(blocks_a), Ok(blocks_b)) = (parse_blocks(a), parse_blocks(b)) else {
        return false;
    };
    blocks_a.iter().any(|na| {
        blocks_b.iter().any(|nb| {
            Family::of_net(na) == Family::of_net(nb)
                && (na.contains(&nb.network()) || nb.contains(&na.network()))
        })
    })
}

/// Whether `cidr` contains `ip`, both possibly dual-stack.
///
/// Every same-family (block, address) pair must contain, and at least one
/// pair must exist. A dual-stack address therefore only matches a dual-stack
/// CIDR when both members are inside their block.
pub fn cidr_contains_ip(cidr: &str, ip: &str) -> bool {
    let Ok(blocks) = parse_blocks(cidr) else {
        return false;
    };
    let Ok(addresses) = ip.split(',').map(parse_ip).collect::<Result<Vec<_>>>() else {
        return false;
    };

    let mut matched = false;
    for block in &blocks {
        for address in addresses.iter().filter(|a| Family::of(a) == Family::of_net(block)) {
            if !block.contains(address) {
                return false;
            }
            matched = true;
        }
    }
    matched
}

fn parse_blocks(cidr: &str) -> Result<Vec<IpNet>> {
    cidr.split(',').map(parse_cidr).collect()
}

/// Parses an exclude entry into an inclusive numeric range.
pub fn parse_exclude_entry(entry: &str) -> Result<(Family, u128, u128)> {
    match entry.split_once(RANGE_SEPARATOR) {
        Some((start, end)) => {
            let start = parse_ip(start)?;
            let end = parse_ip(end)?;
            if Family::of(&start) != Family::of(&end) {
                return Err(IpamError::ProtocolMismatch(format!(
                    "{} mixes address families",
                    entry
                )));
            }
            Ok((Family::of(&start), ip_to_int(start), ip_to_int(end)))
        }
        None => {
            let ip = parse_ip(entry)?;
            Ok((Family::of(&ip), ip_to_int(ip), ip_to_int(ip)))
        }
    }
}

fn format_range(family: Family, start: u128, end: u128) -> String {
    if start == end {
        int_to_ip(start, family).to_string()
    } else {
        format!(
            "{}{}{}",
            int_to_ip(start, family),
            RANGE_SEPARATOR,
            int_to_ip(end, family)
        )
    }
}

/// Normalizes exclude entries against the usable range of each matching block.
///
/// Ranges are clipped to `[first_usable, last_usable]`, collapsed to a single
/// address when only one remains, and dropped when empty or reversed. Single
/// addresses survive only when inside a block and not its network or
/// broadcast address. Malformed entries are logged and skipped.
pub fn expand_exclude_ips(excludes: &[String], cidr: &str) -> Vec<String> {
    let blocks: Vec<IpNet> = cidr
        .split(',')
        .filter_map(|block| match parse_cidr(block) {
            Ok(net) => Some(net),
            Err(e) => {
                warn!("Skipping CIDR block while expanding exclude IPs: {}", e);
                None
            }
        })
        .collect();

    let mut expanded = Vec::new();
    for entry in excludes.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
        let (family, start, end) = match parse_exclude_entry(entry) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Invalid exclude IP {}: {}", entry, e);
                continue;
            }
        };
        if start > end {
            continue;
        }

        if entry.contains(RANGE_SEPARATOR) {
            for block in blocks.iter().filter(|b| Family::of_net(b) == family) {
                if address_count(block) == 0 {
                    warn!("No available IP address in CIDR {}", block);
                    continue;
                }
                let first = ip_to_int(first_usable(block));
                let last = ip_to_int(last_usable(block));
                let s = start.max(first);
                let e = end.min(last);
                if s <= e {
                    expanded.push(format_range(family, s, e));
                }
            }
        } else {
            let ip = int_to_ip(start, family);
            let inside = blocks.iter().any(|b| {
                b.contains(&ip) && ip != network_address(b) && ip != broadcast_address(b)
            });
            if inside {
                expanded.push(ip.to_string());
            }
        }
    }
    debug!("Expanded exclude IPs {:?}", expanded);
    expanded
}

/// Splits exclude entries into IPv4 and IPv6 lists; malformed entries are dropped.
pub fn split_ips_by_protocol(excludes: &[String]) -> (Vec<String>, Vec<String>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for entry in excludes {
        match parse_exclude_entry(entry) {
            Ok((Family::V4, _, _)) => v4.push(entry.clone()),
            Ok((Family::V6, _, _)) => v6.push(entry.clone()),
            Err(e) => warn!("Invalid exclude IP {}: {}", entry, e),
        }
    }
    (v4, v6)
}

/// Whether an exclude entry (address or range) covers `ip`.
pub fn exclude_contains(entry: &str, ip: IpAddr) -> bool {
    match parse_exclude_entry(entry) {
        Ok((family, start, end)) => {
            let value = ip_to_int(ip);
            family == Family::of(&ip) && start <= value && value <= end
        }
        Err(_) => false,
    }
}

/// Number of addresses covered by an exclude list (entries assumed disjoint).
pub fn count_ips(excludes: &[String]) -> u128 {
    excludes
        .iter()
        .filter_map(|e| parse_exclude_entry(e).ok())
        .map(|(_, start, end)| end.saturating_sub(start).saturating_add(1))
        .fold(0u128, u128::saturating_add)
}

/// Draws a uniformly random address in the block (network and broadcast included).
///
/// Uses the thread-local CSPRNG; callers reject unusable candidates.
pub fn random_address(net: &IpNet) -> IpAddr {
    let mut rng = rand::rng();
    let offset = match host_bits(net) {
        0 => 0,
        128 => rng.random::<u128>(),
        bits => rng.random_range(0..(1u128 << bits)),
    };
    let family = Family::of_net(net);
    int_to_ip(ip_to_int(net.network()).saturating_add(offset), family)
}

/// Default gateway(s): the first usable address of every block, v4 first.
pub fn derive_gateway(cidr: &str) -> Result<String> {
    let gateways = parse_blocks(cidr)?
        .iter()
        .map(|net| first_usable(net).to_string())
        .collect::<Vec<_>>();
    Ok(gateways.join(","))
}

/// Extends a single-family gateway to cover every block of `cidr`.
///
/// The existing gateway is kept for its family; the missing family gets the
/// first usable address of its block. Output is ordered v4 then v6.
pub fn append_gateway(gateway: &str, cidr: &str) -> Result<String> {
    let gateway_ip = parse_ip(gateway)?;
    let gateway_family = Family::of(&gateway_ip);

    let mut v4 = String::new();
    let mut v6 = String::new();
    for net in parse_blocks(cidr)? {
        let value = if Family::of_net(&net) == gateway_family {
            gateway_ip.to_string()
        } else {
            first_usable(&net).to_string()
        };
        match Family::of_net(&net) {
            Family::V4 => v4 = value,
            Family::V6 => v6 = value,
        }
    }
    Ok(join_dual_stack(&v4, &v6))
}

/// Joins optional v4 and v6 members; invalid members are left out.
pub fn join_dual_stack(v4: &str, v6: &str) -> String {
    let v4_ok = parse_ip(v4).is_ok_and(|ip| ip.is_ipv4());
    let v6_ok = parse_ip(v6).is_ok_and(|ip| ip.is_ipv6());
    match (v4_ok, v6_ok) {
        (true, true) => format!("{},{}", v4, v6),
        (true, false) => v4.to_string(),
        (false, true) => v6.to_string(),
        (false, false) => String::new(),
    }
}

/// Splits an address specifier into `(v4, v6)`; an absent member is `""`.
pub fn split_dual_stack(s: &str) -> (String, String) {
    match check_protocol(s) {
        Ok(Protocol::Dual) => {
            let (v4, v6) = s.split_once(',').unwrap_or((s, ""));
            (v4.to_string(), v6.to_string())
        }
        Ok(Protocol::IPv4) => (s.to_string(), String::new()),
        Ok(Protocol::IPv6) => (String::new(), s.to_string()),
        Err(_) => (String::new(), String::new()),
    }
}

/// Appends each block's mask to the matching address: `10.0.0.2` + `10.0.0.0/24` gives `10.0.0.2/24`.
pub fn ip_with_mask(ip: &str, cidr: &str) -> Result<String> {
    let blocks = parse_blocks(cidr)?;
    let mut out = Vec::new();
    for part in ip.split(',') {
        let address = parse_ip(part)?;
        let block = blocks
            .iter()
            .find(|b| Family::of_net(b) == Family::of(&address))
            .ok_or_else(|| {
                IpamError::ProtocolMismatch(format!("{} has no block in {}", address, cidr))
            })?;
        out.push(format!("{}/{}", address, block.prefix_len()));
    }
    Ok(out.join(","))
}

/// Drops masks from every member: `10.0.0.2/24,fd00::2/64` gives `10.0.0.2,fd00::2`.
pub fn ip_without_mask(s: &str) -> String {
    s.split(',').map(strip_mask).collect::<Vec<_>>().join(",")
}

/// Random locally-scoped MAC in the `00:00:00` prefix.
pub fn generate_mac() -> String {
    let bytes: [u8; 3] = rand::rng().random();
    format!("00:00:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

/// Lower-cased MAC if `mac` is six colon-separated hex octets.
pub fn normalize_mac(mac: &str) -> Result<String> {
    let octets: Vec<&str> = mac.trim().split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if valid {
        Ok(mac.trim().to_ascii_lowercase())
    } else {
        Err(IpamError::InvalidAddress(format!("{} is not a MAC address", mac)))
    }
}

#[cfg(test)]
#[path = "net_test.rs"]
mod net_test;
