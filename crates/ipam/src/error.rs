//! IPAM errors

use thiserror::Error;

/// Errors returned by the address engine and the allocator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpamError {
    /// Malformed or out-of-range address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Malformed CIDR block
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    /// Address family does not match the subnet
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// No usable, unexcluded, unallocated address remains
    #[error("Address space exhausted in subnet {0}")]
    AddressSpaceExhausted(String),

    /// Address or MAC is excluded or held by another owner
    #[error("Address conflict: {0}")]
    AddressConflict(String),

    /// Subnet is not known to the allocator
    #[error("Subnet not found: {0}")]
    SubnetNotFound(String),
}

/// Result alias for IPAM operations
pub type Result<T> = std::result::Result<T, IpamError>;
