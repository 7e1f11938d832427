//! SDN Controller CRD Definitions
//!
//! Kubernetes Custom Resource Definitions owned by the SDN controller:
//! - `Vpc`: virtual network (one logical router)
//! - `Subnet`: address block bound to a VPC and a logical switch
//! - `IP`: persisted address allocation for a pod or node

pub mod condition;
pub mod ip;
pub mod subnet;
pub mod vpc;

pub use condition::*;
pub use ip::*;
pub use subnet::*;
pub use vpc::*;

/// API group shared by every CRD in this crate
pub const API_GROUP: &str = "sdn.microscaler.io";
