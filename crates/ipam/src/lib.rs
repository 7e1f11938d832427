//! IP Address Management
//!
//! Address-space engine used by the SDN controller.
//!
//! - `net`: pure CIDR/IP arithmetic, exclude-range expansion, dual-stack helpers
//! - `range`: sorted, merged address range lists
//! - `subnet`: one subnet's pool (free view, exclusions, owner ledger)
//! - `ipam`: the allocator owning every subnet pool
//!
//! # Example
//!
//! ```
//! use ipam::{Ipam, AllocationStrategy};
//!
//! let ipam = Ipam::new();
//! ipam.add_or_update_subnet("ovn-default", "10.16.0.0/16", &["10.16.0.1".to_string()], AllocationStrategy::Sequential)
//!     .unwrap();
//! let allocation = ipam.allocate("default/web-0", "ovn-default", None, None).unwrap();
//! assert_eq!(allocation.ip_string(), "10.16.0.2");
//! ```

pub mod error;
pub mod ipam;
pub mod net;
pub mod range;
pub mod subnet;

pub use error::{IpamError, Result};
pub use ipam::Ipam;
pub use net::{Family, Protocol};
pub use range::IpRangeList;
pub use subnet::{Allocation, AllocationStrategy, PoolSnapshot, Subnet};
