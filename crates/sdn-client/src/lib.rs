//! SDN Control Plane Client
//!
//! Client library for the logical network control plane (OVN northbound
//! database). Reconcilers depend on `SdnClientTrait`; production uses
//! `NbctlClient`, tests use `MockSdnClient` (feature `test-util`).
//!
//! # Example
//!
//! ```no_run
//! use sdn_client::{NbctlClient, SdnClientTrait, owned_by};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = NbctlClient::new(Some("tcp:10.0.0.10:6641".to_string()), Duration::from_secs(60));
//! client.create_logical_router("ovn-cluster", &owned_by("ovn-cluster")).await?;
//! let switches = client.list_logical_switches().await?;
//! println!("{} switches", switches.len());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod models;
pub mod nbctl;
#[path = "trait.rs"]
pub mod sdn_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use error::SdnError;
pub use models::*;
pub use nbctl::NbctlClient;
pub use sdn_trait::SdnClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockSdnClient;
