//! DCloud DHCP Controller API Types
//!
//! Shared API definitions for the DHCP controller:
//! - subnet - the kube-ovn Subnet CRD (the fields the controller consumes)
//! - network - multus network-status types (per-interface attachment state)

pub mod network;
pub mod subnet;

// Re-exports
pub use network::*;
pub use subnet::*;
