//! DCloud DHCP Server
//!
//! Reservation-only DHCPv4/DHCPv6 responders for VM workloads. The
//! controller programs fixed MAC-to-IP leases into per-family allocators;
//! the responders answer DISCOVER/REQUEST (v4) and SOLICIT/REQUEST (v6)
//! out of that state and never allocate addresses themselves. Clients
//! without a programmed lease are silently ignored so an upstream server
//! can keep serving them.
//!
//! - [`store`] - cross-indexed lease store (MAC, workload and subnet keys)
//! - [`v4`] - DHCPv4 allocator and responder (UDP 67, NIC-scoped)
//! - [`v6`] - DHCPv6 allocator and responder (UDP 547, NIC-scoped)
//! - [`socket`] - NIC-bound socket construction

pub mod error;
pub mod socket;
pub mod store;
pub mod v4;
pub mod v6;

pub use error::{DhcpError, Result};
pub use store::Lease;
