//! Cross-indexed lease store.
//!
//! Maps a client MAC to its reserved address plus back-references by
//! workload key (`<namespace>/<podName>`) and subnet key, so the pod
//! controller can bulk-remove on deletion and the subnet controller can
//! requeue every workload a subnet change affects. One store instance
//! exists per address family; the owning allocator provides the lock.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::str::FromStr;

use mac_address::MacAddress;

use crate::error::{DhcpError, Result};

/// A programmed reservation: the address to hand to a MAC and the subnet
/// whose options apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub client_ip: IpAddr,
    pub subnet_key: String,
}

/// Normalize a MAC into the store's key form.
///
/// Annotation MACs arrive in arbitrary case while packet MACs render
/// lowercase; normalizing keeps the two reachable from each other.
pub fn normalize_mac(hwaddr: &str) -> Result<String> {
    let mac = MacAddress::from_str(hwaddr)
        .map_err(|_| DhcpError::InvalidMac(hwaddr.to_string()))?;
    Ok(mac.to_string().to_lowercase())
}

#[derive(Debug, Default)]
pub struct LeaseStore {
    leases: HashMap<String, Lease>,
    // MAC <-> workload indexes
    workloads_by_mac: HashMap<String, BTreeSet<String>>,
    macs_by_workload: HashMap<String, BTreeSet<String>>,
    // subnet <-> workload indexes
    workloads_by_subnet: HashMap<String, BTreeSet<String>>,
    subnets_by_workload: HashMap<String, BTreeSet<String>>,
}

impl LeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The packet-handling hot path.
    pub fn lookup(&self, hwaddr: &str) -> Option<Lease> {
        let key = normalize_mac(hwaddr).ok()?;
        self.leases.get(&key).cloned()
    }

    /// True iff every index contains the expected membership and the stored
    /// lease deep-equals the given one. Used to suppress redundant
    /// "lease added" notifications.
    pub fn has(&self, hwaddr: &str, workload_key: &str, lease: &Lease) -> bool {
        let mac = match normalize_mac(hwaddr) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        let mac_member = self
            .macs_by_workload
            .get(workload_key)
            .is_some_and(|set| set.contains(&mac));
        let workload_member = self
            .workloads_by_mac
            .get(&mac)
            .is_some_and(|set| set.contains(workload_key));
        let subnet_member = self
            .subnets_by_workload
            .get(workload_key)
            .is_some_and(|set| set.contains(&lease.subnet_key));
        let subnet_workload_member = self
            .workloads_by_subnet
            .get(&lease.subnet_key)
            .is_some_and(|set| set.contains(workload_key));
        if !(mac_member && workload_member && subnet_member && subnet_workload_member) {
            return false;
        }
        self.leases.get(&mac) == Some(lease)
    }

    /// Add or replace a lease, updating all five indexes. Idempotent.
    pub fn upsert(&mut self, hwaddr: &str, workload_key: &str, lease: Lease) -> Result<()> {
        if hwaddr.is_empty() {
            return Err(DhcpError::EmptyField("hwaddr"));
        }
        if workload_key.is_empty() {
            return Err(DhcpError::EmptyField("workload key"));
        }
        if lease.subnet_key.is_empty() {
            return Err(DhcpError::EmptyField("subnet key"));
        }
        let mac = normalize_mac(hwaddr)?;
        let subnet_key = lease.subnet_key.clone();

        self.leases.insert(mac.clone(), lease);

        self.workloads_by_mac
            .entry(mac.clone())
            .or_default()
            .insert(workload_key.to_string());
        self.macs_by_workload
            .entry(workload_key.to_string())
            .or_default()
            .insert(mac.clone());

        self.workloads_by_subnet
            .entry(subnet_key.clone())
            .or_default()
            .insert(workload_key.to_string());
        self.subnets_by_workload
            .entry(workload_key.to_string())
            .or_default()
            .insert(subnet_key);

        tracing::debug!("lease added for hardware address: {}", mac);
        Ok(())
    }

    /// MACs currently bound to a workload.
    pub fn macs_for(&self, workload_key: &str) -> Option<Vec<String>> {
        self.macs_by_workload
            .get(workload_key)
            .map(|set| set.iter().cloned().collect())
    }

    /// Workloads holding a lease in a subnet. The subnet controller uses
    /// this to requeue dependent pods when options change.
    pub fn workloads_for(&self, subnet_key: &str) -> Option<Vec<String>> {
        self.workloads_by_subnet
            .get(subnet_key)
            .map(|set| set.iter().cloned().collect())
    }

    /// Remove every MAC solely owned by this workload. MACs shared with
    /// another workload (a pod-replacement transient) are retained and
    /// merely un-associated. Returns the MACs actually removed so the
    /// caller can clear per-MAC gauges.
    pub fn delete_by_workload(&mut self, workload_key: &str) -> Result<Vec<String>> {
        if workload_key.is_empty() {
            return Err(DhcpError::EmptyField("workload key"));
        }
        let macs = self
            .macs_by_workload
            .remove(workload_key)
            .ok_or_else(|| DhcpError::WorkloadNotFound(workload_key.to_string()))?;
        let subnets = self
            .subnets_by_workload
            .remove(workload_key)
            .ok_or_else(|| DhcpError::WorkloadNotFound(workload_key.to_string()))?;

        let mut removed = Vec::new();
        for mac in macs {
            if let Some(owners) = self.workloads_by_mac.get_mut(&mac) {
                owners.remove(workload_key);
                if owners.is_empty() {
                    self.workloads_by_mac.remove(&mac);
                    self.leases.remove(&mac);
                    removed.push(mac);
                }
            }
        }

        for subnet_key in subnets {
            if let Some(workloads) = self.workloads_by_subnet.get_mut(&subnet_key) {
                workloads.remove(workload_key);
                if workloads.is_empty() {
                    self.workloads_by_subnet.remove(&subnet_key);
                }
            }
        }

        tracing::debug!(
            "workload <{}> leases deleted for hardware addresses: {:?}",
            workload_key,
            removed
        );
        Ok(removed)
    }
}
