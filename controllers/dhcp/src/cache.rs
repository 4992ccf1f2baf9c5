//! Network-state cache and self-pod cache.
//!
//! The network cache merges two views keyed by attachment name: `original`
//! entries are seeded once at startup from the platform manifest and are
//! never mutable or deletable; `synthetic` entries are materialized at
//! runtime by the service controller for load-balancer mappings and may
//! never shadow an original. Reads hand out snapshots (owned clones), so a
//! caller observing a result never sees later mutations.
//!
//! The Go original guards both maps with a re-entrant mutex held across
//! subnet helpers; here every operation takes a plain `RwLock` for the
//! shortest span and the service deletion flow sequences its steps instead.

use std::collections::HashMap;
use std::sync::RwLock;

use crds::NetworkStatus;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use kube::Api;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("network name is empty")]
    EmptyName,

    #[error("cannot set default network")]
    DefaultNetwork,

    #[error("cannot set the original network <{0}>")]
    SetOriginal(String),

    #[error("cannot update the original network <{0}>")]
    UpdateOriginal(String),

    #[error("cannot delete original network <{0}>")]
    DeleteOriginal(String),

    #[error("network name <{0}> already exists")]
    AlreadyExists(String),

    #[error("network name <{0}> non-existent")]
    NonExistent(String),
}

#[derive(Default)]
struct CacheInner {
    original: HashMap<String, NetworkStatus>,
    synthetic: HashMap<String, NetworkStatus>,
}

pub struct NetworkCache {
    inner: RwLock<CacheInner>,
}

impl NetworkCache {
    pub fn new(infos: Vec<NetworkStatus>) -> Self {
        let mut original = HashMap::new();
        for info in infos {
            original.insert(info.name.clone(), info);
        }
        Self {
            inner: RwLock::new(CacheInner {
                original,
                synthetic: HashMap::new(),
            }),
        }
    }

    /// The cluster-primary attachment from the startup manifest.
    pub fn get_default_network(&self) -> Option<NetworkStatus> {
        let inner = self.inner.read().unwrap();
        inner.original.values().find(|s| s.default).cloned()
    }

    /// Snapshot of an attachment, originals taking precedence.
    pub fn get_network_status(&self, name: &str) -> Option<NetworkStatus> {
        let inner = self.inner.read().unwrap();
        inner
            .original
            .get(name)
            .or_else(|| inner.synthetic.get(name))
            .cloned()
    }

    pub fn has_original_network(&self, name: &str) -> bool {
        self.inner.read().unwrap().original.contains_key(name)
    }

    pub fn set_network_status(&self, network: NetworkStatus) -> Result<(), CacheError> {
        let mut inner = self.inner.write().unwrap();
        if network.name.is_empty() {
            return Err(CacheError::EmptyName);
        }
        if network.default {
            return Err(CacheError::DefaultNetwork);
        }
        if inner.original.contains_key(&network.name) {
            return Err(CacheError::SetOriginal(network.name));
        }
        if inner.synthetic.contains_key(&network.name) {
            return Err(CacheError::AlreadyExists(network.name));
        }
        inner.synthetic.insert(network.name.clone(), network);
        Ok(())
    }

    pub fn update_network_status(&self, network: NetworkStatus) -> Result<(), CacheError> {
        let mut inner = self.inner.write().unwrap();
        if network.name.is_empty() {
            return Err(CacheError::EmptyName);
        }
        if network.default {
            return Err(CacheError::DefaultNetwork);
        }
        if inner.original.contains_key(&network.name) {
            return Err(CacheError::UpdateOriginal(network.name));
        }
        if !inner.synthetic.contains_key(&network.name) {
            return Err(CacheError::NonExistent(network.name));
        }
        inner.synthetic.insert(network.name.clone(), network);
        Ok(())
    }

    pub fn delete_network_status(&self, name: &str) -> Result<(), CacheError> {
        let mut inner = self.inner.write().unwrap();
        if name.is_empty() {
            return Err(CacheError::EmptyName);
        }
        if inner.original.contains_key(name) {
            return Err(CacheError::DeleteOriginal(name.to_string()));
        }
        if inner.synthetic.remove(name).is_none() {
            return Err(CacheError::NonExistent(name.to_string()));
        }
        Ok(())
    }

    /// How many entries across both maps use a NIC. The subnet controller
    /// keeps a responder alive while this exceeds one.
    pub fn interface_use_count(&self, nic: &str) -> usize {
        let inner = self.inner.read().unwrap();
        inner
            .original
            .values()
            .chain(inner.synthetic.values())
            .filter(|s| s.interface == nic)
            .count()
    }
}

/// A single-pod watch keeping the controller's own Pod available for
/// service selector matching.
#[derive(Default)]
pub struct SelfPodCache {
    pod: RwLock<Option<Pod>>,
}

impl SelfPodCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_self_pod(&self) -> Option<Pod> {
        self.pod.read().unwrap().clone()
    }

    /// Watch the named pod until shutdown.
    pub async fn run(&self, api: Api<Pod>, name: &str, mut shutdown: watch::Receiver<bool>) {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
        let mut stream = Box::pin(watcher(api, config));

        loop {
            tokio::select! {
                event = stream.next() => {
                    match event {
                        Some(Ok(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod))) => {
                            *self.pod.write().unwrap() = Some(pod);
                        }
                        Some(Ok(watcher::Event::Delete(_))) => {
                            *self.pod.write().unwrap() = None;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => error!("(cache.self_pod) watch error: {}", e),
                        None => break,
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("(cache.self_pod) stopping self pod watch");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn original_infos() -> Vec<NetworkStatus> {
        vec![
            NetworkStatus {
                name: "ovn".to_string(),
                default: true,
                interface: "eth0".to_string(),
                ips: vec!["10.10.1.39".to_string()],
                mtu: Some(1500),
                mac: "00:00:00:01:02:03".to_string(),
                ..Default::default()
            },
            NetworkStatus {
                name: "default/net-atta-def".to_string(),
                default: false,
                interface: "net1".to_string(),
                ips: vec!["192.168.2.10".to_string()],
                mtu: Some(1500),
                mac: "00:00:00:04:05:06".to_string(),
                ..Default::default()
            },
        ]
    }

    fn synthetic(name: &str) -> NetworkStatus {
        NetworkStatus {
            name: name.to_string(),
            default: false,
            interface: "net1".to_string(),
            ips: vec!["203.0.113.5".to_string()],
            mac: "00:00:00:0a:0b:0c".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_get_default_network() {
        let cache = NetworkCache::new(original_infos());
        let default = cache.get_default_network().unwrap();
        assert_eq!(default.name, "ovn");
    }

    #[test]
    fn test_get_network_status_snapshot() {
        let cache = NetworkCache::new(original_infos());
        let mut snap = cache.get_network_status("default/net-atta-def").unwrap();
        snap.ips.push("1.2.3.4".to_string());
        // The mutation above must not be visible in the cache
        let again = cache.get_network_status("default/net-atta-def").unwrap();
        assert_eq!(again.ips, vec!["192.168.2.10"]);
    }

    #[test]
    fn test_set_network_status_rejections() {
        let cache = NetworkCache::new(original_infos());

        let mut network = synthetic("");
        assert_eq!(cache.set_network_status(network.clone()), Err(CacheError::EmptyName));

        network.name = "default/macvtap01".to_string();
        network.default = true;
        assert_eq!(
            cache.set_network_status(network.clone()),
            Err(CacheError::DefaultNetwork)
        );

        network.default = false;
        network.name = "ovn".to_string();
        assert_eq!(
            cache.set_network_status(network.clone()),
            Err(CacheError::SetOriginal("ovn".to_string()))
        );

        network.name = "default/macvtap01".to_string();
        assert!(cache.set_network_status(network.clone()).is_ok());
        assert_eq!(
            cache.set_network_status(network),
            Err(CacheError::AlreadyExists("default/macvtap01".to_string()))
        );
    }

    #[test]
    fn test_update_network_status() {
        let cache = NetworkCache::new(original_infos());
        cache.set_network_status(synthetic("default/macvtap01")).unwrap();

        assert_eq!(
            cache.update_network_status(synthetic("default/other")),
            Err(CacheError::NonExistent("default/other".to_string()))
        );
        assert_eq!(
            cache.update_network_status(synthetic("ovn")),
            Err(CacheError::UpdateOriginal("ovn".to_string()))
        );

        let mut network = synthetic("default/macvtap01");
        network.mtu = Some(1400);
        cache.update_network_status(network).unwrap();
        assert_eq!(
            cache.get_network_status("default/macvtap01").unwrap().mtu,
            Some(1400)
        );
    }

    #[test]
    fn test_delete_network_status() {
        let cache = NetworkCache::new(original_infos());
        cache.set_network_status(synthetic("default/macvtap01")).unwrap();

        assert_eq!(cache.delete_network_status(""), Err(CacheError::EmptyName));
        assert_eq!(
            cache.delete_network_status("ovn"),
            Err(CacheError::DeleteOriginal("ovn".to_string()))
        );
        assert_eq!(
            cache.delete_network_status("test"),
            Err(CacheError::NonExistent("test".to_string()))
        );

        cache.delete_network_status("default/macvtap01").unwrap();
        assert!(cache.get_network_status("default/macvtap01").is_none());
    }

    #[test]
    fn test_interface_use_count() {
        let cache = NetworkCache::new(original_infos());
        assert_eq!(cache.interface_use_count("eth0"), 1);
        assert_eq!(cache.interface_use_count("net1"), 1);

        // Synthetic entry on the same NIC as an original counts twice
        cache.set_network_status(synthetic("default/macvtap01")).unwrap();
        assert_eq!(cache.interface_use_count("net1"), 2);
        assert_eq!(cache.interface_use_count("net9"), 0);
    }

    #[test]
    fn test_original_never_shadowed() {
        let cache = NetworkCache::new(original_infos());
        // The invariant: a synthetic name never equals an original name
        assert!(cache.has_original_network("ovn"));
        assert!(cache.set_network_status(synthetic("ovn")).is_err());
        assert!(!cache.has_original_network("default/macvtap01"));
    }
}
