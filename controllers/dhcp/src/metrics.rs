//! Prometheus gauges and the metrics endpoint.
//!
//! Gauge vectors mirror the controller's view of the world: per-responder
//! info gauges, a per-subnet info gauge and per-VM lease-time gauges.
//! Updates replace any series previously registered for the same owner, so
//! a responder re-bind or option change never leaves a stale series behind.
//! The registry only supports removal by full label set; the allocator
//! keeps its own label bookkeeping to provide the partial-match deletions
//! the controllers need.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{extract::State, routing::get, Router};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::ControllerError;

pub const DEFAULT_METRICS_PORT: u16 = 8080;

#[derive(Default)]
struct LabelIndex {
    /// network name -> v4 server info label values
    v4_server: HashMap<String, Vec<String>>,
    /// network name -> v6 server info label values
    v6_server: HashMap<String, Vec<String>>,
    /// subnet name -> subnet info label values
    subnet: HashMap<String, Vec<String>>,
    /// (vm, mac) -> v4 lease label values
    vm_v4: HashMap<(String, String), Vec<String>>,
    /// (vm, mac) -> v6 lease label values
    vm_v6: HashMap<(String, String), Vec<String>>,
}

pub struct Metrics {
    dhcp_v4_server_info: GaugeVec,
    dhcp_v6_server_info: GaugeVec,
    dhcp_subnet_info: GaugeVec,
    vm_dhcp_v4_lease_time: GaugeVec,
    vm_dhcp_v6_lease_time: GaugeVec,

    registry: Registry,
    index: Mutex<LabelIndex>,
}

impl Metrics {
    pub fn new() -> Result<Self, ControllerError> {
        let dhcp_v4_server_info = GaugeVec::new(
            Opts::new("dcloud_dhcp_v4_server_info", "DCloud DHCPv4 server information"),
            &["network", "interface", "ip", "mac", "port"],
        )?;
        let dhcp_v6_server_info = GaugeVec::new(
            Opts::new("dcloud_dhcp_v6_server_info", "DCloud DHCPv6 server information"),
            &["network", "interface", "ip", "mac", "port"],
        )?;
        let dhcp_subnet_info = GaugeVec::new(
            Opts::new("dcloud_dhcp_subnet_info", "DCloud dhcp subnet information"),
            &["name", "provider", "cidr", "protocol", "gateway", "dhcpv4", "dhcpv6"],
        )?;
        let vm_dhcp_v4_lease_time = GaugeVec::new(
            Opts::new(
                "dcloud_vm_dhcp_v4_lease_time",
                "DCloud virtual machine DHCPv4 lease time (second)",
            ),
            &["vm", "subnet", "ip", "mac"],
        )?;
        let vm_dhcp_v6_lease_time = GaugeVec::new(
            Opts::new(
                "dcloud_vm_dhcp_v6_lease_time",
                "DCloud virtual machine DHCPv6 lease time (second)",
            ),
            &["vm", "subnet", "ip", "mac"],
        )?;

        let registry = Registry::new();
        registry.register(Box::new(dhcp_v4_server_info.clone()))?;
        registry.register(Box::new(dhcp_v6_server_info.clone()))?;
        registry.register(Box::new(dhcp_subnet_info.clone()))?;
        registry.register(Box::new(vm_dhcp_v4_lease_time.clone()))?;
        registry.register(Box::new(vm_dhcp_v6_lease_time.clone()))?;

        Ok(Self {
            dhcp_v4_server_info,
            dhcp_v6_server_info,
            dhcp_subnet_info,
            vm_dhcp_v4_lease_time,
            vm_dhcp_v6_lease_time,
            registry,
            index: Mutex::new(LabelIndex::default()),
        })
    }

    pub fn update_dhcp_v4_server_info(&self, network: &str, interface: &str, ip: &str, mac: &str) {
        self.delete_dhcp_v4_server_info(network);
        let labels = vec![
            network.to_string(),
            interface.to_string(),
            ip.to_string(),
            mac.to_string(),
            "67".to_string(),
        ];
        self.dhcp_v4_server_info
            .with_label_values(&labels.iter().map(String::as_str).collect::<Vec<_>>())
            .set(1.0);
        self.index
            .lock()
            .unwrap()
            .v4_server
            .insert(network.to_string(), labels);
    }

    pub fn delete_dhcp_v4_server_info(&self, network: &str) {
        if let Some(labels) = self.index.lock().unwrap().v4_server.remove(network) {
            let _ = self
                .dhcp_v4_server_info
                .remove_label_values(&labels.iter().map(String::as_str).collect::<Vec<_>>());
        }
    }

    pub fn update_dhcp_v6_server_info(&self, network: &str, interface: &str, ip: &str, mac: &str) {
        self.delete_dhcp_v6_server_info(network);
        let labels = vec![
            network.to_string(),
            interface.to_string(),
            ip.to_string(),
            mac.to_string(),
            "547".to_string(),
        ];
        self.dhcp_v6_server_info
            .with_label_values(&labels.iter().map(String::as_str).collect::<Vec<_>>())
            .set(1.0);
        self.index
            .lock()
            .unwrap()
            .v6_server
            .insert(network.to_string(), labels);
    }

    pub fn delete_dhcp_v6_server_info(&self, network: &str) {
        if let Some(labels) = self.index.lock().unwrap().v6_server.remove(network) {
            let _ = self
                .dhcp_v6_server_info
                .remove_label_values(&labels.iter().map(String::as_str).collect::<Vec<_>>());
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_dhcp_subnet_info(
        &self,
        name: &str,
        provider: &str,
        cidr: &str,
        protocol: &str,
        gateway: &str,
        dhcpv4: bool,
        dhcpv6: bool,
    ) {
        self.delete_dhcp_subnet_info(name);
        let labels = vec![
            name.to_string(),
            provider.to_string(),
            cidr.to_string(),
            protocol.to_string(),
            gateway.to_string(),
            dhcpv4.to_string(),
            dhcpv6.to_string(),
        ];
        self.dhcp_subnet_info
            .with_label_values(&labels.iter().map(String::as_str).collect::<Vec<_>>())
            .set(1.0);
        self.index
            .lock()
            .unwrap()
            .subnet
            .insert(name.to_string(), labels);
    }

    pub fn delete_dhcp_subnet_info(&self, name: &str) {
        if let Some(labels) = self.index.lock().unwrap().subnet.remove(name) {
            let _ = self
                .dhcp_subnet_info
                .remove_label_values(&labels.iter().map(String::as_str).collect::<Vec<_>>());
        }
    }

    pub fn update_vm_dhcp_v4_lease(&self, vm: &str, subnet: &str, ip: &str, mac: &str, lease: u32) {
        self.delete_vm_dhcp_v4_lease(vm, Some(mac));
        let labels = vec![
            vm.to_string(),
            subnet.to_string(),
            ip.to_string(),
            mac.to_string(),
        ];
        self.vm_dhcp_v4_lease_time
            .with_label_values(&labels.iter().map(String::as_str).collect::<Vec<_>>())
            .set(f64::from(lease));
        self.index
            .lock()
            .unwrap()
            .vm_v4
            .insert((vm.to_string(), mac.to_string()), labels);
    }

    /// Delete the lease gauge for one MAC of a VM, or every MAC when none
    /// is given.
    pub fn delete_vm_dhcp_v4_lease(&self, vm: &str, mac: Option<&str>) {
        let mut index = self.index.lock().unwrap();
        let keys: Vec<(String, String)> = index
            .vm_v4
            .keys()
            .filter(|(v, m)| v == vm && mac.map_or(true, |mac| m == mac))
            .cloned()
            .collect();
        for key in keys {
            if let Some(labels) = index.vm_v4.remove(&key) {
                let _ = self
                    .vm_dhcp_v4_lease_time
                    .remove_label_values(&labels.iter().map(String::as_str).collect::<Vec<_>>());
            }
        }
    }

    /// Delete every v4 lease gauge of a VM whose MAC is not in the
    /// reserved set.
    pub fn delete_stale_vm_dhcp_v4_leases(&self, vm: &str, reserved_macs: &[String]) {
        let stale: Vec<String> = {
            let index = self.index.lock().unwrap();
            index
                .vm_v4
                .keys()
                .filter(|(v, m)| v == vm && !reserved_macs.contains(m))
                .map(|(_, m)| m.clone())
                .collect()
        };
        for mac in stale {
            self.delete_vm_dhcp_v4_lease(vm, Some(&mac));
        }
    }

    pub fn update_vm_dhcp_v6_lease(&self, vm: &str, subnet: &str, ip: &str, mac: &str, lease: u32) {
        self.delete_vm_dhcp_v6_lease(vm, Some(mac));
        let labels = vec![
            vm.to_string(),
            subnet.to_string(),
            ip.to_string(),
            mac.to_string(),
        ];
        self.vm_dhcp_v6_lease_time
            .with_label_values(&labels.iter().map(String::as_str).collect::<Vec<_>>())
            .set(f64::from(lease));
        self.index
            .lock()
            .unwrap()
            .vm_v6
            .insert((vm.to_string(), mac.to_string()), labels);
    }

    pub fn delete_vm_dhcp_v6_lease(&self, vm: &str, mac: Option<&str>) {
        let mut index = self.index.lock().unwrap();
        let keys: Vec<(String, String)> = index
            .vm_v6
            .keys()
            .filter(|(v, m)| v == vm && mac.map_or(true, |mac| m == mac))
            .cloned()
            .collect();
        for key in keys {
            if let Some(labels) = index.vm_v6.remove(&key) {
                let _ = self
                    .vm_dhcp_v6_lease_time
                    .remove_label_values(&labels.iter().map(String::as_str).collect::<Vec<_>>());
            }
        }
    }

    pub fn delete_stale_vm_dhcp_v6_leases(&self, vm: &str, reserved_macs: &[String]) {
        let stale: Vec<String> = {
            let index = self.index.lock().unwrap();
            index
                .vm_v6
                .keys()
                .filter(|(v, m)| v == vm && !reserved_macs.contains(m))
                .map(|(_, m)| m.clone())
                .collect()
        };
        for mac in stale {
            self.delete_vm_dhcp_v6_lease(vm, Some(&mac));
        }
    }

    /// Serve `/metrics` until shutdown.
    pub async fn run(self: Arc<Self>, port: u16, mut shutdown: watch::Receiver<bool>) {
        info!("(metrics.run) starting Metrics service");

        let app = Router::new()
            .route("/metrics", get(render_metrics))
            .with_state(self.clone());
        let addr = SocketAddr::from(([0, 0, 0, 0], port));

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("(metrics.run) cannot bind {}: {}", addr, e);
                return;
            }
        };

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("(metrics.stop) stopping Metrics service");
            })
            .await;
        if let Err(e) = result {
            error!("(metrics.run) {}", e);
        }
    }

    #[cfg(test)]
    fn series_count(&self, name: &str) -> usize {
        self.registry
            .gather()
            .iter()
            .find(|mf| mf.get_name() == name)
            .map(|mf| mf.get_metric().len())
            .unwrap_or(0)
    }
}

async fn render_metrics(State(metrics): State<Arc<Metrics>>) -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metrics.registry.gather(), &mut buffer) {
        error!("(metrics.render) encode failed: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_info_update_replaces_series() {
        let metrics = Metrics::new().unwrap();
        metrics.update_dhcp_v4_server_info("ns1/nad1", "net1", "10.0.0.1", "00:00:00:2e:2f:b8");
        metrics.update_dhcp_v4_server_info("ns1/nad1", "net1", "203.0.113.5", "00:00:00:2e:2f:b8");
        // Re-binding the responder must not leave the old ip series behind
        assert_eq!(metrics.series_count("dcloud_dhcp_v4_server_info"), 1);

        metrics.delete_dhcp_v4_server_info("ns1/nad1");
        assert_eq!(metrics.series_count("dcloud_dhcp_v4_server_info"), 0);
    }

    #[test]
    fn test_subnet_info_roundtrip() {
        let metrics = Metrics::new().unwrap();
        metrics.update_dhcp_subnet_info(
            "s1",
            "nad1.ns1",
            "10.0.0.0/24",
            "IPv4",
            "10.0.0.1",
            true,
            false,
        );
        assert_eq!(metrics.series_count("dcloud_dhcp_subnet_info"), 1);
        metrics.delete_dhcp_subnet_info("s1");
        assert_eq!(metrics.series_count("dcloud_dhcp_subnet_info"), 0);
    }

    #[test]
    fn test_vm_lease_delete_all_macs() {
        let metrics = Metrics::new().unwrap();
        metrics.update_vm_dhcp_v4_lease("ns2/myvm", "s1", "10.0.0.42", "02:00:00:00:00:01", 3600);
        metrics.update_vm_dhcp_v4_lease("ns2/myvm", "s1", "10.0.0.43", "02:00:00:00:00:02", 3600);
        metrics.update_vm_dhcp_v4_lease("ns2/other", "s1", "10.0.0.44", "02:00:00:00:00:03", 3600);
        assert_eq!(metrics.series_count("dcloud_vm_dhcp_v4_lease_time"), 3);

        metrics.delete_vm_dhcp_v4_lease("ns2/myvm", None);
        assert_eq!(metrics.series_count("dcloud_vm_dhcp_v4_lease_time"), 1);
    }

    #[test]
    fn test_vm_lease_delete_single_mac() {
        let metrics = Metrics::new().unwrap();
        metrics.update_vm_dhcp_v6_lease("ns2/myvm", "s1", "fd00::42", "02:00:00:00:00:01", 3600);
        metrics.update_vm_dhcp_v6_lease("ns2/myvm", "s1", "fd00::43", "02:00:00:00:00:02", 3600);

        metrics.delete_vm_dhcp_v6_lease("ns2/myvm", Some("02:00:00:00:00:01"));
        assert_eq!(metrics.series_count("dcloud_vm_dhcp_v6_lease_time"), 1);
    }

    #[test]
    fn test_delete_stale_vm_leases() {
        let metrics = Metrics::new().unwrap();
        metrics.update_vm_dhcp_v4_lease("ns2/myvm", "s1", "10.0.0.42", "02:00:00:00:00:01", 3600);
        metrics.update_vm_dhcp_v4_lease("ns2/myvm", "s1", "10.0.0.43", "02:00:00:00:00:02", 3600);

        // Only the MAC still present in the reservation survives
        metrics.delete_stale_vm_dhcp_v4_leases("ns2/myvm", &["02:00:00:00:00:02".to_string()]);
        assert_eq!(metrics.series_count("dcloud_vm_dhcp_v4_lease_time"), 1);
    }
}
