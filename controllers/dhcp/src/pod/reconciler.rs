//! Pod reconciliation: lease programming from the network-status
//! annotation.

use std::net::IpAddr;
use std::str::FromStr;

use crds::{NetworkStatus, Subnet};
use dhcp_server::store::normalize_mac;
use dhcp_server::Lease;
use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};
use mac_address::MacAddress;
use tracing::{debug, info, warn};

use super::controller::PodController;
use super::watcher::get_network_status;
use crate::error::ControllerError;
use crate::util::{self, NamespacedName};

struct PendingNetwork {
    subnet_name: String,
    status: NetworkStatus,
}

/// The per-interface subnet override annotation.
fn logical_switch_annotation(pod: &Pod, multus_name: &str, multus_namespace: &str) -> Option<String> {
    let anno = format!("{}.{}.kubernetes.io/logical_switch", multus_name, multus_namespace);
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(&anno))
        .cloned()
}

/// The per-interface IP override annotation.
fn ip_address_annotation(pod: &Pod, multus_name: &str, multus_namespace: &str) -> Option<Vec<IpAddr>> {
    let anno = format!("{}.{}.kubernetes.io/ip_address", multus_name, multus_namespace);
    let value = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(&anno))?;
    let ips: Vec<IpAddr> = value.split(',').filter_map(util::parse_ip).collect();
    if ips.is_empty() {
        None
    } else {
        Some(ips)
    }
}

fn cidr_contains_any(cidr_block: &str, ips: &[IpAddr]) -> bool {
    cidr_block
        .split(',')
        .filter_map(|part| IpNetwork::from_str(part.trim()).ok())
        .any(|net| ips.iter().any(|ip| net.contains(*ip)))
}

/// Pick the subnet owning an interface among the provider's candidates:
/// only subnets whose CIDR contains one of the pod's addresses qualify,
/// the default subnet wins, else the first.
fn select_subnet(subnets: &[Subnet], pod_ips: &[IpAddr]) -> Option<String> {
    let candidates: Vec<&Subnet> = subnets
        .iter()
        .filter(|s| cidr_contains_any(&s.spec.cidr_block, pod_ips))
        .collect();
    let chosen = candidates
        .iter()
        .find(|s| s.spec.default)
        .or_else(|| candidates.first())?;
    Some(chosen.name_any())
}

impl PodController {
    fn resolve_subnet_name(
        &self,
        pod: &Pod,
        multus_name: &str,
        multus_namespace: &str,
        status: &NetworkStatus,
    ) -> Option<String> {
        // 1. from the logical_switch annotation
        if let Some(subnet_name) = logical_switch_annotation(pod, multus_name, multus_namespace) {
            return Some(subnet_name);
        }
        // 2. from subnets referencing this attachment as spec provider
        let provider = format!("{}.{}", multus_name, multus_namespace);
        let subnets = self.subnets.subnets_by_spec_provider(&provider);
        if subnets.is_empty() {
            return None;
        }
        let pod_ips = ip_address_annotation(pod, multus_name, multus_namespace)
            .unwrap_or_else(|| status.ips.iter().filter_map(|ip| util::parse_ip(ip)).collect());
        select_subnet(&subnets, &pod_ips)
    }

    pub(super) async fn handle_add(
        &self,
        pod_key: &NamespacedName,
        pod: &Pod,
    ) -> Result<(), ControllerError> {
        // 1. check pod network status
        let Some(annotation) = get_network_status(pod).filter(|s| !s.is_empty()) else {
            debug!("(pod.handle_add) Pod <{}> non-existent network status annotation, skip adding", pod_key);
            return Ok(());
        };

        // 2. parse network status; a parse failure is the only retriable
        // condition here
        let statuses: Vec<NetworkStatus> = match serde_json::from_str(annotation) {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!("(pod.handle_add) Pod <{}> network status deserialization failed: {}", pod_key, e);
                self.recorder
                    .warning(
                        &pod.object_ref(&()),
                        "DHCPLeaseError",
                        format!("annotation '{}' deserialization failed: {}", util::ANNO_NETWORK_STATUS, e),
                    )
                    .await;
                return Err(e.into());
            }
        };

        // 3. filter out the pending networks
        let mut pending_networks = Vec::new();
        let mut pending_names = Vec::new();
        for status in statuses {
            // Non-multus entries like the cluster network have no
            // namespaced name
            let Some(nad_key) = NamespacedName::parse(&status.name) else {
                continue;
            };
            let (multus_name, multus_namespace) = (nad_key.name, nad_key.namespace);
            let Some(subnet_name) =
                self.resolve_subnet_name(pod, &multus_name, &multus_namespace, &status)
            else {
                continue;
            };
            pending_names.push(status.name.clone());
            pending_networks.push(PendingNetwork {
                subnet_name,
                status,
            });
        }
        if pending_networks.is_empty() {
            debug!("(pod.handle_add) Pod <{}> has no network to handle, skip adding", pod_key);
            return Ok(());
        }
        info!("(pod.handle_add) Pod <{}> pending networks {:?}", pod_key, pending_names);

        let mut errs = Vec::new();

        // 4. handle network leases
        for pending in &pending_networks {
            if MacAddress::from_str(&pending.status.mac).is_err() {
                errs.push(format!(
                    "network <{}>: hwaddr <{}> is not valid",
                    pending.status.name, pending.status.mac
                ));
                continue;
            }

            if let Err(e) = self
                .handle_v4_lease(&pending.subnet_name, &pending.status, pod_key, pod)
                .await
            {
                errs.push(e);
            }
            if let Err(e) = self
                .handle_v6_lease(&pending.subnet_name, &pending.status, pod_key, pod)
                .await
            {
                errs.push(e);
            }
        }

        if !errs.is_empty() {
            warn!("(pod.handle_add) Pod <{}> handle dhcp lease error: {}", pod_key, errs.join("; "));
        }

        Ok(())
    }

    async fn handle_v4_lease(
        &self,
        subnet_name: &str,
        status: &NetworkStatus,
        pod_key: &NamespacedName,
        pod: &Pod,
    ) -> Result<(), String> {
        let Some(ipv4) = util::first_ipv4_addr(status) else {
            return Err(format!("network <{}>: no IPv4 address available", status.name));
        };
        let lease = Lease {
            client_ip: IpAddr::V4(ipv4),
            subnet_key: subnet_name.to_string(),
        };

        let workload_key = pod_key.to_string();
        if self.dhcp_v4.has_lease(&status.mac, &workload_key, &lease) {
            debug!(
                "(pod.handle_v4_lease) Pod <{}> network <{}> lease already present",
                pod_key, status.name
            );
        } else {
            self.dhcp_v4
                .add_lease(&status.mac, &workload_key, lease)
                .map_err(|e| e.to_string())?;
            self.recorder
                .normal(
                    &pod.object_ref(&()),
                    "DHCPLease",
                    format!("Additional network <{}> DHCPv4 lease successfully added", status.name),
                )
                .await;
        }

        // Refresh the lease-time gauge from the current subnet options
        if let Some(ovn_subnet) = self.dhcp_v4.get_subnet(subnet_name) {
            let mac = normalize_mac(&status.mac).map_err(|e| e.to_string())?;
            self.metrics.update_vm_dhcp_v4_lease(
                &util::vm_key_for_pod(pod_key),
                subnet_name,
                &ipv4.to_string(),
                &mac,
                ovn_subnet.lease_time,
            );
        }

        Ok(())
    }

    async fn handle_v6_lease(
        &self,
        subnet_name: &str,
        status: &NetworkStatus,
        pod_key: &NamespacedName,
        pod: &Pod,
    ) -> Result<(), String> {
        let Some(ipv6) = util::first_ipv6_addr(status) else {
            return Err(format!("network <{}>: no IPv6 address available", status.name));
        };
        let lease = Lease {
            client_ip: IpAddr::V6(ipv6),
            subnet_key: subnet_name.to_string(),
        };

        let workload_key = pod_key.to_string();
        if self.dhcp_v6.has_lease(&status.mac, &workload_key, &lease) {
            debug!(
                "(pod.handle_v6_lease) Pod <{}> network <{}> lease already present",
                pod_key, status.name
            );
        } else {
            self.dhcp_v6
                .add_lease(&status.mac, &workload_key, lease)
                .map_err(|e| e.to_string())?;
            self.recorder
                .normal(
                    &pod.object_ref(&()),
                    "DHCPLease",
                    format!("Additional network <{}> DHCPv6 lease successfully added", status.name),
                )
                .await;
        }

        if let Some(ovn_subnet) = self.dhcp_v6.get_subnet(subnet_name) {
            let mac = normalize_mac(&status.mac).map_err(|e| e.to_string())?;
            self.metrics.update_vm_dhcp_v6_lease(
                &util::vm_key_for_pod(pod_key),
                subnet_name,
                &ipv6.to_string(),
                &mac,
                ovn_subnet.lease_time,
            );
        }

        Ok(())
    }

    pub(super) fn handle_delete(&self, pod_key: &NamespacedName) -> Result<(), ControllerError> {
        let workload_key = pod_key.to_string();
        let vm_key = util::vm_key_for_pod(pod_key);

        // delete pod ipv4 leases and their gauges
        let removed_v4 = self.dhcp_v4.delete_workload_leases(&workload_key).unwrap_or_default();
        for mac in &removed_v4 {
            self.metrics.delete_vm_dhcp_v4_lease(&vm_key, Some(mac));
        }

        // delete pod ipv6 leases and their gauges
        let removed_v6 = self.dhcp_v6.delete_workload_leases(&workload_key).unwrap_or_default();
        for mac in &removed_v6 {
            self.metrics.delete_vm_dhcp_v6_lease(&vm_key, Some(mac));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(name: &str, cidr: &str, default: bool) -> Subnet {
        let mut subnet = Subnet::new(name, Default::default());
        subnet.spec.cidr_block = cidr.to_string();
        subnet.spec.default = default;
        subnet
    }

    #[test]
    fn test_cidr_contains_any() {
        let ips = vec!["10.0.0.42".parse().unwrap()];
        assert!(cidr_contains_any("10.0.0.0/24", &ips));
        assert!(!cidr_contains_any("10.1.0.0/24", &ips));
        assert!(cidr_contains_any("10.0.0.0/24,fd00::/64", &ips));
        assert!(!cidr_contains_any("", &ips));
    }

    #[test]
    fn test_select_subnet_filters_by_cidr() {
        let subnets = vec![
            subnet("s1", "10.1.0.0/24", false),
            subnet("s2", "10.0.0.0/24", false),
        ];
        let ips = vec!["10.0.0.42".parse().unwrap()];
        assert_eq!(select_subnet(&subnets, &ips), Some("s2".to_string()));
    }

    #[test]
    fn test_select_subnet_prefers_default() {
        let subnets = vec![
            subnet("s1", "10.0.0.0/16", false),
            subnet("s2", "10.0.0.0/24", true),
        ];
        let ips = vec!["10.0.0.42".parse().unwrap()];
        assert_eq!(select_subnet(&subnets, &ips), Some("s2".to_string()));
    }

    #[test]
    fn test_select_subnet_none_matching() {
        let subnets = vec![subnet("s1", "10.1.0.0/24", false)];
        let ips = vec!["10.0.0.42".parse().unwrap()];
        assert_eq!(select_subnet(&subnets, &ips), None);
        assert_eq!(select_subnet(&subnets, &[]), None);
    }

    #[test]
    fn test_annotation_helpers() {
        let mut pod = Pod::default();
        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert(
            "nad1.ns1.kubernetes.io/logical_switch".to_string(),
            "s1".to_string(),
        );
        annotations.insert(
            "nad1.ns1.kubernetes.io/ip_address".to_string(),
            "10.0.0.42,fd00::42".to_string(),
        );
        pod.metadata.annotations = Some(annotations);

        assert_eq!(
            logical_switch_annotation(&pod, "nad1", "ns1"),
            Some("s1".to_string())
        );
        assert!(logical_switch_annotation(&pod, "nad2", "ns1").is_none());

        let ips = ip_address_annotation(&pod, "nad1", "ns1").unwrap();
        assert_eq!(ips.len(), 2);
        assert!(ip_address_annotation(&pod, "nad2", "ns1").is_none());
    }
}
