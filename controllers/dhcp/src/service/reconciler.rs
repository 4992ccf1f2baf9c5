//! Service reconciliation: synthetic network materialization.

use crds::{NetworkDns, NetworkStatus};
use k8s_openapi::api::core::v1::Service;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use super::controller::ServiceController;
use super::watcher::{is_load_balancer, mapping_provider, match_labels};
use crate::error::ControllerError;
use crate::subnet;
use crate::util::{self, NamespacedName};

/// Resolve the mapping annotation value into an attachment key. The value
/// is `<attachmentName>` (same namespace as the service) or the canonical
/// `<attachmentName>.<attachmentNamespace>`.
fn check_network_provider(
    provider: &str,
    svc_key: &NamespacedName,
) -> Result<NamespacedName, String> {
    let parts: Vec<&str> = provider.split('.').collect();
    match parts.len() {
        1 => Ok(NamespacedName::new(svc_key.namespace.clone(), provider)),
        2 => Ok(NamespacedName::new(parts[1], parts[0])),
        _ => Err(format!("unsupported network provider format: {}", provider)),
    }
}

/// Overwrite the cloned attachment with the service-provided identity.
fn mutate_network(nad_key: &NamespacedName, ingress_ips: Vec<String>, network: &mut NetworkStatus) {
    network.name = nad_key.to_string();
    network.ips = ingress_ips;
    network.default = false;
    network.gateway = Vec::new();
    network.dns = NetworkDns::default();
}

/// The service's ready ingress IPv4 addresses.
fn load_balancer_ips(svc: &Service) -> Vec<String> {
    svc.status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| {
            ingress
                .iter()
                .filter_map(|entry| entry.ip.as_deref())
                .filter(|ip| util::is_ipv4(ip))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl ServiceController {
    pub(super) async fn handle_create_or_update(
        &self,
        svc_key: &NamespacedName,
        svc: &Service,
    ) -> Result<(), ControllerError> {
        let obj_ref = svc.object_ref(&());

        // check svc type is LoadBalancer
        if !is_load_balancer(svc) {
            debug!("(service.handle_create_or_update) Service <{}> not load balancing type", svc_key);
            return Ok(());
        }
        // check svc has a mapping provider
        let Some(provider) = mapping_provider(svc) else {
            debug!("(service.handle_create_or_update) Service <{}> has no mapped provider", svc_key);
            return Ok(());
        };
        // only services directed at this DHCP controller participate
        let Some(self_pod) = self.self_pod.get_self_pod() else {
            return Err(ControllerError::Reconcile(
                "self pod not available in local cache".to_string(),
            ));
        };
        if !match_labels(svc, &self_pod) {
            warn!(
                "(service.handle_create_or_update) Service <{}> selector is not the current DHCP service, skip it",
                svc_key
            );
            return Ok(());
        }

        let nad_key = match check_network_provider(&provider, svc_key) {
            Ok(key) => key,
            Err(msg) => {
                self.recorder
                    .warning(&obj_ref, "ValidateProviderError", msg.clone())
                    .await;
                warn!(
                    "(service.handle_create_or_update) Service <{}> check network provider error: {}",
                    svc_key, msg
                );
                return Ok(());
            }
        };

        // a second service claiming the same mapping is a conflict
        let claimants = self
            .store
            .list_filtered(|s| mapping_provider(s).as_deref() == Some(provider.as_str()));
        if claimants.len() > 1 {
            let msg = format!("detected multiple services using the same provider <{}>", provider);
            self.recorder
                .warning(&obj_ref, "ValidateProviderError", msg.clone())
                .await;
            return Err(ControllerError::Reconcile(msg));
        }

        // an original network can never be shadowed
        let nad_name = nad_key.to_string();
        if self.network_cache.has_original_network(&nad_name) {
            let msg = format!(
                "Unable to use the built-in original network provider <{}> as a mapping object",
                provider
            );
            self.recorder
                .warning(&obj_ref, "ValidateProviderError", msg.clone())
                .await;
            warn!("(service.handle_create_or_update) Service <{}> {}", svc_key, msg);
            return Ok(());
        }

        // collect the ready ingress addresses
        let ingress_ips = load_balancer_ips(svc);
        if ingress_ips.is_empty() {
            self.recorder
                .warning(
                    &obj_ref,
                    "WaitingLoadBalancer",
                    "Waiting for LoadBalancer initialization".to_string(),
                )
                .await;
            return Ok(());
        }
        debug!(
            "(service.handle_create_or_update) Service <{}> detected load balancing IPs {:?}",
            svc_key, ingress_ips
        );

        // clone the existing synthetic entry or the cluster default
        let (mut network, original, update) = match self.network_cache.get_network_status(&nad_name)
        {
            Some(status) => (status.clone(), Some(status), true),
            None => match self.network_cache.get_default_network() {
                Some(status) => (status, None, false),
                None => {
                    let msg = "default network not found in network state cache".to_string();
                    self.recorder.warning(&obj_ref, "InternalError", msg.clone()).await;
                    return Err(ControllerError::Reconcile(msg));
                }
            },
        };

        mutate_network(&nad_key, ingress_ips, &mut network);
        if update && original.as_ref() == Some(&network) {
            debug!(
                "(service.handle_create_or_update) Service <{}> no need to update any configuration",
                svc_key
            );
            return Ok(());
        }

        let result = if update {
            self.network_cache.update_network_status(network)
        } else {
            self.network_cache.set_network_status(network)
        };
        if let Err(e) = result {
            warn!(
                "(service.handle_create_or_update) Service <{}> failed to modify network cache: {}",
                svc_key, e
            );
            self.recorder
                .warning(&obj_ref, "InternalError", e.to_string())
                .await;
            return Err(e.into());
        }

        // notify the subnets bound to this provider
        let provider = format!("{}.{}", nad_key.name, nad_key.namespace);
        let mut notified = Vec::new();
        for sub in self.subnets.subnets_by_dhcp_provider(&provider) {
            if sub.meta().deletion_timestamp.is_some() {
                continue;
            }
            let name = sub.name_any();
            self.subnets.enqueue(subnet::Event {
                name: name.clone(),
                provider: provider.clone(),
                operation: subnet::Operation::Update,
            });
            notified.push(name);
        }
        if !notified.is_empty() {
            debug!(
                "(service.handle_create_or_update) Service <{}> notify to update subnets {:?}",
                svc_key, notified
            );
        }

        Ok(())
    }

    pub(super) async fn handle_delete(
        &self,
        provider: &str,
        svc_key: &NamespacedName,
    ) -> Result<(), ControllerError> {
        // check provider
        let nad_key = match check_network_provider(provider, svc_key) {
            Ok(key) => key,
            Err(msg) => {
                warn!("(service.handle_delete) Service <{}> {}, ignore it", svc_key, msg);
                return Ok(());
            }
        };

        // skip original networks
        let nad_name = nad_key.to_string();
        if self.network_cache.has_original_network(&nad_name) {
            warn!(
                "(service.handle_delete) Service <{}> original network state cannot be deleted, ignore it",
                svc_key
            );
            return Ok(());
        }

        // check the synthetic entry exists
        if self.network_cache.get_network_status(&nad_name).is_none() {
            warn!(
                "(service.handle_delete) Service <{}> provider <{}> does not exist in the local network cache",
                svc_key, provider
            );
            return Ok(());
        }

        // tear down the responders of every subnet bound to this provider
        let provider = format!("{}.{}", nad_key.name, nad_key.namespace);
        for sub in self.subnets.subnets_by_dhcp_provider(&provider) {
            let name = sub.name_any();
            self.subnets
                .delete_network_provider(&name, None, &provider)
                .await?;
            if sub.spec.enable_dhcp {
                self.recorder
                    .warning(
                        &sub.object_ref(&()),
                        "DHCPServer",
                        "Stop provider's DHCP service due to LoadBalancer shutdown".to_string(),
                    )
                    .await;
            }
        }

        let _ = self.network_cache.delete_network_status(&nad_name);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};

    #[test]
    fn test_check_network_provider_forms() {
        let svc_key = NamespacedName::new("dhcp", "svc1");

        let short = check_network_provider("nadX", &svc_key).unwrap();
        assert_eq!(short.to_string(), "dhcp/nadX");

        let canonical = check_network_provider("nadX.ns", &svc_key).unwrap();
        assert_eq!(canonical.to_string(), "ns/nadX");

        assert!(check_network_provider("a.b.c", &svc_key).is_err());
    }

    #[test]
    fn test_mutate_network_clears_identity() {
        let nad_key = NamespacedName::new("ns", "nadX");
        let mut network = NetworkStatus {
            name: "ovn".to_string(),
            interface: "eth0".to_string(),
            ips: vec!["10.10.1.39".to_string()],
            mac: "00:00:00:01:02:03".to_string(),
            default: true,
            gateway: vec!["10.10.1.1".to_string()],
            dns: NetworkDns {
                nameservers: vec!["10.96.0.10".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };

        mutate_network(&nad_key, vec!["203.0.113.5".to_string()], &mut network);

        assert_eq!(network.name, "ns/nadX");
        assert_eq!(network.ips, vec!["203.0.113.5"]);
        assert!(!network.default);
        assert!(network.gateway.is_empty());
        assert_eq!(network.dns, NetworkDns::default());
        // Inherited attributes survive the rewrite
        assert_eq!(network.interface, "eth0");
        assert_eq!(network.mac, "00:00:00:01:02:03");
    }

    #[test]
    fn test_load_balancer_ips_filters_v4() {
        let mut svc = Service::default();
        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![
                    LoadBalancerIngress {
                        ip: Some("203.0.113.5".to_string()),
                        ..Default::default()
                    },
                    LoadBalancerIngress {
                        ip: Some("fd00::5".to_string()),
                        ..Default::default()
                    },
                    LoadBalancerIngress {
                        hostname: Some("lb.example".to_string()),
                        ..Default::default()
                    },
                ]),
            }),
            ..Default::default()
        });
        assert_eq!(load_balancer_ips(&svc), vec!["203.0.113.5"]);

        assert!(load_balancer_ips(&Service::default()).is_empty());
    }
}
