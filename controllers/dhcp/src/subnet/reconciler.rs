//! Subnet reconciliation: responder configuration and lifecycle.

use std::collections::HashSet;

use crds::{NetworkStatus, Subnet};
use kube::Resource;
use kube::ResourceExt;
use tracing::{error, info, warn};

use super::controller::SubnetController;
use super::watcher::dhcp_provider;
use crate::error::ControllerError;
use crate::pod;
use crate::util::{self, NamespacedName, Protocol};

/// Whether the CIDR family requires a v4 responder.
pub fn need_dhcp_v4(subnet: &Subnet) -> bool {
    subnet.spec.enable_dhcp
        && matches!(
            util::check_protocol(&subnet.spec.cidr_block),
            Some(Protocol::IPv4) | Some(Protocol::Dual)
        )
}

/// Whether the CIDR family requires a v6 responder.
pub fn need_dhcp_v6(subnet: &Subnet) -> bool {
    subnet.spec.enable_dhcp
        && matches!(
            util::check_protocol(&subnet.spec.cidr_block),
            Some(Protocol::IPv6) | Some(Protocol::Dual)
        )
}

impl SubnetController {
    /// Resolve `<attachmentName>.<attachmentNamespace>` against the
    /// network-state cache.
    fn check_network_provider(&self, provider: &str) -> Result<NetworkStatus, String> {
        let parts: Vec<&str> = provider.split('.').collect();
        if parts.len() != 2 {
            return Err(format!("invalid network provider <{}>", provider));
        }
        let (multus_name, multus_namespace) = (parts[0], parts[1]);
        let nad_name = format!("{}/{}", multus_namespace, multus_name);
        self.network_cache
            .get_network_status(&nad_name)
            .ok_or_else(|| format!("unsupported network provider <{}>", provider))
    }

    pub async fn create_or_update_dhcp_server(
        &self,
        subnet: &Subnet,
        provider: &str,
    ) -> Result<(), ControllerError> {
        let name = subnet.name_any();

        // 1. check enable dhcp
        if !subnet.spec.enable_dhcp {
            info!("(subnet.create_or_update_dhcp_server) Subnet <{}> did not enable DHCP", name);
            return Ok(());
        }

        // 2. check provider; an unknown provider may become known later
        // when a service materializes it
        let network_status = match self.check_network_provider(provider) {
            Ok(status) => status,
            Err(msg) => {
                warn!("(subnet.create_or_update_dhcp_server) Subnet <{}>: {}, skip it", name, msg);
                return Ok(());
            }
        };

        let mut err_msgs = Vec::new();

        // 3. handle dhcp v4
        if let Err(e) = self.handle_dhcp_v4(subnet, provider, &network_status).await {
            error!("(subnet.create_or_update_dhcp_server) Subnet <{}> handle_dhcp_v4 failed: {}", name, e);
            err_msgs.push(format!("handle_dhcp_v4 error: {}", e));
        }

        // 4. handle dhcp v6
        if let Err(e) = self.handle_dhcp_v6(subnet, provider, &network_status).await {
            error!("(subnet.create_or_update_dhcp_server) Subnet <{}> handle_dhcp_v6 failed: {}", name, e);
            err_msgs.push(format!("handle_dhcp_v6 error: {}", e));
        }

        // 5. update subnet gauge
        let protocol = util::check_protocol(&subnet.spec.cidr_block)
            .map(|p| p.to_string())
            .unwrap_or_default();
        self.metrics.update_dhcp_subnet_info(
            &name,
            provider,
            &subnet.spec.cidr_block,
            &protocol,
            &subnet.spec.gateway,
            need_dhcp_v4(subnet),
            need_dhcp_v6(subnet),
        );

        // 6. notify the update of pod lease gauges
        self.notify_pods(&name);

        if !err_msgs.is_empty() {
            return Err(ControllerError::Reconcile(err_msgs.join("; ")));
        }
        Ok(())
    }

    async fn handle_dhcp_v4(
        &self,
        subnet: &Subnet,
        provider: &str,
        network_status: &NetworkStatus,
    ) -> Result<(), ControllerError> {
        let name = subnet.name_any();
        let obj_ref = subnet.object_ref(&());

        // 1. check need dhcp v4 server; if not needed, stop it
        if !need_dhcp_v4(subnet) {
            return self
                .delete_dhcp_v4(&name, provider, Some(subnet), network_status)
                .await;
        }

        // 2. parse dhcpv4 options
        let options_str = subnet
            .spec
            .dhcp_v4_options
            .clone()
            .unwrap_or_default()
            .replace(' ', "");
        let options = util::parse_dhcp_options(&options_str);

        // 3. build ovn subnet; attachment problems surface as events only
        let ovn_subnet = match util::build_v4_subnet(subnet, network_status, &options).await {
            Ok(ovn) => ovn,
            Err(e) => {
                warn!("(subnet.handle_dhcp_v4) Subnet <{}>: {}", name, e);
                self.recorder.warning(&obj_ref, "SubnetError", e.to_string()).await;
                return Ok(());
            }
        };

        // 4. add or update subnet
        let old = self.dhcp_v4.get_subnet(&name);
        self.dhcp_v4.add_or_update_subnet(&name, ovn_subnet.clone());

        match &old {
            Some(old) if *old != ovn_subnet => {
                self.recorder
                    .normal(&obj_ref, "DHCPServer", "DHCPv4 options updated successfully".to_string())
                    .await;
            }
            None if provider != subnet.spec_provider() => {
                self.recorder
                    .normal(
                        &obj_ref,
                        "DHCPServer",
                        format!("Add subnet to the dhcp provider <{}> DHCPv4 server", provider),
                    )
                    .await;
            }
            _ => {}
        }

        // 5. check dhcpv4 server already exists
        if self.dhcp_v4.has_server(&network_status.interface) {
            warn!(
                "(subnet.handle_dhcp_v4) Subnet <{}> network provider <{}> DHCP service already exists",
                name, provider
            );
            self.metrics.update_dhcp_v4_server_info(
                &network_status.name,
                &network_status.interface,
                &ovn_subnet.server_ip.to_string(),
                &ovn_subnet.server_mac,
            );
            return Ok(());
        }

        // 6. if dhcpv4 server non-existent, add and run
        if let Err(e) = self.dhcp_v4.add_and_run(&network_status.interface) {
            self.recorder
                .warning(
                    &obj_ref,
                    "DHCPServerError",
                    format!("The DHCPv4 server of network provider <{}> failed to start", provider),
                )
                .await;
            return Err(ControllerError::Reconcile(format!(
                "network provider <{}> DHCPv4 service startup failed: {}",
                provider, e
            )));
        }

        // 7. update dhcp v4 server gauge
        self.metrics.update_dhcp_v4_server_info(
            &network_status.name,
            &network_status.interface,
            &ovn_subnet.server_ip.to_string(),
            &ovn_subnet.server_mac,
        );

        self.recorder
            .normal(
                &obj_ref,
                "DHCPServer",
                format!(
                    "The DHCPv4 server of network provider <{}> has been successfully started",
                    provider
                ),
            )
            .await;

        Ok(())
    }

    async fn handle_dhcp_v6(
        &self,
        subnet: &Subnet,
        provider: &str,
        network_status: &NetworkStatus,
    ) -> Result<(), ControllerError> {
        let name = subnet.name_any();
        let obj_ref = subnet.object_ref(&());

        // 1. check need dhcp v6 server; if not needed, stop it
        if !need_dhcp_v6(subnet) {
            return self
                .delete_dhcp_v6(&name, provider, Some(subnet), network_status)
                .await;
        }

        // 2. parse dhcpv6 options
        let options_str = subnet
            .spec
            .dhcp_v6_options
            .clone()
            .unwrap_or_default()
            .replace(' ', "");
        let options = util::parse_dhcp_options(&options_str);

        // 3. build ovn subnet; attachment problems surface as events only
        let ovn_subnet = match util::build_v6_subnet(network_status, &options).await {
            Ok(ovn) => ovn,
            Err(e) => {
                warn!("(subnet.handle_dhcp_v6) Subnet <{}>: {}", name, e);
                self.recorder.warning(&obj_ref, "SubnetError", e.to_string()).await;
                return Ok(());
            }
        };

        // 4. add or update subnet
        let old = self.dhcp_v6.get_subnet(&name);
        self.dhcp_v6.add_or_update_subnet(&name, ovn_subnet.clone());

        match &old {
            Some(old) if *old != ovn_subnet => {
                self.recorder
                    .normal(&obj_ref, "DHCPServer", "DHCPv6 options updated successfully".to_string())
                    .await;
            }
            None if provider != subnet.spec_provider() => {
                self.recorder
                    .normal(
                        &obj_ref,
                        "DHCPServer",
                        format!("Add subnet to the dhcp provider <{}> DHCPv6 server", provider),
                    )
                    .await;
            }
            _ => {}
        }

        // 5. check dhcpv6 server already exists
        if self.dhcp_v6.has_server(&network_status.interface) {
            warn!(
                "(subnet.handle_dhcp_v6) Subnet <{}> network provider <{}> DHCP service already exists",
                name, provider
            );
            self.metrics.update_dhcp_v6_server_info(
                &network_status.name,
                &network_status.interface,
                &ovn_subnet.server_ip.to_string(),
                &ovn_subnet.server_mac,
            );
            return Ok(());
        }

        // 6. if dhcpv6 server non-existent, add and run
        if let Err(e) = self.dhcp_v6.add_and_run(&network_status.interface) {
            self.recorder
                .warning(
                    &obj_ref,
                    "DHCPServerError",
                    format!("The DHCPv6 server of network provider <{}> failed to start", provider),
                )
                .await;
            return Err(ControllerError::Reconcile(format!(
                "network provider <{}> DHCPv6 service startup failed: {}",
                provider, e
            )));
        }

        // 7. update dhcp v6 server gauge
        self.metrics.update_dhcp_v6_server_info(
            &network_status.name,
            &network_status.interface,
            &ovn_subnet.server_ip.to_string(),
            &ovn_subnet.server_mac,
        );

        self.recorder
            .normal(
                &obj_ref,
                "DHCPServer",
                format!(
                    "The DHCPv6 server of network provider <{}> has been successfully started",
                    provider
                ),
            )
            .await;

        Ok(())
    }

    pub async fn delete_network_provider(
        &self,
        subnet_name: &str,
        subnet: Option<&Subnet>,
        provider: &str,
    ) -> Result<(), ControllerError> {
        // 1. check provider
        let network_status = match self.check_network_provider(provider) {
            Ok(status) => status,
            Err(msg) => {
                warn!(
                    "(subnet.delete_network_provider) Subnet <{}>: {}, skip deletion",
                    subnet_name, msg
                );
                return Ok(());
            }
        };

        // 2. delete and stop dhcp v4 server
        if let Err(e) = self
            .delete_dhcp_v4(subnet_name, provider, subnet, &network_status)
            .await
        {
            error!("(subnet.delete_network_provider) Subnet <{}> delete_dhcp_v4 error: {}", subnet_name, e);
            return Err(e);
        }

        // 3. delete and stop dhcp v6 server
        if let Err(e) = self
            .delete_dhcp_v6(subnet_name, provider, subnet, &network_status)
            .await
        {
            error!("(subnet.delete_network_provider) Subnet <{}> delete_dhcp_v6 error: {}", subnet_name, e);
            return Err(e);
        }

        // 4. delete subnet gauge
        self.metrics.delete_dhcp_subnet_info(subnet_name);

        // 5. notify the update of pod lease gauges
        self.notify_pods(subnet_name);

        Ok(())
    }

    async fn delete_dhcp_v4(
        &self,
        subnet_name: &str,
        provider: &str,
        subnet: Option<&Subnet>,
        network_status: &NetworkStatus,
    ) -> Result<(), ControllerError> {
        // 1. remove dhcp ovn subnet
        let _ = self.dhcp_v4.delete_subnet(subnet_name);

        // 2. check other subnet references
        let subnets = self.store.list_filtered(|s| dhcp_provider(s) == provider);
        let exist = subnets
            .iter()
            .any(|s| s.name_any() != subnet_name && need_dhcp_v4(s));

        let send_event = subnet.is_some_and(|s| provider == s.spec_provider());

        if exist {
            warn!(
                "(subnet.delete_dhcp_v4) Subnet <{}> dhcp provider <{}> has other subnets in use and cannot delete the DHCP service",
                subnet_name, provider
            );
            if send_event {
                if let Some(subnet) = subnet {
                    self.recorder
                        .warning(
                            &subnet.object_ref(&()),
                            "DHCPServer",
                            "There are other subnets using the DHCPv4 server and it cannot be stopped"
                                .to_string(),
                        )
                        .await;
                }
            }
            return Ok(());
        }

        // interface use count > 1 indicates multiple providers share the NIC
        let interface_busy = self.network_cache.interface_use_count(&network_status.interface) > 1;
        if interface_busy {
            warn!(
                "(subnet.delete_dhcp_v4) Subnet <{}> multiple providers using interface <{}> have been detected, \
                 and the DHCP server cannot be stopped due to busy network interfaces",
                subnet_name, network_status.interface
            );
        }

        // 3. delete and stop dhcp v4 server
        if !interface_busy && self.dhcp_v4.has_server(&network_status.interface) {
            self.dhcp_v4
                .del_and_stop(&network_status.interface)
                .map_err(|e| {
                    ControllerError::Reconcile(format!(
                        "stopping the DHCPv4 server of network provider <{}> failed: {}",
                        provider, e
                    ))
                })?;
            if send_event {
                if let Some(subnet) = subnet {
                    self.recorder
                        .normal(
                            &subnet.object_ref(&()),
                            "DHCPServer",
                            "The DHCPv4 server has been successfully shutdown".to_string(),
                        )
                        .await;
                }
            }
        }

        // 4. delete dhcp v4 server gauge
        self.metrics.delete_dhcp_v4_server_info(&network_status.name);

        Ok(())
    }

    async fn delete_dhcp_v6(
        &self,
        subnet_name: &str,
        provider: &str,
        subnet: Option<&Subnet>,
        network_status: &NetworkStatus,
    ) -> Result<(), ControllerError> {
        // 1. remove dhcp ovn subnet
        let _ = self.dhcp_v6.delete_subnet(subnet_name);

        // 2. check other subnet references
        let subnets = self.store.list_filtered(|s| dhcp_provider(s) == provider);
        let exist = subnets
            .iter()
            .any(|s| s.name_any() != subnet_name && need_dhcp_v6(s));

        let send_event = subnet.is_some_and(|s| provider == s.spec_provider());

        if exist {
            warn!(
                "(subnet.delete_dhcp_v6) Subnet <{}> dhcp provider <{}> has other subnets in use and cannot delete the DHCP service",
                subnet_name, provider
            );
            if send_event {
                if let Some(subnet) = subnet {
                    self.recorder
                        .warning(
                            &subnet.object_ref(&()),
                            "DHCPServer",
                            "There are other subnets using the DHCPv6 server and it cannot be stopped"
                                .to_string(),
                        )
                        .await;
                }
            }
            return Ok(());
        }

        let interface_busy = self.network_cache.interface_use_count(&network_status.interface) > 1;
        if interface_busy {
            warn!(
                "(subnet.delete_dhcp_v6) Subnet <{}> multiple providers using interface <{}> have been detected, \
                 and the DHCP server cannot be stopped due to busy network interfaces",
                subnet_name, network_status.interface
            );
        }

        // 3. delete and stop dhcp v6 server
        if !interface_busy && self.dhcp_v6.has_server(&network_status.interface) {
            self.dhcp_v6
                .del_and_stop(&network_status.interface)
                .map_err(|e| {
                    ControllerError::Reconcile(format!(
                        "stopping the DHCPv6 server of network provider <{}> failed: {}",
                        provider, e
                    ))
                })?;
            if send_event {
                if let Some(subnet) = subnet {
                    self.recorder
                        .normal(
                            &subnet.object_ref(&()),
                            "DHCPServer",
                            "The DHCPv6 server has been successfully shutdown".to_string(),
                        )
                        .await;
                }
            }
        }

        // 4. delete dhcp v6 server gauge
        self.metrics.delete_dhcp_v6_server_info(&network_status.name);

        Ok(())
    }

    /// Requeue every workload holding a lease in this subnet so pod-level
    /// gauges and option propagation observe the new configuration.
    pub fn notify_pods(&self, subnet_name: &str) {
        let mut workload_keys = HashSet::new();
        for key in self
            .dhcp_v4
            .subnet_workloads(subnet_name)
            .unwrap_or_default()
            .into_iter()
            .chain(self.dhcp_v6.subnet_workloads(subnet_name).unwrap_or_default())
        {
            if let Some(parsed) = NamespacedName::parse(&key) {
                workload_keys.insert(parsed);
            }
        }
        for key in workload_keys {
            self.pod_queue.add(pod::Event {
                key,
                operation: pod::Operation::Update,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(cidr: &str, enable_dhcp: bool) -> Subnet {
        let mut subnet = Subnet::new("s1", Default::default());
        subnet.spec.cidr_block = cidr.to_string();
        subnet.spec.enable_dhcp = enable_dhcp;
        subnet
    }

    #[test]
    fn test_need_dhcp_by_family() {
        assert!(need_dhcp_v4(&subnet("10.0.0.0/24", true)));
        assert!(!need_dhcp_v6(&subnet("10.0.0.0/24", true)));

        assert!(!need_dhcp_v4(&subnet("fd00::/64", true)));
        assert!(need_dhcp_v6(&subnet("fd00::/64", true)));

        assert!(need_dhcp_v4(&subnet("10.0.0.0/24,fd00::/64", true)));
        assert!(need_dhcp_v6(&subnet("10.0.0.0/24,fd00::/64", true)));

        assert!(!need_dhcp_v4(&subnet("10.0.0.0/24", false)));
        assert!(!need_dhcp_v6(&subnet("fd00::/64", false)));
    }
}
