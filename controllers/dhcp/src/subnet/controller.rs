//! Subnet controller wiring: store, queue and sync dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use crds::Subnet;
use dhcp_server::v4::DhcpV4Allocator;
use dhcp_server::v6::DhcpV6Allocator;
use tracing::{error, info};

use super::watcher::dhcp_provider;
use super::{Event, Operation, SubnetClient};
use crate::cache::NetworkCache;
use crate::error::ControllerError;
use crate::events::EventRecorder;
use crate::metrics::Metrics;
use crate::pod;
use crate::store::ObjectStore;
use crate::worker::WorkQueue;

pub struct SubnetController {
    pub(super) store: ObjectStore<Subnet>,
    pub(super) queue: WorkQueue<Event>,
    pub(super) dhcp_v4: Arc<DhcpV4Allocator>,
    pub(super) dhcp_v6: Arc<DhcpV6Allocator>,
    pub(super) metrics: Arc<Metrics>,
    pub(super) network_cache: Arc<NetworkCache>,
    pub(super) pod_queue: WorkQueue<pod::Event>,
    pub(super) recorder: EventRecorder,
}

impl SubnetController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: ObjectStore<Subnet>,
        queue: WorkQueue<Event>,
        dhcp_v4: Arc<DhcpV4Allocator>,
        dhcp_v6: Arc<DhcpV6Allocator>,
        metrics: Arc<Metrics>,
        network_cache: Arc<NetworkCache>,
        pod_queue: WorkQueue<pod::Event>,
        recorder: EventRecorder,
    ) -> Self {
        Self {
            store,
            queue,
            dhcp_v4,
            dhcp_v6,
            metrics,
            network_cache,
            pod_queue,
            recorder,
        }
    }

    pub fn queue(&self) -> WorkQueue<Event> {
        self.queue.clone()
    }

    pub async fn sync(self: Arc<Self>, event: Event) -> Result<(), ControllerError> {
        let subnet = self.store.get(&event.name);

        match event.operation {
            Operation::Add | Operation::Update => {
                let Some(subnet) = subnet else {
                    info!("(subnet.sync) Subnet {} does not exist anymore", event.name);
                    return Ok(());
                };
                info!(
                    "(subnet.sync) {} Subnet {} network provider {}",
                    event.operation, event.name, event.provider
                );
                if let Err(e) = self.create_or_update_dhcp_server(&subnet, &event.provider).await {
                    error!(
                        "(subnet.sync) {} Subnet {} network provider {} failed: {}",
                        event.operation, event.name, event.provider, e
                    );
                    return Err(e);
                }
            }
            Operation::Delete => {
                info!(
                    "(subnet.sync) Delete Subnet {} network provider {}",
                    event.name, event.provider
                );
                if let Err(e) = self
                    .delete_network_provider(&event.name, subnet.as_ref(), &event.provider)
                    .await
                {
                    error!(
                        "(subnet.sync) Delete Subnet {} network provider {} failed: {}",
                        event.name, event.provider, e
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SubnetClient for SubnetController {
    fn subnets_by_dhcp_provider(&self, provider: &str) -> Vec<Subnet> {
        self.store.list_filtered(|s| dhcp_provider(s) == provider)
    }

    fn subnets_by_spec_provider(&self, provider: &str) -> Vec<Subnet> {
        self.store.list_filtered(|s| s.spec_provider() == provider)
    }

    async fn delete_network_provider(
        &self,
        subnet_name: &str,
        subnet: Option<&Subnet>,
        provider: &str,
    ) -> Result<(), ControllerError> {
        SubnetController::delete_network_provider(self, subnet_name, subnet, provider).await
    }

    fn enqueue(&self, event: Event) {
        self.queue.add(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::ResourceExt;

    fn subnet(name: &str, provider: &str, anno_provider: Option<&str>) -> Subnet {
        let mut subnet = Subnet::new(name, Default::default());
        subnet.spec.provider = Some(provider.to_string());
        if let Some(anno) = anno_provider {
            let mut annotations = std::collections::BTreeMap::new();
            annotations.insert(
                crate::util::ANNO_DCLOUD_DHCP_PROVIDER.to_string(),
                anno.to_string(),
            );
            subnet.metadata.annotations = Some(annotations);
        }
        subnet
    }

    #[test]
    fn test_store_provider_indexes() {
        let store: ObjectStore<Subnet> = ObjectStore::new();
        store.insert("s1", subnet("s1", "nad1.ns1", None));
        store.insert("s2", subnet("s2", "nad1.ns1", Some("nad2.ns1")));
        store.insert("s3", subnet("s3", "nad3.ns1", None));

        let by_dhcp: Vec<String> = store
            .list_filtered(|s| dhcp_provider(s) == "nad1.ns1")
            .iter()
            .map(|s| s.name_any())
            .collect();
        // s2's annotation moves it to nad2.ns1 for DHCP purposes
        assert_eq!(by_dhcp, vec!["s1"]);

        let by_spec: Vec<String> = {
            let mut names: Vec<String> = store
                .list_filtered(|s| s.spec_provider() == "nad1.ns1")
                .iter()
                .map(|s| s.name_any())
                .collect();
            names.sort();
            names
        };
        assert_eq!(by_spec, vec!["s1", "s2"]);
    }
}
