//! Pod controller wiring: store, queue and sync dispatch.

use std::sync::Arc;

use dhcp_server::v4::DhcpV4Allocator;
use dhcp_server::v6::DhcpV6Allocator;
use k8s_openapi::api::core::v1::Pod;
use tracing::{error, info};

use super::{Event, Operation};
use crate::error::ControllerError;
use crate::events::EventRecorder;
use crate::metrics::Metrics;
use crate::store::ObjectStore;
use crate::subnet::SubnetClient;
use crate::worker::WorkQueue;

pub struct PodController {
    pub(super) store: ObjectStore<Pod>,
    pub(super) queue: WorkQueue<Event>,
    pub(super) dhcp_v4: Arc<DhcpV4Allocator>,
    pub(super) dhcp_v6: Arc<DhcpV6Allocator>,
    pub(super) metrics: Arc<Metrics>,
    pub(super) subnets: Arc<dyn SubnetClient>,
    pub(super) recorder: EventRecorder,
}

impl PodController {
    pub fn new(
        store: ObjectStore<Pod>,
        queue: WorkQueue<Event>,
        dhcp_v4: Arc<DhcpV4Allocator>,
        dhcp_v6: Arc<DhcpV6Allocator>,
        metrics: Arc<Metrics>,
        subnets: Arc<dyn SubnetClient>,
        recorder: EventRecorder,
    ) -> Self {
        Self {
            store,
            queue,
            dhcp_v4,
            dhcp_v6,
            metrics,
            subnets,
            recorder,
        }
    }

    pub fn queue(&self) -> WorkQueue<Event> {
        self.queue.clone()
    }

    pub async fn sync(self: Arc<Self>, event: Event) -> Result<(), ControllerError> {
        match event.operation {
            Operation::Add | Operation::Update => {
                let Some(pod) = self.store.get(&event.key.to_string()) else {
                    info!("(pod.sync) Pod {} does not exist anymore", event.key);
                    return Ok(());
                };
                info!("(pod.sync) handle add Pod {}", event.key);
                if let Err(e) = self.handle_add(&event.key, &pod).await {
                    error!("(pod.sync) handle add Pod {} failed: {}", event.key, e);
                    return Err(e);
                }
            }
            Operation::Delete => {
                info!("(pod.sync) handle delete Pod {}", event.key);
                if let Err(e) = self.handle_delete(&event.key) {
                    error!("(pod.sync) handle delete Pod {} failed: {}", event.key, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
