//! Service controller wiring: store, queue and sync dispatch.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use tracing::{error, info};

use super::{Event, Operation};
use crate::cache::{NetworkCache, SelfPodCache};
use crate::error::ControllerError;
use crate::events::EventRecorder;
use crate::store::ObjectStore;
use crate::subnet::SubnetClient;
use crate::worker::WorkQueue;

pub struct ServiceController {
    pub(super) store: ObjectStore<Service>,
    pub(super) queue: WorkQueue<Event>,
    pub(super) network_cache: Arc<NetworkCache>,
    pub(super) self_pod: Arc<SelfPodCache>,
    pub(super) subnets: Arc<dyn SubnetClient>,
    pub(super) recorder: EventRecorder,
}

impl ServiceController {
    pub fn new(
        store: ObjectStore<Service>,
        queue: WorkQueue<Event>,
        network_cache: Arc<NetworkCache>,
        self_pod: Arc<SelfPodCache>,
        subnets: Arc<dyn SubnetClient>,
        recorder: EventRecorder,
    ) -> Self {
        Self {
            store,
            queue,
            network_cache,
            self_pod,
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
                let Some(svc) = self.store.get(&event.key.to_string()) else {
                    info!("(service.sync) Service <{}> does not exist anymore", event.key);
                    return Ok(());
                };
                info!("(service.sync) Handler update Service <{}>", event.key);
                if let Err(e) = self.handle_create_or_update(&event.key, &svc).await {
                    error!("(service.sync) Handler update Service <{}> failed: {}", event.key, e);
                    return Err(e);
                }
            }
            Operation::Delete => {
                info!("(service.sync) Handler delete Service <{}>", event.key);
                if let Err(e) = self.handle_delete(&event.provider, &event.key).await {
                    error!("(service.sync) Handler delete Service <{}> failed: {}", event.key, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
