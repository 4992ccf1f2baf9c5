//! Process bootstrap and service wiring.
//!
//! Init reads the environment and the platform attachment manifest; run
//! enters leader election and, once leading, starts the metrics endpoint,
//! the allocators, the caches and the three controllers.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crds::{NetworkStatus, Subnet};
use dhcp_server::v4::DhcpV4Allocator;
use dhcp_server::v6::DhcpV6Allocator;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Patch, PatchParams};
use kube::config::KubeConfigOptions;
use kube::{Api, Client, Config};
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

use crate::cache::{NetworkCache, SelfPodCache};
use crate::error::ControllerError;
use crate::events::EventRecorder;
use crate::leader::{LeaderElection, LEASE_NAME};
use crate::metrics::{Metrics, DEFAULT_METRICS_PORT};
use crate::pod::PodController;
use crate::service::ServiceController;
use crate::store::ObjectStore;
use crate::subnet::{SubnetClient, SubnetController};
use crate::util;
use crate::worker::{Worker, WorkQueue};
use crate::{pod, service, subnet};

pub struct App {
    client: Client,
    pod_name: String,
    pod_namespace: String,
    network_infos: Vec<NetworkStatus>,
}

fn kubeconfig_path() -> PathBuf {
    if let Ok(path) = env::var("KUBECONFIG") {
        return PathBuf::from(path);
    }
    let home = env::var("HOME").unwrap_or_default();
    Path::new(&home).join(".kube").join("config")
}

async fn build_client() -> Result<Client, ControllerError> {
    if kubeconfig_path().is_file() {
        let options = KubeConfigOptions {
            context: env::var("KUBECONTEXT").ok(),
            ..Default::default()
        };
        let config = Config::from_kubeconfig(&options)
            .await
            .map_err(|e| ControllerError::InvalidConfig(format!("cannot load kubeconfig: {}", e)))?;
        return Ok(Client::try_from(config)?);
    }
    Ok(Client::try_default().await?)
}

impl App {
    pub async fn init() -> Result<Self, ControllerError> {
        let pod_name = env::var("POD_NAME")
            .map_err(|_| ControllerError::InvalidConfig("POD_NAME is required".to_string()))?;
        let pod_namespace = env::var("POD_NAMESPACE")
            .map_err(|_| ControllerError::InvalidConfig("POD_NAMESPACE is required".to_string()))?;

        let client = build_client().await?;

        let app = Self {
            client,
            pod_name,
            pod_namespace,
            network_infos: Vec::new(),
        };

        // make sure the leader label is removed in case the pod crashed
        app.remove_leader_pod_label().await;

        let network_infos =
            util::network_status_from_file(Path::new(util::NETWORK_STATUS_FILE_PATH)).await?;
        if network_infos.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "no multus network status information available".to_string(),
            ));
        }

        Ok(Self {
            network_infos,
            ..app
        })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        let identity = Uuid::new_v4().to_string();
        info!("(app.run) generated leader id: {}", identity);

        let lease_api: Api<Lease> = Api::namespaced(self.client.clone(), &self.pod_namespace);
        let elector = LeaderElection::new(lease_api, LEASE_NAME, identity);

        if !elector.acquire(&mut shutdown).await {
            return Ok(());
        }

        // a dedicated channel so losing leadership tears the services down
        // without ending the process-wide shutdown watch
        let (stop_tx, stop_rx) = watch::channel(false);
        self.run_services(stop_rx).await?;

        tokio::select! {
            _ = elector.hold() => {
                info!("(app.run) leader lost: {}", elector.identity());
            }
            _ = async {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            } => {}
        }

        let _ = stop_tx.send(true);
        self.remove_leader_pod_label().await;
        elector.release().await;
        Ok(())
    }

    async fn run_services(&self, shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        // initialize the dhcp v4/v6 services
        let dhcp_v4 = Arc::new(DhcpV4Allocator::new(shutdown.clone()));
        let dhcp_v6 = Arc::new(DhcpV6Allocator::new(shutdown.clone()));

        // initialize the metrics service
        let metrics = Arc::new(Metrics::new()?);
        let metrics_port = env::var("METRICS_PORT")
            .ok()
            .and_then(|port| port.parse().ok())
            .unwrap_or(DEFAULT_METRICS_PORT);
        tokio::spawn(Arc::clone(&metrics).run(metrics_port, shutdown.clone()));

        // mark this pod as the active leader
        self.add_leader_pod_label().await;

        let network_cache = Arc::new(NetworkCache::new(self.network_infos.clone()));
        let recorder = EventRecorder::new(self.client.clone());

        let self_pod = Arc::new(SelfPodCache::new());
        {
            let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.pod_namespace);
            let cache = Arc::clone(&self_pod);
            let name = self.pod_name.clone();
            let stop = shutdown.clone();
            tokio::spawn(async move { cache.run(api, &name, stop).await });
        }

        let subnet_store: ObjectStore<Subnet> = ObjectStore::new();
        let pod_store: ObjectStore<Pod> = ObjectStore::new();
        let service_store: ObjectStore<Service> = ObjectStore::new();

        let subnet_queue: WorkQueue<subnet::Event> = WorkQueue::new();
        let pod_queue: WorkQueue<pod::Event> = WorkQueue::new();
        let service_queue: WorkQueue<service::Event> = WorkQueue::new();

        let subnet_controller = Arc::new(SubnetController::new(
            subnet_store.clone(),
            subnet_queue.clone(),
            Arc::clone(&dhcp_v4),
            Arc::clone(&dhcp_v6),
            Arc::clone(&metrics),
            Arc::clone(&network_cache),
            pod_queue.clone(),
            recorder.clone(),
        ));
        let pod_controller = Arc::new(PodController::new(
            pod_store.clone(),
            pod_queue.clone(),
            Arc::clone(&dhcp_v4),
            Arc::clone(&dhcp_v6),
            Arc::clone(&metrics),
            Arc::clone(&subnet_controller) as Arc<dyn SubnetClient>,
            recorder.clone(),
        ));
        let service_controller = Arc::new(ServiceController::new(
            service_store.clone(),
            service_queue.clone(),
            Arc::clone(&network_cache),
            Arc::clone(&self_pod),
            Arc::clone(&subnet_controller) as Arc<dyn SubnetClient>,
            recorder.clone(),
        ));

        // watchers
        {
            let api: Api<Subnet> = Api::all(self.client.clone());
            let queue = subnet_queue.clone();
            let store = subnet_store.clone();
            let stop = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = subnet::watcher::watch(api, store, queue, stop).await {
                    error!("(app.run_services) subnet watcher failed: {}", e);
                }
            });
        }
        {
            let api: Api<Pod> = Api::all(self.client.clone());
            let queue = pod_queue.clone();
            let store = pod_store.clone();
            let stop = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = pod::watcher::watch(api, store, queue, stop).await {
                    error!("(app.run_services) pod watcher failed: {}", e);
                }
            });
        }
        {
            let api: Api<Service> = Api::namespaced(self.client.clone(), &self.pod_namespace);
            let queue = service_queue.clone();
            let store = service_store.clone();
            let stop = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = service::watcher::watch(api, store, queue, stop).await {
                    error!("(app.run_services) service watcher failed: {}", e);
                }
            });
        }

        // close the queues once the services stop
        {
            let subnet_queue = subnet_queue.clone();
            let pod_queue = pod_queue.clone();
            let service_queue = service_queue.clone();
            let mut stop = shutdown.clone();
            tokio::spawn(async move {
                while stop.changed().await.is_ok() {
                    if *stop.borrow() {
                        break;
                    }
                }
                subnet_queue.shut_down();
                pod_queue.shut_down();
                service_queue.shut_down();
            });
        }

        // one worker per controller keeps per-resource event handling
        // sequential
        {
            let worker = Worker {
                name: "subnet",
                queue: subnet_queue,
            };
            let controller = Arc::clone(&subnet_controller);
            tokio::spawn(async move {
                worker
                    .run(1, true, move |event| {
                        let controller = Arc::clone(&controller);
                        async move { controller.sync(event).await }
                    })
                    .await;
            });
        }
        {
            let worker = Worker {
                name: "pod",
                queue: pod_queue,
            };
            let controller = Arc::clone(&pod_controller);
            tokio::spawn(async move {
                worker
                    .run(1, true, move |event| {
                        let controller = Arc::clone(&controller);
                        async move { controller.sync(event).await }
                    })
                    .await;
            });
        }
        {
            let worker = Worker {
                name: "service",
                queue: service_queue,
            };
            let controller = Arc::clone(&service_controller);
            tokio::spawn(async move {
                worker
                    .run(1, true, move |event| {
                        let controller = Arc::clone(&controller);
                        async move { controller.sync(event).await }
                    })
                    .await;
            });
        }

        Ok(())
    }

    /// Best effort: the label only steers the metrics service endpoint,
    /// DHCP keeps serving if it cannot be applied.
    async fn add_leader_pod_label(&self) {
        self.patch_pod_label(serde_json::json!("active")).await;
    }

    pub async fn remove_leader_pod_label(&self) {
        self.patch_pod_label(serde_json::Value::Null).await;
    }

    async fn patch_pod_label(&self, value: serde_json::Value) {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.pod_namespace);
        let patch = serde_json::json!({
            "metadata": { "labels": { util::LABEL_DCLOUD_LEADER: value } }
        });
        if let Err(e) = api
            .patch(&self.pod_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            error!("(app.patch_pod_label) try patch pod labels failed: {}", e);
        }
    }
}
