//! Pod watch plumbing and event filters.
//!
//! Only VM launcher pods are watched (label selector), which keeps the
//! local cache small. A pod is admitted once its network-status annotation
//! appears; deletions are always admitted since teardown needs only the
//! workload key.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use tokio::sync::watch;
use tracing::{error, info};

use super::{Event, Operation};
use crate::error::ControllerError;
use crate::store::ObjectStore;
use crate::util::{self, NamespacedName};
use crate::worker::WorkQueue;

/// Label selector for VM launcher pods.
pub const VM_LAUNCHER_SELECTOR: &str = "kubevirt.io=virt-launcher";

pub fn get_network_status(pod: &Pod) -> Option<&String> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(util::ANNO_NETWORK_STATUS))
}

fn pod_key(pod: &Pod) -> NamespacedName {
    NamespacedName::new(pod.namespace().unwrap_or_default(), pod.name_any())
}

/// Event for a pod seen in the initial list: only annotated pods matter,
/// there is no network status at pod-creation time.
pub fn initial_event(pod: &Pod) -> Option<Event> {
    get_network_status(pod)?;
    Some(Event {
        key: pod_key(pod),
        operation: Operation::Add,
    })
}

/// Event for an observed update: admitted when the annotation transitions
/// from absent/empty to present.
pub fn update_event(old: &Pod, new: &Pod) -> Option<Event> {
    let had = get_network_status(old).is_some_and(|s| !s.is_empty());
    let has = get_network_status(new).is_some_and(|s| !s.is_empty());
    if !had && has {
        return Some(Event {
            key: pod_key(new),
            operation: Operation::Add,
        });
    }
    None
}

/// Deletions recycle by workload key alone, no annotation required.
pub fn delete_event(pod: &Pod) -> Event {
    Event {
        key: pod_key(pod),
        operation: Operation::Delete,
    }
}

/// Watch launcher pods, maintain the store and feed the queue until
/// shutdown.
pub async fn watch(
    api: Api<Pod>,
    store: ObjectStore<Pod>,
    queue: WorkQueue<Event>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ControllerError> {
    info!("(pod.watch) starting Pod watcher");

    let config = watcher::Config::default().labels(VM_LAUNCHER_SELECTOR);
    let mut stream = Box::pin(watcher(api, config).default_backoff());
    // Keys seen during a (re-)list, so pods deleted while the watch was
    // down still get their delete event at InitDone.
    let mut init_seen: Option<std::collections::HashSet<String>> = None;
    loop {
        tokio::select! {
            event = stream.next() => {
                match event {
                    Some(Ok(watcher::Event::Init)) => {
                        init_seen = Some(Default::default());
                    }
                    Some(Ok(watcher::Event::InitApply(pod) | watcher::Event::Apply(pod))) => {
                        let key = pod_key(&pod).to_string();
                        if let Some(seen) = &mut init_seen {
                            seen.insert(key.clone());
                        }
                        let event = match store.insert(&key, pod.clone()) {
                            Some(old) => update_event(&old, &pod),
                            None => initial_event(&pod),
                        };
                        if let Some(event) = event {
                            queue.add(event);
                        }
                    }
                    Some(Ok(watcher::Event::InitDone)) => {
                        if let Some(seen) = init_seen.take() {
                            for key in store.keys() {
                                if seen.contains(&key) {
                                    continue;
                                }
                                if let Some(gone) = store.remove(&key) {
                                    queue.add(delete_event(&gone));
                                }
                            }
                        }
                    }
                    Some(Ok(watcher::Event::Delete(pod))) => {
                        store.remove(&pod_key(&pod).to_string());
                        queue.add(delete_event(&pod));
                    }
                    Some(Err(e)) => error!("(pod.watch) watch error: {}", e),
                    None => {
                        return Err(ControllerError::Watch("pod watch stream ended".to_string()));
                    }
                }
            }
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    info!("(pod.watch) stopping Pod watcher");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn pod(name: &str, network_status: Option<&str>) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("ns2".to_string());
        if let Some(status) = network_status {
            let mut annotations = BTreeMap::new();
            annotations.insert(util::ANNO_NETWORK_STATUS.to_string(), status.to_string());
            pod.metadata.annotations = Some(annotations);
        }
        pod
    }

    #[test]
    fn test_initial_event_requires_annotation() {
        assert!(initial_event(&pod("p1", None)).is_none());
        let event = initial_event(&pod("p1", Some("[]"))).unwrap();
        assert_eq!(event.operation, Operation::Add);
        assert_eq!(event.key.to_string(), "ns2/p1");
    }

    #[test]
    fn test_update_event_on_annotation_transition() {
        // absent -> present
        assert!(update_event(&pod("p1", None), &pod("p1", Some("[{}]"))).is_some());
        // empty -> present
        assert!(update_event(&pod("p1", Some("")), &pod("p1", Some("[{}]"))).is_some());
        // present -> present is not a transition
        assert!(update_event(&pod("p1", Some("[{}]")), &pod("p1", Some("[{}]"))).is_none());
        // absent -> absent
        assert!(update_event(&pod("p1", None), &pod("p1", None)).is_none());
    }

    #[test]
    fn test_delete_event_always_fires() {
        let event = delete_event(&pod("p1", None));
        assert_eq!(event.operation, Operation::Delete);
        assert_eq!(event.key.to_string(), "ns2/p1");
    }
}
