//! Service watch plumbing and event filters.

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use tokio::sync::watch;
use tracing::{error, info};

use super::{Event, Operation};
use crate::error::ControllerError;
use crate::store::ObjectStore;
use crate::util::{self, NamespacedName};
use crate::worker::WorkQueue;

/// The mapping annotation naming the NAD a LoadBalancer materializes.
pub fn mapping_provider(svc: &Service) -> Option<String> {
    svc.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(util::ANNO_DCLOUD_MAPPING_PROVIDER))
        .cloned()
}

pub fn is_load_balancer(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        .is_some_and(|t| t == "LoadBalancer")
}

/// Does the service selector match the given pod's labels?
pub fn match_labels(svc: &Service, pod: &Pod) -> bool {
    let Some(selector) = svc.spec.as_ref().and_then(|spec| spec.selector.as_ref()) else {
        return true;
    };
    let empty = Default::default();
    let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

fn svc_key(svc: &Service) -> NamespacedName {
    NamespacedName::new(svc.namespace().unwrap_or_default(), svc.name_any())
}

/// Event for a newly observed service. The initial list only admits
/// LoadBalancer services; later adds are admitted on the annotation alone
/// (the type check happens at reconcile time).
pub fn add_event(svc: &Service, is_initial: bool) -> Option<Event> {
    let provider = mapping_provider(svc)?;
    if is_initial && !is_load_balancer(svc) {
        return None;
    }
    Some(Event {
        key: svc_key(svc),
        provider,
        operation: Operation::Add,
    })
}

/// Events for an observed transition between two service versions.
pub fn update_events(old: &Service, new: &Service) -> Vec<Event> {
    if old.resource_version() == new.resource_version() {
        return Vec::new();
    }
    let old_provider = mapping_provider(old);
    let new_provider = mapping_provider(new);

    match (old_provider, new_provider) {
        // annotation removed: tear down the old provider
        (Some(old_provider), None) => vec![Event {
            key: svc_key(new),
            provider: old_provider,
            operation: Operation::Delete,
        }],
        // annotation changed: tear down the old provider, then add the new
        (Some(old_provider), Some(new_provider)) if old_provider != new_provider => vec![
            Event {
                key: svc_key(new),
                provider: old_provider,
                operation: Operation::Delete,
            },
            Event {
                key: svc_key(new),
                provider: new_provider,
                operation: Operation::Add,
            },
        ],
        (_, Some(new_provider)) => vec![Event {
            key: svc_key(new),
            provider: new_provider,
            operation: Operation::Update,
        }],
        (None, None) => Vec::new(),
    }
}

pub fn delete_event(svc: &Service) -> Option<Event> {
    let provider = mapping_provider(svc)?;
    Some(Event {
        key: svc_key(svc),
        provider,
        operation: Operation::Delete,
    })
}

/// Watch services in the controller namespace, maintain the store and
/// feed the queue until shutdown.
pub async fn watch(
    api: Api<Service>,
    store: ObjectStore<Service>,
    queue: WorkQueue<Event>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ControllerError> {
    info!("(service.watch) starting Service watcher");

    let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff());
    // Keys seen during a (re-)list, so services deleted while the watch
    // was down still get their delete event at InitDone.
    let mut init_seen: Option<std::collections::HashSet<String>> = None;
    loop {
        tokio::select! {
            event = stream.next() => {
                match event {
                    Some(Ok(watcher::Event::Init)) => {
                        init_seen = Some(Default::default());
                    }
                    Some(Ok(watcher::Event::InitApply(svc) | watcher::Event::Apply(svc))) => {
                        let key = svc_key(&svc).to_string();
                        let is_initial = init_seen.is_some();
                        if let Some(seen) = &mut init_seen {
                            seen.insert(key.clone());
                        }
                        match store.insert(&key, svc.clone()) {
                            Some(old) => {
                                for event in update_events(&old, &svc) {
                                    queue.add(event);
                                }
                            }
                            None => {
                                if let Some(event) = add_event(&svc, is_initial) {
                                    queue.add(event);
                                }
                            }
                        }
                    }
                    Some(Ok(watcher::Event::InitDone)) => {
                        if let Some(seen) = init_seen.take() {
                            for key in store.keys() {
                                if seen.contains(&key) {
                                    continue;
                                }
                                if let Some(gone) = store.remove(&key) {
                                    if let Some(event) = delete_event(&gone) {
                                        queue.add(event);
                                    }
                                }
                            }
                        }
                    }
                    Some(Ok(watcher::Event::Delete(svc))) => {
                        store.remove(&svc_key(&svc).to_string());
                        if let Some(event) = delete_event(&svc) {
                            queue.add(event);
                        }
                    }
                    Some(Err(e)) => error!("(service.watch) watch error: {}", e),
                    None => {
                        return Err(ControllerError::Watch("service watch stream ended".to_string()));
                    }
                }
            }
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    info!("(service.watch) stopping Service watcher");
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

    fn service(name: &str, provider: Option<&str>, type_: &str, version: &str) -> Service {
        let mut svc = Service::default();
        svc.metadata.name = Some(name.to_string());
        svc.metadata.namespace = Some("dhcp".to_string());
        svc.metadata.resource_version = Some(version.to_string());
        if let Some(provider) = provider {
            let mut annotations = BTreeMap::new();
            annotations.insert(
                util::ANNO_DCLOUD_MAPPING_PROVIDER.to_string(),
                provider.to_string(),
            );
            svc.metadata.annotations = Some(annotations);
        }
        svc.spec = Some(k8s_openapi::api::core::v1::ServiceSpec {
            type_: Some(type_.to_string()),
            ..Default::default()
        });
        svc
    }

    #[test]
    fn test_add_event_initial_requires_load_balancer() {
        let lb = service("svc1", Some("nadX.ns"), "LoadBalancer", "1");
        let cluster_ip = service("svc1", Some("nadX.ns"), "ClusterIP", "1");
        assert!(add_event(&lb, true).is_some());
        assert!(add_event(&cluster_ip, true).is_none());
        // A later add is admitted regardless of type
        assert!(add_event(&cluster_ip, false).is_some());
        // No annotation, no event
        assert!(add_event(&service("svc1", None, "LoadBalancer", "1"), true).is_none());
    }

    #[test]
    fn test_update_annotation_removed_is_delete() {
        let old = service("svc1", Some("nadX.ns"), "LoadBalancer", "1");
        let new = service("svc1", None, "LoadBalancer", "2");
        let events = update_events(&old, &new);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, Operation::Delete);
        assert_eq!(events[0].provider, "nadX.ns");
    }

    #[test]
    fn test_update_provider_change_is_delete_then_add() {
        let old = service("svc1", Some("nadX.ns"), "LoadBalancer", "1");
        let new = service("svc1", Some("nadY.ns"), "LoadBalancer", "2");
        let events = update_events(&old, &new);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].operation, Operation::Delete);
        assert_eq!(events[0].provider, "nadX.ns");
        assert_eq!(events[1].operation, Operation::Add);
        assert_eq!(events[1].provider, "nadY.ns");
    }

    #[test]
    fn test_update_same_provider_is_update() {
        let old = service("svc1", Some("nadX.ns"), "LoadBalancer", "1");
        let new = service("svc1", Some("nadX.ns"), "LoadBalancer", "2");
        let events = update_events(&old, &new);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, Operation::Update);
    }

    #[test]
    fn test_update_same_resource_version_skipped() {
        let old = service("svc1", Some("nadX.ns"), "LoadBalancer", "1");
        let new = service("svc1", Some("nadY.ns"), "LoadBalancer", "1");
        assert!(update_events(&old, &new).is_empty());
    }

    #[test]
    fn test_match_labels() {
        let mut svc = service("svc1", None, "LoadBalancer", "1");
        svc.spec.as_mut().unwrap().selector = Some(BTreeMap::from([(
            "app".to_string(),
            "dhcp-controller".to_string(),
        )]));

        let mut pod = Pod::default();
        pod.metadata.labels = Some(BTreeMap::from([
            ("app".to_string(), "dhcp-controller".to_string()),
            ("other".to_string(), "x".to_string()),
        ]));
        assert!(match_labels(&svc, &pod));

        pod.metadata.labels = Some(BTreeMap::from([("app".to_string(), "else".to_string())]));
        assert!(!match_labels(&svc, &pod));
    }
}
