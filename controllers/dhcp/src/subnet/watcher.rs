//! Subnet watch plumbing and event filters.
//!
//! The filters decide which cluster changes become queue events. Subnets
//! on the native `ovn` provider are never admitted; update admittance is
//! transition-based so a no-op re-list does not churn the responders.

use crds::Subnet;
use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use tokio::sync::watch;
use tracing::{error, info};

use super::{Event, Operation};
use crate::error::ControllerError;
use crate::store::ObjectStore;
use crate::util;
use crate::worker::WorkQueue;

/// Effective DHCP provider: the `dhcp-provider` annotation wins over
/// `spec.provider` when present.
pub fn dhcp_provider(subnet: &Subnet) -> String {
    subnet.dhcp_provider(util::ANNO_DCLOUD_DHCP_PROVIDER)
}

/// Subnets on the native OVN provider need no external DHCP.
fn filter_subnet_provider(subnet: &Subnet) -> bool {
    let provider = dhcp_provider(subnet);
    !provider.is_empty() && provider != "ovn" && !provider.ends_with(".ovn")
}

fn dhcp_options_changed(old: &Subnet, new: &Subnet) -> bool {
    old.spec.dhcp_v4_options != new.spec.dhcp_v4_options
        || old.spec.dhcp_v6_options != new.spec.dhcp_v6_options
}

/// Event for a newly observed subnet: admitted only when DHCP is enabled.
pub fn add_event(subnet: &Subnet) -> Option<Event> {
    if filter_subnet_provider(subnet) && subnet.spec.enable_dhcp {
        return Some(Event {
            name: subnet.name_any(),
            provider: dhcp_provider(subnet),
            operation: Operation::Add,
        });
    }
    None
}

/// Events for an observed transition between two subnet versions.
pub fn update_events(old: &Subnet, new: &Subnet) -> Vec<Event> {
    let mut events = Vec::new();

    if !old.spec.enable_dhcp && new.spec.enable_dhcp {
        // enable dhcp
        if filter_subnet_provider(new) {
            events.push(Event {
                name: new.name_any(),
                provider: dhcp_provider(new),
                operation: Operation::Add,
            });
        }
    } else if dhcp_provider(old) != dhcp_provider(new) {
        // dhcp provider change: tear down the old provider, then add the new
        if filter_subnet_provider(old) {
            events.push(Event {
                name: old.name_any(),
                provider: dhcp_provider(old),
                operation: Operation::Delete,
            });
        }
        if filter_subnet_provider(new) {
            events.push(Event {
                name: new.name_any(),
                provider: dhcp_provider(new),
                operation: Operation::Add,
            });
        }
    } else if old.spec.enable_dhcp && !new.spec.enable_dhcp {
        // disable dhcp
        if filter_subnet_provider(new) {
            events.push(Event {
                name: new.name_any(),
                provider: dhcp_provider(new),
                operation: Operation::Delete,
            });
        }
    } else if dhcp_options_changed(old, new)
        || old.spec.gateway != new.spec.gateway
        || old.spec.cidr_block != new.spec.cidr_block
    {
        if filter_subnet_provider(new) {
            events.push(Event {
                name: new.name_any(),
                provider: dhcp_provider(new),
                operation: Operation::Update,
            });
        }
    }

    events
}

/// Event for a deleted subnet, with the provider captured at delete time.
pub fn delete_event(subnet: &Subnet) -> Option<Event> {
    if filter_subnet_provider(subnet) {
        return Some(Event {
            name: subnet.name_any(),
            provider: dhcp_provider(subnet),
            operation: Operation::Delete,
        });
    }
    None
}

/// Watch subnets, maintain the store and feed the queue until shutdown.
pub async fn watch(
    api: Api<Subnet>,
    store: ObjectStore<Subnet>,
    queue: WorkQueue<Event>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ControllerError> {
    info!("(subnet.watch) starting Subnet watcher");

    let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff());
    // Names seen during a (re-)list, so objects deleted while the watch
    // was down still get their delete event at InitDone.
    let mut init_seen: Option<std::collections::HashSet<String>> = None;
    loop {
        tokio::select! {
            event = stream.next() => {
                match event {
                    Some(Ok(watcher::Event::Init)) => {
                        init_seen = Some(Default::default());
                    }
                    Some(Ok(watcher::Event::InitApply(subnet) | watcher::Event::Apply(subnet))) => {
                        let name = subnet.name_any();
                        if let Some(seen) = &mut init_seen {
                            seen.insert(name.clone());
                        }
                        match store.insert(&name, subnet.clone()) {
                            Some(old) => {
                                for event in update_events(&old, &subnet) {
                                    queue.add(event);
                                }
                            }
                            None => {
                                if let Some(event) = add_event(&subnet) {
                                    queue.add(event);
                                }
                            }
                        }
                    }
                    Some(Ok(watcher::Event::InitDone)) => {
                        if let Some(seen) = init_seen.take() {
                            for name in store.keys() {
                                if seen.contains(&name) {
                                    continue;
                                }
                                if let Some(gone) = store.remove(&name) {
                                    if let Some(event) = delete_event(&gone) {
                                        queue.add(event);
                                    }
                                }
                            }
                        }
                    }
                    Some(Ok(watcher::Event::Delete(subnet))) => {
                        store.remove(&subnet.name_any());
                        if let Some(event) = delete_event(&subnet) {
                            queue.add(event);
                        }
                    }
                    Some(Err(e)) => error!("(subnet.watch) watch error: {}", e),
                    None => {
                        return Err(ControllerError::Watch("subnet watch stream ended".to_string()));
                    }
                }
            }
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    info!("(subnet.watch) stopping Subnet watcher");
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

    fn subnet(name: &str, provider: &str, enable_dhcp: bool) -> Subnet {
        let mut subnet = Subnet::new(name, Default::default());
        subnet.spec.provider = Some(provider.to_string()).filter(|p| !p.is_empty());
        subnet.spec.enable_dhcp = enable_dhcp;
        subnet.spec.cidr_block = "10.0.0.0/24".to_string();
        subnet
    }

    fn with_dhcp_provider(mut subnet: Subnet, provider: &str) -> Subnet {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            util::ANNO_DCLOUD_DHCP_PROVIDER.to_string(),
            provider.to_string(),
        );
        subnet.metadata.annotations = Some(annotations);
        subnet
    }

    #[test]
    fn test_add_admits_only_dhcp_enabled_foreign_providers() {
        assert!(add_event(&subnet("s1", "nad1.ns1", true)).is_some());
        assert!(add_event(&subnet("s1", "nad1.ns1", false)).is_none());
        assert!(add_event(&subnet("s1", "", true)).is_none());
        assert!(add_event(&subnet("s1", "ovn", true)).is_none());
        assert!(add_event(&subnet("s1", "cluster.ovn", true)).is_none());
    }

    #[test]
    fn test_annotation_overrides_provider() {
        let s = with_dhcp_provider(subnet("s1", "ovn", true), "nad1.ns1");
        let event = add_event(&s).unwrap();
        assert_eq!(event.provider, "nad1.ns1");
    }

    #[test]
    fn test_update_dhcp_enable_transition() {
        let old = subnet("s1", "nad1.ns1", false);
        let new = subnet("s1", "nad1.ns1", true);
        let events = update_events(&old, &new);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, Operation::Add);
    }

    #[test]
    fn test_update_provider_change_deletes_then_adds() {
        let old = subnet("s1", "nadA.ns", true);
        let new = subnet("s1", "nadB.ns", true);
        let events = update_events(&old, &new);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].operation, Operation::Delete);
        assert_eq!(events[0].provider, "nadA.ns");
        assert_eq!(events[1].operation, Operation::Add);
        // the ADD must carry the new provider
        assert_eq!(events[1].provider, "nadB.ns");
    }

    #[test]
    fn test_update_dhcp_disable_transition() {
        let old = subnet("s1", "nad1.ns1", true);
        let new = subnet("s1", "nad1.ns1", false);
        let events = update_events(&old, &new);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, Operation::Delete);
    }

    #[test]
    fn test_update_option_changes() {
        let old = subnet("s1", "nad1.ns1", true);
        let mut new = subnet("s1", "nad1.ns1", true);
        new.spec.dhcp_v4_options = Some("dns_server={1.1.1.1}".to_string());
        let events = update_events(&old, &new);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, Operation::Update);

        let mut new = subnet("s1", "nad1.ns1", true);
        new.spec.gateway = "10.0.0.254".to_string();
        assert_eq!(update_events(&old, &new)[0].operation, Operation::Update);

        let mut new = subnet("s1", "nad1.ns1", true);
        new.spec.cidr_block = "10.1.0.0/24".to_string();
        assert_eq!(update_events(&old, &new)[0].operation, Operation::Update);
    }

    #[test]
    fn test_update_no_relevant_change() {
        let old = subnet("s1", "nad1.ns1", true);
        let new = subnet("s1", "nad1.ns1", true);
        assert!(update_events(&old, &new).is_empty());
    }

    #[test]
    fn test_delete_event_captures_provider() {
        let s = with_dhcp_provider(subnet("s1", "spec.ns", true), "anno.ns");
        let event = delete_event(&s).unwrap();
        assert_eq!(event.operation, Operation::Delete);
        assert_eq!(event.provider, "anno.ns");

        assert!(delete_event(&subnet("s1", "ovn", true)).is_none());
    }
}
