//! Service controller.
//!
//! Watches LoadBalancer services in the controller's own namespace and
//! materializes synthetic network attachments from their ingress
//! addresses, fanning changes out to the subnets bound to the mapped
//! provider.

pub mod controller;
mod reconciler;
pub mod watcher;

pub use controller::ServiceController;

use crate::util::NamespacedName;
use crate::worker::EventKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    pub key: NamespacedName,
    pub provider: String,
    pub operation: Operation,
}

impl EventKey for Event {
    fn key_string(&self) -> String {
        self.key.to_string()
    }
}
