//! Pod controller.
//!
//! Watches VM launcher pods and programs their v4/v6 leases from the
//! network-status annotation.

pub mod controller;
mod reconciler;
pub mod watcher;

pub use controller::PodController;

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
    pub operation: Operation,
}

impl EventKey for Event {
    fn key_string(&self) -> String {
        self.key.to_string()
    }
}
