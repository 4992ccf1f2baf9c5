//! Subnet controller.
//!
//! Reconciles subnet declarations into per-subnet responder configuration
//! and responder lifecycle. Exposes a small client interface to the pod
//! and service controllers.

pub mod controller;
mod reconciler;
pub mod watcher;

pub use controller::SubnetController;

use async_trait::async_trait;
use crds::Subnet;

use crate::error::ControllerError;
use crate::worker::EventKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Add,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Add => write!(f, "add"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// A queued subnet change, carrying the provider observed at filter time so
/// deletions still know which responder they owned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    pub name: String,
    pub provider: String,
    pub operation: Operation,
}

impl EventKey for Event {
    fn key_string(&self) -> String {
        self.name.clone()
    }
}

/// The subnet-facing capability interface handed to the pod and service
/// controllers. Wiring is explicit; nothing else of the subnet controller
/// is reachable from them.
#[async_trait]
pub trait SubnetClient: Send + Sync {
    /// Subnets whose effective DHCP provider equals `provider`.
    fn subnets_by_dhcp_provider(&self, provider: &str) -> Vec<Subnet>;

    /// Subnets whose `spec.provider` equals `provider`.
    fn subnets_by_spec_provider(&self, provider: &str) -> Vec<Subnet>;

    /// Tear down the responder state a provider held for a subnet.
    async fn delete_network_provider(
        &self,
        subnet_name: &str,
        subnet: Option<&Subnet>,
        provider: &str,
    ) -> Result<(), ControllerError>;

    /// Trigger a re-reconciliation of a subnet.
    fn enqueue(&self, event: Event);
}
