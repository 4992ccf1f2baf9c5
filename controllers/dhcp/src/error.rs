//! Controller-specific error types.
//!
//! This module defines error types specific to the DHCP controller that
//! are not covered by upstream library errors.

use thiserror::Error;

use crate::cache::CacheError;

/// Errors that can occur in the DHCP controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// DHCP allocator or responder error
    #[error("DHCP error: {0}")]
    Dhcp(#[from] dhcp_server::DhcpError),

    /// Network-state cache error
    #[error("network cache error: {0}")]
    Cache(#[from] CacheError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Annotation or manifest deserialization error
    #[error("deserialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    Reconcile(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registry error
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
