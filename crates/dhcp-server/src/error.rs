//! Error types for the DHCP responders and lease store.

use std::net::SocketAddr;
use thiserror::Error;

/// Error type for DHCP operations
#[derive(Debug, Error)]
pub enum DhcpError {
    /// Failed to bind the responder socket
    #[error("failed to bind to {addr} on nic <{nic}>: {source}")]
    BindFailed {
        addr: SocketAddr,
        nic: String,
        #[source]
        source: std::io::Error,
    },

    /// A responder for this interface already exists
    #[error("DHCP server on nic <{0}> already exists")]
    ResponderExists(String),

    /// Failed to parse an incoming DHCP packet
    #[error("failed to parse DHCP packet: {0}")]
    ParseError(String),

    /// Failed to encode an outgoing DHCP packet
    #[error("failed to encode DHCP packet: {0}")]
    EncodeError(String),

    /// Invalid MAC address format
    #[error("hwaddr <{0}> is not valid")]
    InvalidMac(String),

    /// A required key was empty
    #[error("{0} is empty")]
    EmptyField(&'static str),

    /// No lease state recorded for a workload
    #[error("workload <{0}> not found in lease store")]
    WorkloadNotFound(String),

    /// No responder configuration recorded for a subnet
    #[error("subnet <{0}> is not found")]
    SubnetNotFound(String),

    /// Socket send/receive error
    #[error("socket error: {0}")]
    SocketError(#[from] std::io::Error),
}

/// Result type for DHCP operations
pub type Result<T> = std::result::Result<T, DhcpError>;
