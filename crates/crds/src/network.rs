//! Multus network-status types
//!
//! The JSON shape of the `k8s.v1.cni.cncf.io/network-status` pod annotation
//! and of the startup networks-status-map manifest. Entries describe one
//! attached interface each.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// DNS configuration carried by a network attachment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NetworkDns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// One entry of the network-status annotation: the state of a single
/// attached interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NetworkStatus {
    /// Attachment name in `<namespace>/<attachmentName>` form
    #[serde(default)]
    pub name: String,

    /// Host NIC name the attachment is plumbed to
    #[serde(default)]
    pub interface: String,

    /// Assigned addresses, v4/v6 mixed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,

    /// Interface hardware address
    #[serde(default)]
    pub mac: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    /// Marks the cluster-primary attachment
    #[serde(default)]
    pub default: bool,

    #[serde(default)]
    pub dns: NetworkDns,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateway: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_status_deserialize() {
        // A realistic multus annotation value
        let json = r#"[
            {
                "name": "kube-ovn",
                "interface": "eth0",
                "ips": ["10.16.0.10"],
                "mac": "00:00:00:2E:2F:B8",
                "default": true,
                "dns": {"nameservers": ["10.96.0.10"]},
                "gateway": ["10.16.0.1"]
            },
            {
                "name": "ns1/nad1",
                "interface": "net1",
                "ips": ["10.0.0.42", "fd00::42"],
                "mac": "02:00:00:00:00:01",
                "mtu": 1400,
                "dns": {}
            }
        ]"#;
        let statuses: Vec<NetworkStatus> = serde_json::from_str(json).unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses[0].default);
        assert_eq!(statuses[0].dns.nameservers, vec!["10.96.0.10"]);
        assert_eq!(statuses[1].name, "ns1/nad1");
        assert_eq!(statuses[1].interface, "net1");
        assert_eq!(statuses[1].ips.len(), 2);
        assert_eq!(statuses[1].mtu, Some(1400));
        assert!(!statuses[1].default);
    }

    #[test]
    fn test_network_status_minimal() {
        // Entries without optional fields must still deserialize
        let status: NetworkStatus = serde_json::from_str(r#"{"name": "ovn"}"#).unwrap();
        assert_eq!(status.name, "ovn");
        assert!(status.ips.is_empty());
        assert!(status.gateway.is_empty());
    }
}
