//! Subnet CRD
//!
//! The kube-ovn Subnet resource, reduced to the fields this controller
//! reads. Subnets are cluster-scoped; the controller never writes them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kubeovn.io",
    version = "v1",
    kind = "Subnet",
    status = "SubnetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// Marks the cluster default subnet
    #[serde(default)]
    pub default: bool,

    /// Owning VPC (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<String>,

    /// Protocol hint (IPv4, IPv6 or Dual); the CIDR block is authoritative
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Namespaces bound to this subnet
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,

    /// CIDR block, "v4", "v6" or "v4,v6"
    #[serde(default)]
    pub cidr_block: String,

    /// Gateway address(es), same ordering as the CIDR block
    #[serde(default)]
    pub gateway: String,

    /// Addresses excluded from allocation (informational)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_ips: Vec<String>,

    /// Network provider in `<attachmentName>.<attachmentNamespace>` form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Interface MTU handed to clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    /// Whether DHCP responders should serve this subnet
    #[serde(default, rename = "enableDHCP")]
    pub enable_dhcp: bool,

    /// Free-form DHCPv4 option string, e.g.
    /// `lease_time=3600,router={10.0.0.1;10.0.0.2},dns_server={8.8.8.8}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp_v4_options: Option<String>,

    /// Free-form DHCPv6 option string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp_v6_options: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetStatus {
    /// Latest observed conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<SubnetCondition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition, one of True, False, Unknown
    pub status: String,

    /// The reason for the condition's last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// A human readable message indicating details about the transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Subnet {
    /// Effective DHCP provider: the `dhcp-provider` annotation wins over
    /// `spec.provider` when present.
    pub fn dhcp_provider(&self, annotation: &str) -> String {
        if let Some(annotations) = &self.metadata.annotations {
            if let Some(val) = annotations.get(annotation) {
                return val.clone();
            }
        }
        self.spec.provider.clone().unwrap_or_default()
    }

    /// The `spec.provider` value, empty string when unset.
    pub fn spec_provider(&self) -> String {
        self.spec.provider.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_spec_deserialize() {
        let json = serde_json::json!({
            "cidrBlock": "10.0.0.0/24",
            "gateway": "10.0.0.1",
            "provider": "nad1.ns1",
            "enableDHCP": true,
            "dhcpV4Options": "lease_time=7200",
            "mtu": 1400
        });
        let spec: SubnetSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.cidr_block, "10.0.0.0/24");
        assert_eq!(spec.gateway, "10.0.0.1");
        assert_eq!(spec.provider.as_deref(), Some("nad1.ns1"));
        assert!(spec.enable_dhcp);
        assert_eq!(spec.dhcp_v4_options.as_deref(), Some("lease_time=7200"));
        assert_eq!(spec.mtu, Some(1400));
        assert!(!spec.default);
    }

    #[test]
    fn test_subnet_spec_defaults() {
        let spec: SubnetSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(!spec.enable_dhcp);
        assert!(spec.provider.is_none());
        assert_eq!(spec.cidr_block, "");
    }
}
