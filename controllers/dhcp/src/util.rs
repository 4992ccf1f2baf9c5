//! Shared helpers: annotation constants, DHCP option parsing, OVN subnet
//! building, protocol classification and key derivation.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crds::{NetworkStatus, Subnet};
use dhcp_server::{v4, v6};
use ipnetwork::IpNetwork;
use mac_address::MacAddress;
use tracing::debug;

use crate::error::ControllerError;

pub const DCLOUD_DOMAIN: &str = "dcloud.tydic.io";

/// Indicates that a pod instance is the leader, which lets the metrics
/// service accurately hit the active endpoint.
pub const LABEL_DCLOUD_LEADER: &str = "network.dcloud.tydic.io/leader";
/// Applied to Subnet annotations to override the DHCP network provider.
pub const ANNO_DCLOUD_DHCP_PROVIDER: &str = "network.dcloud.tydic.io/dhcp-provider";
/// Applied to Service annotations to specify the mapping provider for a
/// LoadBalancer Service.
pub const ANNO_DCLOUD_MAPPING_PROVIDER: &str = "network.dcloud.tydic.io/mapping-provider";

/// The multus per-interface attachment status annotation.
pub const ANNO_NETWORK_STATUS: &str = "k8s.v1.cni.cncf.io/network-status";

/// Startup manifest of the controller pod's own attachments.
pub const NETWORK_STATUS_FILE_PATH: &str = "/etc/net-info/networks-status-map";

/// `<namespace>/<name>` object key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a `<namespace>/<name>` key.
    pub fn parse(key: &str) -> Option<Self> {
        let (namespace, name) = key.split_once('/')?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Address families a subnet CIDR block spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    IPv4,
    IPv6,
    Dual,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::IPv4 => write!(f, "IPv4"),
            Protocol::IPv6 => write!(f, "IPv6"),
            Protocol::Dual => write!(f, "Dual"),
        }
    }
}

/// Classify a CIDR block string ("v4", "v6" or "v4,v6").
pub fn check_protocol(cidr_block: &str) -> Option<Protocol> {
    let mut has_v4 = false;
    let mut has_v6 = false;
    for part in cidr_block.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match IpNetwork::from_str(part) {
            Ok(IpNetwork::V4(_)) => has_v4 = true,
            Ok(IpNetwork::V6(_)) => has_v6 = true,
            Err(_) => return None,
        }
    }
    match (has_v4, has_v6) {
        (true, true) => Some(Protocol::Dual),
        (true, false) => Some(Protocol::IPv4),
        (false, true) => Some(Protocol::IPv6),
        (false, false) => None,
    }
}

pub fn is_ipv4(addr: &str) -> bool {
    addr.parse::<Ipv4Addr>().is_ok()
}

pub fn is_ipv6(addr: &str) -> bool {
    addr.parse::<Ipv6Addr>().is_ok()
}

/// Parse an address that may carry a prefix length suffix.
pub fn parse_ip(addr: &str) -> Option<IpAddr> {
    let bare = addr.split('/').next().unwrap_or(addr);
    bare.parse().ok()
}

pub fn first_ipv4_addr(status: &NetworkStatus) -> Option<Ipv4Addr> {
    status.ips.iter().find_map(|ip| match parse_ip(ip) {
        Some(IpAddr::V4(v4)) => Some(v4),
        _ => None,
    })
}

pub fn first_ipv6_addr(status: &NetworkStatus) -> Option<Ipv6Addr> {
    status.ips.iter().find_map(|ip| match parse_ip(ip) {
        Some(IpAddr::V6(v6)) => Some(v6),
        _ => None,
    })
}

/// Derive the metrics VM key from a launcher pod key: the `virt-launcher-`
/// prefix and the trailing random segment are stripped.
pub fn vm_key_for_pod(pod_key: &NamespacedName) -> String {
    let mut name = pod_key.name.strip_prefix("virt-launcher-").unwrap_or(&pod_key.name);
    if let Some(last_index) = name.rfind('-') {
        if last_index > 0 {
            name = &name[..last_index];
        }
    }
    format!("{}/{}", pod_key.namespace, name)
}

/// Extract DHCP option key/value pairs, supporting `{}`-wrapped values.
///
/// A value may be wrapped in braces and use `;` as an internal separator so
/// nested lists are not split by the outer comma, e.g.
/// `lease_time=3600,router={10.0.0.1;10.0.0.2},dns_server={8.8.8.8}`.
/// Braces are stripped on completion and internal `;` rewritten to `,`.
/// Unrecognized keys are preserved but unused.
pub fn parse_dhcp_options(dhcp_str: &str) -> HashMap<String, String> {
    let mut options = HashMap::new();

    let mut key = String::new();
    let mut value = String::new();
    let mut in_key = false;
    let mut in_value = false;
    let mut depth = 0i32;

    for ch in dhcp_str.chars() {
        if ch == '{' {
            depth += 1;
        } else if ch == '}' {
            depth -= 1;
        }

        if depth == 0 && ch == '=' {
            if in_key {
                key = key.trim().to_string();
                in_key = false;
                in_value = true;
            }
        } else if depth == 0 && ch == ',' {
            if in_value {
                options.insert(key.clone(), value.trim().to_string());
                key.clear();
                value.clear();
                in_value = false;
                in_key = false;
            }
        } else if in_key {
            key.push(ch);
        } else if in_value {
            value.push(ch);
        } else if ch != ' ' {
            in_key = true;
            key.push(ch);
        }
    }
    if in_value {
        options.insert(key, value.trim().to_string());
    }

    options
        .into_iter()
        .map(|(k, mut v)| {
            if v.starts_with('{') && v.ends_with('}') {
                v = v.trim_matches(|c| c == '{' || c == '}').to_string();
            }
            (k, v.replace(';', ","))
        })
        .collect()
}

/// Resolve an NTP entry that may be an address or a DNS name.
async fn resolve_ntp_entry(entry: &str, want_v4: bool) -> Vec<IpAddr> {
    let resolver = match hickory_resolver::TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(e) => {
            debug!("cannot construct resolver for ntp entry <{}>: {}", entry, e);
            return Vec::new();
        }
    };
    match resolver.lookup_ip(entry).await {
        Ok(lookup) => lookup
            .iter()
            .filter(|ip| ip.is_ipv4() == want_v4)
            .collect(),
        Err(e) => {
            debug!("cannot get any ip addresses from ntp domainname entry <{}>: {}", entry, e);
            Vec::new()
        }
    }
}

/// Build the v4 responder configuration from subnet spec + attachment state.
///
/// Recognized options: `lease_time`, `mtu`, `router`, `ntp_server`,
/// `dns_server`. The subnet mask falls back to /24 when the CIDR does not
/// parse; routers fall back to the v4 portion of the subnet gateway.
pub async fn build_v4_subnet(
    subnet: &Subnet,
    network_status: &NetworkStatus,
    options: &HashMap<String, String>,
) -> Result<v4::OvnSubnet, ControllerError> {
    MacAddress::from_str(&network_status.mac).map_err(|e| {
        ControllerError::Reconcile(format!(
            "conversion of multus network <{}> interface <{}> MAC address failed: {}",
            network_status.name, network_status.interface, e
        ))
    })?;
    let server_ip = first_ipv4_addr(network_status).ok_or_else(|| {
        ControllerError::Reconcile(format!(
            "unable to find multus network <{}> interface <{}> IPv4 address",
            network_status.name, network_status.interface
        ))
    })?;

    let mut ovn_subnet = v4::OvnSubnet {
        server_mac: network_status.mac.clone(),
        server_ip,
        ..Default::default()
    };

    ovn_subnet.mtu = subnet.spec.mtu.unwrap_or(0);
    if let Some(mtu) = options.get("mtu").and_then(|v| v.parse::<u32>().ok()) {
        ovn_subnet.mtu = mtu;
    }

    ovn_subnet.lease_time = options
        .get("lease_time")
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|t| *t > 0)
        .unwrap_or(3600);

    let mut routers = Vec::new();
    if let Some(router) = options.get("router") {
        for entry in router.split(',').filter(|s| !s.is_empty()) {
            if let Ok(ip) = entry.parse::<Ipv4Addr>() {
                routers.push(ip);
            }
        }
    }
    // No routers configured, default to the subnet's IPv4 gateway
    if routers.is_empty() {
        let gateway = subnet.spec.gateway.split(',').next().unwrap_or_default();
        if let Ok(ip) = gateway.parse::<Ipv4Addr>() {
            routers.push(ip);
        }
    }
    ovn_subnet.routers = routers;

    let mut ntp = Vec::new();
    if let Some(ntp_server) = options.get("ntp_server") {
        for entry in ntp_server.split(',').filter(|s| !s.is_empty()) {
            if let Ok(ip) = entry.parse::<Ipv4Addr>() {
                ntp.push(ip);
                continue;
            }
            for resolved in resolve_ntp_entry(entry, true).await {
                if let IpAddr::V4(v4) = resolved {
                    ntp.push(v4);
                }
            }
        }
    }
    ovn_subnet.ntp = ntp;

    let ipv4_cidr = subnet.spec.cidr_block.split(',').next().unwrap_or_default();
    ovn_subnet.subnet_mask = match ipv4_cidr.trim().parse::<IpNetwork>() {
        Ok(IpNetwork::V4(net)) => net.mask(),
        _ => Ipv4Addr::new(255, 255, 255, 0),
    };

    let mut dns = Vec::new();
    if let Some(dns_server) = options.get("dns_server") {
        for entry in dns_server.split(',').filter(|s| !s.is_empty()) {
            if let Ok(ip) = entry.parse::<Ipv4Addr>() {
                dns.push(ip);
            }
        }
    }
    ovn_subnet.dns = dns;

    Ok(ovn_subnet)
}

/// Build the v6 responder configuration from attachment state.
///
/// Recognized options: `lease_time`, `ntp_server`, `dns_server` (IPv6 only).
pub async fn build_v6_subnet(
    network_status: &NetworkStatus,
    options: &HashMap<String, String>,
) -> Result<v6::OvnSubnet, ControllerError> {
    MacAddress::from_str(&network_status.mac).map_err(|e| {
        ControllerError::Reconcile(format!(
            "conversion of multus network <{}> interface <{}> MAC address failed: {}",
            network_status.name, network_status.interface, e
        ))
    })?;
    let server_ip = first_ipv6_addr(network_status).ok_or_else(|| {
        ControllerError::Reconcile(format!(
            "unable to find multus network <{}> interface <{}> IPv6 address",
            network_status.name, network_status.interface
        ))
    })?;

    let mut ovn_subnet = v6::OvnSubnet {
        server_mac: network_status.mac.clone(),
        server_ip,
        ..Default::default()
    };

    ovn_subnet.lease_time = options
        .get("lease_time")
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|t| *t > 0)
        .unwrap_or(3600);

    let mut ntp = Vec::new();
    if let Some(ntp_server) = options.get("ntp_server") {
        for entry in ntp_server.split(',').filter(|s| !s.is_empty()) {
            if let Ok(ip) = entry.parse::<Ipv6Addr>() {
                ntp.push(ip);
                continue;
            }
            for resolved in resolve_ntp_entry(entry, false).await {
                if let IpAddr::V6(v6) = resolved {
                    ntp.push(v6);
                }
            }
        }
    }
    ovn_subnet.ntp = ntp;

    let mut dns = Vec::new();
    if let Some(dns_server) = options.get("dns_server") {
        for entry in dns_server.split(',').filter(|s| !s.is_empty()) {
            if let Ok(ip) = entry.parse::<Ipv6Addr>() {
                dns.push(ip);
            }
        }
    }
    ovn_subnet.dns = dns;

    Ok(ovn_subnet)
}

/// Read the platform-provided attachment manifest, polling until it is
/// non-empty (interval 100 ms, timeout 5 s).
pub async fn network_status_from_file(path: &Path) -> Result<Vec<NetworkStatus>, ControllerError> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let contents = loop {
        match tokio::fs::read(path).await {
            Ok(bytes) if !bytes.is_empty() => break bytes,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ControllerError::InvalidConfig(format!(
                    "cannot read network-status map {}: {}",
                    path.display(),
                    e
                )))
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ControllerError::InvalidConfig(format!(
                "timed out waiting for network-status map {}",
                path.display()
            )));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    serde_json::from_slice(&contents).map_err(|e| {
        ControllerError::InvalidConfig(format!("failed to unmarshal network-status map: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dhcp_options() {
        let input = "lease_time=3600,router={10.0.0.1,10.0.0.2},server_id=169.254.0.254,\
                     server_mac=00:00:00:2E:2F:B8,classless_static_route={30.0.0.0/24,10.0.0.10,0.0.0.0/0,10.0.0.1}";
        let options = parse_dhcp_options(input);
        assert_eq!(options.get("lease_time").unwrap(), "3600");
        assert_eq!(options.get("router").unwrap(), "10.0.0.1,10.0.0.2");
        assert_eq!(options.get("server_id").unwrap(), "169.254.0.254");
        assert_eq!(options.get("server_mac").unwrap(), "00:00:00:2E:2F:B8");
        assert_eq!(
            options.get("classless_static_route").unwrap(),
            "30.0.0.0/24,10.0.0.10,0.0.0.0/0,10.0.0.1"
        );
    }

    #[test]
    fn test_parse_dhcp_options_semicolon_separator() {
        let input = "lease_time=3600,router={10.0.0.1;10.0.0.2},\
                     classless_static_route={30.0.0.0/24;10.0.0.10;0.0.0.0/0;10.0.0.1}";
        let options = parse_dhcp_options(input);
        assert_eq!(options.get("router").unwrap(), "10.0.0.1,10.0.0.2");
        assert_eq!(
            options.get("classless_static_route").unwrap(),
            "30.0.0.0/24,10.0.0.10,0.0.0.0/0,10.0.0.1"
        );
    }

    #[test]
    fn test_parse_dhcp_options_round_trip_law() {
        let options = parse_dhcp_options("a=1,b={x;y;z},c=foo");
        assert_eq!(options.get("a").unwrap(), "1");
        assert_eq!(options.get("b").unwrap(), "x,y,z");
        assert_eq!(options.get("c").unwrap(), "foo");
    }

    #[test]
    fn test_check_protocol() {
        assert_eq!(check_protocol("10.0.0.0/24"), Some(Protocol::IPv4));
        assert_eq!(check_protocol("fd00::/64"), Some(Protocol::IPv6));
        assert_eq!(check_protocol("10.0.0.0/24,fd00::/64"), Some(Protocol::Dual));
        assert_eq!(check_protocol(""), None);
        assert_eq!(check_protocol("not-a-cidr"), None);
    }

    #[test]
    fn test_is_ipv6() {
        for dns in [
            "2402:4e00::",
            "2400:3200::1",
            "2400:3200:baba::1",
            "2400:da00::6666",
            "2a09::",
            "2a11::",
            "240C::6666",
            "240C::6644",
            "2001:4860:4860::8888",
            "2001:4860:4860::8844",
        ] {
            assert!(is_ipv6(dns), "{} should be IPv6", dns);
            assert!(!is_ipv4(dns), "{} should not be IPv4", dns);
        }
    }

    #[test]
    fn test_first_addr_pickers() {
        let status = NetworkStatus {
            name: "ns1/nad1".to_string(),
            ips: vec!["fd00::42".to_string(), "10.0.0.42".to_string()],
            ..Default::default()
        };
        assert_eq!(first_ipv4_addr(&status), Some(Ipv4Addr::new(10, 0, 0, 42)));
        assert_eq!(first_ipv6_addr(&status), "fd00::42".parse().ok());
    }

    #[test]
    fn test_vm_key_for_pod() {
        let key = NamespacedName::new("ns2", "virt-launcher-myvm-x7k2p");
        assert_eq!(vm_key_for_pod(&key), "ns2/myvm");

        // Names without the prefix only lose the trailing segment
        let key = NamespacedName::new("ns2", "plain-pod");
        assert_eq!(vm_key_for_pod(&key), "ns2/plain");
    }

    #[test]
    fn test_namespaced_name_parse() {
        let key = NamespacedName::parse("ns1/nad1").unwrap();
        assert_eq!(key.namespace, "ns1");
        assert_eq!(key.name, "nad1");
        assert!(NamespacedName::parse("no-slash").is_none());
        assert!(NamespacedName::parse("/missing").is_none());
    }

    #[tokio::test]
    async fn test_build_v4_subnet() {
        let mut subnet = Subnet::new("s1", Default::default());
        subnet.spec.cidr_block = "10.0.0.0/24".to_string();
        subnet.spec.gateway = "10.0.0.1".to_string();
        subnet.spec.mtu = Some(1500);
        let status = NetworkStatus {
            name: "ns1/nad1".to_string(),
            interface: "net1".to_string(),
            mac: "00:00:00:2e:2f:b8".to_string(),
            ips: vec!["192.168.2.10".to_string()],
            ..Default::default()
        };
        let options = parse_dhcp_options("lease_time=7200,dns_server={8.8.8.8;8.8.4.4},mtu=1400");

        let ovn = build_v4_subnet(&subnet, &status, &options).await.unwrap();
        assert_eq!(ovn.server_ip, Ipv4Addr::new(192, 168, 2, 10));
        assert_eq!(ovn.server_mac, "00:00:00:2e:2f:b8");
        assert_eq!(ovn.lease_time, 7200);
        assert_eq!(ovn.mtu, 1400);
        assert_eq!(ovn.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));
        // Router defaulted from the subnet gateway
        assert_eq!(ovn.routers, vec![Ipv4Addr::new(10, 0, 0, 1)]);
        assert_eq!(
            ovn.dns,
            vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)]
        );
    }

    #[tokio::test]
    async fn test_build_v4_subnet_defaults() {
        let mut subnet = Subnet::new("s1", Default::default());
        subnet.spec.cidr_block = "garbage".to_string();
        let status = NetworkStatus {
            name: "ns1/nad1".to_string(),
            interface: "net1".to_string(),
            mac: "00:00:00:2e:2f:b8".to_string(),
            ips: vec!["192.168.2.10".to_string()],
            ..Default::default()
        };
        let ovn = build_v4_subnet(&subnet, &status, &HashMap::new()).await.unwrap();
        assert_eq!(ovn.lease_time, 3600);
        // Unparsable CIDR falls back to /24
        assert_eq!(ovn.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));
        assert!(ovn.routers.is_empty());
    }

    #[tokio::test]
    async fn test_build_v4_subnet_requires_mac_and_ip() {
        let subnet = Subnet::new("s1", Default::default());
        let status = NetworkStatus {
            name: "ns1/nad1".to_string(),
            interface: "net1".to_string(),
            mac: "not-a-mac".to_string(),
            ips: vec!["192.168.2.10".to_string()],
            ..Default::default()
        };
        assert!(build_v4_subnet(&subnet, &status, &HashMap::new()).await.is_err());

        let status = NetworkStatus {
            mac: "00:00:00:2e:2f:b8".to_string(),
            ips: vec!["fd00::1".to_string()],
            ..Default::default()
        };
        assert!(build_v4_subnet(&subnet, &status, &HashMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_build_v6_subnet() {
        let status = NetworkStatus {
            name: "ns1/nad1".to_string(),
            interface: "net1".to_string(),
            mac: "00:00:00:2e:2f:b8".to_string(),
            ips: vec!["10.0.0.5".to_string(), "fd00::5".to_string()],
            ..Default::default()
        };
        let options = parse_dhcp_options("lease_time=600,dns_server={2001:4860:4860::8888}");
        let ovn = build_v6_subnet(&status, &options).await.unwrap();
        assert_eq!(ovn.server_ip, "fd00::5".parse::<Ipv6Addr>().unwrap());
        assert_eq!(ovn.lease_time, 600);
        assert_eq!(ovn.dns.len(), 1);
        assert!(ovn.ntp.is_empty());
    }

    #[tokio::test]
    async fn test_network_status_from_file() {
        let dir = std::env::temp_dir().join("dhcp-controller-test");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("networks-status-map");
        tokio::fs::write(
            &path,
            r#"[{"name": "default/net1", "interface": "net1", "ips": ["10.0.0.5"], "mac": "00:00:00:2e:2f:b8", "default": true}]"#,
        )
        .await
        .unwrap();

        let statuses = network_status_from_file(&path).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].name, "default/net1");
        tokio::fs::remove_file(&path).await.unwrap();
    }
}
