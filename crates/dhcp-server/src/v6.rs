//! DHCPv6 allocator and responder.
//!
//! Same shape as the v4 side: a subnet table, a lease store and per-NIC
//! responders. The client hardware address is recovered from the DUID in
//! the client identifier option. SOLICIT is answered with ADVERTISE
//! (REPLY under Rapid Commit); every other supported message gets a REPLY
//! carrying an IA_NA that echoes the client's IAID.

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use dhcproto::v6::{
    DhcpOption, DhcpOptions, IAAddr, Message, MessageType, OptionCode, IANA,
};
use dhcproto::{Decodable, Encodable};
use mac_address::MacAddress;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{DhcpError, Result};
use crate::socket;
use crate::store::{Lease, LeaseStore};

/// DHCPv6 NTP server option (RFC 5908).
const OPTION_NTP_SERVER: u16 = 56;
/// NTP suboption carrying a server address.
const NTP_SUBOPTION_SRV_ADDR: u16 = 1;

/// Seconds between the Unix epoch and 2000-01-01, the DUID time base.
const DUID_TIME_EPOCH: u64 = 946_684_800;

/// Per-subnet responder configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvnSubnet {
    pub server_mac: String,
    pub server_ip: Ipv6Addr,
    pub ntp: Vec<Ipv6Addr>,
    pub dns: Vec<Ipv6Addr>,
    /// Lease seconds, default 3600
    pub lease_time: u32,
}

impl Default for OvnSubnet {
    fn default() -> Self {
        Self {
            server_mac: String::new(),
            server_ip: Ipv6Addr::UNSPECIFIED,
            ntp: Vec::new(),
            dns: Vec::new(),
            lease_time: 3600,
        }
    }
}

struct ResponderHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// DHCPv6 state: subnet table, lease store and running responders.
pub struct DhcpV6Allocator {
    subnets: RwLock<HashMap<String, OvnSubnet>>,
    store: RwLock<LeaseStore>,
    servers: Mutex<HashMap<String, ResponderHandle>>,
    shutdown: watch::Receiver<bool>,
}

impl DhcpV6Allocator {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            subnets: RwLock::new(HashMap::new()),
            store: RwLock::new(LeaseStore::new()),
            servers: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn get_subnet(&self, subnet_key: &str) -> Option<OvnSubnet> {
        self.subnets.read().unwrap().get(subnet_key).cloned()
    }

    pub fn add_or_update_subnet(&self, subnet_key: &str, subnet: OvnSubnet) {
        let mut subnets = self.subnets.write().unwrap();
        if subnets.insert(subnet_key.to_string(), subnet).is_some() {
            debug!("(dhcpv6) subnet <{}> updated", subnet_key);
        } else {
            debug!("(dhcpv6) subnet <{}> added", subnet_key);
        }
    }

    pub fn delete_subnet(&self, subnet_key: &str) -> Result<()> {
        if subnet_key.is_empty() {
            return Err(DhcpError::EmptyField("subnet key"));
        }
        let mut subnets = self.subnets.write().unwrap();
        if subnets.remove(subnet_key).is_some() {
            debug!("(dhcpv6) subnet <{}> deleted", subnet_key);
            Ok(())
        } else {
            debug!("(dhcpv6) subnet <{}> is not found", subnet_key);
            Err(DhcpError::SubnetNotFound(subnet_key.to_string()))
        }
    }

    pub fn get_lease(&self, hwaddr: &str) -> Option<Lease> {
        self.store.read().unwrap().lookup(hwaddr)
    }

    pub fn has_lease(&self, hwaddr: &str, workload_key: &str, lease: &Lease) -> bool {
        self.store.read().unwrap().has(hwaddr, workload_key, lease)
    }

    pub fn add_lease(&self, hwaddr: &str, workload_key: &str, lease: Lease) -> Result<()> {
        self.store.write().unwrap().upsert(hwaddr, workload_key, lease)
    }

    pub fn workload_macs(&self, workload_key: &str) -> Option<Vec<String>> {
        self.store.read().unwrap().macs_for(workload_key)
    }

    pub fn subnet_workloads(&self, subnet_key: &str) -> Option<Vec<String>> {
        self.store.read().unwrap().workloads_for(subnet_key)
    }

    pub fn delete_workload_leases(&self, workload_key: &str) -> Result<Vec<String>> {
        self.store.write().unwrap().delete_by_workload(workload_key)
    }

    pub fn has_server(&self, nic: &str) -> bool {
        self.servers.lock().unwrap().contains_key(nic)
    }

    /// Bind a responder to `nic` and start serving. Fails if one already
    /// exists for the interface or the bind fails.
    pub fn add_and_run(self: &Arc<Self>, nic: &str) -> Result<()> {
        let mut servers = self.servers.lock().unwrap();

        info!("(dhcpv6) starting DHCP service on nic <{}>", nic);

        if servers.contains_key(nic) {
            return Err(DhcpError::ResponderExists(nic.to_string()));
        }

        let udp = socket::bind_v6(nic)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let allocator = Arc::clone(self);
        let nic_owned = nic.to_string();
        let parent = self.shutdown.clone();
        let task = tokio::spawn(async move {
            allocator.serve(udp, nic_owned, parent, stop_rx).await;
        });

        servers.insert(
            nic.to_string(),
            ResponderHandle { stop: stop_tx, task },
        );

        debug!("(dhcpv6) DHCP server on nic <{}> has started", nic);
        Ok(())
    }

    /// Stop the responder on `nic`. Idempotent on "not running".
    pub fn del_and_stop(&self, nic: &str) -> Result<()> {
        let mut servers = self.servers.lock().unwrap();

        info!("(dhcpv6) stopping DHCP service on nic <{}>", nic);

        let Some(handle) = servers.remove(nic) else {
            warn!("(dhcpv6) DHCP server on nic <{}> not found", nic);
            return Ok(());
        };
        let _ = handle.stop.send(true);
        handle.task.abort();

        debug!("(dhcpv6) DHCP server on nic <{}> has stopped", nic);
        Ok(())
    }

    async fn serve(
        self: Arc<Self>,
        udp: UdpSocket,
        nic: String,
        mut parent: watch::Receiver<bool>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut buf = [0u8; 1500];
        loop {
            tokio::select! {
                result = udp.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer)) => self.handle_packet(&udp, &buf[..len], peer).await,
                        Err(e) => error!("(dhcpv6) error receiving packet on nic <{}>: {}", nic, e),
                    }
                }
                result = parent.changed() => {
                    if result.is_err() || *parent.borrow() {
                        info!("(dhcpv6) shutdown, closing DHCP server on nic <{}>", nic);
                        break;
                    }
                }
                result = stop.changed() => {
                    if result.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_packet(&self, udp: &UdpSocket, data: &[u8], peer: SocketAddr) {
        let msg = match Message::from_bytes(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("(dhcpv6) failed to parse packet: {}", e);
                return;
            }
        };

        let Some(hwaddr) = extract_mac(&msg) else {
            debug!("(dhcpv6) cannot extract hwaddr from client identifier");
            return;
        };

        let Some(lease) = self.get_lease(&hwaddr) else {
            warn!("(dhcpv6) no lease found: hwaddr={}", hwaddr);
            return;
        };
        let Some(subnet) = self.get_subnet(&lease.subnet_key) else {
            warn!("(dhcpv6) no matched subnet found for lease: hwaddr={}", hwaddr);
            return;
        };
        let std::net::IpAddr::V6(client_ip) = lease.client_ip else {
            warn!("(dhcpv6) lease for hwaddr={} is not IPv6", hwaddr);
            return;
        };

        debug!(
            "(dhcpv6) lease found: hwaddr={}, serverip={}, serverid={}, clientip={}, ntp={:?}, dns={:?}, leasetime={}",
            hwaddr,
            subnet.server_ip,
            subnet.server_mac,
            client_ip,
            subnet.ntp,
            subnet.dns,
            subnet.lease_time,
        );

        let Some(reply) = build_reply(&msg, client_ip, &subnet) else {
            warn!("(dhcpv6) failure building response for hwaddr [{}]", hwaddr);
            return;
        };

        let bytes = match reply.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("(dhcpv6) failed to encode reply: {}", e);
                return;
            }
        };

        if let Err(e) = udp.send_to(&bytes, peer).await {
            error!("(dhcpv6) failure sending response: {}", e);
        }
    }
}

/// Recover the client MAC from the DUID carried in the client identifier.
/// Supports DUID-LLT and DUID-LL with Ethernet hardware type.
pub fn extract_mac(msg: &Message) -> Option<String> {
    let duid = msg.opts().get(OptionCode::ClientId).and_then(|opt| {
        if let DhcpOption::ClientId(duid) = opt {
            Some(duid.as_slice())
        } else {
            None
        }
    })?;
    mac_from_duid(duid)
}

fn mac_from_duid(duid: &[u8]) -> Option<String> {
    if duid.len() < 4 {
        return None;
    }
    let duid_type = u16::from_be_bytes([duid[0], duid[1]]);
    let hw_type = u16::from_be_bytes([duid[2], duid[3]]);
    if hw_type != 1 {
        return None;
    }
    let mac = match duid_type {
        // DUID-LLT: type(2) hwtype(2) time(4) addr(6)
        1 if duid.len() >= 14 => &duid[8..14],
        // DUID-LL: type(2) hwtype(2) addr(6)
        3 if duid.len() >= 10 => &duid[4..10],
        _ => return None,
    };
    Some(
        mac.iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

/// DUID-LLT for the server identifier: Ethernet hardware type plus the
/// server MAC, timestamped in the DUID epoch.
fn duid_llt(mac: &MacAddress) -> Vec<u8> {
    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().saturating_sub(DUID_TIME_EPOCH) as u32)
        .unwrap_or(0);
    let mut duid = Vec::with_capacity(14);
    duid.extend_from_slice(&1u16.to_be_bytes());
    duid.extend_from_slice(&1u16.to_be_bytes());
    duid.extend_from_slice(&time.to_be_bytes());
    duid.extend_from_slice(&mac.bytes());
    duid
}

/// RFC 5908 NTP option payload with a single server-address suboption.
fn ntp_option_bytes(addr: Ipv6Addr) -> Vec<u8> {
    let mut data = Vec::with_capacity(20);
    data.extend_from_slice(&NTP_SUBOPTION_SRV_ADDR.to_be_bytes());
    data.extend_from_slice(&16u16.to_be_bytes());
    data.extend_from_slice(&addr.octets());
    data
}

/// Assemble the ADVERTISE/REPLY for a client message. Returns `None` when
/// the message carries no usable client identifier or the subnet's server
/// MAC does not parse.
pub fn build_reply(msg: &Message, client_ip: Ipv6Addr, subnet: &OvnSubnet) -> Option<Message> {
    let client_id = msg.opts().get(OptionCode::ClientId).and_then(|opt| {
        if let DhcpOption::ClientId(duid) = opt {
            Some(duid.clone())
        } else {
            None
        }
    })?;
    let server_mac = MacAddress::from_str(&subnet.server_mac).ok()?;

    let rapid_commit = msg.opts().get(OptionCode::RapidCommit).is_some();
    let reply_type = match msg.msg_type() {
        MessageType::Solicit if !rapid_commit => MessageType::Advertise,
        _ => MessageType::Reply,
    };

    let mut reply = Message::new_with_id(reply_type, msg.xid());
    reply.opts_mut().insert(DhcpOption::ClientId(client_id));
    reply
        .opts_mut()
        .insert(DhcpOption::ServerId(duid_llt(&server_mac)));

    // Echo the client's IAID so it can match the answer to its request.
    let iaid = msg
        .opts()
        .get(OptionCode::IANA)
        .and_then(|opt| {
            if let DhcpOption::IANA(iana) = opt {
                Some(iana.id)
            } else {
                None
            }
        })
        .unwrap_or(0);

    let mut ia_opts = DhcpOptions::new();
    ia_opts.insert(DhcpOption::IAAddr(IAAddr {
        addr: client_ip,
        preferred_life: subnet.lease_time,
        valid_life: subnet.lease_time,
        opts: DhcpOptions::new(),
    }));
    reply.opts_mut().insert(DhcpOption::IANA(IANA {
        id: iaid,
        t1: 0,
        t2: 0,
        opts: ia_opts,
    }));

    if !subnet.dns.is_empty() {
        reply
            .opts_mut()
            .insert(DhcpOption::DomainNameServers(subnet.dns.clone()));
    }
    if let Some(ntp) = subnet.ntp.first() {
        reply.opts_mut().insert(DhcpOption::Unknown(
            dhcproto::v6::UnknownOption::new(OptionCode::from(OPTION_NTP_SERVER), ntp_option_bytes(*ntp)),
        ));
    }
    if rapid_commit && msg.msg_type() == MessageType::Solicit {
        reply.opts_mut().insert(DhcpOption::RapidCommit);
    }

    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_subnet() -> OvnSubnet {
        OvnSubnet {
            server_mac: "00:00:00:2e:2f:b8".to_string(),
            server_ip: "fd00::1".parse().unwrap(),
            ntp: vec!["fd00::123".parse().unwrap()],
            dns: vec!["2001:4860:4860::8888".parse().unwrap()],
            lease_time: 7200,
        }
    }

    fn client_duid_llt(mac: [u8; 6]) -> Vec<u8> {
        let mut duid = vec![0, 1, 0, 1, 0x2a, 0x2b, 0x2c, 0x2d];
        duid.extend_from_slice(&mac);
        duid
    }

    fn solicit(rapid_commit: bool) -> Message {
        let mut msg = Message::new_with_id(MessageType::Solicit, [0x11, 0x22, 0x33]);
        msg.opts_mut().insert(DhcpOption::ClientId(client_duid_llt([
            0x02, 0x00, 0x00, 0x00, 0x00, 0x01,
        ])));
        let mut ia_opts = DhcpOptions::new();
        ia_opts.insert(DhcpOption::IAAddr(IAAddr {
            addr: Ipv6Addr::UNSPECIFIED,
            preferred_life: 0,
            valid_life: 0,
            opts: DhcpOptions::new(),
        }));
        msg.opts_mut().insert(DhcpOption::IANA(IANA {
            id: 0xdeadbeef,
            t1: 0,
            t2: 0,
            opts: ia_opts,
        }));
        if rapid_commit {
            msg.opts_mut().insert(DhcpOption::RapidCommit);
        }
        msg
    }

    #[test]
    fn test_extract_mac_from_llt() {
        let msg = solicit(false);
        assert_eq!(extract_mac(&msg).as_deref(), Some("02:00:00:00:00:01"));
    }

    #[test]
    fn test_extract_mac_from_ll() {
        let mut msg = Message::new_with_id(MessageType::Solicit, [0, 0, 1]);
        msg.opts_mut().insert(DhcpOption::ClientId(vec![
            0, 3, 0, 1, 0x02, 0x00, 0x00, 0x00, 0x00, 0x02,
        ]));
        assert_eq!(extract_mac(&msg).as_deref(), Some("02:00:00:00:00:02"));
    }

    #[test]
    fn test_extract_mac_rejects_non_ethernet() {
        let mut msg = Message::new_with_id(MessageType::Solicit, [0, 0, 1]);
        // hardware type 6 (IEEE 802) is not handled
        msg.opts_mut().insert(DhcpOption::ClientId(vec![
            0, 3, 0, 6, 0x02, 0x00, 0x00, 0x00, 0x00, 0x02,
        ]));
        assert!(extract_mac(&msg).is_none());
    }

    #[test]
    fn test_solicit_yields_advertise() {
        let msg = solicit(false);
        let client_ip: Ipv6Addr = "fd00::42".parse().unwrap();
        let reply = build_reply(&msg, client_ip, &test_subnet()).unwrap();

        assert_eq!(reply.msg_type(), MessageType::Advertise);
        assert_eq!(reply.xid(), msg.xid());

        // IAID echoed, address carries preferred = valid = lease time
        let Some(DhcpOption::IANA(iana)) = reply.opts().get(OptionCode::IANA) else {
            panic!("missing IA_NA");
        };
        assert_eq!(iana.id, 0xdeadbeef);
        let Some(DhcpOption::IAAddr(addr)) = iana.opts.get(OptionCode::IAAddr) else {
            panic!("missing IA address");
        };
        assert_eq!(addr.addr, client_ip);
        assert_eq!(addr.preferred_life, 7200);
        assert_eq!(addr.valid_life, 7200);
    }

    #[test]
    fn test_solicit_rapid_commit_yields_reply() {
        let msg = solicit(true);
        let reply = build_reply(&msg, "fd00::42".parse().unwrap(), &test_subnet()).unwrap();
        assert_eq!(reply.msg_type(), MessageType::Reply);
        assert!(reply.opts().get(OptionCode::RapidCommit).is_some());
    }

    #[test]
    fn test_request_yields_reply() {
        let mut msg = solicit(false);
        msg.set_msg_type(MessageType::Request);
        let reply = build_reply(&msg, "fd00::42".parse().unwrap(), &test_subnet()).unwrap();
        assert_eq!(reply.msg_type(), MessageType::Reply);
    }

    #[test]
    fn test_server_id_is_duid_llt_with_server_mac() {
        let msg = solicit(false);
        let reply = build_reply(&msg, "fd00::42".parse().unwrap(), &test_subnet()).unwrap();
        let Some(DhcpOption::ServerId(duid)) = reply.opts().get(OptionCode::ServerId) else {
            panic!("missing server identifier");
        };
        assert_eq!(&duid[0..2], &[0, 1]);
        assert_eq!(&duid[2..4], &[0, 1]);
        assert_eq!(&duid[8..14], &[0x00, 0x00, 0x00, 0x2e, 0x2f, 0xb8]);
    }

    #[test]
    fn test_dns_option_emitted() {
        let msg = solicit(false);
        let reply = build_reply(&msg, "fd00::42".parse().unwrap(), &test_subnet()).unwrap();
        let Some(DhcpOption::DomainNameServers(dns)) =
            reply.opts().get(OptionCode::DomainNameServers)
        else {
            panic!("missing DNS servers");
        };
        assert_eq!(dns.len(), 1);
    }

    #[test]
    fn test_missing_client_id_dropped() {
        let msg = Message::new_with_id(MessageType::Solicit, [0, 0, 1]);
        assert!(build_reply(&msg, "fd00::42".parse().unwrap(), &test_subnet()).is_none());
    }

    #[test]
    fn test_ntp_option_bytes() {
        let addr: Ipv6Addr = "fd00::123".parse().unwrap();
        let data = ntp_option_bytes(addr);
        assert_eq!(&data[0..2], &[0, 1]);
        assert_eq!(&data[2..4], &[0, 16]);
        assert_eq!(&data[4..], &addr.octets());
    }
}
