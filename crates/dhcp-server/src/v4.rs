//! DHCPv4 allocator and responder.
//!
//! The allocator owns the per-subnet responder configuration, the v4 lease
//! store and the running responders keyed by NIC. Responders answer
//! DISCOVER with OFFER and REQUEST with ACK, entirely out of programmed
//! state; a MAC without a lease is dropped so the client retries against
//! whichever server does know it.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};

use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Encodable};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{DhcpError, Result};
use crate::socket;
use crate::store::{Lease, LeaseStore};

/// Per-subnet responder configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvnSubnet {
    /// Server hardware address (the attachment NIC's MAC)
    pub server_mac: String,
    /// Server address, used as siaddr and option 54
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    /// Interface MTU, emitted only when > 0 and requested by the client
    pub mtu: u32,
    pub routers: Vec<Ipv4Addr>,
    pub ntp: Vec<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    /// Lease seconds, default 3600
    pub lease_time: u32,
}

impl Default for OvnSubnet {
    fn default() -> Self {
        Self {
            server_mac: String::new(),
            server_ip: Ipv4Addr::UNSPECIFIED,
            subnet_mask: Ipv4Addr::UNSPECIFIED,
            mtu: 0,
            routers: Vec::new(),
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

/// DHCPv4 state: subnet table, lease store and running responders.
pub struct DhcpV4Allocator {
    subnets: RwLock<HashMap<String, OvnSubnet>>,
    store: RwLock<LeaseStore>,
    servers: Mutex<HashMap<String, ResponderHandle>>,
    shutdown: watch::Receiver<bool>,
}

impl DhcpV4Allocator {
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
            debug!("(dhcpv4) subnet <{}> updated", subnet_key);
        } else {
            debug!("(dhcpv4) subnet <{}> added", subnet_key);
        }
    }

    pub fn delete_subnet(&self, subnet_key: &str) -> Result<()> {
        if subnet_key.is_empty() {
            return Err(DhcpError::EmptyField("subnet key"));
        }
        let mut subnets = self.subnets.write().unwrap();
        if subnets.remove(subnet_key).is_some() {
            debug!("(dhcpv4) subnet <{}> deleted", subnet_key);
            Ok(())
        } else {
            debug!("(dhcpv4) subnet <{}> is not found", subnet_key);
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

        info!("(dhcpv4) starting DHCP service on nic <{}>", nic);

        if servers.contains_key(nic) {
            return Err(DhcpError::ResponderExists(nic.to_string()));
        }

        let udp = socket::bind_v4(nic)?;
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

        debug!("(dhcpv4) DHCP server on nic <{}> has started", nic);
        Ok(())
    }

    /// Stop the responder on `nic`. Idempotent on "not running".
    pub fn del_and_stop(&self, nic: &str) -> Result<()> {
        let mut servers = self.servers.lock().unwrap();

        info!("(dhcpv4) stopping DHCP service on nic <{}>", nic);

        let Some(handle) = servers.remove(nic) else {
            warn!("(dhcpv4) DHCP server on nic <{}> not found", nic);
            return Ok(());
        };
        let _ = handle.stop.send(true);
        handle.task.abort();

        debug!("(dhcpv4) DHCP server on nic <{}> has stopped", nic);
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
                        Err(e) => error!("(dhcpv4) error receiving packet on nic <{}>: {}", nic, e),
                    }
                }
                result = parent.changed() => {
                    if result.is_err() || *parent.borrow() {
                        info!("(dhcpv4) shutdown, closing DHCP server on nic <{}>", nic);
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

    /// Per-packet errors are logged and absorbed; the responder never
    /// terminates on a bad or unknown packet.
    async fn handle_packet(&self, udp: &UdpSocket, data: &[u8], peer: SocketAddr) {
        let msg = match Message::from_bytes(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("(dhcpv4) failed to parse packet: {}", e);
                return;
            }
        };

        if msg.opcode() != Opcode::BootRequest {
            debug!("(dhcpv4) not a BootRequest, dropped");
            return;
        }

        let hwaddr = chaddr_string(&msg);

        let Some(lease) = self.get_lease(&hwaddr) else {
            warn!("(dhcpv4) no lease found: hwaddr={}", hwaddr);
            return;
        };
        let Some(subnet) = self.get_subnet(&lease.subnet_key) else {
            warn!("(dhcpv4) no matched subnet found for lease: hwaddr={}", hwaddr);
            return;
        };
        let std::net::IpAddr::V4(client_ip) = lease.client_ip else {
            warn!("(dhcpv4) lease for hwaddr={} is not IPv4", hwaddr);
            return;
        };

        debug!(
            "(dhcpv4) lease found: hwaddr={}, serverip={}, clientip={}, mask={}, router={:?}, dns={:?}, ntp={:?}, leasetime={}",
            hwaddr,
            subnet.server_ip,
            client_ip,
            subnet.subnet_mask,
            subnet.routers,
            subnet.dns,
            subnet.ntp,
            subnet.lease_time,
        );

        let Some(reply) = build_reply(&msg, client_ip, &subnet) else {
            warn!("(dhcpv4) unhandled message type for hwaddr [{}]", hwaddr);
            return;
        };

        let bytes = match reply.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("(dhcpv4) failed to encode reply: {}", e);
                return;
            }
        };

        let dest = reply_destination(&msg, peer);
        if let Err(e) = udp.send_to(&bytes, dest).await {
            error!("(dhcpv4) cannot reply to client: {}", e);
        }
    }
}

/// Render the client hardware address from the fixed-size chaddr field.
fn chaddr_string(msg: &Message) -> String {
    let chaddr = msg.chaddr();
    chaddr
        .iter()
        .take(6)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Where to send the reply: the relay if one forwarded the request, the
/// client address if it already has one, else broadcast.
fn reply_destination(msg: &Message, _peer: SocketAddr) -> SocketAddr {
    if msg.giaddr() != Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(msg.giaddr().into(), socket::DHCPV4_SERVER_PORT)
    } else if msg.ciaddr() != Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(msg.ciaddr().into(), socket::DHCPV4_CLIENT_PORT)
    } else {
        SocketAddr::new(Ipv4Addr::BROADCAST.into(), socket::DHCPV4_CLIENT_PORT)
    }
}

/// Assemble the OFFER/ACK for a request. Returns `None` for message types
/// the responder does not serve.
pub fn build_reply(msg: &Message, client_ip: Ipv4Addr, subnet: &OvnSubnet) -> Option<Message> {
    let msg_type = msg.opts().get(OptionCode::MessageType).and_then(|opt| {
        if let DhcpOption::MessageType(mt) = opt {
            Some(mt.clone())
        } else {
            None
        }
    })?;

    let reply_type = match msg_type {
        MessageType::Discover => MessageType::Offer,
        MessageType::Request => MessageType::Ack,
        _ => return None,
    };

    let mut reply = Message::default();
    reply.set_opcode(Opcode::BootReply);
    reply.set_xid(msg.xid());
    reply.set_flags(msg.flags());
    reply.set_chaddr(msg.chaddr());
    reply.set_giaddr(msg.giaddr());
    reply.set_yiaddr(client_ip);
    reply.set_siaddr(subnet.server_ip);

    reply.opts_mut().insert(DhcpOption::MessageType(reply_type));
    reply
        .opts_mut()
        .insert(DhcpOption::ServerIdentifier(subnet.server_ip));
    reply
        .opts_mut()
        .insert(DhcpOption::SubnetMask(subnet.subnet_mask));
    reply
        .opts_mut()
        .insert(DhcpOption::Router(subnet.routers.clone()));

    if subnet.mtu > 0 && mtu_requested(msg) {
        reply
            .opts_mut()
            .insert(DhcpOption::InterfaceMtu(subnet.mtu as u16));
    }
    if !subnet.dns.is_empty() {
        reply
            .opts_mut()
            .insert(DhcpOption::DomainNameServer(subnet.dns.clone()));
    }
    if !subnet.ntp.is_empty() {
        reply
            .opts_mut()
            .insert(DhcpOption::NtpServers(subnet.ntp.clone()));
    }
    reply
        .opts_mut()
        .insert(DhcpOption::AddressLeaseTime(subnet.lease_time));

    Some(reply)
}

/// Did the client ask for option 26 in its parameter request list?
fn mtu_requested(msg: &Message) -> bool {
    msg.opts()
        .get(OptionCode::ParameterRequestList)
        .map(|opt| {
            if let DhcpOption::ParameterRequestList(codes) = opt {
                codes.contains(&OptionCode::InterfaceMtu)
            } else {
                false
            }
        })
        .unwrap_or(false)
}
