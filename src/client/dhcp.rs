//! DHCP-discovered upstream
//!
//! Queries the DHCP server on a named interface for the DNS servers it
//! hands out, then exchanges through UDP clients bound to that interface.
//! Discovery is time-gated: the interface address is rechecked every 20
//! seconds, and DHCP itself is renegotiated hourly or whenever the
//! interface address changes.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::sync::watch;

use crate::client::{batch_exchange, system, udp_clients_for, DnsClient};
use crate::dialer::GetDialer;
use crate::error::{Error, Result};
use crate::iface;

/// How often the interface address is rechecked
const IFACE_TTL: Duration = Duration::from_secs(20);

/// How long a DHCP answer is trusted
const DHCP_TTL: Duration = Duration::from_secs(60 * 60);

/// Hard cap on one DHCP discovery round
const DHCP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Default)]
struct State {
    iface_expire: Option<Instant>,
    dns_expire: Option<Instant>,
    iface_addr: Option<(Ipv4Addr, Option<Ipv4Addr>)>,
    clients: Option<Vec<Arc<dyn DnsClient>>>,
    err: Option<String>,
    /// Present while a discovery task is in flight; completion is signalled
    /// through it so waiters never hold the mutex across I/O.
    done: Option<watch::Receiver<bool>>,
}

/// Upstream whose servers come from DHCP on a named interface
pub struct DhcpClient {
    iface: String,
    get_dialer: GetDialer,
    state: Mutex<State>,
    me: Weak<DhcpClient>,
}

impl DhcpClient {
    pub fn new(iface: &str, get_dialer: GetDialer) -> Arc<Self> {
        let client = Arc::new_cyclic(|me| Self {
            iface: iface.to_string(),
            get_dialer,
            state: Mutex::new(State::default()),
            me: me.clone(),
        });

        // Best-effort warm start from the OS view of the interface's DNS;
        // real DHCP discovery happens lazily on first exchange.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let me = Arc::downgrade(&client);
            handle.spawn(async move {
                if let Some(client) = me.upgrade() {
                    client.init().await;
                }
            });
        }

        client
    }

    async fn init(&self) {
        match system::probe_servers(&self.iface).await {
            Ok(servers) => {
                let v4: Vec<Ipv4Addr> = servers
                    .into_iter()
                    .filter_map(|ip| match ip {
                        IpAddr::V4(v4) => Some(v4),
                        IpAddr::V6(_) => None,
                    })
                    .collect();
                log::info!("dhcp client init on {}: {:?}", self.iface, v4);
                let clients = udp_clients_for(&v4, &self.iface, &self.get_dialer);
                if !clients.is_empty() {
                    let mut st = self.state.lock().expect("dhcp state lock poisoned");
                    st.clients = Some(clients);
                }
            }
            Err(e) => log::warn!("dhcp client init on {} failed: {}", self.iface, e),
        }
    }

    /// Discover (or wait for a discovery of) the interface's DNS servers.
    async fn resolve(&self) -> Result<Vec<Arc<dyn DnsClient>>> {
        {
            let mut st = self.state.lock().expect("dhcp state lock poisoned");
            match Self::invalidate(&self.iface, &mut st) {
                Err(e) => st.err = Some(e.to_string()),
                Ok(true) => self.spawn_discovery(&mut st),
                Ok(false) => {}
            }
        }

        loop {
            let (clients, err, done) = {
                let st = self.state.lock().expect("dhcp state lock poisoned");
                (st.clients.clone(), st.err.clone(), st.done.clone())
            };

            if clients.is_none() && err.is_none() {
                // initializing
                match done {
                    Some(mut rx) => {
                        if rx.changed().await.is_err() {
                            return Err(Error::Dns("dhcp discovery was abandoned".into()));
                        }
                        continue;
                    }
                    None => return Err(Error::Dns("dhcp discovery is not running".into())),
                }
            }

            // Dirty return: a refresh may still be in flight and these
            // values may be one round stale; callers simply retry.
            if let Some(e) = err {
                return Err(Error::Dns(e));
            }
            return Ok(clients.unwrap_or_default());
        }
    }

    /// Decide whether a new DHCP round is due. Refreshes the interface
    /// check window and records the current interface address.
    fn invalidate(iface: &str, st: &mut State) -> Result<bool> {
        let now = Instant::now();

        if st.iface_expire.is_some_and(|t| now < t) {
            return Ok(false);
        }
        st.iface_expire = Some(now + IFACE_TTL);

        let addr = iface::pick_ipv4(iface)?;

        if st.dns_expire.is_some_and(|t| now < t) && st.iface_addr == Some(addr) {
            return Ok(false);
        }
        st.dns_expire = Some(now + DHCP_TTL);
        st.iface_addr = Some(addr);

        Ok(st.done.is_none())
    }

    /// Launch the discovery task. The mutex is held only to publish the
    /// in-flight marker; all I/O happens in the detached task.
    fn spawn_discovery(&self, st: &mut State) {
        let (tx, rx) = watch::channel(false);
        st.done = Some(rx);

        let me = self.me.clone();
        let iface = self.iface.clone();
        let get_dialer = self.get_dialer.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(
                DHCP_TIMEOUT,
                probe::resolve_dns_from_dhcp(&iface),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Dns("dhcp discovery timed out".into())),
            };

            if let Some(client) = me.upgrade() {
                let mut st = client.state.lock().expect("dhcp state lock poisoned");
                st.done = None;
                match result {
                    Ok(servers) => {
                        log::info!("dhcp discovered dns on {}: {:?}", iface, servers);
                        let clients = udp_clients_for(&servers, &iface, &get_dialer);
                        if !clients.is_empty() {
                            st.clients = Some(clients);
                        }
                        st.err = None;
                    }
                    Err(e) => {
                        log::warn!("dhcp discovery on {} failed: {}", iface, e);
                        st.err = Some(e.to_string());
                    }
                }
            }

            let _ = tx.send(true);
        });
    }

    async fn update(&self) {
        let result = match tokio::time::timeout(DHCP_TIMEOUT, self.resolve()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Dns("dhcp discovery timed out".into())),
        };
        if let Err(e) = result {
            log::warn!("dhcp resolve failed on update: {}", e);
        }
    }
}

#[async_trait]
impl DnsClient for DhcpClient {
    fn servers(&self) -> Vec<String> {
        let clients = {
            let st = self.state.lock().expect("dhcp state lock poisoned");
            st.clients.clone().unwrap_or_default()
        };
        clients.iter().flat_map(|c| c.servers()).collect()
    }

    async fn exchange(&self, msg: &Message) -> Result<Message> {
        let clients = {
            let st = self.state.lock().expect("dhcp state lock poisoned");
            st.clients.clone()
        };
        let clients = match clients {
            Some(clients) if !clients.is_empty() => clients,
            _ => self.resolve().await?,
        };

        let result = batch_exchange(&clients, msg).await;
        if result.is_err() {
            // Best-effort rediscovery; the failed exchange still surfaces.
            if let Some(client) = self.me.upgrade() {
                tokio::spawn(async move { client.update().await });
            }
        }
        result
    }
}

/// Minimal DHCPINFORM exchange: broadcast a request on the interface and
/// read the DNS-servers option (6) out of the first matching reply.
mod probe {
    use super::*;
    use rand::Rng;

    const SERVER_PORT: u16 = 67;
    const CLIENT_PORT: u16 = 68;

    const BOOTREQUEST: u8 = 1;
    const BOOTREPLY: u8 = 2;
    const HTYPE_ETHERNET: u8 = 1;
    const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

    const OPTION_PAD: u8 = 0;
    const OPTION_DNS_SERVERS: u8 = 6;
    const OPTION_MESSAGE_TYPE: u8 = 53;
    const OPTION_PARAMETER_LIST: u8 = 55;
    const OPTION_END: u8 = 255;

    const DHCP_INFORM: u8 = 8;

    pub(super) async fn resolve_dns_from_dhcp(iface: &str) -> Result<Vec<Ipv4Addr>> {
        let (ciaddr, _) = iface::pick_ipv4(iface)?;
        let mac = iface::mac_addr(iface)?;

        let socket = bind_broadcast_socket(iface)?;
        let xid: u32 = rand::rng().random();
        let frame = build_inform(xid, ciaddr, mac);
        socket
            .send_to(&frame, (Ipv4Addr::BROADCAST, SERVER_PORT))
            .await?;

        // The caller bounds this loop with the discovery timeout.
        let mut buf = vec![0u8; 1500];
        loop {
            let (len, _) = socket.recv_from(&mut buf).await?;
            if let Some(servers) = parse_dns_servers(&buf[..len], xid) {
                return Ok(servers);
            }
        }
    }

    fn bind_broadcast_socket(iface: &str) -> Result<tokio::net::UdpSocket> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        socket.bind_device(Some(iface.as_bytes()))?;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let _ = iface;
        let local: std::net::SocketAddr = (Ipv4Addr::UNSPECIFIED, CLIENT_PORT).into();
        socket.bind(&local.into())?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(tokio::net::UdpSocket::from_std(std_socket)?)
    }

    /// Fixed 236-byte BOOTP header, magic cookie, then the INFORM options.
    pub(super) fn build_inform(xid: u32, ciaddr: Ipv4Addr, mac: [u8; 6]) -> Vec<u8> {
        let mut frame = vec![0u8; 236];
        frame[0] = BOOTREQUEST;
        frame[1] = HTYPE_ETHERNET;
        frame[2] = 6; // hardware address length
        frame[4..8].copy_from_slice(&xid.to_be_bytes());
        frame[12..16].copy_from_slice(&ciaddr.octets());
        frame[28..34].copy_from_slice(&mac);

        frame.extend_from_slice(&MAGIC_COOKIE);
        frame.extend_from_slice(&[OPTION_MESSAGE_TYPE, 1, DHCP_INFORM]);
        frame.extend_from_slice(&[OPTION_PARAMETER_LIST, 1, OPTION_DNS_SERVERS]);
        frame.push(OPTION_END);
        frame
    }

    /// DNS servers from a BOOTREPLY matching our transaction, if any.
    pub(super) fn parse_dns_servers(frame: &[u8], xid: u32) -> Option<Vec<Ipv4Addr>> {
        if frame.len() < 240 || frame[0] != BOOTREPLY {
            return None;
        }
        if frame[4..8] != xid.to_be_bytes() {
            return None;
        }
        if frame[236..240] != MAGIC_COOKIE {
            return None;
        }

        let mut opts = &frame[240..];
        while let Some(&code) = opts.first() {
            match code {
                OPTION_PAD => opts = &opts[1..],
                OPTION_END => break,
                _ => {
                    let len = *opts.get(1)? as usize;
                    let data = opts.get(2..2 + len)?;
                    if code == OPTION_DNS_SERVERS {
                        let servers: Vec<Ipv4Addr> = data
                            .chunks_exact(4)
                            .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
                            .collect();
                        return (!servers.is_empty()).then_some(servers);
                    }
                    opts = &opts[2 + len..];
                }
            }
        }
        None
    }

}
