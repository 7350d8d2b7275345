//! Upstream DNS transports
//!
//! Every transport satisfies the same small capability: list its servers
//! and exchange a DNS message. The resolver fans a question out to a group
//! of clients with [`batch_exchange`] and keeps whichever answer arrives
//! first.

pub mod dhcp;
pub mod doh;
pub mod fakeip;
pub mod net;
pub mod system;

use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::sync::mpsc;

use crate::config::{NameServer, Scheme};
use crate::dialer::GetDialer;
use crate::error::{Error, Result};
use crate::resolver::Resolver;
use crate::DEFAULT_DNS_TIMEOUT;

use dhcp::DhcpClient;
use doh::DohClient;
use fakeip::{FakeIpClient, FakeIpPool};
use net::{NetClient, NetScheme};
use system::SystemClient;

/// Capability every upstream transport provides.
///
/// Cancellation is the caller's: dropping the `exchange` future aborts the
/// underlying I/O, and deadlines are applied by `batch_exchange` or by the
/// caller's own timeout.
#[async_trait]
pub trait DnsClient: Send + Sync {
    /// Human-readable list of the servers behind this client
    fn servers(&self) -> Vec<String>;

    /// Send one query and await its response
    async fn exchange(&self, msg: &Message) -> Result<Message>;
}

/// Send the same question to every client concurrently and return the
/// first successful response. If all fail, the last error is returned.
/// One `DEFAULT_DNS_TIMEOUT` covers the whole batch.
pub async fn batch_exchange(clients: &[Arc<dyn DnsClient>], msg: &Message) -> Result<Message> {
    if clients.is_empty() {
        return Err(Error::Config("no dns clients in group".into()));
    }

    let (tx, mut rx) = mpsc::channel::<Result<Message>>(clients.len());
    for client in clients {
        let client = client.clone();
        let msg = msg.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            // The receiver may be gone if a peer already answered.
            let _ = tx.send(client.exchange(&msg).await).await;
        });
    }
    drop(tx);

    let collect = async {
        let mut last_err = None;
        while let Some(result) = rx.recv().await {
            match result {
                Ok(msg) => return Ok(msg),
                Err(e) => {
                    log::debug!("upstream dns exchange failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Dns("all dns requests failed".into())))
    };

    match tokio::time::timeout(DEFAULT_DNS_TIMEOUT, collect).await {
        Ok(result) => result,
        Err(_) => Err(Error::Dns("dns batch exchange timed out".into())),
    }
}

/// Build transport clients from configured name servers.
///
/// `bootstrap` resolves non-literal transport hostnames and must itself be
/// backed by literal-IP servers only.
pub fn transform(
    servers: &[NameServer],
    get_dialer: &GetDialer,
    pool: Option<&Arc<FakeIpPool>>,
    bootstrap: Option<&Arc<Resolver>>,
) -> Result<Vec<Arc<dyn DnsClient>>> {
    let mut clients: Vec<Arc<dyn DnsClient>> = Vec::with_capacity(servers.len());

    for server in servers {
        match server.scheme {
            Scheme::Udp => clients.push(Arc::new(NetClient::new(
                NetScheme::Udp,
                server,
                get_dialer.clone(),
                bootstrap.cloned(),
            )?)),
            Scheme::Tcp => clients.push(Arc::new(NetClient::new(
                NetScheme::Tcp,
                server,
                get_dialer.clone(),
                bootstrap.cloned(),
            )?)),
            Scheme::Dot => clients.push(Arc::new(NetClient::new(
                NetScheme::Dot,
                server,
                get_dialer.clone(),
                bootstrap.cloned(),
            )?)),
            Scheme::Doh => clients.push(Arc::new(DohClient::new(&server.addr)?)),
            Scheme::FakeIp => {
                let pool = pool.ok_or_else(|| {
                    Error::Config("fake-ip name server configured without a pool".into())
                })?;
                clients.push(Arc::new(FakeIpClient::new(pool.clone())));
            }
            Scheme::Dhcp => clients.push(DhcpClient::new(&server.addr, get_dialer.clone())),
            Scheme::System => clients.push(SystemClient::new(&server.addr, get_dialer.clone())),
        }
    }

    Ok(clients)
}

/// UDP/53 clients for discovered server addresses, bound to the discovery
/// interface. Shared by the DHCP and System transports.
pub(crate) fn udp_clients_for(
    ips: &[std::net::Ipv4Addr],
    iface: &str,
    get_dialer: &GetDialer,
) -> Vec<Arc<dyn DnsClient>> {
    ips.iter()
        .filter_map(|ip| {
            let server = NameServer {
                scheme: Scheme::Udp,
                addr: format!("{}:53", ip),
                iface: Some(iface.to_string()),
            };
            match NetClient::new(NetScheme::Udp, &server, get_dialer.clone(), None) {
                Ok(client) => Some(Arc::new(client) as Arc<dyn DnsClient>),
                Err(e) => {
                    log::warn!("skipping discovered dns server {}: {}", ip, e);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::MessageType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedClient {
        delay: Duration,
        fail: bool,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(delay_ms: u64, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::from_millis(delay_ms),
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DnsClient for ScriptedClient {
        fn servers(&self) -> Vec<String> {
            vec!["scripted".into()]
        }

        async fn exchange(&self, msg: &Message) -> Result<Message> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::Dns("scripted failure".into()));
            }
            let mut reply = msg.clone();
            reply.set_message_type(MessageType::Response);
            Ok(reply)
        }
    }

    fn query() -> Message {
        crate::msg::make_query("example.com", hickory_proto::rr::RecordType::A).unwrap()
    }

    #[tokio::test]
    async fn test_batch_empty_group() {
        assert!(batch_exchange(&[], &query()).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_first_success_wins() {
        let slow = ScriptedClient::new(200, false);
        let fast = ScriptedClient::new(1, false);
        let clients: Vec<Arc<dyn DnsClient>> = vec![slow.clone(), fast.clone()];

        let started = std::time::Instant::now();
        let reply = batch_exchange(&clients, &query()).await.unwrap();
        assert_eq!(reply.message_type(), MessageType::Response);
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_batch_failure_swallowed_when_peer_succeeds() {
        let failing = ScriptedClient::new(1, true);
        let ok = ScriptedClient::new(20, false);
        let clients: Vec<Arc<dyn DnsClient>> = vec![failing.clone(), ok.clone()];

        assert!(batch_exchange(&clients, &query()).await.is_ok());
    }

    #[tokio::test]
    async fn test_batch_all_fail_returns_error() {
        let a = ScriptedClient::new(1, true);
        let b = ScriptedClient::new(5, true);
        let clients: Vec<Arc<dyn DnsClient>> = vec![a.clone(), b.clone()];

        let err = batch_exchange(&clients, &query()).await.unwrap_err();
        assert!(matches!(err, Error::Dns(_)));
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transform_rejects_fake_ip_without_pool() {
        let servers = vec![crate::config::parse_name_server("fake-ip://").unwrap()];
        let dialer = crate::dialer::direct();
        assert!(transform(&servers, &dialer, None, None).is_err());
    }

    #[tokio::test]
    async fn test_transform_builds_socket_clients() {
        let servers = vec![
            crate::config::parse_name_server("8.8.8.8").unwrap(),
            crate::config::parse_name_server("tcp://1.1.1.1").unwrap(),
            crate::config::parse_name_server("tls://dns.google").unwrap(),
            crate::config::parse_name_server("https://dns.google/dns-query").unwrap(),
        ];
        let dialer = crate::dialer::direct();
        let clients = transform(&servers, &dialer, None, None).unwrap();
        assert_eq!(clients.len(), 4);
        assert_eq!(clients[0].servers(), vec!["udp://8.8.8.8:53".to_string()]);
    }
}
