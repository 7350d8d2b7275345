//! Socket-based DNS transports: UDP, TCP, and DNS over TLS
//!
//! One client type covers the three schemes because they share everything
//! up to the wire: resolve the configured host to an IP (directly for
//! literals, through the bootstrap resolver otherwise), obtain a dialer,
//! and exchange a single message. TCP and DoT go through the proxy dialer;
//! UDP always dials plainly, bound to the optional interface.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use rand::prelude::IndexedRandom;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::client::DnsClient;
use crate::config::NameServer;
use crate::dialer::{self, DialOptions, GetDialer, Metadata};
use crate::error::{Error, Result};
use crate::resolver::Resolver;

/// Maximum UDP DNS response size
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// Maximum TCP/DoT DNS response size
const MAX_TCP_RESPONSE_SIZE: usize = 65535;

/// Wire scheme of a [`NetClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetScheme {
    Udp,
    Tcp,
    Dot,
}

impl NetScheme {
    fn as_str(&self) -> &'static str {
        match self {
            NetScheme::Udp => "udp",
            NetScheme::Tcp => "tcp",
            NetScheme::Dot => "tls",
        }
    }
}

/// UDP, TCP, or DoT upstream client
pub struct NetClient {
    scheme: NetScheme,
    host: String,
    port: u16,
    iface: Option<String>,
    get_dialer: GetDialer,
    /// Resolves a non-literal `host`; must be backed by literal-IP servers
    bootstrap: Option<Arc<Resolver>>,
    /// TLS config shared across DoT connections
    tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl NetClient {
    pub fn new(
        scheme: NetScheme,
        server: &NameServer,
        get_dialer: GetDialer,
        bootstrap: Option<Arc<Resolver>>,
    ) -> Result<Self> {
        let (host, port) = server.host_port()?;

        let tls_config = match scheme {
            NetScheme::Dot => Some(Arc::new(build_tls_config()?)),
            _ => None,
        };

        Ok(Self {
            scheme,
            host,
            port,
            iface: server.iface.clone(),
            get_dialer,
            bootstrap,
            tls_config,
        })
    }

    /// Resolve the configured host to one concrete IP.
    async fn resolve_host(&self) -> Result<IpAddr> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let Some(bootstrap) = &self.bootstrap else {
            return Err(Error::InvalidHost(self.host.clone()));
        };

        let ips = bootstrap.lookup_ip(&self.host).await?;
        ips.choose(&mut rand::rng())
            .copied()
            .ok_or(Error::IpNotFound)
    }

    async fn exchange_udp(&self, remote: SocketAddr, msg: &Message) -> Result<Message> {
        let socket = dialer::bind_udp_socket(remote, self.iface.as_deref()).await?;
        socket.connect(remote).await?;

        let query = msg
            .to_vec()
            .map_err(|e| Error::Dns(format!("packing DNS query: {}", e)))?;
        socket.send(&query).await?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
        loop {
            let len = socket.recv(&mut buf).await?;
            match Message::from_vec(&buf[..len]) {
                // A response to someone else's query is dropped, not fatal.
                Ok(reply) if reply.id() == msg.id() => return Ok(reply),
                Ok(_) => continue,
                Err(e) => return Err(Error::Dns(format!("parsing DNS response: {}", e))),
            }
        }
    }

    async fn dial_tcp(&self, ip: IpAddr) -> Result<TcpStream> {
        let dialer = (self.get_dialer)()?;
        let metadata = Metadata::tcp(ip, self.port);
        let opts = DialOptions {
            interface: self.iface.clone(),
        };
        Ok(dialer.dial(&metadata, &opts).await?)
    }

    async fn exchange_dot(&self, ip: IpAddr, msg: &Message) -> Result<Message> {
        let tcp = self.dial_tcp(ip).await?;

        let tls_config = self
            .tls_config
            .clone()
            .ok_or_else(|| Error::Config("DoT client missing TLS config".into()))?;
        let connector = tokio_rustls::TlsConnector::from(tls_config);
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| Error::Dns(format!("invalid DoT server name: {}", e)))?;

        let mut stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Dns(format!("DoT TLS handshake failed: {}", e)))?;

        dns_over_stream(&mut stream, msg).await
    }
}

#[async_trait]
impl DnsClient for NetClient {
    fn servers(&self) -> Vec<String> {
        vec![format!(
            "{}://{}:{}",
            self.scheme.as_str(),
            self.host,
            self.port
        )]
    }

    async fn exchange(&self, msg: &Message) -> Result<Message> {
        let ip = self.resolve_host().await?;
        let remote = SocketAddr::new(ip, self.port);

        match self.scheme {
            NetScheme::Udp => self.exchange_udp(remote, msg).await,
            NetScheme::Tcp => {
                let mut stream = self.dial_tcp(ip).await?;
                dns_over_stream(&mut stream, msg).await
            }
            NetScheme::Dot => self.exchange_dot(ip, msg).await,
        }
    }
}

/// TLS config for DoT using webpki roots and the ring crypto provider.
fn build_tls_config() -> Result<rustls::ClientConfig> {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Config(format!("failed to create TLS config: {}", e)))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(config)
}

/// Exchange a length-prefixed DNS message over a stream (TCP and DoT).
async fn dns_over_stream<S>(stream: &mut S, msg: &Message) -> Result<Message>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let query = msg
        .to_vec()
        .map_err(|e| Error::Dns(format!("packing DNS query: {}", e)))?;

    let mut framed = Vec::with_capacity(2 + query.len());
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(&query);
    stream.write_all(&framed).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_TCP_RESPONSE_SIZE {
        return Err(Error::Dns("DNS response too large".into()));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;

    Message::from_vec(&body).map_err(|e| Error::Dns(format!("parsing DNS response: {}", e)))
}
