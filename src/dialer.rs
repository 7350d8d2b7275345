//! Outbound connection bridge
//!
//! Transports never open sockets themselves. TCP-based exchanges go through
//! the [`Dialer`] capability so the surrounding proxy can tunnel outbound
//! DNS, while plain UDP always dials directly (bound to the requested
//! interface) exactly like the rest of the stack expects.
//!
//! The dialer is fetched through a closure on every exchange, so the host
//! can swap it as tunnels come and go.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};

use crate::error::Result;
use crate::iface;

/// Transport protocol of an outbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

/// Destination description handed to the proxy dialer
#[derive(Debug, Clone)]
pub struct Metadata {
    pub network: Network,
    pub dst_ip: Option<IpAddr>,
    pub dst_port: u16,
    /// Destination hostname when the IP is not known yet
    pub host: String,
}

impl Metadata {
    pub fn tcp(dst_ip: IpAddr, dst_port: u16) -> Self {
        Self {
            network: Network::Tcp,
            dst_ip: Some(dst_ip),
            dst_port,
            host: String::new(),
        }
    }
}

/// Options applied when dialing
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Bind the outbound socket to this interface
    pub interface: Option<String>,
}

/// Capability to open an outbound TCP connection, typically implemented by
/// the proxy's tunnel dispatcher.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, metadata: &Metadata, opts: &DialOptions) -> io::Result<TcpStream>;
}

/// Returns the current dialer; consulted on every exchange.
pub type GetDialer = Arc<dyn Fn() -> Result<Arc<dyn Dialer>> + Send + Sync>;

/// A `GetDialer` that always dials directly, for hosts without a tunnel.
pub fn direct() -> GetDialer {
    Arc::new(|| Ok(Arc::new(DirectDialer) as Arc<dyn Dialer>))
}

/// Dials the destination straight from this host.
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, metadata: &Metadata, opts: &DialOptions) -> io::Result<TcpStream> {
        let ip = metadata.dst_ip.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "direct dial needs an IP")
        })?;
        let addr = SocketAddr::new(ip, metadata.dst_port);
        create_bound_tcp_stream(addr, opts.interface.as_deref()).await
    }
}

/// Create a TCP stream, optionally bound to a named interface before
/// connecting.
pub async fn create_bound_tcp_stream(
    addr: SocketAddr,
    interface: Option<&str>,
) -> io::Result<TcpStream> {
    let socket = socket2::Socket::new(
        if addr.is_ipv6() {
            socket2::Domain::IPV6
        } else {
            socket2::Domain::IPV4
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if let Some(name) = interface {
        bind_to_interface(&socket, name, addr)?;
    }
    socket.set_nonblocking(true)?;

    // Start the connection (non-blocking).
    // EINPROGRESS (36 on macOS, 115 on Linux) or WouldBlock indicates the
    // connection is in progress.
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(36)
                || e.raw_os_error() == Some(115)
                || e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)?;

    // Wait for connection to complete.
    stream.ready(tokio::io::Interest::WRITABLE).await?;

    if let Some(e) = stream.take_error()? {
        return Err(e);
    }

    Ok(stream)
}

/// Create a UDP socket bound to an optional interface, ready to talk to
/// `remote`.
pub async fn bind_udp_socket(remote: SocketAddr, interface: Option<&str>) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        if remote.is_ipv6() {
            socket2::Domain::IPV6
        } else {
            socket2::Domain::IPV4
        },
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    if let Some(name) = interface {
        bind_to_interface(&socket, name, remote)?;
    } else {
        let any: SocketAddr = if remote.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        socket.bind(&any.into())?;
    }
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Bind a socket to a named interface: by device on Linux, and by the
/// interface's address everywhere (the portable part of the binding).
fn bind_to_interface(
    socket: &socket2::Socket,
    name: &str,
    remote: SocketAddr,
) -> io::Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    socket.bind_device(Some(name.as_bytes()))?;

    if remote.is_ipv6() {
        // Interface enumeration only yields IPv4 here; device binding above
        // still applies where the platform supports it.
        let any: SocketAddr = (std::net::Ipv6Addr::UNSPECIFIED, 0).into();
        socket.bind(&any.into())?;
        return Ok(());
    }

    let (ip, _) = iface::pick_ipv4(name)
        .map_err(|e| io::Error::new(io::ErrorKind::AddrNotAvailable, e.to_string()))?;
    let local: SocketAddr = (ip, 0).into();
    socket.bind(&local.into())?;
    Ok(())
}
