//! Name-server configuration parsing
//!
//! Parses upstream name-server specifications in various formats:
//! - `host[:53]` or `udp://host[:53]` - plain UDP
//! - `tcp://host[:53]` - TCP
//! - `tls://host[:853]` - DNS over TLS (DoT)
//! - `https://host[/path]` - DNS over HTTPS (DoH)
//! - `dhcp://iface` - servers discovered via DHCP on the interface
//! - `system://iface` - servers configured in the OS for the interface
//! - `fake-ip://` - synthetic A answers from the Fake-IP pool
//!
//! A trailing `#iface` fragment binds the outbound socket to that interface.

use std::net::IpAddr;
use std::sync::Arc;

use crate::client::fakeip::FakeIpPool;
use crate::dialer::GetDialer;
use crate::error::{Error, Result};

/// Transport scheme of an upstream name server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain UDP (default)
    Udp,
    /// TCP
    Tcp,
    /// DNS over TLS
    Dot,
    /// DNS over HTTPS
    Doh,
    /// Discovered via DHCP on an interface
    Dhcp,
    /// Configured in the operating system for an interface
    System,
    /// Synthesized from the Fake-IP pool
    FakeIp,
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scheme::Udp => write!(f, "udp"),
            Scheme::Tcp => write!(f, "tcp"),
            Scheme::Dot => write!(f, "tls"),
            Scheme::Doh => write!(f, "https"),
            Scheme::Dhcp => write!(f, "dhcp"),
            Scheme::System => write!(f, "system"),
            Scheme::FakeIp => write!(f, "fake-ip"),
        }
    }
}

/// A configured upstream name server, immutable after construction.
///
/// `addr` carries `host:port` for UDP/TCP/DoT, the full URL for DoH,
/// and the interface name for DHCP/System.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameServer {
    pub scheme: Scheme,
    pub addr: String,
    /// Interface to bind outbound sockets to (`#iface` fragment)
    pub iface: Option<String>,
}

impl NameServer {
    /// Split `addr` into host and port for the socket-based schemes.
    pub fn host_port(&self) -> Result<(String, u16)> {
        split_host_port(&self.addr)
    }
}

impl std::fmt::Display for NameServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.scheme {
            Scheme::Doh => write!(f, "{}", self.addr)?,
            _ => write!(f, "{}://{}", self.scheme, self.addr)?,
        }
        if let Some(iface) = &self.iface {
            write!(f, "#{}", iface)?;
        }
        Ok(())
    }
}

/// Parse a name-server specification string.
///
/// Bare `host` or `host:port` defaults to UDP on port 53.
pub fn parse_name_server(s: &str) -> Result<NameServer> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Config("empty name server".into()));
    }

    // The fragment binds the outbound socket to an interface.
    let (s, iface) = match s.rsplit_once('#') {
        Some((rest, frag)) if !frag.is_empty() => (rest, Some(frag.to_string())),
        Some((rest, _)) => (rest, None),
        None => (s, None),
    };

    if s.starts_with("https://") {
        return Ok(NameServer {
            scheme: Scheme::Doh,
            addr: s.to_string(),
            iface,
        });
    }

    if let Some(rest) = s.strip_prefix("tls://") {
        let (host, port) = split_host_port_default(rest, 853)?;
        return Ok(NameServer {
            scheme: Scheme::Dot,
            addr: join_host_port(&host, port),
            iface,
        });
    }

    if let Some(rest) = s.strip_prefix("tcp://") {
        let (host, port) = split_host_port_default(rest, 53)?;
        return Ok(NameServer {
            scheme: Scheme::Tcp,
            addr: join_host_port(&host, port),
            iface,
        });
    }

    if let Some(rest) = s.strip_prefix("dhcp://") {
        if rest.is_empty() {
            return Err(Error::Config("dhcp name server needs an interface".into()));
        }
        return Ok(NameServer {
            scheme: Scheme::Dhcp,
            addr: rest.to_string(),
            iface,
        });
    }

    if let Some(rest) = s.strip_prefix("system://") {
        if rest.is_empty() {
            return Err(Error::Config("system name server needs an interface".into()));
        }
        return Ok(NameServer {
            scheme: Scheme::System,
            addr: rest.to_string(),
            iface,
        });
    }

    if s.starts_with("fake-ip://") {
        return Ok(NameServer {
            scheme: Scheme::FakeIp,
            addr: "fake-ip".to_string(),
            iface,
        });
    }

    let rest = s.strip_prefix("udp://").unwrap_or(s);
    let (host, port) = split_host_port_default(rest, 53)?;
    Ok(NameServer {
        scheme: Scheme::Udp,
        addr: join_host_port(&host, port),
        iface,
    })
}

/// Join host and port, bracketing IPv6 hosts.
fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Split `host:port`, tolerating bracketed IPv6 (`[::1]:53`) and bare
/// addresses without a port.
fn split_host_port_default(s: &str, default_port: u16) -> Result<(String, u16)> {
    if s.is_empty() {
        return Err(Error::Config("empty name server host".into()));
    }

    // Bracketed IPv6: [::1] or [::1]:53
    if let Some(rest) = s.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            return Err(Error::Config(format!("unterminated IPv6 literal '{}'", s)));
        };
        let host = &rest[..end];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => p
                .parse::<u16>()
                .map_err(|e| Error::Config(format!("invalid port '{}': {}", p, e)))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    // Unbracketed IPv6 has more than one colon and no port.
    if s.matches(':').count() > 1 {
        return Ok((s.to_string(), default_port));
    }

    match s.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|e| Error::Config(format!("invalid port '{}': {}", port, e)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((s.to_string(), default_port)),
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    // Addresses are normalized at parse time; the port is always present.
    split_host_port_default(addr, 53)
}

/// Everything the resolver needs from the host application.
///
/// This is a plain struct; YAML parsing and the control plane live in the
/// surrounding proxy.
#[derive(Clone, Default)]
pub struct ResolverConfig {
    /// Main server group
    pub main: Vec<NameServer>,
    /// Fallback server group raced against `main` for A/AAAA queries
    pub fallback: Vec<NameServer>,
    /// Literal-IP-only servers used to bootstrap transport host resolution
    pub default: Vec<NameServer>,
    /// Per-domain policy: longest-suffix pattern -> dedicated server
    pub policy: Vec<(String, NameServer)>,
    /// Static host table consulted before any network query
    pub hosts: Vec<(String, IpAddr)>,
    /// Suffixes appended in order when a lookup yields no IPs
    pub search_domains: Vec<String>,
    /// Whether AAAA lookups participate in `lookup_ip`
    pub ipv6: bool,
    /// Disable the answer cache and request coalescing
    pub disable_cache: bool,
    /// Pool backing `fake-ip://` servers
    pub fake_ip: Option<Arc<FakeIpPool>>,
    /// Outbound dialer indirection; `None` dials directly
    pub get_dialer: Option<GetDialer>,
}
