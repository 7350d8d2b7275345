//! rudder-dns - policy-routing DNS resolver front-end
//!
//! The resolver half of the rudder proxy: it accepts DNS questions,
//! dispatches them to upstream transports, and applies the routing policy
//! that keeps hostname-based dispatch working behind the tunnel.
//!
//! Transports:
//! - UDP and TCP (traditional DNS)
//! - DoT (DNS over TLS)
//! - DoH (DNS over HTTPS)
//! - Fake-IP (synthetic A answers backed by an address pool)
//! - DHCP-discovered and OS-configured servers, per interface
//!
//! Features:
//! - Longest-suffix per-domain policy routing
//! - TTL-aware answer cache with stale-while-revalidate
//! - Request coalescing (one upstream query per in-flight question)
//! - Main/fallback race that prefers the main group only when it yields
//!   concrete addresses, to blunt DNS poisoning
//! - Outbound dialing through the proxy's own dialer, with optional
//!   interface binding
//!
//! # Example
//!
//! ```no_run
//! use rudder_dns::{parse_name_server, Resolver, ResolverConfig};
//!
//! # async fn example() -> rudder_dns::Result<()> {
//! let config = ResolverConfig {
//!     main: vec![parse_name_server("udp://1.1.1.1")?],
//!     fallback: vec![parse_name_server("tls://dns.google")?],
//!     policy: vec![("*.internal".into(), parse_name_server("udp://10.0.0.1")?)],
//!     ..Default::default()
//! };
//! let resolver = Resolver::new(config)?;
//!
//! let ips = resolver.lookup_ip("example.com").await?;
//! # let _ = ips;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

pub mod cache;
pub mod client;
pub mod config;
pub mod dialer;
pub mod error;
pub mod flight;
pub mod iface;
pub mod msg;
pub mod resolver;
pub mod trie;

pub use client::fakeip::FakeIpPool;
pub use client::{batch_exchange, DnsClient};
pub use config::{parse_name_server, NameServer, ResolverConfig, Scheme};
pub use dialer::{DialOptions, Dialer, DirectDialer, GetDialer, Metadata, Network};
pub use error::{Error, Result};
pub use resolver::{Resolver, ResolverBuilder};

/// Default deadline applied across a batch exchange and to detached
/// cache refreshes.
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);
