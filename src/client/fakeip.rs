//! Fake-IP synthesis
//!
//! Allocates a synthetic IPv4 address per hostname so downstream routing
//! can dispatch by host even though the client resolved over standard DNS.
//! A queries get a one-record authoritative answer with TTL 1; every other
//! question type gets an empty NOERROR answer.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use tokio::sync::RwLock;

use crate::client::DnsClient;
use crate::error::{Error, Result};
use crate::msg;

/// Cycling allocator mapping hostnames to synthetic IPv4 addresses.
///
/// Allocation walks the pool range; when it wraps, the previous tenant of
/// the reused address is evicted.
pub struct FakeIpPool {
    base: u32,
    size: u32,
    offset: AtomicU32,
    host_to_ip: RwLock<HashMap<String, Ipv4Addr>>,
    ip_to_host: RwLock<HashMap<Ipv4Addr, String>>,
}

impl FakeIpPool {
    /// Create a pool over an IPv4 CIDR such as `198.18.0.0/15`.
    pub fn new(cidr: &str) -> Result<Self> {
        let (base, size) = parse_ipv4_cidr(cidr)
            .ok_or_else(|| Error::Config(format!("invalid fake-ip cidr '{}'", cidr)))?;
        Ok(Self {
            base,
            size,
            // skip the network address
            offset: AtomicU32::new(1),
            host_to_ip: RwLock::new(HashMap::new()),
            ip_to_host: RwLock::new(HashMap::new()),
        })
    }

    /// The fake address for `host`, allocating one on first sight.
    pub async fn lookup(&self, host: &str) -> Ipv4Addr {
        let host = host.to_lowercase();

        {
            let map = self.host_to_ip.read().await;
            if let Some(&ip) = map.get(&host) {
                return ip;
            }
        }

        let offset = self.offset.fetch_add(1, Ordering::Relaxed) % self.size;
        let ip = Ipv4Addr::from(self.base.wrapping_add(offset));

        let mut h2i = self.host_to_ip.write().await;
        let mut i2h = self.ip_to_host.write().await;

        // another task may have won the race for this host
        if let Some(&existing) = h2i.get(&host) {
            return existing;
        }

        if let Some(old_host) = i2h.remove(&ip) {
            h2i.remove(&old_host);
        }

        h2i.insert(host.clone(), ip);
        i2h.insert(ip, host.clone());

        log::debug!("fake-ip allocated {} -> {}", host, ip);
        ip
    }

    /// Reverse lookup: which host owns this fake address?
    pub async fn lookup_host(&self, ip: Ipv4Addr) -> Option<String> {
        self.ip_to_host.read().await.get(&ip).cloned()
    }

    /// Whether the address falls inside the pool range.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        ip >= self.base && ip < self.base.saturating_add(self.size)
    }
}

fn parse_ipv4_cidr(cidr: &str) -> Option<(u32, u32)> {
    let (ip, prefix) = cidr.split_once('/')?;
    let ip: Ipv4Addr = ip.parse().ok()?;
    let prefix: u32 = prefix.parse().ok()?;
    if prefix > 32 {
        return None;
    }
    let size = if prefix == 32 { 1 } else { 1u32 << (32 - prefix) };
    Some((u32::from(ip), size))
}

/// Transport that answers out of the Fake-IP pool instead of the network.
pub struct FakeIpClient {
    pool: Arc<FakeIpPool>,
}

impl FakeIpClient {
    pub fn new(pool: Arc<FakeIpPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DnsClient for FakeIpClient {
    fn servers(&self) -> Vec<String> {
        vec!["fake-ip".to_string()]
    }

    async fn exchange(&self, m: &Message) -> Result<Message> {
        let q = m.queries().first().ok_or(Error::NoQuestion)?.clone();

        // AAAA/SVCB/HTTPS (and anything else that is not an A question)
        // must not be synthesized; an empty answer keeps clients on the
        // faked A path.
        if q.query_type() != RecordType::A {
            return Ok(msg::empty_answer(m));
        }

        let host = q.name().to_string();
        let host = host.trim_end_matches('.');
        let ip = self.pool.lookup(host).await;

        let mut reply = m.clone();
        reply.set_message_type(MessageType::Response);
        reply.set_response_code(ResponseCode::NoError);
        reply.set_authoritative(true);
        reply.set_recursion_available(true);

        reply.take_answers();
        reply.add_answer(Record::from_rdata(q.name().clone(), 1, RData::A(A(ip))));
        msg::set_msg_ttl(&mut reply, 1);

        Ok(reply)
    }
}
