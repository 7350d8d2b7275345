//! Resolver orchestration
//!
//! Ties the pieces together: a cached, coalesced front door
//! ([`Resolver::exchange`]), per-domain policy routing, the main/fallback
//! race that blunts DNS poisoning, and the host-oriented lookup API used
//! by the rest of the proxy.

use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use rand::prelude::IndexedRandom;
use tokio::sync::RwLock;

use crate::cache::{self, DnsCache};
use crate::client::{batch_exchange, transform, DnsClient};
use crate::config::ResolverConfig;
use crate::dialer;
use crate::error::{Error, Result};
use crate::flight::FlightGroup;
use crate::msg;
use crate::trie::DomainTrie;
use crate::DEFAULT_DNS_TIMEOUT;

/// Anti-poisoning stub resolver with policy routing and caching.
///
/// One instance is shared across the proxy; it is cheap to clone the
/// surrounding `Arc`.
pub struct Resolver {
    me: Weak<Resolver>,
    ipv6: bool,
    hosts: Option<DomainTrie<IpAddr>>,
    main: Vec<Arc<dyn DnsClient>>,
    fallback: Vec<Arc<dyn DnsClient>>,
    policy: Option<DomainTrie<Vec<Arc<dyn DnsClient>>>>,
    cache: RwLock<DnsCache>,
    flight: FlightGroup,
    search_domains: Vec<String>,
    disable_cache: bool,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("ipv6", &self.ipv6)
            .field("search_domains", &self.search_domains)
            .field("disable_cache", &self.disable_cache)
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// Build a resolver from configured name servers.
    ///
    /// If `config.default` is non-empty, those (literal-IP) servers form a
    /// separate bootstrap resolver used by transports whose own host is a
    /// domain name.
    pub fn new(config: ResolverConfig) -> Result<Arc<Self>> {
        let get_dialer = config.get_dialer.clone().unwrap_or_else(dialer::direct);

        let bootstrap = if config.default.is_empty() {
            None
        } else {
            let bootstrap_config = ResolverConfig {
                main: config.default.clone(),
                ipv6: config.ipv6,
                get_dialer: Some(get_dialer.clone()),
                ..Default::default()
            };
            Some(Self::new(bootstrap_config)?)
        };

        let pool = config.fake_ip.clone();
        let main = transform(&config.main, &get_dialer, pool.as_ref(), bootstrap.as_ref())?;
        if main.is_empty() {
            return Err(Error::Config("no main dns servers configured".into()));
        }

        let mut builder = ResolverBuilder::new(main)
            .ipv6(config.ipv6)
            .disable_cache(config.disable_cache)
            .search_domains(config.search_domains.clone());

        if !config.fallback.is_empty() {
            builder = builder.fallback(transform(
                &config.fallback,
                &get_dialer,
                pool.as_ref(),
                bootstrap.as_ref(),
            )?);
        }

        for (pattern, server) in &config.policy {
            let clients = transform(
                std::slice::from_ref(server),
                &get_dialer,
                pool.as_ref(),
                bootstrap.as_ref(),
            )?;
            builder = builder.policy(pattern, clients);
        }

        for (host, ip) in &config.hosts {
            builder = builder.host(host, *ip);
        }

        Ok(builder.build())
    }

    /// The servers behind the main group.
    pub fn servers(&self) -> Vec<String> {
        self.main.iter().flat_map(|c| c.servers()).collect()
    }

    /// Exchange a DNS message, serving from cache when possible.
    ///
    /// Cached answers come back with the caller's query ID and TTLs
    /// decremented to the remaining lifetime. Expired entries are served
    /// with TTL 1 while a detached refresh repopulates the cache.
    pub async fn exchange(&self, m: &Message) -> Result<Message> {
        let q = m.queries().first().ok_or(Error::NoQuestion)?.clone();
        let key = msg::question_key(&q);

        let hit = {
            let mut cache = self.cache.write().await;
            cache.get_with_expire(&key)
        };

        if let Some((cached, expires_at)) = hit {
            let now = Instant::now();
            let mut reply = msg::copy_with_id(&cached, m);

            if expires_at <= now {
                log::debug!("dns cache stale hit for {}", key);
                msg::set_msg_ttl(&mut reply, 1);
                // Stale: refresh in the background with a fresh deadline,
                // detached from the caller.
                if let Some(me) = self.me.upgrade() {
                    let m = m.clone();
                    tokio::spawn(async move {
                        let _ = tokio::time::timeout(
                            DEFAULT_DNS_TIMEOUT,
                            me.exchange_without_cache(&m),
                        )
                        .await;
                    });
                }
            } else {
                log::debug!("dns cache hit for {}", key);
                msg::update_msg_ttl(&mut reply, remaining_secs(expires_at, now));
            }
            return Ok(reply);
        }

        self.exchange_without_cache(m).await
    }

    /// Exchange bypassing the cache read, funneled through single-flight
    /// so one upstream query serves every concurrent caller of the same
    /// question.
    async fn exchange_without_cache(&self, m: &Message) -> Result<Message> {
        let q = m.queries().first().ok_or(Error::NoQuestion)?.clone();

        if self.disable_cache {
            return self.do_exchange(m).await;
        }

        let key = msg::question_key(&q);
        let (result, _shared) = self
            .flight
            .run(&key, async {
                let mut reply = self.do_exchange(m).await?;
                // OPT RRs MUST NOT be cached, forwarded, or stored in or
                // loaded from master files (RFC 6891).
                msg::strip_opt(&mut reply);
                self.cache.write().await.put(&key, &reply);
                Ok(reply)
            })
            .await;
        result
    }

    async fn do_exchange(&self, m: &Message) -> Result<Message> {
        let q = m.queries().first().ok_or(Error::NoQuestion)?;

        if msg::is_ip_request(q) {
            return self.ip_exchange(m).await;
        }

        if let Some(matched) = self.match_policy(m) {
            return batch_exchange(matched, m).await;
        }
        batch_exchange(&self.main, m).await
    }

    /// Address queries race main against fallback. Main wins iff it
    /// succeeds with at least one concrete IP; anything else trusts the
    /// fallback, regardless of which finished first.
    async fn ip_exchange(&self, m: &Message) -> Result<Message> {
        if let Some(matched) = self.match_policy(m) {
            return batch_exchange(matched, m).await;
        }

        if self.fallback.is_empty() {
            return batch_exchange(&self.main, m).await;
        }

        let fallback_clients = self.fallback.clone();
        let fallback_query = m.clone();
        let fallback_task =
            tokio::spawn(async move { batch_exchange(&fallback_clients, &fallback_query).await });

        let main_result = batch_exchange(&self.main, m).await;
        if let Ok(reply) = &main_result {
            if !msg::msg_to_ip(reply).is_empty() {
                fallback_task.abort();
                return main_result;
            }
        }

        match fallback_task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Dns(format!("fallback exchange aborted: {}", e))),
        }
    }

    fn match_policy(&self, m: &Message) -> Option<&Vec<Arc<dyn DnsClient>>> {
        let policy = self.policy.as_ref()?;
        let q = m.queries().first()?;
        let name = q.name().to_string();
        let domain = name.trim_end_matches('.');
        if domain.is_empty() {
            return None;
        }
        policy.search(domain)
    }

    /// Resolve a host to IPs, querying A and AAAA in parallel and
    /// preferring the A results whenever they arrive successfully.
    pub async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        if !self.ipv6 {
            return self.lookup_ip_for_type(host, RecordType::A).await;
        }

        let aaaa_task = self.me.upgrade().map(|me| {
            let host = host.to_string();
            tokio::spawn(async move { me.lookup_ip_for_type(&host, RecordType::AAAA).await })
        });

        match self.lookup_ip_for_type(host, RecordType::A).await {
            Ok(ips) => {
                if let Some(task) = aaaa_task {
                    task.abort();
                }
                Ok(ips)
            }
            Err(_) => match aaaa_task {
                Some(task) => match task.await {
                    Ok(Ok(ips)) => Ok(ips),
                    _ => Err(Error::IpNotFound),
                },
                None => Err(Error::IpNotFound),
            },
        }
    }

    /// Resolve a host to its IPv4 addresses.
    pub async fn lookup_ipv4(&self, host: &str) -> Result<Vec<IpAddr>> {
        self.lookup_ip_for_type(host, RecordType::A).await
    }

    /// Resolve a host to its IPv6 addresses.
    pub async fn lookup_ipv6(&self, host: &str) -> Result<Vec<IpAddr>> {
        self.lookup_ip_for_type(host, RecordType::AAAA).await
    }

    /// One address for the host, picked uniformly at random.
    pub async fn resolve_ip(&self, host: &str) -> Result<IpAddr> {
        pick_one(self.lookup_ip(host).await?)
    }

    /// One IPv4 address for the host, picked uniformly at random.
    pub async fn resolve_ipv4(&self, host: &str) -> Result<IpAddr> {
        pick_one(self.lookup_ipv4(host).await?)
    }

    /// One IPv6 address for the host, picked uniformly at random.
    pub async fn resolve_ipv6(&self, host: &str) -> Result<IpAddr> {
        pick_one(self.lookup_ipv6(host).await?)
    }

    /// Drop every cached answer.
    pub async fn flush_cache(&self) {
        self.cache.write().await.flush();
    }

    async fn lookup_ip_for_type(&self, host: &str, qtype: RecordType) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return if family_matches(qtype, ip) {
                Ok(vec![ip])
            } else {
                Err(Error::IpVersion)
            };
        }

        if let Some(hosts) = &self.hosts {
            if let Some(&ip) = hosts.search(host) {
                if family_matches(qtype, ip) {
                    return Ok(vec![ip]);
                }
            }
        }

        let query = msg::make_query(host, qtype)?;
        let reply = self.exchange(&query).await?;
        let ips = msg::msg_to_ip(&reply);
        if !ips.is_empty() {
            return Ok(ips);
        }
        if self.search_domains.is_empty() {
            return Err(Error::IpNotFound);
        }

        // Search domains are tried strictly in order; the first non-empty
        // answer wins.
        for domain in &self.search_domains {
            let query = msg::make_query(&format!("{}.{}", host, domain), qtype)?;
            let reply = self.exchange(&query).await?;
            let ips = msg::msg_to_ip(&reply);
            if !ips.is_empty() {
                return Ok(ips);
            }
        }

        Err(Error::IpNotFound)
    }
}

fn family_matches(qtype: RecordType, ip: IpAddr) -> bool {
    matches!(
        (qtype, ip),
        (RecordType::A, IpAddr::V4(_)) | (RecordType::AAAA, IpAddr::V6(_))
    )
}

fn pick_one(ips: Vec<IpAddr>) -> Result<IpAddr> {
    ips.choose(&mut rand::rng()).copied().ok_or(Error::IpNotFound)
}

fn remaining_secs(expires_at: Instant, now: Instant) -> u32 {
    let remaining = expires_at - now;
    let mut secs = remaining.as_secs() as u32;
    if remaining.subsec_nanos() > 0 {
        secs += 1;
    }
    secs
}

/// Assembles a [`Resolver`] from already-built transport clients.
///
/// [`Resolver::new`] is the configuration-driven front; this builder is
/// the seam for embedding custom [`DnsClient`] implementations.
pub struct ResolverBuilder {
    main: Vec<Arc<dyn DnsClient>>,
    fallback: Vec<Arc<dyn DnsClient>>,
    policy: Vec<(String, Vec<Arc<dyn DnsClient>>)>,
    hosts: Vec<(String, IpAddr)>,
    search_domains: Vec<String>,
    ipv6: bool,
    disable_cache: bool,
}

impl ResolverBuilder {
    pub fn new(main: Vec<Arc<dyn DnsClient>>) -> Self {
        Self {
            main,
            fallback: Vec::new(),
            policy: Vec::new(),
            hosts: Vec::new(),
            search_domains: Vec::new(),
            ipv6: true,
            disable_cache: false,
        }
    }

    pub fn fallback(mut self, clients: Vec<Arc<dyn DnsClient>>) -> Self {
        self.fallback = clients;
        self
    }

    pub fn policy(mut self, pattern: &str, clients: Vec<Arc<dyn DnsClient>>) -> Self {
        self.policy.push((pattern.to_string(), clients));
        self
    }

    pub fn host(mut self, host: &str, ip: IpAddr) -> Self {
        self.hosts.push((host.to_string(), ip));
        self
    }

    pub fn search_domains(mut self, domains: Vec<String>) -> Self {
        self.search_domains = domains;
        self
    }

    pub fn ipv6(mut self, ipv6: bool) -> Self {
        self.ipv6 = ipv6;
        self
    }

    pub fn disable_cache(mut self, disable: bool) -> Self {
        self.disable_cache = disable;
        self
    }

    pub fn build(self) -> Arc<Resolver> {
        let policy = if self.policy.is_empty() {
            None
        } else {
            let mut trie = DomainTrie::new();
            for (pattern, clients) in self.policy {
                trie.insert(&pattern, clients);
            }
            Some(trie)
        };

        let hosts = if self.hosts.is_empty() {
            None
        } else {
            let mut trie = DomainTrie::new();
            for (host, ip) in self.hosts {
                trie.insert(&host, ip);
            }
            Some(trie)
        };

        Arc::new_cyclic(|me| Resolver {
            me: me.clone(),
            ipv6: self.ipv6,
            hosts,
            main: self.main,
            fallback: self.fallback,
            policy,
            cache: RwLock::new(DnsCache::new(cache::DEFAULT_MAX_ENTRIES)),
            flight: FlightGroup::new(),
            search_domains: self.search_domains,
            disable_cache: self.disable_cache,
        })
    }
}
