//! End-to-end resolver scenarios over mock transports
//!
//! These tests drive the public resolver API against scripted in-memory
//! clients and verify the contract end to end: caching with TTL
//! decrement, stale-while-revalidate, request coalescing, policy routing,
//! the main/fallback race, and the A/AAAA merge.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};

use rudder_dns::resolver::ResolverBuilder;
use rudder_dns::{msg, DnsClient, Error, FakeIpPool, Result};

/// Scripted upstream: fixed answers, per-type delays and failures, and a
/// record of everything it was asked.
struct MockClient {
    v4: Vec<Ipv4Addr>,
    v6: Vec<Ipv6Addr>,
    ttl: Arc<AtomicU32>,
    delay_a: Duration,
    delay_aaaa: Duration,
    fail_a: bool,
    fail_aaaa: bool,
    with_edns: bool,
    calls: Arc<AtomicUsize>,
    queried: Arc<Mutex<Vec<(String, RecordType)>>>,
}

impl MockClient {
    fn new(v4: Vec<Ipv4Addr>, v6: Vec<Ipv6Addr>) -> Self {
        Self {
            v4,
            v6,
            ttl: Arc::new(AtomicU32::new(300)),
            delay_a: Duration::ZERO,
            delay_aaaa: Duration::ZERO,
            fail_a: false,
            fail_aaaa: false,
            with_edns: false,
            calls: Arc::new(AtomicUsize::new(0)),
            queried: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn answering(ip: Ipv4Addr) -> Self {
        Self::new(vec![ip], Vec::new())
    }

    fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    fn queried(&self) -> Arc<Mutex<Vec<(String, RecordType)>>> {
        self.queried.clone()
    }
}

#[async_trait]
impl DnsClient for MockClient {
    fn servers(&self) -> Vec<String> {
        vec!["mock".into()]
    }

    async fn exchange(&self, m: &Message) -> Result<Message> {
        let q = m.queries().first().ok_or(Error::NoQuestion)?.clone();
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queried
            .lock()
            .unwrap()
            .push((q.name().to_string(), q.query_type()));

        let (delay, fail) = match q.query_type() {
            RecordType::AAAA => (self.delay_aaaa, self.fail_aaaa),
            _ => (self.delay_a, self.fail_a),
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(Error::Dns("mock upstream failure".into()));
        }

        let ttl = self.ttl.load(Ordering::SeqCst);
        let mut reply = m.clone();
        reply.set_message_type(MessageType::Response);
        reply.set_response_code(ResponseCode::NoError);
        reply.set_recursion_available(true);
        match q.query_type() {
            RecordType::A => {
                for ip in &self.v4 {
                    reply.add_answer(Record::from_rdata(q.name().clone(), ttl, RData::A(A(*ip))));
                }
            }
            RecordType::AAAA => {
                for ip in &self.v6 {
                    reply.add_answer(Record::from_rdata(
                        q.name().clone(),
                        ttl,
                        RData::AAAA(AAAA(*ip)),
                    ));
                }
            }
            _ => {}
        }
        if self.with_edns {
            let mut edns = hickory_proto::op::Edns::new();
            edns.set_max_payload(4096);
            *reply.extensions_mut() = Some(edns);
        }
        Ok(reply)
    }
}

/// Upstream answering from a fixed name -> IPv4 table; unknown names get
/// an empty NOERROR answer.
struct MapClient {
    answers: HashMap<String, Ipv4Addr>,
    queried: Arc<Mutex<Vec<String>>>,
}

impl MapClient {
    fn new(entries: &[(&str, Ipv4Addr)]) -> Self {
        Self {
            answers: entries
                .iter()
                .map(|(name, ip)| (name.to_string(), *ip))
                .collect(),
            queried: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl DnsClient for MapClient {
    fn servers(&self) -> Vec<String> {
        vec!["map-mock".into()]
    }

    async fn exchange(&self, m: &Message) -> Result<Message> {
        let q = m.queries().first().ok_or(Error::NoQuestion)?.clone();
        let name = q.name().to_string();
        self.queried.lock().unwrap().push(name.clone());

        let mut reply = m.clone();
        reply.set_message_type(MessageType::Response);
        reply.set_response_code(ResponseCode::NoError);
        if let Some(ip) = self.answers.get(&name) {
            reply.add_answer(Record::from_rdata(q.name().clone(), 60, RData::A(A(*ip))));
        }
        Ok(reply)
    }
}

fn a_query(host: &str) -> Message {
    msg::make_query(host, RecordType::A).unwrap()
}

async fn wait_for_calls(calls: &AtomicUsize, expected: usize) {
    for _ in 0..200 {
        if calls.load(Ordering::SeqCst) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} upstream calls, saw {}",
        expected,
        calls.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn e1_basic_a_query_is_cached() {
    let upstream = MockClient::answering(Ipv4Addr::new(93, 184, 216, 34));
    let calls = upstream.calls();
    let resolver = ResolverBuilder::new(vec![Arc::new(upstream)]).build();

    let first = resolver.exchange(&a_query("example.com")).await.unwrap();
    assert_eq!(
        msg::msg_to_ip(&first),
        vec!["93.184.216.34".parse::<IpAddr>().unwrap()]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Second identical question: served from cache, ID rewritten, TTL
    // decremented, and no further network call.
    let query = a_query("example.com");
    let second = resolver.exchange(&query).await.unwrap();
    assert_eq!(second.id(), query.id());
    assert_eq!(msg::msg_to_ip(&second), msg::msg_to_ip(&first));
    let ttl = second.answers()[0].ttl();
    assert!(ttl >= 1 && ttl <= 300);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn e2_fallback_wins_when_main_is_empty() {
    // A poisoned main answers NOERROR with no addresses.
    let main = MockClient::empty();
    let fallback = MockClient::answering(Ipv4Addr::new(93, 184, 216, 34));

    let resolver = ResolverBuilder::new(vec![Arc::new(main)])
        .fallback(vec![Arc::new(fallback)])
        .build();

    let reply = resolver.exchange(&a_query("example.com")).await.unwrap();
    assert_eq!(
        msg::msg_to_ip(&reply),
        vec!["93.184.216.34".parse::<IpAddr>().unwrap()]
    );
}

#[tokio::test]
async fn e2b_main_preferred_even_when_slower() {
    let mut main = MockClient::answering(Ipv4Addr::new(1, 2, 3, 4));
    main.delay_a = Duration::from_millis(30);
    let fallback = MockClient::answering(Ipv4Addr::new(5, 6, 7, 8));

    let resolver = ResolverBuilder::new(vec![Arc::new(main)])
        .fallback(vec![Arc::new(fallback)])
        .build();

    let reply = resolver.exchange(&a_query("example.com")).await.unwrap();
    assert_eq!(
        msg::msg_to_ip(&reply),
        vec!["1.2.3.4".parse::<IpAddr>().unwrap()]
    );
}

#[tokio::test]
async fn e2c_fallback_wins_when_main_fails() {
    let mut main = MockClient::answering(Ipv4Addr::new(1, 2, 3, 4));
    main.fail_a = true;
    let fallback = MockClient::answering(Ipv4Addr::new(5, 6, 7, 8));

    let resolver = ResolverBuilder::new(vec![Arc::new(main)])
        .fallback(vec![Arc::new(fallback)])
        .build();

    let reply = resolver.exchange(&a_query("example.com")).await.unwrap();
    assert_eq!(
        msg::msg_to_ip(&reply),
        vec!["5.6.7.8".parse::<IpAddr>().unwrap()]
    );
}

#[tokio::test]
async fn e3_policy_overrides_main() {
    let internal = MockClient::answering(Ipv4Addr::new(10, 0, 0, 1));
    let internal_calls = internal.calls();
    let main = MockClient::answering(Ipv4Addr::new(8, 8, 8, 8));
    let main_calls = main.calls();

    let resolver = ResolverBuilder::new(vec![Arc::new(main)])
        .policy("*.internal", vec![Arc::new(internal)])
        .build();

    let reply = resolver.exchange(&a_query("srv.internal")).await.unwrap();
    assert_eq!(
        msg::msg_to_ip(&reply),
        vec!["10.0.0.1".parse::<IpAddr>().unwrap()]
    );
    assert_eq!(internal_calls.load(Ordering::SeqCst), 1);
    assert_eq!(main_calls.load(Ordering::SeqCst), 0);

    let reply = resolver.exchange(&a_query("example.com")).await.unwrap();
    assert_eq!(
        msg::msg_to_ip(&reply),
        vec!["8.8.8.8".parse::<IpAddr>().unwrap()]
    );
    assert_eq!(internal_calls.load(Ordering::SeqCst), 1);
    assert_eq!(main_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn e4_concurrent_identical_questions_coalesce() {
    let mut upstream = MockClient::answering(Ipv4Addr::new(9, 9, 9, 9));
    upstream.delay_a = Duration::from_millis(50);
    let calls = upstream.calls();
    let resolver = ResolverBuilder::new(vec![Arc::new(upstream)]).build();

    let mut handles = Vec::new();
    for _ in 0..100 {
        let resolver = resolver.clone();
        handles.push(tokio::spawn(async move {
            resolver.exchange(&a_query("foo.test")).await
        }));
    }

    let expected = vec!["9.9.9.9".parse::<IpAddr>().unwrap()];
    for handle in handles {
        let reply = handle.await.unwrap().unwrap();
        assert_eq!(msg::msg_to_ip(&reply), expected);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn e5_stale_entry_served_then_refreshed() {
    let upstream = MockClient::answering(Ipv4Addr::new(9, 9, 9, 9));
    let calls = upstream.calls();
    let ttl = upstream.ttl.clone();
    ttl.store(0, Ordering::SeqCst);
    let resolver = ResolverBuilder::new(vec![Arc::new(upstream)]).build();

    // Seed the cache with an already-expired answer.
    resolver.exchange(&a_query("bar.test")).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Next answers are fresh for 5 minutes.
    ttl.store(300, Ordering::SeqCst);

    // The stale entry comes back immediately with TTL 1...
    let stale = resolver.exchange(&a_query("bar.test")).await.unwrap();
    assert!(stale.answers().iter().all(|r| r.ttl() == 1));

    // ...and exactly one background refresh hits the upstream.
    wait_for_calls(&calls, 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Subsequent calls see the refreshed entry without new queries.
    let fresh = resolver.exchange(&a_query("bar.test")).await.unwrap();
    assert!(fresh.answers()[0].ttl() > 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn e6_lookup_ip_prefers_a_results() {
    let mut upstream = MockClient::new(
        vec![Ipv4Addr::new(1, 2, 3, 4)],
        vec![Ipv6Addr::LOCALHOST],
    );
    // AAAA resolves long before A; A must still win.
    upstream.delay_a = Duration::from_millis(10);
    upstream.delay_aaaa = Duration::from_millis(1);

    let resolver = ResolverBuilder::new(vec![Arc::new(upstream)]).build();
    let ips = resolver.lookup_ip("example.com").await.unwrap();
    assert_eq!(ips, vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
}

#[tokio::test]
async fn lookup_ip_falls_back_to_aaaa_when_a_fails() {
    let mut upstream = MockClient::new(Vec::new(), vec![Ipv6Addr::LOCALHOST]);
    upstream.fail_a = true;

    let resolver = ResolverBuilder::new(vec![Arc::new(upstream)]).build();
    let ips = resolver.lookup_ip("example.com").await.unwrap();
    assert_eq!(ips, vec!["::1".parse::<IpAddr>().unwrap()]);
}

#[tokio::test]
async fn lookup_ip_reports_not_found() {
    let upstream = MockClient::empty();
    let resolver = ResolverBuilder::new(vec![Arc::new(upstream)]).build();
    assert!(matches!(
        resolver.lookup_ip("nowhere.test").await,
        Err(Error::IpNotFound)
    ));
}

#[tokio::test]
async fn ipv6_disabled_skips_aaaa_lookup() {
    let upstream = MockClient::new(
        vec![Ipv4Addr::new(1, 2, 3, 4)],
        vec![Ipv6Addr::LOCALHOST],
    );
    let queried = upstream.queried();

    let resolver = ResolverBuilder::new(vec![Arc::new(upstream)])
        .ipv6(false)
        .build();
    let ips = resolver.lookup_ip("example.com").await.unwrap();
    assert_eq!(ips, vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let queried = queried.lock().unwrap();
    assert!(queried.iter().all(|(_, qtype)| *qtype == RecordType::A));
}

#[tokio::test]
async fn search_domains_tried_in_order() {
    let upstream = MapClient::new(&[("foo.corp.test.", Ipv4Addr::new(10, 1, 1, 1))]);
    let queried = upstream.queried.clone();

    let resolver = ResolverBuilder::new(vec![Arc::new(upstream)])
        .search_domains(vec!["corp.test".into(), "branch.test".into()])
        .build();

    let ips = resolver.lookup_ipv4("foo").await.unwrap();
    assert_eq!(ips, vec!["10.1.1.1".parse::<IpAddr>().unwrap()]);

    // Bare name first, then the first search domain; the match stops the
    // expansion before branch.test is ever asked.
    let queried = queried.lock().unwrap();
    assert_eq!(*queried, vec!["foo.".to_string(), "foo.corp.test.".to_string()]);
}

#[tokio::test]
async fn search_domains_exhausted_reports_not_found() {
    let upstream = MapClient::new(&[]);
    let queried = upstream.queried.clone();

    let resolver = ResolverBuilder::new(vec![Arc::new(upstream)])
        .search_domains(vec!["corp.test".into()])
        .build();

    assert!(matches!(
        resolver.lookup_ipv4("missing").await,
        Err(Error::IpNotFound)
    ));
    assert_eq!(queried.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn hosts_table_short_circuits_network() {
    let upstream = MockClient::answering(Ipv4Addr::new(8, 8, 8, 8));
    let calls = upstream.calls();

    let resolver = ResolverBuilder::new(vec![Arc::new(upstream)])
        .host("router.lan", "192.168.1.1".parse().unwrap())
        .build();

    let ips = resolver.lookup_ipv4("router.lan").await.unwrap();
    assert_eq!(ips, vec!["192.168.1.1".parse::<IpAddr>().unwrap()]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn opt_records_never_surface() {
    let mut upstream = MockClient::answering(Ipv4Addr::new(1, 1, 1, 1));
    upstream.with_edns = true;
    let resolver = ResolverBuilder::new(vec![Arc::new(upstream)]).build();

    let first = resolver.exchange(&a_query("example.com")).await.unwrap();
    assert!(first.extensions().is_none());
    assert!(first
        .additionals()
        .iter()
        .all(|r| r.record_type() != RecordType::OPT));

    let cached = resolver.exchange(&a_query("example.com")).await.unwrap();
    assert!(cached.extensions().is_none());
}

#[tokio::test]
async fn disable_cache_queries_every_time() {
    let upstream = MockClient::answering(Ipv4Addr::new(1, 1, 1, 1));
    let calls = upstream.calls();

    let resolver = ResolverBuilder::new(vec![Arc::new(upstream)])
        .disable_cache(true)
        .build();

    resolver.exchange(&a_query("example.com")).await.unwrap();
    resolver.exchange(&a_query("example.com")).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fake_ip_main_resolves_from_pool() {
    let pool = Arc::new(FakeIpPool::new("198.18.0.0/16").unwrap());
    let client = rudder_dns::client::fakeip::FakeIpClient::new(pool.clone());
    let resolver = ResolverBuilder::new(vec![Arc::new(client)]).build();

    let ips = resolver.lookup_ipv4("site.test").await.unwrap();
    assert_eq!(ips.len(), 1);
    let IpAddr::V4(ip) = ips[0] else {
        panic!("expected an IPv4 fake address");
    };
    assert!(pool.contains(ip));
    assert_eq!(pool.lookup_host(ip).await.as_deref(), Some("site.test"));
}

#[tokio::test]
async fn resolve_ip_picks_from_lookup_results() {
    let upstream = MockClient::new(
        vec![Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8)],
        Vec::new(),
    );
    let resolver = ResolverBuilder::new(vec![Arc::new(upstream)]).build();

    let ip = resolver.resolve_ip("example.com").await.unwrap();
    let expected = [
        "1.2.3.4".parse::<IpAddr>().unwrap(),
        "5.6.7.8".parse::<IpAddr>().unwrap(),
    ];
    assert!(expected.contains(&ip));
}
