//! End-to-end resolution scenarios (spec.md §8, S1-S6), driven against a
//! scripted upstream so no real network I/O happens.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flatdns_cache::TtlCache;
use flatdns_core::config::{CacheConfig, FlattenerConfig, HealthCheckConfig};
use flatdns_core::metrics_window::{MetricsWindow, Outcome};
use flatdns_core::selector::SelectionStrategy;
use flatdns_core::upstream::UpstreamEntry;
use flatdns_proxy::client::{ClientResult, UpstreamClient};
use flatdns_proxy::health::HealthMonitor;
use flatdns_proxy::resolver::FlatteningResolver;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, SOA};
use hickory_proto::rr::{Name, RData, Record, RecordType};

/// One scripted answer: a response code plus the answer-section records to
/// attach, keyed by `(name, record_type)`. `None` for a key means the
/// upstream never responds (timeout).
struct Script {
    answers: HashMap<(Name, RecordType), (ResponseCode, Vec<Record>, Option<Record>)>,
    always_times_out: bool,
}

struct ScriptedClient {
    scripts: HashMap<String, Script>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    fn on(mut self, upstream: &str, name: &str, rtype: RecordType, rcode: ResponseCode, answers: Vec<Record>) -> Self {
        let entry = self.scripts.entry(upstream.to_string()).or_insert_with(|| Script {
            answers: HashMap::new(),
            always_times_out: false,
        });
        entry.answers.insert((name(name), rtype), (rcode, answers, None));
        self
    }

    fn on_with_authority(
        mut self,
        upstream: &str,
        name_str: &str,
        rtype: RecordType,
        rcode: ResponseCode,
        authority: Record,
    ) -> Self {
        let entry = self.scripts.entry(upstream.to_string()).or_insert_with(|| Script {
            answers: HashMap::new(),
            always_times_out: false,
        });
        entry
            .answers
            .insert((name(name_str), rtype), (rcode, Vec::new(), Some(authority)));
        self
    }

    fn timing_out(mut self, upstream: &str) -> Self {
        self.scripts.insert(
            upstream.to_string(),
            Script { answers: HashMap::new(), always_times_out: true },
        );
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamClient for ScriptedClient {
    async fn query(
        &self,
        upstream: &UpstreamEntry,
        metrics: &MetricsWindow,
        question: &Message,
        _deadline: Duration,
    ) -> ClientResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(script) = self.scripts.get(&upstream.name) else {
            metrics.record(Outcome::Timeout, Duration::from_millis(1));
            return ClientResult::Timeout;
        };
        if script.always_times_out {
            metrics.record(Outcome::Timeout, Duration::from_millis(1));
            return ClientResult::Timeout;
        }

        let q = question.queries().first().unwrap();
        let key = (flatdns_core::model::canonicalize(q.name()), q.query_type());
        match script.answers.get(&key) {
            Some((rcode, answers, authority)) => {
                metrics.record(Outcome::Success, Duration::from_millis(1));
                let mut response = Message::new();
                response.set_message_type(MessageType::Response);
                response.set_op_code(OpCode::Query);
                response.set_response_code(*rcode);
                response.add_query(q.clone());
                for r in answers {
                    response.add_answer(r.clone());
                }
                if let Some(soa) = authority {
                    response.add_name_server(soa.clone());
                }
                ClientResult::Answer(response)
            }
            None => {
                metrics.record(Outcome::Success, Duration::from_millis(1));
                let mut response = Message::new();
                response.set_message_type(MessageType::Response);
                response.set_response_code(ResponseCode::NXDomain);
                response.add_query(q.clone());
                ClientResult::Answer(response)
            }
        }
    }
}

fn name(s: &str) -> Name {
    flatdns_core::model::canonicalize(&Name::from_str(s).unwrap())
}

fn a_record(owner: &str, ttl: u32, addr: Ipv4Addr) -> Record {
    let mut r = Record::with(name(owner), RecordType::A, ttl);
    r.set_data(Some(RData::A(A::from(addr))));
    r
}

fn cname_record(owner: &str, ttl: u32, target: &str) -> Record {
    let mut r = Record::with(name(owner), RecordType::CNAME, ttl);
    r.set_data(Some(RData::CNAME(name(target))));
    r
}

fn aaaa_record(owner: &str, ttl: u32) -> Record {
    let mut r = Record::with(name(owner), RecordType::AAAA, ttl);
    r.set_data(Some(RData::AAAA(std::net::Ipv6Addr::LOCALHOST.into())));
    r
}

fn soa_record(owner: &str, minimum: u32) -> Record {
    let soa = SOA::new(name(owner), name(&format!("hostmaster.{owner}")), 1, 3600, 600, 86400, minimum);
    let mut r = Record::with(name(owner), RecordType::SOA, minimum);
    r.set_data(Some(RData::SOA(soa)));
    r
}

fn upstream(name: &str, priority: u32) -> UpstreamEntry {
    UpstreamEntry {
        name: name.into(),
        address: "127.0.0.1:53".parse().unwrap(),
        weight: 100,
        priority,
        health_check_enabled: true,
        timeout_ms: 500,
        description: None,
    }
}

fn resolver(
    upstreams: Vec<UpstreamEntry>,
    client: ScriptedClient,
    strategy: SelectionStrategy,
    flattener: FlattenerConfig,
) -> (Arc<FlatteningResolver>, Arc<ScriptedClient>) {
    let client = Arc::new(client);
    let health = Arc::new(HealthMonitor::new(
        upstreams,
        HealthCheckConfig { enabled: false, ..HealthCheckConfig::default() },
        client.clone(),
    ));
    let cache = Arc::new(TtlCache::new(1024, Duration::from_secs(30)));
    let resolver = Arc::new(FlatteningResolver::new(
        cache,
        health,
        client.clone(),
        strategy,
        flattener,
        CacheConfig::default(),
    ));
    (resolver, client)
}

#[tokio::test]
async fn s1_direct_a_is_cached_after_first_query() {
    let client = ScriptedClient::new().on(
        "u1",
        "example.com",
        RecordType::A,
        ResponseCode::NoError,
        vec![a_record("example.com", 3600, Ipv4Addr::new(93, 184, 216, 34))],
    );
    let (resolver, client) = resolver(vec![upstream("u1", 1)], client, SelectionStrategy::Failover, FlattenerConfig::default());

    let outcome = resolver.resolve(&name("example.com"), RecordType::A).await;
    assert_eq!(outcome.response_code, ResponseCode::NoError);
    assert_eq!(outcome.answer.len(), 1);
    assert_eq!(outcome.answer[0].ttl, 3600);

    let _ = resolver.resolve(&name("example.com"), RecordType::A).await;
    assert_eq!(client.calls(), 1, "second query must be served from cache");
}

#[tokio::test]
async fn s2_cname_chain_flattens_to_the_terminal_a_with_min_ttl() {
    let client = ScriptedClient::new().on(
        "u1",
        "www.site.test",
        RecordType::A,
        ResponseCode::NoError,
        vec![
            cname_record("www.site.test", 600, "a.cdn.test"),
            a_record("a.cdn.test", 300, Ipv4Addr::new(10, 0, 0, 1)),
        ],
    );
    let (resolver, _) = resolver(vec![upstream("u1", 1)], client, SelectionStrategy::Failover, FlattenerConfig::default());

    let outcome = resolver.resolve(&name("www.site.test"), RecordType::A).await;
    assert_eq!(outcome.response_code, ResponseCode::NoError);
    assert_eq!(outcome.answer.len(), 1);
    assert_eq!(outcome.answer[0].owner, name("www.site.test"));
    assert_eq!(outcome.answer[0].ttl, 300);
}

#[tokio::test]
async fn s3_aaaa_filter_leaves_cache_intact_but_empties_the_aaaa_response() {
    let client = ScriptedClient::new()
        .on(
            "u1",
            "x.test",
            RecordType::A,
            ResponseCode::NoError,
            vec![a_record("x.test", 100, Ipv4Addr::new(1, 2, 3, 4))],
        )
        .on("u1", "x.test", RecordType::AAAA, ResponseCode::NoError, vec![aaaa_record("x.test", 100)]);
    let flattener = FlattenerConfig { remove_aaaa: true, ..FlattenerConfig::default() };
    let (resolver, _) = resolver(vec![upstream("u1", 1)], client, SelectionStrategy::Failover, flattener);

    let a_outcome = resolver.resolve(&name("x.test"), RecordType::A).await;
    assert_eq!(a_outcome.answer.len(), 1);

    // the resolver itself does not filter — that is the front end's job
    // (DESIGN.md: cache holds the unfiltered set) — so AAAA is still here.
    let aaaa_outcome = resolver.resolve(&name("x.test"), RecordType::AAAA).await;
    assert_eq!(aaaa_outcome.response_code, ResponseCode::NoError);
    assert_eq!(aaaa_outcome.answer.len(), 1);
}

#[tokio::test]
async fn s4_failover_moves_to_the_backup_while_primary_times_out() {
    let client = ScriptedClient::new().timing_out("u1").on(
        "u2",
        "svc.test",
        RecordType::A,
        ResponseCode::NoError,
        vec![a_record("svc.test", 60, Ipv4Addr::new(10, 1, 1, 1))],
    );
    let flattener = FlattenerConfig { max_upstream_retries: 1, ..FlattenerConfig::default() };
    let (resolver, _) = resolver(
        vec![upstream("u1", 1), upstream("u2", 2)],
        client,
        SelectionStrategy::Failover,
        flattener,
    );

    let outcome = resolver.resolve(&name("svc.test"), RecordType::A).await;
    assert_eq!(outcome.response_code, ResponseCode::NoError);
    match outcome.answer[0].record.data() {
        Some(RData::A(_)) => {}
        other => panic!("expected an A record, got {other:?}"),
    }
    assert!(format!("{:?}", outcome.answer[0].record.data()).contains("10.1.1.1"));
}

#[tokio::test]
async fn s5_negative_cache_uses_soa_minimum_and_skips_the_second_upstream_call() {
    let client = ScriptedClient::new().on_with_authority(
        "u1",
        "missing.test",
        RecordType::A,
        ResponseCode::NXDomain,
        soa_record("missing.test", 60),
    );
    let (resolver, client) = resolver(vec![upstream("u1", 1)], client, SelectionStrategy::Failover, FlattenerConfig::default());

    let outcome = resolver.resolve(&name("missing.test"), RecordType::A).await;
    assert_eq!(outcome.response_code, ResponseCode::NXDomain);

    let outcome2 = resolver.resolve(&name("missing.test"), RecordType::A).await;
    assert_eq!(outcome2.response_code, ResponseCode::NXDomain);
    assert_eq!(client.calls(), 1, "negative cache must absorb the second query");
}

#[tokio::test]
async fn s6_cname_loop_terminates_without_infinite_recursion() {
    let client = ScriptedClient::new().on(
        "u1",
        "loop1.test",
        RecordType::A,
        ResponseCode::NoError,
        vec![cname_record("loop1.test", 60, "loop2.test"), cname_record("loop2.test", 60, "loop1.test")],
    );
    let (resolver, _) = resolver(vec![upstream("u1", 1)], client, SelectionStrategy::Failover, FlattenerConfig::default());

    let outcome = resolver.resolve(&name("loop1.test"), RecordType::A).await;
    assert!(
        outcome.answer.is_empty(),
        "a loop must never synthesize a positive answer"
    );
    assert!(matches!(outcome.response_code, ResponseCode::NoError | ResponseCode::ServFail));
}
