use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use flatdns_cache::{InFlightMap, Lead, TtlCache};
use flatdns_core::config::{CacheConfig, FlattenerConfig};
use flatdns_core::model::{canonicalize, CacheEntry, CacheKind, QueryKey, RR};
use flatdns_core::selector::{select, Candidate, SelectionStrategy, SelectorState};
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::rdata::SOA;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tracing::{debug, warn};

use crate::client::{ClientResult, UpstreamClient};
use crate::health::HealthMonitor;

/// Minimum samples a mean-latency estimate must be based on before the
/// `lowest-latency` strategy trusts it (spec.md §4.3).
const LATENCY_CONFIDENCE_SAMPLES: usize = 3;

/// Negative-cache TTL used for a synthesized SERVFAIL when all upstreams
/// fail (spec.md §4.5 step 5: "a short TTL").
const SERVFAIL_NEGATIVE_TTL_SECS: u32 = 10;

/// The result of resolving one question, pre-AAAA-filter. Cheaply
/// clonable so it can be broadcast to in-flight followers (spec.md §9).
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub answer: Vec<RR>,
    pub response_code: ResponseCode,
    /// SOA minimum from the upstream's authority section, if the negative
    /// answer carried one (spec.md §4.1: bounds the negative-cache TTL).
    pub soa_minimum: Option<u32>,
    /// Whether this outcome was served from cache, for the cache-lookup
    /// metric the admin surface exposes.
    pub cache_hit: bool,
    /// Name of the upstream that produced this answer, for the query-log
    /// line. `None` on a cache hit or when no upstream could be reached.
    pub upstream: Option<String>,
}

/// Resolves a query, recursively expanding CNAMEs, applying the cache, and
/// producing a synthesized answer set (spec.md §4.5, C8).
pub struct FlatteningResolver {
    cache: Arc<TtlCache>,
    inflight: Arc<InFlightMap<Arc<ResolveOutcome>>>,
    health: Arc<HealthMonitor>,
    client: Arc<dyn UpstreamClient>,
    selector_state: SelectorState,
    strategy: SelectionStrategy,
    flattener: FlattenerConfig,
    cache_cfg: CacheConfig,
    in_flight_per_upstream: Vec<AtomicU32>,
}

impl FlatteningResolver {
    pub fn new(
        cache: Arc<TtlCache>,
        health: Arc<HealthMonitor>,
        client: Arc<dyn UpstreamClient>,
        strategy: SelectionStrategy,
        flattener: FlattenerConfig,
        cache_cfg: CacheConfig,
    ) -> Self {
        let count = health.entries().len();
        Self {
            cache,
            inflight: InFlightMap::new(),
            health,
            client,
            selector_state: SelectorState::new(),
            strategy,
            flattener,
            cache_cfg,
            in_flight_per_upstream: (0..count).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Public entry point: resolve `(name, record_type)` as asked by a
    /// client. `name` need not be pre-canonicalized.
    pub async fn resolve(&self, name: &Name, record_type: RecordType) -> Arc<ResolveOutcome> {
        self.resolve_question(name, record_type, 0).await
    }

    /// Boxed because this function recurses: a follower whose leader was
    /// cancelled retries by re-entering, and chain flattening recurses into
    /// this same entry point for each non-terminal CNAME target.
    fn resolve_question<'a>(
        &'a self,
        name: &'a Name,
        record_type: RecordType,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Arc<ResolveOutcome>> + Send + 'a>> {
        Box::pin(async move {
            let q0 = canonicalize(name);
            let key = QueryKey::new(&q0, record_type, hickory_proto::rr::DNSClass::IN);
            let now = SystemTime::now();

            if let Some(entry) = self.cache.get(&key, now) {
                return Arc::new(self.outcome_from_cache(&entry, &q0, now));
            }

            let leader = match self.inflight.join(key.clone()) {
                Lead::Follower(mut rx) => {
                    return match rx.recv().await {
                        Ok(result) => result,
                        Err(_) => self.resolve_question(name, record_type, depth).await,
                    };
                }
                Lead::Leader(guard) => guard,
            };

            let outcome = Arc::new(self.resolve_uncached(&q0, record_type, depth).await);
            self.cache_outcome(&key, &outcome, now);
            leader.complete(Arc::clone(&outcome));
            outcome
        })
    }

    fn outcome_from_cache(&self, entry: &CacheEntry, q0: &Name, now: SystemTime) -> ResolveOutcome {
        let ttl = entry.remaining_ttl(now);
        let answer = entry
            .answer
            .iter()
            .map(|rr| RR {
                owner: q0.clone(),
                record_type: rr.record_type,
                class: rr.class,
                ttl,
                record: rr.rewritten(q0, ttl),
            })
            .collect();
        let response_code = match entry.kind {
            CacheKind::Positive => ResponseCode::NoError,
            CacheKind::Negative => ResponseCode::NXDomain,
        };
        ResolveOutcome { answer, response_code, soa_minimum: None, cache_hit: true, upstream: None }
    }

    async fn resolve_uncached(
        &self,
        q0: &Name,
        record_type: RecordType,
        depth: usize,
    ) -> ResolveOutcome {
        let healthy = self.health.healthy_indices();
        let mut tried: HashSet<usize> = HashSet::new();
        let mut attempts_remaining = self.flattener.max_upstream_retries + 1;

        loop {
            let Some(idx) = self.pick_upstream(&healthy, &tried) else {
                warn!(name = %q0, "no upstream left to try");
                return ResolveOutcome {
                    answer: Vec::new(),
                    response_code: ResponseCode::ServFail,
                    soa_minimum: None,
                    cache_hit: false,
                    upstream: None,
                };
            };
            tried.insert(idx);
            attempts_remaining = attempts_remaining.saturating_sub(1);

            let upstream = &self.health.entries()[idx];
            let metrics = self.health.metrics_for(idx);
            let mut question = hickory_proto::op::Message::new();
            question.set_message_type(hickory_proto::op::MessageType::Query);
            question.set_op_code(hickory_proto::op::OpCode::Query);
            question.set_recursion_desired(true);
            question.add_query(hickory_proto::op::Query::query(q0.clone(), record_type));

            self.in_flight_per_upstream[idx].fetch_add(1, Ordering::Relaxed);
            let result = self
                .client
                .query(upstream, metrics, &question, upstream.timeout())
                .await;
            self.in_flight_per_upstream[idx].fetch_sub(1, Ordering::Relaxed);
            self.health.reevaluate(idx);

            match result {
                ClientResult::Answer(message) => {
                    let rcode = message.response_code();
                    if rcode == ResponseCode::ServFail && attempts_remaining > 0 {
                        continue;
                    }
                    let soa_minimum = soa_minimum(message.name_servers());
                    let answer: Vec<RR> = message
                        .answers()
                        .iter()
                        .cloned()
                        .map(RR::from_record)
                        .collect();

                    if rcode != ResponseCode::NoError {
                        return ResolveOutcome {
                            answer: Vec::new(),
                            response_code: rcode,
                            soa_minimum,
                            cache_hit: false,
                            upstream: Some(upstream.name.clone()),
                        };
                    }

                    if matches!(record_type, RecordType::A | RecordType::AAAA)
                        && has_cname_for(&answer, q0).is_some()
                    {
                        let (flattened, incomplete) = self
                            .flatten(q0, record_type, &answer, depth)
                            .await;
                        let response_code = if flattened.is_empty() && incomplete {
                            ResponseCode::ServFail
                        } else {
                            ResponseCode::NoError
                        };
                        return ResolveOutcome {
                            answer: flattened,
                            response_code,
                            soa_minimum: None,
                            cache_hit: false,
                            upstream: Some(upstream.name.clone()),
                        };
                    }

                    return ResolveOutcome {
                        answer,
                        response_code: ResponseCode::NoError,
                        soa_minimum: None,
                        cache_hit: false,
                        upstream: Some(upstream.name.clone()),
                    };
                }
                ClientResult::Timeout | ClientResult::NetworkError | ClientResult::Malformed => {
                    if attempts_remaining == 0 {
                        return ResolveOutcome {
                            answer: Vec::new(),
                            response_code: ResponseCode::ServFail,
                            soa_minimum: None,
                            cache_hit: false,
                            upstream: Some(upstream.name.clone()),
                        };
                    }
                    continue;
                }
            }
        }
    }

    fn pick_upstream(&self, healthy: &[usize], tried: &HashSet<usize>) -> Option<usize> {
        let untried: Vec<usize> = healthy.iter().copied().filter(|i| !tried.contains(i)).collect();
        if untried.is_empty() {
            return None;
        }
        let candidates: Vec<Candidate> = untried
            .iter()
            .map(|&i| {
                let metrics = self.health.metrics_for(i);
                let entry = &self.health.entries()[i];
                let mean_latency_ms = if metrics.sample_count() >= LATENCY_CONFIDENCE_SAMPLES {
                    metrics
                        .mean_latency()
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0)
                } else {
                    0
                };
                Candidate {
                    index: i,
                    weight: entry.weight,
                    priority: entry.priority,
                    mean_latency_ms,
                    in_flight: self.in_flight_per_upstream[i].load(Ordering::Relaxed),
                }
            })
            .collect();
        Some(select(&candidates, self.strategy, &self.selector_state))
    }

    /// Recursively expand a CNAME chain starting at `q0` (spec.md §4.5
    /// "Flattening algorithm"). Returns the flattened RRs (owner rewritten
    /// to `q0`, TTL set to the minimum across the chain) plus whether the
    /// chain terminated incomplete (loop or recursion-limit hit).
    fn flatten<'a>(
        &'a self,
        q0: &'a Name,
        qtype: RecordType,
        first_answer: &'a [RR],
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = (Vec<RR>, bool)> + Send + 'a>> {
        Box::pin(async move {
            let mut visited: HashSet<Name> = HashSet::new();
            visited.insert(canonicalize(q0));

            let mut queue: VecDeque<Name> = VecDeque::new();
            let mut min_ttl = u32::MAX;
            let mut resolved: Vec<RR> = Vec::new();
            let mut incomplete = false;

            match has_cname_for(first_answer, q0) {
                Some(cname_rr) => {
                    min_ttl = min_ttl.min(cname_rr.ttl);
                    match cname_target(cname_rr) {
                        Some(target) => queue.push_back(target),
                        None => return (Vec::new(), true),
                    }
                }
                None => return (first_answer.to_vec(), false),
            }

            while let Some(target) = queue.pop_front() {
                let tname = canonicalize(&target);
                if visited.contains(&tname) {
                    debug!(name = %q0, target = %tname, "CNAME loop detected");
                    incomplete = true;
                    break;
                }
                visited.insert(tname.clone());
                if visited.len() > self.flattener.max_recursion {
                    incomplete = true;
                    break;
                }

                let direct: Vec<&RR> = first_answer
                    .iter()
                    .filter(|r| r.record_type == qtype && canonicalize(&r.owner) == tname)
                    .collect();
                if !direct.is_empty() {
                    for r in direct {
                        min_ttl = min_ttl.min(r.ttl);
                        resolved.push(r.clone());
                    }
                    continue;
                }

                if let Some(cname_rr) = first_answer
                    .iter()
                    .find(|r| r.record_type == RecordType::CNAME && canonicalize(&r.owner) == tname)
                {
                    min_ttl = min_ttl.min(cname_rr.ttl);
                    match cname_target(cname_rr) {
                        Some(next) => queue.push_back(next),
                        None => {
                            incomplete = true;
                            break;
                        }
                    }
                    continue;
                }

                if depth + 1 > self.flattener.max_recursion {
                    incomplete = true;
                    break;
                }
                let sub = self.resolve_question(&target, qtype, depth + 1).await;
                if sub.response_code == ResponseCode::NoError && !sub.answer.is_empty() {
                    for r in &sub.answer {
                        min_ttl = min_ttl.min(r.ttl);
                        resolved.push(r.clone());
                    }
                } else {
                    incomplete = true;
                }
            }

            if resolved.is_empty() {
                return (Vec::new(), incomplete);
            }

            let final_ttl = min_ttl.min(self.cache_cfg.max_ttl).max(self.cache_cfg.min_ttl);
            let rewritten = resolved
                .iter()
                .map(|r| RR {
                    owner: q0.clone(),
                    record_type: r.record_type,
                    class: r.class,
                    ttl: final_ttl,
                    record: r.rewritten(q0, final_ttl),
                })
                .collect();
            (rewritten, incomplete)
        })
    }

    fn cache_outcome(&self, key: &QueryKey, outcome: &ResolveOutcome, now: SystemTime) {
        match outcome.response_code {
            ResponseCode::NoError if !outcome.answer.is_empty() => {
                let min_ttl = outcome.answer.iter().map(|r| r.ttl).min().unwrap_or(self.cache_cfg.default_ttl);
                let ttl = min_ttl.clamp(self.cache_cfg.min_ttl, self.cache_cfg.max_ttl);
                self.cache
                    .put(key.clone(), CacheEntry::positive(outcome.answer.clone(), ttl, now));
            }
            ResponseCode::NXDomain => {
                let ttl = outcome
                    .soa_minimum
                    .unwrap_or(SERVFAIL_NEGATIVE_TTL_SECS)
                    .min(self.cache_cfg.max_negative_ttl);
                self.cache.put(key.clone(), CacheEntry::negative(ttl, now));
            }
            ResponseCode::ServFail => {
                let ttl = SERVFAIL_NEGATIVE_TTL_SECS.min(self.cache_cfg.max_negative_ttl);
                if ttl > 0 {
                    self.cache.put(key.clone(), CacheEntry::negative(ttl, now));
                }
            }
            _ => {}
        }
    }
}

fn has_cname_for<'a>(answer: &'a [RR], name: &Name) -> Option<&'a RR> {
    let target = canonicalize(name);
    answer
        .iter()
        .find(|r| r.record_type == RecordType::CNAME && canonicalize(&r.owner) == target)
}

fn cname_target(rr: &RR) -> Option<Name> {
    match rr.record.data() {
        Some(RData::CNAME(name)) => Some(name.clone()),
        _ => None,
    }
}

/// Extract the SOA minimum field from a message's authority section, used
/// to bound negative-cache TTLs (spec.md §4.1).
pub fn soa_minimum(records: &[Record]) -> Option<u32> {
    records.iter().find_map(|r| match r.data() {
        Some(RData::SOA(soa)) => Some(soa_minimum_field(soa)),
        _ => None,
    })
}

fn soa_minimum_field(soa: &SOA) -> u32 {
    soa.minimum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_cname_for_matches_canonicalized_name() {
        use std::str::FromStr;
        let name = Name::from_str("www.example.com").unwrap();
        let mut record = Record::new();
        record.set_name(Name::from_str("WWW.Example.com.").unwrap());
        record.set_record_type(RecordType::CNAME);
        record.set_data(Some(RData::CNAME(Name::from_str("cdn.example.net").unwrap())));
        let rr = RR::from_record(record);
        assert!(has_cname_for(&[rr], &name).is_some());
    }
}
