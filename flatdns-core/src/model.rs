use std::time::{Duration, SystemTime};

use hickory_proto::rr::{DNSClass, Name, Record, RecordType};
use serde::{Deserialize, Serialize};

/// Identifies a single question for cache and in-flight coalescing purposes.
///
/// Names are lowercased and stored without a dependence on trailing-dot
/// formatting so that `example.com` and `example.com.` hash identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub name: Name,
    pub record_type: RecordType,
    pub class: DNSClass,
}

impl QueryKey {
    pub fn new(name: &Name, record_type: RecordType, class: DNSClass) -> Self {
        Self {
            name: canonicalize(name),
            record_type,
            class,
        }
    }
}

/// Lowercase and drop the distinction between trailing-dot and bare forms.
pub fn canonicalize(name: &Name) -> Name {
    let mut n = name.clone();
    n.set_fqdn(true);
    Name::from_ascii(n.to_ascii().to_lowercase()).unwrap_or(n)
}

/// One resource record as carried through flattening. Kept deliberately
/// thin — only the fields flattening logic needs to inspect or rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RR {
    pub owner: Name,
    pub record_type: RecordType,
    pub class: DNSClass,
    pub ttl: u32,
    pub record: Record,
}

impl RR {
    pub fn from_record(record: Record) -> Self {
        Self {
            owner: record.name().clone(),
            record_type: record.record_type(),
            class: record.dns_class(),
            ttl: record.ttl(),
            record,
        }
    }

    /// Rewrite the owner name and clamp the TTL to `ttl`, returning a fresh
    /// `hickory_proto::rr::Record` suitable for placing in a response.
    pub fn rewritten(&self, owner: &Name, ttl: u32) -> Record {
        let mut r = self.record.clone();
        r.set_name(owner.clone());
        r.set_ttl(ttl);
        r
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheKind {
    Positive,
    Negative,
}

/// A cached answer, keyed by `QueryKey`. See `spec.md` §3 for the invariants
/// this type must uphold: `expires_at > inserted_at`, and negative entries
/// carry no answer records.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub answer: Vec<RR>,
    pub kind: CacheKind,
    pub inserted_at: SystemTime,
    pub expires_at: SystemTime,
    /// TTL as originally computed, used to re-derive the remaining TTL on
    /// read without re-walking the answer set.
    pub original_ttl: u32,
}

impl CacheEntry {
    pub fn positive(answer: Vec<RR>, ttl: u32, now: SystemTime) -> Self {
        Self {
            answer,
            kind: CacheKind::Positive,
            inserted_at: now,
            expires_at: now + Duration::from_secs(ttl as u64),
            original_ttl: ttl,
        }
    }

    pub fn negative(ttl: u32, now: SystemTime) -> Self {
        Self {
            answer: Vec::new(),
            kind: CacheKind::Negative,
            inserted_at: now,
            expires_at: now + Duration::from_secs(ttl as u64),
            original_ttl: ttl,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    /// TTL remaining as of `now`, counting down from `inserted_at` — never
    /// the original, static value (spec.md §9 "TTL semantics").
    pub fn remaining_ttl(&self, now: SystemTime) -> u32 {
        match self.expires_at.duration_since(now) {
            Ok(remaining) => remaining.as_secs().min(self.original_ttl as u64) as u32,
            Err(_) => 0,
        }
    }
}
