use crate::request::RequestState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use trust_dns_server::client::op::{Message, ResponseCode};
use trust_dns_server::client::rr::{LowerName, Record, RecordType};

/// The query shape a cached reply answers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    name: LowerName,
    query_type: RecordType,
    dnssec_ok: bool,
}

impl Key {
    pub fn new(name: &LowerName, query_type: RecordType, dnssec_ok: bool) -> Self {
        Self {
            name: name.clone(),
            query_type,
            dnssec_ok,
        }
    }
}

/// A cached reply.
///
/// Only the parts of a reply that don't depend on the request are kept: the response code,
/// the AA/RA flags and the record sections. The OPT record and the question are rebuilt for
/// each request by [`Item::to_reply`].
#[derive(Debug)]
pub struct Item {
    response_code: ResponseCode,
    authoritative: bool,
    recursion_available: bool,
    answers: Vec<Record>,
    name_servers: Vec<Record>,
    additionals: Vec<Record>,
    origin: Instant,
    ttl: Duration,
    hits: AtomicU64,
    last_access: AtomicU64,
}

impl Item {
    pub(super) fn new(msg: &Message, ttl: Duration, origin: Instant, tick: u64) -> Self {
        Self {
            response_code: msg.response_code(),
            authoritative: msg.authoritative(),
            recursion_available: msg.recursion_available(),
            answers: msg.answers().to_vec(),
            name_servers: msg.name_servers().to_vec(),
            additionals: msg.additionals().to_vec(),
            origin,
            ttl,
            hits: AtomicU64::new(0),
            last_access: AtomicU64::new(tick),
        }
    }

    /// True once `ttl` has elapsed since the item was stored.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.origin) >= self.ttl
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn response_code(&self) -> ResponseCode {
        self.response_code
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Rebuild a reply to `state` from the cached sections, with every record's TTL reduced by
    /// the time the item has spent in the cache.
    pub fn to_reply(&self, state: &RequestState, now: Instant) -> Message {
        let age = u32::try_from(now.saturating_duration_since(self.origin).as_secs())
            .unwrap_or(u32::MAX);
        let mut reply = state.reply();
        reply
            .set_response_code(self.response_code)
            .set_authoritative(self.authoritative)
            .set_recursion_available(self.recursion_available);
        reply.insert_answers(aged(&self.answers, age));
        reply.insert_name_servers(aged(&self.name_servers, age));
        reply.insert_additionals(aged(&self.additionals, age));
        reply
    }

    pub(super) fn touch(&self, tick: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.last_access.store(tick, Ordering::Relaxed);
    }

    /// Eviction score. The item with the lowest score is evicted first.
    pub(super) fn score(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.last_access.load(Ordering::Relaxed),
        )
    }
}

fn aged(records: &[Record], age: u32) -> Vec<Record> {
    records
        .iter()
        .map(|record| {
            let mut record = record.clone();
            record.set_ttl(record.ttl().saturating_sub(age));
            record
        })
        .collect()
}
