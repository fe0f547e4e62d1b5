//! Answer cache.
//!
//! The [`Cache`] plugin memoizes replies produced further down the chain, keyed by question
//! name, question type and the DO bit. Successful answers and denials (`NXDOMAIN`, or
//! `NOERROR` without answers) live in two separately sized [`Pool`]s.
//!
//! A fresh hit is rebuilt into a reply for the current request, shaped to the size this client
//! negotiated, and written without running the rest of the chain. A miss (or an expired hit)
//! runs the rest of the chain with a writer that stores the reply on its way back out.
//!
//! ```json
//! {
//!   "cache": {
//!     "zones": [ "example.org." ],
//!     "capacity": 10000,
//!     "negative_capacity": 10000,
//!     "min_ttl": 5,
//!     "max_ttl": 3600,
//!     "negative_max_ttl": 1800
//!   }
//! }
//! ```

use crate::config::CacheConfig;
use crate::error::Error;
use crate::plugin::{Context, Next, Outcome, Plugin, ResponseWriter};
use crate::request::RequestState;
use crate::zones::Zones;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use trust_dns_server::client::op::{Message, ResponseCode};
use trust_dns_server::client::rr::{LowerName, RData, Record, RecordType};

pub mod item;
pub mod pool;

pub use item::{Item, Key};
pub use pool::Pool;

/// How a reply is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// A successful answer, stored in the positive pool.
    Success,
    /// `NXDOMAIN` or `NOERROR` without answers, stored in the negative pool.
    Denial,
    /// Errors and truncated replies aren't cached.
    Uncacheable,
}

impl Kind {
    pub fn of(msg: &Message) -> Self {
        if msg.truncated() {
            return Self::Uncacheable;
        }
        match msg.response_code() {
            ResponseCode::NXDomain => Self::Denial,
            ResponseCode::NoError if msg.answers().is_empty() => Self::Denial,
            ResponseCode::NoError => Self::Success,
            _ => Self::Uncacheable,
        }
    }
}

pub struct Cache {
    zones: Zones,
    positive: Pool,
    negative: Pool,
    min_ttl: Duration,
    max_ttl: Duration,
    negative_max_ttl: Duration,
}

impl Cache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            zones: config.zones.clone(),
            positive: Pool::new(config.capacity),
            negative: Pool::new(config.negative_capacity),
            min_ttl: config.min_ttl,
            max_ttl: config.max_ttl,
            negative_max_ttl: config.negative_max_ttl,
        }
    }

    /// Look up a cached reply, returning it along with whether it has expired.
    pub fn lookup(
        &self,
        name: &LowerName,
        query_type: RecordType,
        dnssec_ok: bool,
    ) -> Option<(Arc<Item>, bool)> {
        self.lookup_at(name, query_type, dnssec_ok, Instant::now())
    }

    /// Like [`Cache::lookup`], judging expiry at `now`.
    ///
    /// Denials are checked before successful answers. An expired denial only comes back when
    /// the positive pool has nothing for the key.
    pub fn lookup_at(
        &self,
        name: &LowerName,
        query_type: RecordType,
        dnssec_ok: bool,
        now: Instant,
    ) -> Option<(Arc<Item>, bool)> {
        let key = Key::new(name, query_type, dnssec_ok);
        let negative = self.negative.get(&key);
        if let Some(item) = negative.as_ref().filter(|item| !item.is_expired(now)) {
            return Some((item.clone(), false));
        }
        self.positive.get(&key).or(negative).map(|item| {
            let expired = item.is_expired(now);
            (item, expired)
        })
    }

    /// Cache `msg` for `ttl`, in the negative pool if it denies the name or type exists and in
    /// the positive pool otherwise. Any entry for the same key in the other pool is dropped.
    pub fn store(
        &self,
        name: &LowerName,
        query_type: RecordType,
        dnssec_ok: bool,
        msg: &Message,
        ttl: Duration,
    ) {
        self.store_at(name, query_type, dnssec_ok, msg, ttl, Instant::now());
    }

    /// Like [`Cache::store`], with the item's lifetime starting at `now`.
    pub fn store_at(
        &self,
        name: &LowerName,
        query_type: RecordType,
        dnssec_ok: bool,
        msg: &Message,
        ttl: Duration,
        now: Instant,
    ) {
        let key = Key::new(name, query_type, dnssec_ok);
        let (pool, other) = match Kind::of(msg) {
            Kind::Denial => (&self.negative, &self.positive),
            _ => (&self.positive, &self.negative),
        };
        other.remove(&key);
        pool.insert(key, msg, ttl, now);
    }

    /// How long to cache `msg`, or `None` if it shouldn't be cached.
    ///
    /// Successful answers live for their smallest record TTL. Denials live for the SOA
    /// minimum of the authority section (bounded by the SOA record's own TTL), or the minimum
    /// TTL without one. Both are clamped to the configured range.
    pub fn ttl_for(&self, msg: &Message) -> Option<Duration> {
        match Kind::of(msg) {
            Kind::Uncacheable => None,
            Kind::Success => {
                let ttl = msg
                    .answers()
                    .iter()
                    .chain(msg.name_servers())
                    .map(Record::ttl)
                    .min()
                    .map_or(self.min_ttl, |ttl| Duration::from_secs(ttl.into()));
                Some(ttl.clamp(self.min_ttl, self.max_ttl.max(self.min_ttl)))
            }
            Kind::Denial => {
                let ttl = msg
                    .name_servers()
                    .iter()
                    .find_map(|record| match record.data() {
                        Some(RData::SOA(soa)) => Some(record.ttl().min(soa.minimum())),
                        _ => None,
                    })
                    .map_or(self.min_ttl, |ttl| Duration::from_secs(ttl.into()));
                Some(ttl.clamp(self.min_ttl, self.negative_max_ttl.max(self.min_ttl)))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.positive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positive.is_empty()
    }

    pub fn negative_len(&self) -> usize {
        self.negative.len()
    }
}

#[async_trait::async_trait]
impl Plugin for Cache {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn serve(
        &self,
        ctx: &Context,
        state: &RequestState,
        writer: &mut dyn ResponseWriter,
        next: Next<'_>,
    ) -> Result<Outcome, Error> {
        if self.zones.matches(state.name()).is_none() {
            return next.run(ctx, state, writer).await;
        }

        let now = Instant::now();
        match self.lookup_at(state.name(), state.query_type(), state.dnssec_ok(), now) {
            Some((item, false)) => {
                debug!(name = %state.name(), query_type = %state.query_type(), "cache hit");
                let (reply, _) = state.shape(item.to_reply(state, now));
                let response_code = reply.response_code();
                writer.write_msg(reply)?;
                return Ok(Outcome::Written(response_code));
            }
            Some((_, true)) => {
                trace!(name = %state.name(), query_type = %state.query_type(), "cache expired");
            }
            None => {
                trace!(name = %state.name(), query_type = %state.query_type(), "cache miss");
            }
        }

        let mut caching = CachingWriter {
            cache: self,
            state,
            inner: writer,
        };
        next.run(ctx, state, &mut caching).await
    }
}

/// Stores every reply written through it under the question of the request it answers.
struct CachingWriter<'a> {
    cache: &'a Cache,
    state: &'a RequestState,
    inner: &'a mut dyn ResponseWriter,
}

impl ResponseWriter for CachingWriter<'_> {
    fn write_msg(&mut self, msg: Message) -> Result<(), Error> {
        if let Some(ttl) = self.cache.ttl_for(&msg) {
            self.cache.store(
                self.state.name(),
                self.state.query_type(),
                self.state.dnssec_ok(),
                &msg,
                ttl,
            );
        }
        self.inner.write_msg(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Chain, Recorder};
    use crate::request::tests::state;
    use crate::request::Transport;
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trust_dns_proto::rr::rdata::SOA;
    use trust_dns_server::client::rr::Name;

    fn config() -> CacheConfig {
        CacheConfig {
            zones: Zones::from(vec![LowerName::from(Name::root())]),
            capacity: 10,
            negative_capacity: 10,
            min_ttl: Duration::from_secs(5),
            max_ttl: Duration::from_secs(3600),
            negative_max_ttl: Duration::from_secs(1800),
        }
    }

    fn name(s: &str) -> LowerName {
        LowerName::from_str(s).unwrap()
    }

    fn answer(ttl: u32) -> Message {
        let mut msg = Message::new();
        msg.add_answer(Record::from_rdata(
            Name::from_str("www.example.org.").unwrap(),
            ttl,
            RData::A(Ipv4Addr::new(192, 0, 2, 1)),
        ));
        msg
    }

    fn denial(soa_ttl: u32, minimum: u32) -> Message {
        let mut msg = Message::new();
        msg.set_response_code(ResponseCode::NXDomain);
        msg.add_name_server(Record::from_rdata(
            Name::from_str("example.org.").unwrap(),
            soa_ttl,
            RData::SOA(SOA::new(
                Name::from_str("ns1.example.org.").unwrap(),
                Name::from_str("admin.example.org.").unwrap(),
                1,
                86_400,
                7_200,
                3_600_000,
                minimum,
            )),
        ));
        msg
    }

    #[test]
    fn test_freshness() {
        let cache = Cache::new(&config());
        let t0 = Instant::now();
        let ttl = Duration::from_secs(30);
        let www = name("www.example.org.");
        cache.store_at(&www, RecordType::A, false, &answer(30), ttl, t0);

        let (_, expired) = cache.lookup_at(&www, RecordType::A, false, t0).unwrap();
        assert!(!expired);
        let (_, expired) = cache
            .lookup_at(&www, RecordType::A, false, t0 + Duration::from_secs(29))
            .unwrap();
        assert!(!expired);
        let (_, expired) = cache.lookup_at(&www, RecordType::A, false, t0 + ttl).unwrap();
        assert!(expired);
        let (_, expired) = cache
            .lookup_at(&www, RecordType::A, false, t0 + Duration::from_secs(31))
            .unwrap();
        assert!(expired);
    }

    #[test]
    fn test_key_shape() {
        let cache = Cache::new(&config());
        let www = name("www.example.org.");
        cache.store(&www, RecordType::A, false, &answer(30), Duration::from_secs(30));

        assert!(cache.lookup(&www, RecordType::A, false).is_some());
        assert!(cache
            .lookup(&name("WWW.Example.org."), RecordType::A, false)
            .is_some());
        assert!(cache.lookup(&www, RecordType::A, true).is_none());
        assert!(cache.lookup(&www, RecordType::AAAA, false).is_none());
    }

    #[test]
    fn test_pools_by_kind() {
        let cache = Cache::new(&config());
        let ttl = Duration::from_secs(30);
        cache.store(&name("www.example.org."), RecordType::A, false, &answer(30), ttl);
        cache.store(&name("nope.example.org."), RecordType::A, false, &denial(300, 60), ttl);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.negative_len(), 1);
    }

    #[test]
    fn test_negative_checked_first() {
        let cache = Cache::new(&config());
        let t0 = Instant::now();
        let www = name("www.example.org.");
        cache.store_at(&www, RecordType::A, false, &answer(30), Duration::from_secs(30), t0);
        cache.store_at(&www, RecordType::A, false, &denial(300, 60), Duration::from_secs(30), t0);

        let (item, _) = cache.lookup_at(&www, RecordType::A, false, t0).unwrap();
        assert_eq!(item.response_code(), ResponseCode::NXDomain);
    }

    #[test]
    fn test_expired_denial_falls_through() {
        let cache = Cache::new(&config());
        let t0 = Instant::now();
        let new = name("new.example.org.");
        cache.store_at(&new, RecordType::A, false, &denial(30, 30), Duration::from_secs(30), t0);

        let (item, expired) = cache
            .lookup_at(&new, RecordType::A, false, t0 + Duration::from_secs(40))
            .unwrap();
        assert_eq!(item.response_code(), ResponseCode::NXDomain);
        assert!(expired);

        // The name is created after the denial expired.
        let t1 = t0 + Duration::from_secs(40);
        cache.store_at(&new, RecordType::A, false, &answer(300), Duration::from_secs(300), t1);
        assert_eq!(cache.negative_len(), 0);

        let (item, expired) = cache
            .lookup_at(&new, RecordType::A, false, t1 + Duration::from_secs(1))
            .unwrap();
        assert_eq!(item.response_code(), ResponseCode::NoError);
        assert!(!expired);
    }

    #[test]
    fn test_expired_denial_does_not_hide_answer() {
        let cache = Cache::new(&config());
        let t0 = Instant::now();
        let key = Key::new(&name("www.example.org."), RecordType::A, false);
        cache
            .negative
            .insert(key.clone(), &denial(30, 30), Duration::from_secs(30), t0);
        cache
            .positive
            .insert(key, &answer(300), Duration::from_secs(300), t0);

        let www = name("www.example.org.");
        let (item, _) = cache.lookup_at(&www, RecordType::A, false, t0).unwrap();
        assert_eq!(item.response_code(), ResponseCode::NXDomain);

        let (item, expired) = cache
            .lookup_at(&www, RecordType::A, false, t0 + Duration::from_secs(31))
            .unwrap();
        assert_eq!(item.response_code(), ResponseCode::NoError);
        assert!(!expired);
    }

    #[test]
    fn test_ttl_for() {
        let cache = Cache::new(&config());
        assert_eq!(cache.ttl_for(&answer(120)), Some(Duration::from_secs(120)));
        assert_eq!(cache.ttl_for(&answer(1)), Some(Duration::from_secs(5)));
        assert_eq!(
            cache.ttl_for(&answer(86_400)),
            Some(Duration::from_secs(3600))
        );

        assert_eq!(
            cache.ttl_for(&denial(300, 60)),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            cache.ttl_for(&denial(30, 172_800)),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            cache.ttl_for(&denial(86_400, 172_800)),
            Some(Duration::from_secs(1800))
        );

        let mut servfail = Message::new();
        servfail.set_response_code(ResponseCode::ServFail);
        assert_eq!(cache.ttl_for(&servfail), None);

        let mut truncated = answer(120);
        truncated.set_truncated(true);
        assert_eq!(cache.ttl_for(&truncated), None);
    }

    #[test]
    fn test_to_reply_ages_ttl() {
        let cache = Cache::new(&config());
        let t0 = Instant::now();
        let www = name("www.example.org.");
        cache.store_at(&www, RecordType::A, false, &answer(300), Duration::from_secs(300), t0);

        let state = state("www.example.org.", RecordType::A, Transport::Udp);
        let (item, _) = cache.lookup_at(&www, RecordType::A, false, t0).unwrap();
        let reply = item.to_reply(&state, t0 + Duration::from_secs(100));
        assert_eq!(reply.id(), 4242);
        assert_eq!(reply.queries().len(), 1);
        assert_eq!(reply.answers()[0].ttl(), 200);
    }

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Plugin for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn serve(
            &self,
            _ctx: &Context,
            state: &RequestState,
            writer: &mut dyn ResponseWriter,
            _next: Next<'_>,
        ) -> Result<Outcome, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut reply = state.reply();
            reply.add_answer(Record::from_rdata(
                state.name().into(),
                300,
                RData::A(Ipv4Addr::new(192, 0, 2, 7)),
            ));
            writer.write_msg(reply)?;
            Ok(Outcome::Written(ResponseCode::NoError))
        }
    }

    #[tokio::test]
    async fn test_hit_bypasses_chain() {
        let counting = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let chain = Chain::new(vec![Arc::new(Cache::new(&config())), counting.clone()]);
        let state = state("www.example.org.", RecordType::A, Transport::Udp);

        for _ in 0..3 {
            let mut recorder = Recorder::default();
            chain.handle(&Context::default(), &state, &mut recorder).await;
            let reply = recorder.take().unwrap();
            assert_eq!(reply.answers().len(), 1);
        }
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_outside_zones_not_cached() {
        let counting = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let mut config = config();
        config.zones = Zones::from(vec![name("example.net.")]);
        let cache = Arc::new(Cache::new(&config));
        let chain = Chain::new(vec![cache.clone(), counting.clone()]);
        let state = state("www.example.org.", RecordType::A, Transport::Udp);

        for _ in 0..2 {
            let mut recorder = Recorder::default();
            chain.handle(&Context::default(), &state, &mut recorder).await;
        }
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }
}
