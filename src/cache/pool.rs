use super::item::{Item, Key};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use trust_dns_server::client::op::Message;

/// A bounded pool of cached replies.
///
/// Reads go straight to the concurrent map and record the hit with atomic counters. Inserts
/// and evictions are serialised by a write gate so that two inserts can't both see room for
/// one more item.
pub struct Pool {
    items: DashMap<Key, Arc<Item>>,
    capacity: usize,
    clock: AtomicU64,
    gate: Mutex<()>,
}

impl Pool {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: DashMap::with_capacity(capacity.min(65_536)),
            capacity,
            clock: AtomicU64::new(0),
            gate: Mutex::new(()),
        }
    }

    /// Look up `key`, counting the access towards the item's eviction score.
    pub fn get(&self, key: &Key) -> Option<Arc<Item>> {
        let item = self.items.get(key)?.value().clone();
        item.touch(self.tick());
        Some(item)
    }

    /// Store `msg` under `key` for `ttl`, evicting to stay within capacity. Expired items are
    /// purged before any live item is evicted; among live items the least used, and then the
    /// least recently used, goes first.
    pub fn insert(&self, key: Key, msg: &Message, ttl: Duration, now: Instant) {
        if self.capacity == 0 {
            return;
        }
        let item = Arc::new(Item::new(msg, ttl, now, self.tick()));

        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.items.contains_key(&key) && self.items.len() >= self.capacity {
            self.items.retain(|_, item| !item.is_expired(now));
            while self.items.len() >= self.capacity {
                let Some(victim) = self.victim() else {
                    break;
                };
                self.items.remove(&victim);
            }
        }
        self.items.insert(key, item);
    }

    pub fn remove(&self, key: &Key) {
        self.items.remove(key);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn victim(&self) -> Option<Key> {
        self.items
            .iter()
            .min_by_key(|entry| entry.value().score())
            .map(|entry| entry.key().clone())
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }
}
