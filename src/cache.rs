//! DNS answer caching with stale reads
//!
//! A bounded LRU keyed by the question. Unlike a plain TTL cache, expired
//! entries are still returned together with their expiry time so the
//! resolver can serve them stale while a background refresh runs.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use lru::LruCache;

use crate::msg;

/// Default maximum number of cache entries
pub const DEFAULT_MAX_ENTRIES: usize = 4096;

/// A cached DNS response
#[derive(Debug, Clone)]
struct CacheEntry {
    msg: Message,
    expires_at: Instant,
}

/// TTL-aware LRU cache of DNS responses
pub struct DnsCache {
    cache: LruCache<String, CacheEntry>,
}

impl DnsCache {
    /// Create a cache holding up to `max_entries` responses.
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries)
            .unwrap_or(NonZeroUsize::new(DEFAULT_MAX_ENTRIES).expect("nonzero default"));
        Self {
            cache: LruCache::new(cap),
        }
    }

    /// Look up a response, returning it together with its expiry time.
    ///
    /// Expired entries are returned too; the caller decides whether to
    /// serve them stale.
    pub fn get_with_expire(&mut self, key: &str) -> Option<(Message, Instant)> {
        self.cache
            .get(key)
            .map(|entry| (entry.msg.clone(), entry.expires_at))
    }

    /// Insert a response under the question key.
    ///
    /// OPT records are stripped first, and the entry expires after the
    /// minimum TTL across all sections. Responses without any TTL-bearing
    /// record are not cached.
    pub fn put(&mut self, key: &str, msg: &Message) {
        let mut msg = msg.clone();
        msg::strip_opt(&mut msg);

        let Some(ttl) = msg::min_ttl(&msg) else {
            return;
        };

        let entry = CacheEntry {
            msg,
            expires_at: Instant::now() + Duration::from_secs(u64::from(ttl)),
        };
        self.cache.put(key.to_string(), entry);
    }

    /// Drop every entry.
    pub fn flush(&mut self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
