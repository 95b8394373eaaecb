//! TTL- and size-bounded cache for idempotent tool reads.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::{Error, Result};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
    /// Position in recency order; larger is newer.
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
    bytes: usize,
}

impl Inner {
    fn size_of(key: &str, value: &str) -> usize {
        key.len() + value.len()
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        self.bytes -= Self::size_of(key, &entry.value);
        Some(entry)
    }

    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }
}

/// Key/value store with per-entry TTL and a total byte budget.
///
/// Size is accounted as key length plus value length. Inserting evicts the
/// oldest entries until the new one fits.
///
/// ```
/// use lanes::config::CacheConfig;
/// use lanes::guard::cache::TtlCache;
///
/// let cache = TtlCache::new(&CacheConfig { ttl_secs: 60, max_bytes: 1024 });
/// cache.set("read_file:src/lib.rs", "pub mod core;").unwrap();
/// assert_eq!(cache.get("read_file:src/lib.rs").as_deref(), Some("pub mod core;"));
/// cache.invalidate("src/lib.rs");
/// assert!(cache.get("read_file:src/lib.rs").is_none());
/// ```
#[derive(Debug)]
pub struct TtlCache {
    ttl: Duration,
    max_bytes: usize,
    inner: Mutex<Inner>,
}

impl TtlCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_ttl(Duration::from_secs(config.ttl_secs), config.max_bytes)
    }

    pub fn with_ttl(ttl: Duration, max_bytes: usize) -> Self {
        Self {
            ttl,
            max_bytes,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace `key`.
    ///
    /// # Errors
    /// `CacheEntryTooLarge` when the entry alone exceeds the byte budget;
    /// nothing is evicted in that case.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let size = Inner::size_of(key, value);
        if size > self.max_bytes {
            return Err(Error::CacheEntryTooLarge {
                size,
                max: self.max_bytes,
            });
        }

        let mut inner = self.lock();
        inner.remove(key);
        while inner.bytes + size > self.max_bytes {
            let oldest = match inner.order.first_key_value() {
                Some((_, k)) => k.clone(),
                None => break,
            };
            inner.remove(&oldest);
        }

        let seq = inner.bump();
        inner.order.insert(seq, key.to_string());
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + self.ttl,
                seq,
            },
        );
        inner.bytes += size;
        Ok(())
    }

    /// Look up `key`, purging expired entries first. A hit becomes the newest entry.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.lock();
        inner.purge_expired(Instant::now());

        let old_seq = inner.entries.get(key)?.seq;
        let seq = inner.bump();
        inner.order.remove(&old_seq);
        inner.order.insert(seq, key.to_string());
        let entry = inner.entries.get_mut(key)?;
        entry.seq = seq;
        Some(entry.value.clone())
    }

    /// Remove every entry whose key or value contains `needle`. Returns the count.
    pub fn invalidate(&self, needle: &str) -> usize {
        let mut inner = self.lock();
        let matching: Vec<String> = inner
            .entries
            .iter()
            .filter(|(k, e)| k.contains(needle) || e.value.contains(needle))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &matching {
            inner.remove(key);
        }
        matching.len()
    }

    pub fn clear(&self) {
        *self.lock() = Inner::default();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.lock().bytes
    }
}
