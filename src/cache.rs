//! Tiered content cache.
//!
//! Three independent LRU+TTL tiers keep page-scoped DOM snapshots, page
//! screenshots, and global API responses from being re-sent by the browser
//! client. Screenshots get half the configured capacity so a burst of large
//! captures cannot evict hot DOM entries. Large payloads are stored
//! zlib-compressed above the configured threshold.

use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::CacheStrategy;

/// Cache tier selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Dom,
    Screenshot,
    Api,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Vec<u8>,
    compressed: bool,
    stored_at_ms: i64,
    hits: u32,
    byte_size: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_size: usize,
    pub hit_rate: f64,
}

struct Tiers {
    dom: LruCache<String, CacheEntry>,
    screenshot: LruCache<String, CacheEntry>,
    api: LruCache<String, CacheEntry>,
}

impl Tiers {
    fn tier_mut(&mut self, content_type: ContentType) -> &mut LruCache<String, CacheEntry> {
        match content_type {
            ContentType::Dom => &mut self.dom,
            ContentType::Screenshot => &mut self.screenshot,
            ContentType::Api => &mut self.api,
        }
    }

    fn total_size(&self) -> usize {
        [&self.dom, &self.screenshot, &self.api]
            .iter()
            .flat_map(|tier| tier.iter())
            .map(|(_, entry)| entry.byte_size)
            .sum()
    }
}

/// Per-session content cache with navigation-aware invalidation.
pub struct ContentCache {
    strategy: CacheStrategy,
    tiers: Mutex<Tiers>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ContentCache {
    pub fn new(strategy: CacheStrategy) -> Self {
        let capacity = |size: usize| NonZeroUsize::new(size.max(1)).expect("non-zero capacity");
        let tiers = Tiers {
            dom: LruCache::new(capacity(strategy.max_size)),
            screenshot: LruCache::new(capacity(strategy.max_size / 2)),
            api: LruCache::new(capacity(strategy.max_size)),
        };
        Self {
            strategy,
            tiers: Mutex::new(tiers),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.strategy.enabled
    }

    pub fn put(&self, content_type: ContentType, key: &str, payload: &str) {
        self.put_at(content_type, key, payload, now_ms());
    }

    fn put_at(&self, content_type: ContentType, key: &str, payload: &str, now: i64) {
        let raw = payload.as_bytes();
        let compress =
            self.strategy.compression_enabled && raw.len() > self.strategy.compression_threshold;
        let stored = if compress {
            compress_bytes(raw)
        } else {
            raw.to_vec()
        };
        let entry = CacheEntry {
            byte_size: stored.len(),
            payload: stored,
            compressed: compress,
            stored_at_ms: now,
            hits: 0,
        };

        let mut tiers = self.tiers.lock();
        if let Some((old_key, _)) = tiers.tier_mut(content_type).push(key.to_string(), entry) {
            // push returns the displaced entry; replacing the same key is
            // not an eviction.
            if old_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get(&self, content_type: ContentType, key: &str) -> Option<String> {
        self.get_at(content_type, key, now_ms())
    }

    fn get_at(&self, content_type: ContentType, key: &str, now: i64) -> Option<String> {
        let ttl = self.strategy.ttl_ms as i64;
        let mut tiers = self.tiers.lock();
        let tier = tiers.tier_mut(content_type);

        // Age of exactly the TTL counts as expired.
        let expired = match tier.peek(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => now - entry.stored_at_ms >= ttl,
        };
        if expired {
            tier.pop(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let Some(entry) = tier.get_mut(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        entry.hits += 1;
        let payload = if entry.compressed {
            decompress_bytes(&entry.payload)
        } else {
            entry.payload.clone()
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        String::from_utf8(payload).ok()
    }

    /// Apply the navigation invalidation rule: same host clears DOM only,
    /// a host change clears every tier, the first navigation clears DOM only.
    pub fn invalidate_for_navigation(&self, old_url: Option<&str>, new_url: &str) {
        let same_host = match old_url {
            None => true,
            Some(old) => hosts_match(old, new_url),
        };
        let mut tiers = self.tiers.lock();
        tiers.dom.clear();
        if !same_host {
            tiers.screenshot.clear();
            tiers.api.clear();
        }
    }

    pub fn clear_all(&self) {
        let mut tiers = self.tiers.lock();
        tiers.dom.clear();
        tiers.screenshot.clear();
        tiers.api.clear();
    }

    pub fn len(&self, content_type: ContentType) -> usize {
        self.tiers.lock().tier_mut(content_type).len()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            total_size: self.tiers.lock().total_size(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn hosts_match(a: &str, b: &str) -> bool {
    match (host_of(a), host_of(b)) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

fn host_of(value: &str) -> Option<String> {
    Url::parse(value)
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_ascii_lowercase()))
}

fn compress_bytes(src: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    let _ = encoder.write_all(src);
    encoder.finish().unwrap_or_else(|_| src.to_vec())
}

fn decompress_bytes(src: &[u8]) -> Vec<u8> {
    let mut decoder = ZlibDecoder::new(src);
    let mut out = Vec::new();
    if decoder.read_to_end(&mut out).is_err() {
        return src.to_vec();
    }
    out
}
