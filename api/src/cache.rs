//! Time-boxed memoization of upstream responses.
//!
//! Entries are written only after a successful, parseable response and are
//! dropped once their TTL passes. A miss never fails: callers always fall
//! through to the network.

use dashmap::DashMap;
use log::debug;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

/// Cache key derived from provider, logical endpoint and the normalized
/// parameter set, so equivalent requests collide regardless of formatting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new<K, V>(provider: &str, endpoint: &str, params: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut normalized: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (normalize(k.as_ref()), normalize(v.as_ref())))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect();
        normalized.sort();
        normalized.dedup();

        let query = normalized
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let endpoint = normalize(endpoint);
        Self(format!(
            "{}|{}|{query}",
            normalize(provider),
            endpoint.trim_matches('/')
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: Value,
    pub expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: DashMap<CacheKey, CacheEntry>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh payload for `key`, or `None` on miss or expiry.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .map(|entry| (entry.is_fresh(now), entry.payload.clone()));

        match hit {
            Some((true, payload)) => Some(payload),
            Some((false, _)) => {
                self.entries.remove_if(key, |_, entry| !entry.is_fresh(Instant::now()));
                None
            }
            None => None,
        }
    }

    /// Store a successful payload. A zero TTL disables caching for the call.
    pub fn set(&self, key: CacheKey, payload: Value, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let entry = CacheEntry { key: key.clone(), payload, expires_at: Instant::now() + ttl };
        self.entries.insert(key, entry);
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        before.saturating_sub(self.entries.len())
    }

    /// Purge expired entries every `every`, forever. Keys that are never
    /// read again are only dropped here.
    pub async fn sweep_every(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = self.purge_expired();
            if purged > 0 {
                debug!("cache: purged {purged} expired entries, {} left", self.len());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
