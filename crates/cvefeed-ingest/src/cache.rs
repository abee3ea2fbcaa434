//! Query result cache
//!
//! Read paths cache serialized query results under versioned keys; a
//! completed ingestion run invalidates the affected prefixes so stale
//! vulnerability data does not outlive a feed refresh. Keys hash their
//! parameters, so callers never worry about key length or characters.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Bump to invalidate every existing cache entry at once.
pub const CACHE_VERSION: &str = "v1";

/// Default entry lifetime
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Build a cache key from a prefix and its query parameters.
///
/// Parameters are sorted by name before hashing, so equivalent queries
/// map to the same key regardless of argument order.
pub fn cache_key(prefix: &str, params: &[(&str, &str)]) -> String {
    let mut sorted: Vec<_> = params.to_vec();
    sorted.sort();

    let mut hasher = Sha256::new();
    for (name, value) in &sorted {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"&");
    }
    let digest = hasher.finalize();

    format!("{}:{}:{:x}", CACHE_VERSION, prefix, digest)
}

/// Cache collaborator
///
/// Failures are swallowed by implementations; a broken cache degrades
/// to a miss, never to an error on the read path.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
    /// Remove one entry.
    async fn delete(&self, key: &str);
    /// Drop every entry whose key starts with `prefix`. Returns the
    /// number of entries removed.
    async fn invalidate_prefix(&self, prefix: &str) -> u64;
    /// Drop every entry of the current cache version.
    async fn invalidate_all(&self) -> u64 {
        self.invalidate_prefix(&format!("{}:", CACHE_VERSION)).await
    }
}

/// Process-local [`ResultCache`] with per-entry TTLs
#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultCache for InMemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired entry: drop it on the way out
        self.entries.write().await.remove(key);
        None
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.to_string(), entry);
    }

    async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    async fn invalidate_prefix(&self, prefix: &str) -> u64 {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        (before - entries.len()) as u64
    }
}

// ============================================================================
// Tests
// ============================================================================
