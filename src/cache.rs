//! Fingerprint-keyed result cache with TTL eviction.
//!
//! Keys are the hex MD5 of the canonical JSON encoding of a proxy's secret
//! configuration, so two descriptors with the same secrets share one entry
//! regardless of display name. serde_json orders object keys, which makes
//! the encoding canonical under key permutation.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::proxy::{MeasuredProxy, ProxyDescriptor, SecretConfig};

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Cache of measurement results. Implementations must be safe for
/// concurrent readers and writers.
pub trait ResultCache: Send + Sync {
    fn get(&self, key: &str) -> Option<MeasuredProxy>;
    fn set(&self, key: &str, result: MeasuredProxy);
    fn generate_key(&self, descriptor: &ProxyDescriptor) -> String {
        fingerprint(&descriptor.secret_config).unwrap_or_else(|| descriptor.name.clone())
    }
    fn close(&self);
}

/// Hex MD5 of the canonical JSON encoding of a secret configuration.
pub fn fingerprint(config: &SecretConfig) -> Option<String> {
    let bytes = serde_json::to_vec(config).ok()?;
    Some(format!("{:x}", md5::compute(bytes)))
}

struct CacheEntry {
    result: MeasuredProxy,
    expires_at: Instant,
}

/// In-process TTL cache. A background sweeper ticks at the TTL period and
/// drops expired entries; lookups also evict lazily.
pub struct MemoryCache {
    storage: DashMap<String, CacheEntry>,
    ttl: Duration,
    stop: CancellationToken,
}

impl MemoryCache {
    pub fn new() -> Arc<Self> {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Arc<Self> {
        let cache = Arc::new(MemoryCache {
            storage: DashMap::new(),
            ttl,
            stop: CancellationToken::new(),
        });
        cache.clone().start_sweeper();
        cache
    }

    fn start_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.ttl);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = self.stop.cancelled() => break,
                    _ = interval.tick() => self.sweep(),
                }
            }
        });
    }

    fn sweep(&self) {
        let now = Instant::now();
        self.storage.retain(|_, entry| entry.expires_at > now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.storage.len()
    }
}

impl ResultCache for MemoryCache {
    fn get(&self, key: &str) -> Option<MeasuredProxy> {
        if let Some(entry) = self.storage.get(key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.result.clone());
            }
            drop(entry);
            self.storage.remove(key);
        }
        None
    }

    fn set(&self, key: &str, result: MeasuredProxy) {
        self.storage.insert(
            key.to_string(),
            CacheEntry {
                result,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    fn close(&self) {
        // The process singleton stays alive; see default_cache().
        if let Some(singleton) = SINGLETON.get() {
            if std::ptr::eq(self, singleton.as_ref()) {
                return;
            }
        }
        self.stop.cancel();
    }
}

static SINGLETON: once_cell::sync::OnceCell<Arc<MemoryCache>> = once_cell::sync::OnceCell::new();

/// Process-wide cache shared by runs that do not bring their own. Closing
/// it is a no-op so one consumer cannot shut it down for the others.
pub fn default_cache() -> Arc<MemoryCache> {
    SINGLETON.get_or_init(MemoryCache::new).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyResult;

    fn measured(name: &str, config: SecretConfig) -> MeasuredProxy {
        MeasuredProxy {
            result: ProxyResult::named(name),
            secret_config: config,
        }
    }

    fn config(pairs: &[(&str, &str)]) -> SecretConfig {
        let mut m = SecretConfig::new();
        for (k, v) in pairs {
            m.insert(k.to_string(), serde_json::json!(v));
        }
        m
    }

    #[test]
    fn test_fingerprint_stable_under_key_order() {
        let a = config(&[("server", "1.2.3.4"), ("type", "ss"), ("name", "a")]);
        let mut b = SecretConfig::new();
        b.insert("name".into(), serde_json::json!("a"));
        b.insert("type".into(), serde_json::json!("ss"));
        b.insert("server".into(), serde_json::json!("1.2.3.4"));
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_differs_on_content() {
        let a = config(&[("server", "1.2.3.4")]);
        let b = config(&[("server", "1.2.3.5")]);
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[tokio::test]
    async fn test_get_set_roundtrip() {
        let cache = MemoryCache::with_ttl(Duration::from_secs(60));
        let cfg = config(&[("server", "s")]);
        let key = fingerprint(&cfg).unwrap();
        assert!(cache.get(&key).is_none());
        cache.set(&key, measured("a", cfg));
        let hit = cache.get(&key).unwrap();
        assert_eq!(hit.result.name, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = MemoryCache::with_ttl(Duration::from_millis(50));
        let cfg = config(&[("server", "s")]);
        let key = fingerprint(&cfg).unwrap();
        cache.set(&key, measured("a", cfg));
        assert!(cache.get(&key).is_some());

        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(cache.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_close_stops_owned_cache_only() {
        let cache = MemoryCache::with_ttl(Duration::from_secs(1));
        cache.close();
        assert!(cache.stop.is_cancelled());

        let shared = default_cache();
        shared.close();
        assert!(!shared.stop.is_cancelled());
        // Still usable after close.
        let cfg = config(&[("k", "v")]);
        let key = fingerprint(&cfg).unwrap();
        shared.set(&key, measured("x", cfg));
        assert_eq!(shared.len() >= 1, true);
    }
}
