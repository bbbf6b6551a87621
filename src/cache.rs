use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// A TTL cache with per-key single-flight: concurrent misses on the same key
/// collapse into one upstream call. A timed-out or failed fetch returns the
/// caller's default without populating the cache.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (V, Instant)>>,
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn fresh(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock().await;
        entries.get(key).and_then(|(v, acquired)| {
            if acquired.elapsed() < self.ttl {
                Some(v.clone())
            } else {
                None
            }
        })
    }

    async fn key_lock(&self, key: &K) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Returns the cached value if fresh; otherwise fetches exactly once per
    /// key among concurrent callers, via `fetch`, propagating the upstream's
    /// `Err` (timeout included) to the caller rather than hiding it behind a
    /// default. A failed fetch never populates the cache.
    async fn fetch_result<F, Fut>(&self, key: K, fetch: F) -> anyhow::Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        if let Some(v) = self.fresh(&key).await {
            return Ok(v);
        }

        let key_lock = self.key_lock(&key).await;
        let _guard = key_lock.lock().await;

        // Re-check inside the lock: another caller may have just populated it.
        if let Some(v) = self.fresh(&key).await {
            return Ok(v);
        }

        match tokio::time::timeout(UPSTREAM_TIMEOUT, fetch()).await {
            Ok(Ok(value)) => {
                let mut entries = self.entries.lock().await;
                entries.insert(key, (value.clone(), Instant::now()));
                Ok(value)
            }
            Ok(Err(e)) => {
                log::warn!("[CACHE] upstream fetch failed: {e}");
                Err(e)
            }
            Err(_) => {
                log::warn!("[CACHE] upstream fetch timed out");
                Err(anyhow::anyhow!("upstream fetch timed out"))
            }
        }
    }

    /// Returns the cached value if fresh; otherwise fetches exactly once per
    /// key among concurrent callers, via `fetch`, falling back to `default`
    /// on timeout or error. Use this where the caller has a safe default and
    /// doesn't need to distinguish "upstream failed" from "upstream returned
    /// this value" (follower balances, open-order metadata).
    pub async fn get_or_fetch<F, Fut>(&self, key: K, default: V, fetch: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        self.fetch_result(key, fetch).await.unwrap_or(default)
    }

    /// Like `get_or_fetch`, but surfaces the fetch failure instead of masking
    /// it with a default. Use this where "upstream failed" and "upstream
    /// returned a real empty/zero value" must not collapse into the same
    /// outcome (master-position polling: a fetch failure must not read as
    /// "the master closed everything").
    pub async fn get_or_fetch_result<F, Fut>(&self, key: K, fetch: F) -> anyhow::Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        self.fetch_result(key, fetch).await
    }
}

/// The three TTL caches the sync engine reads through.
pub struct CacheLayer {
    pub master_positions: TtlCache<(), Vec<crate::exchange::RemotePosition>>,
    pub open_orders: TtlCache<String, (Option<u32>, Option<rust_decimal::Decimal>, Option<rust_decimal::Decimal>)>,
    pub follower_balance: TtlCache<String, crate::domain::Balance>,
}

impl CacheLayer {
    pub fn new() -> Self {
        Self {
            master_positions: TtlCache::new(Duration::from_millis(800)),
            open_orders: TtlCache::new(Duration::from_secs(12)),
            follower_balance: TtlCache::new(Duration::from_secs(20)),
        }
    }
}

impl Default for CacheLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_misses_collapse_into_one_fetch() {
        let cache = Arc::new(TtlCache::<&'static str, i32>::new(Duration::from_secs(10)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("k", 0, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_triggers_refetch() {
        let cache = TtlCache::<&'static str, i32>::new(Duration::from_millis(10));
        let v1 = cache.get_or_fetch("k", 0, || async { Ok(1) }).await;
        assert_eq!(v1, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let v2 = cache.get_or_fetch("k", 0, || async { Ok(2) }).await;
        assert_eq!(v2, 2);
    }

    #[tokio::test]
    async fn error_returns_default_without_caching() {
        let cache = TtlCache::<&'static str, i32>::new(Duration::from_secs(10));
        let v = cache
            .get_or_fetch("k", -1, || async { Err(anyhow::anyhow!("boom")) })
            .await;
        assert_eq!(v, -1);
        let v2 = cache.get_or_fetch("k", -1, || async { Ok(7) }).await;
        assert_eq!(v2, 7);
    }

    #[tokio::test]
    async fn get_or_fetch_result_propagates_upstream_error() {
        let cache = TtlCache::<&'static str, Vec<i32>>::new(Duration::from_secs(10));
        let err = cache
            .get_or_fetch_result("k", || async { Err(anyhow::anyhow!("upstream down")) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("upstream down"));

        // The failed fetch must not have populated the cache.
        let v = cache.get_or_fetch_result("k", || async { Ok(vec![1, 2, 3]) }).await.unwrap();
        assert_eq!(v, vec![1, 2, 3]);
    }
}
