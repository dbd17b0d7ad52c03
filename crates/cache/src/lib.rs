//! Trellis cache: a read-your-writes overlay over a watch-fed cache.
//!
//! Objects this process writes are remembered for a short time. A `get`
//! that hits a cache still lagging behind the write returns the remembered
//! copy instead, so handlers never observe their own writes going backwards.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use trellis_core::{meta, Client, DynamicObject, Gvk, ListOptions, ObjectKey, PatchKind, Reader, Result, Writer};

struct Recent {
    obj: DynamicObject,
    inserted: Instant,
}

type Overlay = FxHashMap<(Gvk, ObjectKey), Recent>;

/// True when `new_rv` is strictly newer than `old_rv`.
///
/// Equal-length versions compare as strings; otherwise both are parsed as
/// integers. An unparsable old version loses, an unparsable new one never wins.
pub fn newer(old_rv: &str, new_rv: &str) -> bool {
    if old_rv.len() == new_rv.len() {
        return old_rv < new_rv;
    }
    let Ok(old) = old_rv.parse::<i64>() else { return true };
    let Ok(new) = new_rv.parse::<i64>() else { return false };
    old < new
}

/// Client whose reads come from `cached` and whose writes go through it too,
/// remembering each written object for `ttl`.
#[derive(Clone)]
pub struct CachedClient {
    cached: Arc<dyn Client>,
    uncached: Arc<dyn Client>,
    recent: Arc<Mutex<Overlay>>,
    ttl: Duration,
}

impl std::fmt::Debug for CachedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedClient").field("recent", &self.len()).field("ttl", &self.ttl).finish()
    }
}

impl CachedClient {
    pub fn new(cached: Arc<dyn Client>, uncached: Arc<dyn Client>, ttl: Duration) -> Self {
        Self { cached, uncached, recent: Arc::new(Mutex::new(FxHashMap::default())), ttl }
    }

    /// Direct client: no overlay, no cache.
    pub fn uncached(&self) -> Arc<dyn Client> {
        self.uncached.clone()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of remembered writes.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Overlay> {
        self.recent.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn store(&self, gvk: &Gvk, obj: &DynamicObject) {
        let key = meta::key_of(obj);
        trace!(gvk = %gvk, key = %key, rv = %meta::resource_version(obj), "overlay store");
        self.lock().insert((gvk.clone(), key), Recent { obj: obj.clone(), inserted: Instant::now() });
    }

    fn forget(&self, gvk: &Gvk, key: &ObjectKey) {
        self.lock().remove(&(gvk.clone(), key.clone()));
    }

    /// Drop entries older than the TTL; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_older_than(Instant::now())
    }

    fn purge_older_than(&self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut recent = self.lock();
        let before = recent.len();
        recent.retain(|_, v| v.inserted + ttl >= now);
        before - recent.len()
    }

    /// Purge expired entries every TTL until `shutdown` fires.
    pub fn start_purge(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(this.ttl) => {
                        let purged = this.purge_expired();
                        if purged > 0 {
                            debug!(purged, "overlay purge");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Reader for CachedClient {
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let Some(obj) = self.cached.get(gvk, key).await? else {
            return Ok(None);
        };
        let recent = self.lock().get(&(gvk.clone(), key.clone())).map(|r| r.obj.clone());
        match recent {
            Some(r) if newer(meta::resource_version(&obj), meta::resource_version(&r)) => {
                counter!("cache_overlay_hit_total", 1u64);
                trace!(gvk = %gvk, key = %key, "serving recent write over cache");
                Ok(Some(r))
            }
            _ => Ok(Some(obj)),
        }
    }

    async fn list(&self, gvk: &Gvk, opts: &ListOptions) -> Result<Vec<DynamicObject>> {
        self.cached.list(gvk, opts).await
    }

    async fn is_namespaced(&self, gvk: &Gvk) -> Result<bool> {
        self.cached.is_namespaced(gvk).await
    }
}

#[async_trait]
impl Writer for CachedClient {
    async fn create(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        let out = self.cached.create(gvk, obj).await?;
        self.store(gvk, &out);
        Ok(out)
    }

    async fn update(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        let out = self.cached.update(gvk, obj).await?;
        self.store(gvk, &out);
        Ok(out)
    }

    async fn patch(&self, gvk: &Gvk, key: &ObjectKey, kind: PatchKind, patch: &Value) -> Result<DynamicObject> {
        let out = self.cached.patch(gvk, key, kind, patch).await?;
        self.store(gvk, &out);
        Ok(out)
    }

    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> Result<()> {
        self.cached.delete(gvk, key).await?;
        self.forget(gvk, key);
        Ok(())
    }

    async fn update_status(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        let out = self.cached.update_status(gvk, obj).await?;
        self.store(gvk, &out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::MemoryStore;

    #[test]
    fn resource_version_ordering() {
        assert!(newer("10", "11"));
        assert!(!newer("11", "10"));
        assert!(!newer("10", "10"));
        assert!(newer("9", "10"));
        assert!(!newer("100", "99"));
        // equal length compares as strings, even when not numbers
        assert!(newer("abc", "abd"));
        assert!(newer("x", "10"));
        assert!(!newer("10", "xyz"));
    }

    #[tokio::test]
    async fn purge_drops_only_expired_entries() {
        let store = MemoryStore::new();
        let client = CachedClient::new(Arc::new(store.clone()), Arc::new(store), Duration::from_secs(10));
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a", "namespace": "ns"}
        }))
        .unwrap();
        let gvk = Gvk::new("", "v1", "ConfigMap");
        client.create(&gvk, &obj).await.unwrap();
        assert_eq!(client.len(), 1);

        assert_eq!(client.purge_expired(), 0);
        assert_eq!(client.purge_older_than(Instant::now() + Duration::from_secs(11)), 1);
        assert!(client.is_empty());
    }
}
