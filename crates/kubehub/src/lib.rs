//! Trellis kubehub: the cluster-backed [`Backend`].
//!
//! Reads of watched kinds come from an in-memory mirror kept by list+watch;
//! everything else, and every write, goes straight to the API server.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;
use trellis_core::{
    Backend, Client, DynamicObject, EngineConfig, EventSink, Gvk, ListOptions, ObjectKey, PatchKind, Reader, Result,
    Writer,
};

pub mod direct;
pub mod error;
pub mod informer;
pub mod resolve;

pub use direct::DirectClient;
pub use resolve::{Resolved, Resolver};

use informer::{Informer, Mirror};

#[derive(Clone)]
pub struct KubeBackend {
    direct: DirectClient,
    config: EngineConfig,
    informers: Arc<Mutex<FxHashMap<Gvk, Arc<Informer>>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for KubeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeBackend").field("watched", &self.lock().len()).finish()
    }
}

impl KubeBackend {
    pub fn new(client: kube::Client, config: EngineConfig) -> Self {
        let resolver = Arc::new(Resolver::new(client.clone()));
        Self {
            direct: DirectClient::new(client, resolver),
            config,
            informers: Arc::new(Mutex::new(FxHashMap::default())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Connect with the ambient kubeconfig or in-cluster config.
    pub async fn try_default(config: EngineConfig) -> anyhow::Result<Self> {
        let client = kube::Client::try_default().await?;
        Ok(Self::new(client, config))
    }

    pub fn direct(&self) -> &DirectClient {
        &self.direct
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<Gvk, Arc<Informer>>> {
        self.informers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `None` until the kind is watched and its initial list has arrived.
    fn from_mirror<T>(&self, gvk: &Gvk, f: impl FnOnce(&Mirror) -> T) -> Option<T> {
        let informer = self.lock().get(gvk).filter(|i| i.is_synced()).cloned()?;
        let mirror = informer.mirror.read().unwrap_or_else(|e| e.into_inner());
        Some(f(&mirror))
    }
}

#[async_trait]
impl Reader for KubeBackend {
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        if let Some(obj) = self.from_mirror(gvk, |m| m.get(key).cloned()) {
            return Ok(obj);
        }
        self.direct.get(gvk, key).await
    }

    async fn list(&self, gvk: &Gvk, opts: &ListOptions) -> Result<Vec<DynamicObject>> {
        if let Some(objs) = self.from_mirror(gvk, |m| m.list(opts)) {
            return Ok(objs);
        }
        self.direct.list(gvk, opts).await
    }

    async fn is_namespaced(&self, gvk: &Gvk) -> Result<bool> {
        self.direct.is_namespaced(gvk).await
    }
}

#[async_trait]
impl Writer for KubeBackend {
    async fn create(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        self.direct.create(gvk, obj).await
    }

    async fn update(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        self.direct.update(gvk, obj).await
    }

    async fn patch(&self, gvk: &Gvk, key: &ObjectKey, kind: PatchKind, patch: &Value) -> Result<DynamicObject> {
        self.direct.patch(gvk, key, kind, patch).await
    }

    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> Result<()> {
        self.direct.delete(gvk, key).await
    }

    async fn update_status(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        self.direct.update_status(gvk, obj).await
    }
}

#[async_trait]
impl Backend for KubeBackend {
    async fn watch(&self, gvk: &Gvk, sink: Arc<dyn EventSink>) -> Result<()> {
        // resolve up front so an unknown kind fails the caller instead of the task
        self.direct.resolver().resolve(gvk).await?;
        let (informer, fresh) = {
            let mut informers = self.lock();
            match informers.get(gvk) {
                Some(i) => (i.clone(), false),
                None => {
                    let i = Informer::new();
                    informers.insert(gvk.clone(), i.clone());
                    (i, true)
                }
            }
        };
        informer.add_sink(gvk, sink);
        if fresh {
            let task = informer.run(gvk.clone(), self.direct.clone(), self.config.watch_timeout, self.shutdown.clone());
            tokio::spawn(task);
        }
        Ok(())
    }

    fn uncached(&self) -> Arc<dyn Client> {
        Arc::new(self.direct.clone())
    }

    /// Returns once every kind watched so far has finished its initial list.
    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let own = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => own.cancel(),
                _ = own.cancelled() => {}
            }
        });

        let pending: Vec<(Gvk, Arc<Informer>)> = self.lock().iter().map(|(g, i)| (g.clone(), i.clone())).collect();
        for (gvk, informer) in pending {
            let mut rx = informer.subscribe();
            let synced = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                res = rx.wait_for(|synced| *synced) => res.map(|_| ()),
            };
            synced.map_err(|e| trellis_core::Error::Watch { gvk: gvk.clone(), message: e.to_string() })?;
            info!(gvk = %gvk, "cache synced");
        }
        Ok(())
    }
}
