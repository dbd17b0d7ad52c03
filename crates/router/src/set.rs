//! The dispatch core: watched GVKs and their queues, handler lookup,
//! trigger fan-out and saving each pass.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trellis_cache::CachedClient;
use trellis_core::error::aggregate;
use trellis_core::{Backend, Client, DynamicObject, EngineConfig, EventSink, Gvk, ObjectKey, Reader};

use crate::client::TriggerClient;
use crate::handler::{ErrorHandler, Handler, Request, Response};
use crate::locker::KeyLocker;
use crate::queue::{Backoff, Item, WorkQueue};
use crate::save::Saver;
use crate::trigger::{Registry, Source, Triggers};

struct QueueSink {
    queue: Arc<WorkQueue>,
}

impl EventSink for QueueSink {
    fn enqueue(&self, _gvk: &Gvk, key: ObjectKey) {
        self.queue.add(Item::direct(key));
    }
}

pub(crate) struct HandlerSet {
    name: String,
    backend: Arc<dyn Backend>,
    client: CachedClient,
    config: EngineConfig,
    handlers: RwLock<FxHashMap<Gvk, Vec<Arc<dyn Handler>>>>,
    triggers: Triggers,
    saver: Saver,
    on_error: RwLock<Option<Arc<dyn ErrorHandler>>>,
    watching: tokio::sync::Mutex<BTreeMap<Gvk, Arc<WorkQueue>>>,
    locker: KeyLocker,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet").field("name", &self.name).field("triggers", &self.triggers.len()).finish()
    }
}

fn join_errors(mut errs: Vec<anyhow::Error>) -> Option<anyhow::Error> {
    match errs.len() {
        0 => None,
        1 => errs.pop(),
        _ => {
            let msgs: Vec<String> = errs.iter().map(|e| format!("{:#}", e)).collect();
            Some(anyhow::anyhow!(msgs.join("; ")))
        }
    }
}

impl HandlerSet {
    pub(crate) fn new(name: String, backend: Arc<dyn Backend>, config: EngineConfig) -> Self {
        let cached: Arc<dyn Client> = Arc::new(backend.clone());
        let client = CachedClient::new(cached, backend.uncached(), config.overlay_ttl);
        let saver = Saver::new(Arc::new(client.clone()), &name);
        Self {
            name,
            backend,
            client,
            config,
            handlers: RwLock::new(FxHashMap::default()),
            triggers: Triggers::new(),
            saver,
            on_error: RwLock::new(None),
            watching: tokio::sync::Mutex::new(BTreeMap::new()),
            locker: KeyLocker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn client(&self) -> &CachedClient {
        &self.client
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub(crate) fn triggers(&self) -> &Triggers {
        &self.triggers
    }

    pub(crate) fn add_handler(&self, gvk: Gvk, handler: Arc<dyn Handler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(gvk).or_default().push(handler);
    }

    pub(crate) fn set_error_handler(&self, hook: Arc<dyn ErrorHandler>) {
        *self.on_error.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    fn handlers_for(&self, gvk: &Gvk) -> Vec<Arc<dyn Handler>> {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).get(gvk).cloned().unwrap_or_default()
    }

    fn handler_gvks(&self) -> Vec<Gvk> {
        let mut gvks: Vec<Gvk> = self.handlers.read().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect();
        gvks.sort();
        gvks
    }

    pub(crate) async fn watched(&self) -> Vec<Gvk> {
        self.watching.lock().await.keys().cloned().collect()
    }

    /// Watch every GVK not yet watched; already-watched ones are skipped.
    pub(crate) async fn watch_gvks(self: &Arc<Self>, gvks: &[Gvk]) -> trellis_core::Result<()> {
        let mut results = Vec::new();
        let mut watching = self.watching.lock().await;
        for gvk in gvks {
            if watching.contains_key(gvk) {
                continue;
            }
            let queue = WorkQueue::new(Backoff::new(self.config.backoff_base, self.config.backoff_max));
            let sink = Arc::new(QueueSink { queue: queue.clone() });
            match self.backend.watch(gvk, sink).await {
                Ok(()) => {
                    info!(router = %self.name, gvk = %gvk, "watching");
                    self.spawn_workers(gvk, queue.clone());
                    watching.insert(gvk.clone(), queue);
                }
                Err(e) => results.push(Err(e)),
            }
        }
        aggregate(results)
    }

    fn spawn_workers(self: &Arc<Self>, gvk: &Gvk, queue: Arc<WorkQueue>) {
        for _ in 0..self.config.workers {
            let (this, gvk, queue) = (self.clone(), gvk.clone(), queue.clone());
            tokio::spawn(async move {
                while let Some(item) = queue.get(&this.shutdown).await {
                    match this.on_change(&gvk, &item).await {
                        Ok(()) => queue.forget(&item),
                        Err(e) => {
                            counter!("router_handler_error_total", 1u64);
                            let msg = format!("{:#}", e);
                            warn!(gvk = %gvk, key = %item.key, retries = queue.retries(&item), error = %msg, "requeueing");
                            queue.add_rate_limited(item.clone(), this.shutdown.clone());
                        }
                    }
                    queue.done(&item);
                }
            });
        }
    }

    async fn queue_for(self: &Arc<Self>, gvk: &Gvk) -> trellis_core::Result<Arc<WorkQueue>> {
        if let Some(q) = self.watching.lock().await.get(gvk) {
            return Ok(q.clone());
        }
        self.watch_gvks(std::slice::from_ref(gvk)).await?;
        self.watching
            .lock()
            .await
            .get(gvk)
            .cloned()
            .ok_or_else(|| trellis_core::Error::Watch { gvk: gvk.clone(), message: "not watched".into() })
    }

    pub(crate) async fn enqueue_after(self: &Arc<Self>, gvk: &Gvk, item: Item, delay: Duration) -> trellis_core::Result<()> {
        let queue = self.queue_for(gvk).await?;
        queue.add_after(item, delay, self.shutdown.clone());
        Ok(())
    }

    async fn on_change(self: &Arc<Self>, gvk: &Gvk, item: &Item) -> anyhow::Result<()> {
        let _guard = self.locker.lock(format!("{} {}", gvk.kind, item.key)).await;
        let obj = self.client.get(gvk, &item.key).await.with_context(|| format!("failed to get {} {}", gvk, item.key))?;
        self.handle(gvk, &item.key, obj, item.from_trigger).await
    }

    fn handle_error(&self, req: &Request, resp: &Response, err: anyhow::Error) -> anyhow::Result<()> {
        let hook = self.on_error.read().unwrap_or_else(|e| e.into_inner()).clone();
        match hook {
            Some(hook) => hook.on_error(req, resp, err),
            None => Err(err),
        }
    }

    async fn handle(
        self: &Arc<Self>,
        gvk: &Gvk,
        key: &ObjectKey,
        unmodified: Option<DynamicObject>,
        from_trigger: bool,
    ) -> anyhow::Result<()> {
        let t0 = Instant::now();
        let source = Source { gvk: gvk.clone(), key: key.clone() };
        let generation = self.triggers.begin(&source);
        let registry = Arc::new(Registry::new(source.clone()));
        let cached: Arc<dyn Client> = Arc::new(self.client.clone());
        let mut req = Request {
            gvk: gvk.clone(),
            key: key.clone(),
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            object: unmodified.clone(),
            from_trigger,
            client: Arc::new(TriggerClient::new(cached, registry.clone(), self.clone())),
            shutdown: self.shutdown.clone(),
            set: Some(self.clone()),
        };
        let mut resp = Response::scoped(registry.clone(), self.clone());

        let handlers = self.handlers_for(gvk);
        let handles = !handlers.is_empty();
        if handles {
            if from_trigger {
                info!(router = %self.name, gvk = %gvk, key = %key, "handling trigger");
            } else {
                info!(router = %self.name, gvk = %gvk, key = %key, "handling");
            }
            counter!("router_dispatch_total", 1u64);
            let mut errs = Vec::new();
            for h in &handlers {
                if let Err(e) = h.handle(&mut req, &mut resp).await {
                    errs.push(e);
                }
            }
            self.watch_gvks(&registry.gvks()).await?;
            if let Some(err) = join_errors(errs) {
                self.handle_error(&req, &resp, err)?;
            }
        }

        if !from_trigger {
            for target in self.triggers.matching(gvk, key, unmodified.as_ref()) {
                info!(target = %target.key, target_gvk = %target.gvk, source = %key, source_gvk = %gvk, "triggering");
                counter!("router_trigger_total", 1u64);
                self.enqueue_after(&target.gvk, Item::triggered(target.key.clone()), Duration::ZERO).await?;
            }
        }

        if handles {
            let watching = self.watched().await;
            match self.saver.save(unmodified.as_ref(), &req, &resp, watching).await {
                Ok(obj) => req.object = obj,
                Err(e) => self.handle_error(&req, &resp, e.into())?,
            }
            if let Some(delay) = resp.delay() {
                debug!(gvk = %gvk, key = %key, delay_ms = delay.as_millis() as u64, "retry requested");
                self.enqueue_after(gvk, Item::direct(key.clone()), delay).await?;
            }
            histogram!("router_dispatch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        }

        self.triggers.finish(&source, generation);
        if self.config.collect_stale_triggers {
            let removed = self.triggers.collect_stale();
            if removed > 0 {
                debug!(removed, "collected stale triggers");
            }
        }
        Ok(())
    }

    /// Persist a pass the way the dispatcher does; used by finalizers for their private pass.
    pub(crate) async fn save(
        &self,
        unmodified: Option<&DynamicObject>,
        req: &Request,
        resp: &Response,
    ) -> trellis_core::Result<Option<DynamicObject>> {
        let watching = self.watched().await;
        self.saver.save(unmodified, req, resp, watching).await
    }

    pub(crate) async fn start(self: &Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        {
            let own = self.shutdown.clone();
            let outer = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = outer.cancelled() => own.cancel(),
                    _ = own.cancelled() => {}
                }
            });
        }
        let gvks = self.handler_gvks();
        self.watch_gvks(&gvks).await.with_context(|| format!("router {} failed to watch", self.name))?;
        let purge = self.client.start_purge(self.shutdown.clone());
        self.backend.start(self.shutdown.clone()).await.context("backend failed to start")?;
        info!(router = %self.name, gvks = gvks.len(), "router started");

        self.shutdown.cancelled().await;
        for queue in self.watching.lock().await.values() {
            queue.shut_down();
        }
        let _ = purge.await;
        info!(router = %self.name, "router stopped");
        Ok(())
    }
}
