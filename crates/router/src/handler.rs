//! Handler surface: the request/response pair and the filters a route
//! wraps around its handler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::Resource;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use trellis_core::{meta, Client, DynamicObject, FieldSelector, Gvk, LabelSelector, ObjectKey};

use crate::set::HandlerSet;
use crate::trigger::Registry;

/// One event delivered to a handler.
#[derive(Clone)]
pub struct Request {
    pub gvk: Gvk,
    pub key: ObjectKey,
    pub namespace: String,
    pub name: String,
    /// `None` when the object no longer exists.
    pub object: Option<DynamicObject>,
    pub from_trigger: bool,
    /// Reads and writes through this client register triggers for the key.
    pub client: Arc<dyn Client>,
    pub shutdown: CancellationToken,
    pub(crate) set: Option<Arc<HandlerSet>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("gvk", &self.gvk)
            .field("key", &self.key)
            .field("present", &self.object.is_some())
            .field("from_trigger", &self.from_trigger)
            .finish()
    }
}

impl Request {
    /// A request outside any router; useful for driving handlers directly.
    pub fn new(gvk: Gvk, key: ObjectKey, object: Option<DynamicObject>, client: Arc<dyn Client>) -> Self {
        Self {
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            gvk,
            key,
            object,
            from_trigger: false,
            client,
            shutdown: CancellationToken::new(),
            set: None,
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.object.as_ref().map(meta::is_deleting).unwrap_or(false)
    }
}

/// What handlers hand back: child objects, a retry delay, a prune opt-out.
#[derive(Debug, Default)]
pub struct Response {
    delay: Option<Duration>,
    objects: Vec<DynamicObject>,
    no_prune: bool,
    saved_status: Option<Option<serde_json::Value>>,
    registry: Option<Arc<Registry>>,
    pub(crate) set: Option<Arc<HandlerSet>>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn scoped(registry: Arc<Registry>, set: Arc<HandlerSet>) -> Self {
        Self { registry: Some(registry), set: Some(set), ..Self::default() }
    }

    /// Emit desired children. Each one also becomes a dependency of the request.
    pub fn objects<I: IntoIterator<Item = DynamicObject>>(&mut self, objs: I) {
        for obj in objs {
            if let (Some(registry), Some(set)) = (&self.registry, &self.set) {
                registry.watch_object(set.triggers(), &obj);
            }
            self.objects.push(obj);
        }
    }

    pub fn object(&mut self, obj: DynamicObject) {
        self.objects([obj]);
    }

    /// Emit a typed API object.
    pub fn resource<K>(&mut self, obj: &K) -> trellis_core::Result<()>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        self.object(meta::resource_to_dynamic(obj)?);
        Ok(())
    }

    /// Ask to be called again. The smallest non-zero delay requested wins.
    pub fn retry_after(&mut self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        self.delay = Some(self.delay.map_or(delay, |d| d.min(delay)));
    }

    pub fn disable_prune(&mut self) {
        self.no_prune = true;
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    pub fn emitted(&self) -> &[DynamicObject] {
        &self.objects
    }

    pub fn prune_disabled(&self) -> bool {
        self.no_prune
    }

    /// Record the status a nested save already persisted, so the outer save diffs against it.
    pub(crate) fn status_saved(&mut self, status: Option<serde_json::Value>) {
        self.saved_status = Some(status);
    }

    pub(crate) fn saved_status(&self) -> Option<Option<&serde_json::Value>> {
        self.saved_status.as_ref().map(|s| s.as_ref())
    }

    /// A response sharing this one's trigger registry but nothing else.
    pub(crate) fn private(&self) -> Self {
        Self { registry: self.registry.clone(), set: self.set.clone(), ..Self::default() }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> Handler for F
where
    F: Fn(&mut Request, &mut Response) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()> {
        self(req, resp)
    }
}

/// Decides what happens to a handler error: `Ok` resolves the key, `Err` requeues it.
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, req: &Request, resp: &Response, err: anyhow::Error) -> anyhow::Result<()>;
}

impl<F> ErrorHandler for F
where
    F: Fn(&Request, &Response, anyhow::Error) -> anyhow::Result<()> + Send + Sync,
{
    fn on_error(&self, req: &Request, resp: &Response, err: anyhow::Error) -> anyhow::Result<()> {
        self(req, resp, err)
    }
}

pub type Middleware = Arc<dyn Fn(Arc<dyn Handler>) -> Arc<dyn Handler> + Send + Sync>;

/// Skip absent and deleting objects.
pub struct IgnoreRemove {
    pub next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for IgnoreRemove {
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()> {
        match &req.object {
            Some(obj) if !meta::is_deleting(obj) => self.next.handle(req, resp).await,
            _ => Ok(()),
        }
    }
}

pub struct NameNamespace {
    pub next: Arc<dyn Handler>,
    pub name: String,
    pub namespace: String,
}

#[async_trait]
impl Handler for NameNamespace {
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()> {
        if !self.name.is_empty() && req.name != self.name {
            return Ok(());
        }
        if !self.namespace.is_empty() && req.namespace != self.namespace {
            return Ok(());
        }
        self.next.handle(req, resp).await
    }
}

pub struct Selector {
    pub next: Arc<dyn Handler>,
    pub selector: LabelSelector,
}

#[async_trait]
impl Handler for Selector {
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()> {
        match &req.object {
            Some(obj) if self.selector.matches(obj.metadata.labels.as_ref()) => self.next.handle(req, resp).await,
            _ => Ok(()),
        }
    }
}

pub struct Fields {
    pub next: Arc<dyn Handler>,
    pub selector: FieldSelector,
}

#[async_trait]
impl Handler for Fields {
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()> {
        match &req.object {
            Some(obj) if self.selector.matches(obj) => self.next.handle(req, resp).await,
            _ => Ok(()),
        }
    }
}

/// Prefix errors with the route name.
pub struct ErrorPrefix {
    pub next: Arc<dyn Handler>,
    pub prefix: String,
}

#[async_trait]
impl Handler for ErrorPrefix {
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()> {
        self.next.handle(req, resp).await.map_err(|e| e.context(format!("[{}]", self.prefix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trellis_core::MemoryStore;

    #[derive(Default)]
    struct Count(AtomicUsize);

    #[async_trait]
    impl Handler for Count {
        async fn handle(&self, _req: &mut Request, _resp: &mut Response) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn req(obj: Option<serde_json::Value>) -> Request {
        let obj: Option<DynamicObject> = obj.map(|v| serde_json::from_value(v).unwrap());
        Request::new(Gvk::new("", "v1", "ConfigMap"), ObjectKey::new("ns", "a"), obj, Arc::new(MemoryStore::new()))
    }

    fn cm(extra: serde_json::Value) -> serde_json::Value {
        let mut v = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a", "namespace": "ns"}});
        if let Some(labels) = extra.get("labels") {
            v["metadata"]["labels"] = labels.clone();
        }
        if let Some(ts) = extra.get("deletionTimestamp") {
            v["metadata"]["deletionTimestamp"] = ts.clone();
        }
        v
    }

    #[tokio::test]
    async fn filters_gate_the_next_handler() {
        let count = Arc::new(Count::default());
        let mut resp = Response::new();

        let h = IgnoreRemove { next: count.clone() };
        h.handle(&mut req(None), &mut resp).await.unwrap();
        h.handle(&mut req(Some(cm(json!({"deletionTimestamp": "2024-01-01T00:00:00Z"})))), &mut resp).await.unwrap();
        h.handle(&mut req(Some(cm(json!({})))), &mut resp).await.unwrap();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);

        let h = NameNamespace { next: count.clone(), name: "b".into(), namespace: String::new() };
        h.handle(&mut req(Some(cm(json!({})))), &mut resp).await.unwrap();
        let h = NameNamespace { next: count.clone(), name: "a".into(), namespace: "ns".into() };
        h.handle(&mut req(Some(cm(json!({})))), &mut resp).await.unwrap();
        assert_eq!(count.0.load(Ordering::SeqCst), 2);

        let h = Selector { next: count.clone(), selector: "app=web".parse().unwrap() };
        h.handle(&mut req(Some(cm(json!({"labels": {"app": "db"}})))), &mut resp).await.unwrap();
        h.handle(&mut req(Some(cm(json!({"labels": {"app": "web"}})))), &mut resp).await.unwrap();
        assert_eq!(count.0.load(Ordering::SeqCst), 3);

        let h = Fields { next: count.clone(), selector: "metadata.name=a".parse().unwrap() };
        h.handle(&mut req(Some(cm(json!({})))), &mut resp).await.unwrap();
        h.handle(&mut req(None), &mut resp).await.unwrap();
        assert_eq!(count.0.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn error_prefix_and_closures() {
        let failing = |_: &mut Request, _: &mut Response| -> anyhow::Result<()> { anyhow::bail!("boom") };
        let h = ErrorPrefix { next: Arc::new(failing), prefix: "apps.rs:12".into() };
        let err = h.handle(&mut req(None), &mut Response::new()).await.unwrap_err();
        assert_eq!(format!("{:#}", err), "[apps.rs:12]: boom");
    }

    #[test]
    fn retry_after_keeps_smallest_non_zero() {
        let mut resp = Response::new();
        resp.retry_after(Duration::from_secs(5));
        resp.retry_after(Duration::ZERO);
        resp.retry_after(Duration::from_secs(2));
        resp.retry_after(Duration::from_secs(9));
        assert_eq!(resp.delay(), Some(Duration::from_secs(2)));
        resp.disable_prune();
        assert!(resp.prune_disabled());
    }
}
