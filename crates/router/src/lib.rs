//! Trellis router: watch-driven dispatch of handlers.
//!
//! Each event loads the object through the smoothing cache, runs every
//! handler registered for its GVK, fans out to keys that depend on it and
//! applies whatever the handlers emitted with the object as owner.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kube::Resource;
use tokio_util::sync::CancellationToken;
use trellis_core::{Backend, Client, EngineConfig, FieldSelector, Gvk, LabelSelector, ObjectKey};

mod client;
pub mod finalizer;
pub mod handler;
pub mod locker;
pub mod queue;
mod save;
mod set;
pub mod trigger;

pub use finalizer::{FinalizerHandler, FinalizerState};
pub use handler::{ErrorHandler, Handler, Middleware, Request, Response};
pub use save::status_changed;

use handler::{ErrorPrefix, Fields, IgnoreRemove, NameNamespace, Selector};
use queue::Item;
use set::HandlerSet;

#[derive(Clone)]
pub struct Router {
    set: Arc<HandlerSet>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("name", &self.set.name()).finish()
    }
}

impl Router {
    /// `name` is also the owner sub-context of everything this router applies.
    pub fn new(name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self::with_config(name, backend, EngineConfig::from_env())
    }

    pub fn with_config(name: impl Into<String>, backend: Arc<dyn Backend>, config: EngineConfig) -> Self {
        Self { set: Arc::new(HandlerSet::new(name.into(), backend, config)) }
    }

    pub fn name(&self) -> &str {
        self.set.name()
    }

    /// Routes for a typed API kind.
    pub fn kind<K: Resource<DynamicType = ()>>(&self) -> RouteBuilder {
        self.gvk(Gvk::of::<K>())
    }

    pub fn gvk(&self, gvk: Gvk) -> RouteBuilder {
        RouteBuilder {
            set: self.set.clone(),
            gvk,
            name: String::new(),
            namespace: String::new(),
            selector: None,
            fields: None,
            include_removed: false,
            finalize_id: None,
            middleware: Vec::new(),
            route_name: None,
        }
    }

    /// Install the hook every handler and save error passes through.
    pub fn on_error<E: ErrorHandler + 'static>(&self, hook: E) {
        self.set.set_error_handler(Arc::new(hook));
    }

    /// Watch everything registered so far, start the backend, then block until `shutdown`.
    pub async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.set.start(shutdown).await
    }

    /// Enqueue `key` of `gvk` after `delay`. An immediate trigger is handled as
    /// one and does not fan out to the key's dependents.
    pub async fn trigger(&self, gvk: &Gvk, key: ObjectKey, delay: Duration) -> trellis_core::Result<()> {
        let item = if delay.is_zero() { Item::triggered(key) } else { Item::direct(key) };
        self.set.enqueue_after(gvk, item, delay).await
    }

    /// Drop trigger registrations not refreshed by their source's latest completed pass.
    pub fn collect_stale_triggers(&self) -> usize {
        self.set.triggers().collect_stale()
    }

    pub fn trigger_count(&self) -> usize {
        self.set.triggers().len()
    }

    /// Cached client with the recent-write overlay.
    pub fn client(&self) -> Arc<dyn Client> {
        Arc::new(self.set.client().clone())
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.set.backend().clone()
    }

    pub async fn watched(&self) -> Vec<Gvk> {
        self.set.watched().await
    }
}

/// Filters and options for one handler registration.
#[derive(Clone)]
pub struct RouteBuilder {
    set: Arc<HandlerSet>,
    gvk: Gvk,
    name: String,
    namespace: String,
    selector: Option<LabelSelector>,
    fields: Option<FieldSelector>,
    include_removed: bool,
    finalize_id: Option<String>,
    middleware: Vec<Middleware>,
    route_name: Option<String>,
}

impl RouteBuilder {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn selector(mut self, selector: LabelSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn field_selector(mut self, selector: FieldSelector) -> Self {
        self.fields = Some(selector);
        self
    }

    /// Also deliver absent and deleting objects.
    pub fn include_removed(mut self) -> Self {
        self.include_removed = true;
        self
    }

    pub fn middleware(mut self, m: Middleware) -> Self {
        self.middleware.push(m);
        self
    }

    /// Name used to prefix handler errors; defaults to the registering `file:line`.
    pub fn route_name(mut self, name: impl Into<String>) -> Self {
        self.route_name = Some(name.into());
        self
    }

    /// Run `h` for this route and block deletion until it has run with the
    /// object deleting and `id` at the head of its finalizers.
    #[track_caller]
    pub fn finalize<H: Handler + 'static>(mut self, id: impl Into<String>, h: H) {
        self.finalize_id = Some(id.into());
        self.handler(h)
    }

    #[track_caller]
    pub fn handler<H: Handler + 'static>(self, h: H) {
        let loc = std::panic::Location::caller();
        let route_name = self.route_name.clone().unwrap_or_else(|| {
            let file = Path::new(loc.file()).file_name().and_then(|f| f.to_str()).unwrap_or(loc.file());
            format!("{}:{}", file, loc.line())
        });

        let mut result: Arc<dyn Handler> = Arc::new(h);
        if let Some(id) = &self.finalize_id {
            result = Arc::new(FinalizerHandler { id: id.clone(), next: result });
        }
        for m in self.middleware.iter().rev() {
            result = m(result);
        }
        if !self.name.is_empty() || !self.namespace.is_empty() {
            result = Arc::new(NameNamespace { next: result, name: self.name.clone(), namespace: self.namespace.clone() });
        }
        if let Some(selector) = self.selector.clone() {
            result = Arc::new(Selector { next: result, selector });
        }
        if let Some(selector) = self.fields.clone() {
            result = Arc::new(Fields { next: result, selector });
        }
        if !self.include_removed && self.finalize_id.is_none() {
            result = Arc::new(IgnoreRemove { next: result });
        }
        result = Arc::new(ErrorPrefix { next: result, prefix: route_name });

        self.set.add_handler(self.gvk, result);
    }
}
