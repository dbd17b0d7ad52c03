//! Request-scoped client: every call registers a trigger for the key being
//! processed and makes sure the touched GVK is watched.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use trellis_core::{meta, Client, DynamicObject, Gvk, ListOptions, ObjectKey, PatchKind, Reader, Result, Writer};

use crate::set::HandlerSet;
use crate::trigger::{Matcher, Registry};

pub(crate) struct TriggerClient {
    inner: Arc<dyn Client>,
    registry: Arc<Registry>,
    set: Arc<HandlerSet>,
}

impl TriggerClient {
    pub(crate) fn new(inner: Arc<dyn Client>, registry: Arc<Registry>, set: Arc<HandlerSet>) -> Self {
        Self { inner, registry, set }
    }

    async fn watch(&self, gvk: &Gvk, matcher: Matcher) -> Result<()> {
        self.registry.watch(self.set.triggers(), gvk, matcher);
        self.set.watch_gvks(std::slice::from_ref(gvk)).await
    }

    async fn watch_key(&self, gvk: &Gvk, key: &ObjectKey) -> Result<()> {
        self.watch(gvk, Matcher::object(key)).await
    }
}

#[async_trait]
impl Reader for TriggerClient {
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        self.watch_key(gvk, key).await?;
        self.inner.get(gvk, key).await
    }

    async fn list(&self, gvk: &Gvk, opts: &ListOptions) -> Result<Vec<DynamicObject>> {
        let matcher = Matcher {
            namespace: opts.namespace.clone().unwrap_or_default(),
            name: String::new(),
            selector: opts.label_selector.clone(),
            fields: opts.field_selector.clone(),
        };
        self.watch(gvk, matcher).await?;
        self.inner.list(gvk, opts).await
    }

    async fn is_namespaced(&self, gvk: &Gvk) -> Result<bool> {
        self.inner.is_namespaced(gvk).await
    }
}

#[async_trait]
impl Writer for TriggerClient {
    async fn create(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        self.watch_key(gvk, &meta::key_of(obj)).await?;
        self.inner.create(gvk, obj).await
    }

    async fn update(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        self.watch_key(gvk, &meta::key_of(obj)).await?;
        self.inner.update(gvk, obj).await
    }

    async fn patch(&self, gvk: &Gvk, key: &ObjectKey, kind: PatchKind, patch: &Value) -> Result<DynamicObject> {
        self.watch_key(gvk, key).await?;
        self.inner.patch(gvk, key, kind, patch).await
    }

    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> Result<()> {
        self.watch_key(gvk, key).await?;
        self.inner.delete(gvk, key).await
    }

    async fn update_status(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        self.watch_key(gvk, &meta::key_of(obj)).await?;
        self.inner.update_status(gvk, obj).await
    }
}
