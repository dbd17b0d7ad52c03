//! Store traits. Everything above the store (apply engine, cache, router)
//! talks through these so the same code runs against a cluster or memory.

use std::sync::Arc;

use async_trait::async_trait;
use kube::core::DynamicObject;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{FieldSelector, Gvk, LabelSelector, ObjectKey, Result};

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Restrict to one namespace; `None` lists across all namespaces.
    pub namespace: Option<String>,
    pub label_selector: Option<LabelSelector>,
    pub field_selector: Option<FieldSelector>,
}

impl ListOptions {
    pub fn in_namespace(ns: impl Into<String>) -> Self {
        let ns = ns.into();
        Self { namespace: if ns.is_empty() { None } else { Some(ns) }, ..Default::default() }
    }

    pub fn with_labels(mut self, selector: LabelSelector) -> Self {
        self.label_selector = Some(selector);
        self
    }

    pub fn with_fields(mut self, selector: FieldSelector) -> Self {
        self.field_selector = Some(selector);
        self
    }

    pub fn matches(&self, obj: &DynamicObject) -> bool {
        if let Some(ns) = &self.namespace {
            if obj.metadata.namespace.as_deref().unwrap_or("") != ns {
                return false;
            }
        }
        if let Some(sel) = &self.label_selector {
            if !sel.matches(obj.metadata.labels.as_ref()) {
                return false;
            }
        }
        if let Some(sel) = &self.field_selector {
            if !sel.matches(obj) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// RFC 7386 JSON merge patch.
    Merge,
    /// Kubernetes strategic merge patch (list merge keys, `$patch` directives).
    Strategic,
}

impl PatchKind {
    pub fn content_type(&self) -> &'static str {
        match self {
            PatchKind::Merge => "application/merge-patch+json",
            PatchKind::Strategic => "application/strategic-merge-patch+json",
        }
    }
}

#[async_trait]
pub trait Reader: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Result<Option<DynamicObject>>;
    async fn list(&self, gvk: &Gvk, opts: &ListOptions) -> Result<Vec<DynamicObject>>;
    /// Whether objects of this GVK live in a namespace.
    async fn is_namespaced(&self, gvk: &Gvk) -> Result<bool>;
}

#[async_trait]
pub trait Writer: Send + Sync {
    async fn create(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject>;
    async fn update(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject>;
    async fn patch(&self, gvk: &Gvk, key: &ObjectKey, kind: PatchKind, patch: &Value) -> Result<DynamicObject>;
    /// Deleting an object that is already gone is not an error.
    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> Result<()>;
    async fn update_status(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject>;
}

/// Reader + Writer.
pub trait Client: Reader + Writer {}

impl<T: Reader + Writer + ?Sized> Client for T {}

/// Receives object keys whenever a watched object changes.
pub trait EventSink: Send + Sync {
    fn enqueue(&self, gvk: &Gvk, key: ObjectKey);
}

/// A store that can also feed change notifications.
#[async_trait]
pub trait Backend: Client {
    /// Register interest in a GVK; every change is reported to `sink`.
    /// Calling it again for the same GVK adds another sink.
    async fn watch(&self, gvk: &Gvk, sink: Arc<dyn EventSink>) -> Result<()>;

    /// A client that always reads through to the authoritative store.
    fn uncached(&self) -> Arc<dyn Client>;

    /// Start background machinery; returns once the initial sync is done.
    async fn start(&self, shutdown: CancellationToken) -> Result<()>;
}

#[async_trait]
impl<T: Reader + ?Sized> Reader for Arc<T> {
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        (**self).get(gvk, key).await
    }
    async fn list(&self, gvk: &Gvk, opts: &ListOptions) -> Result<Vec<DynamicObject>> {
        (**self).list(gvk, opts).await
    }
    async fn is_namespaced(&self, gvk: &Gvk) -> Result<bool> {
        (**self).is_namespaced(gvk).await
    }
}

#[async_trait]
impl<T: Writer + ?Sized> Writer for Arc<T> {
    async fn create(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        (**self).create(gvk, obj).await
    }
    async fn update(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        (**self).update(gvk, obj).await
    }
    async fn patch(&self, gvk: &Gvk, key: &ObjectKey, kind: PatchKind, patch: &Value) -> Result<DynamicObject> {
        (**self).patch(gvk, key, kind, patch).await
    }
    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> Result<()> {
        (**self).delete(gvk, key).await
    }
    async fn update_status(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        (**self).update_status(gvk, obj).await
    }
}

/// Fetch an object, turning absence into [`crate::Error::NotFound`].
pub async fn must_get<R: Reader + ?Sized>(reader: &R, gvk: &Gvk, key: &ObjectKey) -> Result<DynamicObject> {
    reader
        .get(gvk, key)
        .await?
        .ok_or_else(|| crate::Error::NotFound { gvk: gvk.clone(), key: key.clone() })
}
