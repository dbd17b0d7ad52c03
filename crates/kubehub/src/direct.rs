//! Uncached client straight against the API server.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use serde_json::Value;
use tracing::trace;
use trellis_core::{meta, DynamicObject, Gvk, ListOptions, ObjectKey, PatchKind, Reader, Result, Writer};

use crate::error::{is_not_found, map_err};
use crate::resolve::Resolver;

#[derive(Clone)]
pub struct DirectClient {
    client: kube::Client,
    resolver: Arc<Resolver>,
}

impl std::fmt::Debug for DirectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectClient").field("resolver", &self.resolver).finish()
    }
}

/// Label and field selectors rendered the way the API server parses them.
pub fn list_params(opts: &ListOptions) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(sel) = opts.label_selector.as_ref().filter(|s| !s.is_empty()) {
        lp = lp.labels(&sel.to_string());
    }
    if let Some(sel) = opts.field_selector.as_ref().filter(|s| !s.is_empty()) {
        lp = lp.fields(&sel.to_string());
    }
    lp
}

impl DirectClient {
    pub fn new(client: kube::Client, resolver: Arc<Resolver>) -> Self {
        Self { client, resolver }
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub(crate) async fn api(&self, gvk: &Gvk, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let r = self.resolver.resolve(gvk).await?;
        Ok(match namespace.filter(|ns| r.namespaced && !ns.is_empty()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &r.resource),
            None => Api::all_with(self.client.clone(), &r.resource),
        })
    }

    async fn api_for(&self, gvk: &Gvk, key: &ObjectKey) -> Result<Api<DynamicObject>> {
        self.api(gvk, key.namespace()).await
    }
}

fn typed(gvk: &Gvk, mut obj: DynamicObject) -> DynamicObject {
    meta::set_gvk(&mut obj, gvk);
    obj
}

#[async_trait]
impl Reader for DirectClient {
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let api = self.api_for(gvk, key).await?;
        let obj = api.get_opt(&key.name).await.map_err(|e| map_err(gvk, key, e))?;
        Ok(obj.map(|o| typed(gvk, o)))
    }

    async fn list(&self, gvk: &Gvk, opts: &ListOptions) -> Result<Vec<DynamicObject>> {
        let api = self.api(gvk, opts.namespace.as_deref()).await?;
        let list = api
            .list(&list_params(opts))
            .await
            .map_err(|e| map_err(gvk, &ObjectKey::cluster(""), e))?;
        trace!(gvk = %gvk, count = list.items.len(), "listed");
        Ok(list.items.into_iter().map(|o| typed(gvk, o)).collect())
    }

    async fn is_namespaced(&self, gvk: &Gvk) -> Result<bool> {
        Ok(self.resolver.resolve(gvk).await?.namespaced)
    }
}

#[async_trait]
impl Writer for DirectClient {
    async fn create(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = meta::key_of(obj);
        let api = self.api_for(gvk, &key).await?;
        let created = api.create(&PostParams::default(), obj).await.map_err(|e| map_err(gvk, &key, e))?;
        Ok(typed(gvk, created))
    }

    async fn update(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = meta::key_of(obj);
        let api = self.api_for(gvk, &key).await?;
        let updated = api.replace(&key.name, &PostParams::default(), obj).await.map_err(|e| map_err(gvk, &key, e))?;
        Ok(typed(gvk, updated))
    }

    async fn patch(&self, gvk: &Gvk, key: &ObjectKey, kind: PatchKind, patch: &Value) -> Result<DynamicObject> {
        let api = self.api_for(gvk, key).await?;
        let p = match kind {
            PatchKind::Strategic => Patch::Strategic(patch),
            PatchKind::Merge => Patch::Merge(patch),
        };
        let patched = api.patch(&key.name, &PatchParams::default(), &p).await.map_err(|e| map_err(gvk, key, e))?;
        Ok(typed(gvk, patched))
    }

    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> Result<()> {
        let api = self.api_for(gvk, key).await?;
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(map_err(gvk, key, e)),
        }
    }

    async fn update_status(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = meta::key_of(obj);
        let api = self.api_for(gvk, &key).await?;
        let body = serde_json::to_vec(obj)?;
        let updated = api.replace_status(&key.name, &PostParams::default(), body).await.map_err(|e| map_err(gvk, &key, e))?;
        Ok(typed(gvk, updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_render_into_list_params() {
        let opts = ListOptions::in_namespace("ns")
            .with_labels("app=web".parse().unwrap())
            .with_fields("metadata.name=a".parse().unwrap());
        let lp = list_params(&opts);
        assert_eq!(lp.label_selector.as_deref(), Some("app=web"));
        assert_eq!(lp.field_selector.as_deref(), Some("metadata.name=a"));

        let lp = list_params(&ListOptions::default());
        assert!(lp.label_selector.is_none());
        assert!(lp.field_selector.is_none());
    }
}
