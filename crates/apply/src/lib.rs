//! Trellis apply: converge live state to a desired object set for one owner.
//!
//! Per GVK the engine lists the owner's existing children with one selector,
//! creates what is missing, three-way patches what exists, and prunes what
//! the owner no longer wants. Failures are collected per object; nothing is
//! rolled back, callers retry the whole apply.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use metrics::{counter, histogram};
use tracing::{debug, warn};
use trellis_core::error::aggregate;
use trellis_core::objectset::ObjectsByKey;
use trellis_core::{meta, Client, Error, Gvk, LabelSelector, ListOptions, ObjectKey, ObjectSet, Result};

pub mod ownership;
pub mod patch;
pub mod replace;
pub mod snapshot;

pub use ownership::{Owner, OwnerRef};
pub use replace::{ReplaceDetector, ReplaceRegistry};

use ownership::{should, ANNOTATION_CREATE, ANNOTATION_PRUNE, ANNOTATION_UPDATE, LABEL_HASH};

/// Apply configuration. Cheap to clone; every `with_*` returns a modified copy.
#[derive(Clone)]
pub struct Apply {
    client: Arc<dyn Client>,
    sub_context: String,
    default_namespace: String,
    lister_namespace: Option<String>,
    prune_gvks: BTreeSet<Gvk>,
    no_prune: bool,
    replace: ReplaceRegistry,
    allowed_transitions: Vec<String>,
}

impl std::fmt::Debug for Apply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Apply")
            .field("sub_context", &self.sub_context)
            .field("default_namespace", &self.default_namespace)
            .field("prune_gvks", &self.prune_gvks)
            .field("no_prune", &self.no_prune)
            .finish()
    }
}

enum Updated {
    Unchanged,
    Patched,
    Replace,
}

/// State shared by every GVK of one apply call.
struct Pass<'a> {
    owner: Owner,
    selector: Option<LabelSelector>,
    debug_id: String,
    all: &'a ObjectSet,
}

impl Apply {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self {
            client,
            sub_context: String::new(),
            default_namespace: String::new(),
            lister_namespace: None,
            prune_gvks: BTreeSet::new(),
            no_prune: false,
            replace: ReplaceRegistry::default(),
            allowed_transitions: Vec::new(),
        }
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    /// Namespace for namespaced objects that have none, and the namespace
    /// existing children are listed in.
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        let ns = ns.into();
        self.lister_namespace = if ns.is_empty() { None } else { Some(ns.clone()) };
        self.default_namespace = ns;
        self
    }

    pub fn with_owner_sub_context(mut self, sub_context: impl Into<String>) -> Self {
        self.sub_context = sub_context.into();
        self
    }

    /// Also consider these GVKs for pruning when the desired set has none of them.
    pub fn with_prune_gvks<I: IntoIterator<Item = Gvk>>(mut self, gvks: I) -> Self {
        self.prune_gvks.extend(gvks);
        self
    }

    pub fn with_prune_type<K: kube::Resource<DynamicType = ()>>(self) -> Self {
        self.with_prune_gvks([Gvk::of::<K>()])
    }

    pub fn with_no_prune(mut self) -> Self {
        self.no_prune = true;
        self
    }

    pub fn with_replace_detector<D: ReplaceDetector + 'static>(mut self, gvk: Gvk, detector: D) -> Self {
        self.replace.register(gvk, detector);
        self
    }

    /// Allow adopting an object whose sub-context moves `from => to` for the same owner.
    pub fn with_allowed_owner_transition(mut self, from: &str, to: &str) -> Self {
        self.allowed_transitions.push(format!("{} => {}", from, to));
        self
    }

    /// Owner-scoped apply with pruning.
    pub async fn apply(&self, owner: &DynamicObject, objs: &ObjectSet) -> Result<()> {
        let owner = Owner::new(OwnerRef::from_object(owner)?, self.sub_context.clone());
        self.apply_as(owner, objs).await
    }

    /// Unscoped upsert: no ownership labels, nothing is ever pruned.
    pub async fn ensure(&self, objs: &ObjectSet) -> Result<()> {
        self.apply_as(Owner::Unowned, objs).await
    }

    pub async fn apply_as(&self, owner: Owner, objs: &ObjectSet) -> Result<()> {
        let t0 = Instant::now();
        let gvk_order = objs.gvk_order(self.prune_gvks.iter());
        let labels = owner.labels();
        let annotations = owner.annotations();
        let stamped = objs.clone().map_objects(|_, mut obj| {
            ownership::stamp(&mut obj, &labels, &annotations);
            Ok(obj)
        })?;
        let pass = Pass { selector: owner.selector(), debug_id: owner.debug_id(), owner, all: &stamped };

        let mut results = Vec::with_capacity(gvk_order.len());
        for gvk in &gvk_order {
            results.push(self.process(&pass, gvk).await);
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        let res = aggregate(results);
        if let Err(e) = &res {
            counter!("apply_error_total", 1u64);
            warn!(owner = %pass.debug_id, error = %e, "apply failed");
        }
        res
    }

    async fn process(&self, pass: &Pass<'_>, gvk: &Gvk) -> Result<()> {
        let mut objs = pass.all.objects_by_gvk(gvk).cloned().unwrap_or_default();
        let namespaced = self.client.is_namespaced(gvk).await?;

        if let Some(owner) = pass.owner.owner_ref() {
            let owner_namespaced = self.client.is_namespaced(&owner.gvk).await?;
            objs = assign_owner_reference(owner, owner_namespaced, namespaced, objs);
        }
        objs = if namespaced { adjust_namespace(objs, &self.default_namespace) } else { clear_namespace(objs) };

        let mut existing = self
            .list(gvk, pass.selector.as_ref(), &objs)
            .await
            .map_err(|e| e.context(format!("failed to list {} for {}", gvk, pass.debug_id)))?;

        let (to_create, to_delete, mut to_update) = compare_sets(&existing, &objs);
        let mut to_delete = filter_cross_version(pass.all, gvk, to_delete, &self.default_namespace);

        let mut results = Vec::new();
        for key in &to_create {
            results.push(self.create(pass, gvk, key, &objs[key], &mut existing, &mut to_update).await);
        }

        let mut recreate = Vec::new();
        for key in &to_update {
            let (Some(current), Some(desired)) = (existing.get(key), objs.get(key)) else { continue };
            match self.update(pass, gvk, key, current, desired).await {
                Ok(Updated::Replace) => {
                    if should(current, ANNOTATION_PRUNE) && should(current, ANNOTATION_CREATE) {
                        counter!("apply_replace_total", 1u64);
                        debug!(gvk = %gvk, key = %key, owner = %pass.debug_id, "replacing");
                        to_delete.push(key.clone());
                        recreate.push(key.clone());
                    }
                }
                Ok(_) => {}
                Err(e) => results.push(Err(e.context(format!("failed to update {} {} for {}", key, gvk, pass.debug_id)))),
            }
        }

        if !self.no_prune {
            for key in &to_delete {
                results.push(self.delete(pass, gvk, key).await);
            }
        }

        for key in &recreate {
            let mut ignored = Vec::new();
            results.push(self.create(pass, gvk, key, &objs[key], &mut existing, &mut ignored).await);
        }

        aggregate(results)
    }

    async fn list(&self, gvk: &Gvk, selector: Option<&LabelSelector>, objs: &ObjectsByKey) -> Result<ObjectsByKey> {
        let mut out = ObjectsByKey::new();
        match selector {
            Some(sel) => {
                let opts = ListOptions { namespace: self.lister_namespace.clone(), ..Default::default() }
                    .with_labels(sel.clone());
                for obj in self.client.list(gvk, &opts).await? {
                    out.insert(meta::key_of(&obj), obj);
                }
            }
            None => {
                for key in objs.keys() {
                    if let Some(obj) = self.client.get(gvk, key).await? {
                        out.insert(key.clone(), obj);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn create(
        &self,
        pass: &Pass<'_>,
        gvk: &Gvk,
        key: &ObjectKey,
        desired: &DynamicObject,
        existing: &mut ObjectsByKey,
        to_update: &mut Vec<ObjectKey>,
    ) -> Result<()> {
        let prepared = snapshot::prepare_for_create(gvk, desired)
            .map_err(|e| e.context(format!("failed to prepare create {} {} for {}", key, gvk, pass.debug_id)))?;
        match self.client.create(gvk, &prepared).await {
            Ok(_) => {
                counter!("apply_create_total", 1u64);
                debug!(gvk = %gvk, key = %key, owner = %pass.debug_id, "created");
                Ok(())
            }
            Err(err) if err.is_already_exists() => {
                let live = match self.client.get(gvk, key).await {
                    Ok(Some(live)) => live,
                    _ => return Err(err.context(format!("failed to create {} {} for {}", key, gvk, pass.debug_id))),
                };
                let live_hash = meta::label(&live, LABEL_HASH).unwrap_or("");
                let our_hash = meta::label(&prepared, LABEL_HASH).unwrap_or("");
                if !live_hash.is_empty()
                    && live_hash != our_hash
                    && !ownership::is_assigning_sub_context(&live, &prepared)
                    && !ownership::is_allowed_owner_transition(&live, &prepared, &self.allowed_transitions)
                {
                    let note = |k: &str| meta::annotation(&live, k).unwrap_or("").to_string();
                    return Err(Error::OwnershipConflict {
                        gvk: gvk.clone(),
                        key: key.clone(),
                        message: format!(
                            "owned by subcontext [{}] gvk [{}] namespace [{}] name [{}], wanted by {}",
                            note(ownership::LABEL_SUB_CONTEXT),
                            note(ownership::LABEL_GVK),
                            note(ownership::LABEL_NAMESPACE),
                            note(ownership::LABEL_NAME),
                            pass.debug_id
                        ),
                    });
                }
                debug!(gvk = %gvk, key = %key, owner = %pass.debug_id, "adopting existing object");
                if should(&prepared, ANNOTATION_UPDATE) {
                    to_update.push(key.clone());
                }
                existing.insert(key.clone(), live);
                Ok(())
            }
            Err(err) => Err(err.context(format!("failed to create {} {} for {}", key, gvk, pass.debug_id))),
        }
    }

    async fn update(
        &self,
        pass: &Pass<'_>,
        gvk: &Gvk,
        key: &ObjectKey,
        current: &DynamicObject,
        desired: &DynamicObject,
    ) -> Result<Updated> {
        let modified_obj = snapshot::prepare_for_create(gvk, desired)?;
        let original = snapshot::original_value(gvk, current)?;
        let modified = serde_json::to_value(&modified_obj)?;
        let live = serde_json::to_value(current)?;

        let kind = patch::patch_kind_for(gvk);
        let diff = patch::three_way(kind, &original, &modified, &live);
        if patch::is_empty(&diff) {
            return Ok(Updated::Unchanged);
        }
        let diff = patch::sanitize(diff);
        if patch::is_empty(&diff) {
            return Ok(Updated::Unchanged);
        }

        if let Some(detector) = self.replace.get(gvk) {
            let original_obj = match snapshot::original_object(gvk, current)? {
                Some(o) => o,
                None => current.clone(),
            };
            if detector.needs_replace(&original_obj, &modified_obj)? {
                return Ok(Updated::Replace);
            }
        }

        debug!(gvk = %gvk, key = %key, owner = %pass.debug_id, patch = %diff, "patching");
        self.client.patch(gvk, key, kind, &diff).await?;
        counter!("apply_patch_total", 1u64);
        Ok(Updated::Patched)
    }

    async fn delete(&self, pass: &Pass<'_>, gvk: &Gvk, key: &ObjectKey) -> Result<()> {
        self.client
            .delete(gvk, key)
            .await
            .map_err(|e| e.context(format!("failed to delete {} {} for {}", key, gvk, pass.debug_id)))?;
        counter!("apply_delete_total", 1u64);
        debug!(gvk = %gvk, key = %key, owner = %pass.debug_id, "deleted");
        Ok(())
    }
}

/// Point children at `owner`. A namespaced owner only owns namespaced
/// children in its own namespace; children without a namespace get the owner's.
fn assign_owner_reference(owner: &OwnerRef, owner_namespaced: bool, namespaced: bool, objs: ObjectsByKey) -> ObjectsByKey {
    let mut out = ObjectsByKey::new();
    for (key, mut obj) in objs {
        if owner_namespaced && !namespaced {
            out.insert(key, obj);
            continue;
        }
        let assign_ns = namespaced && key.namespace.is_empty();
        if namespaced && !assign_ns && owner_namespaced && key.namespace != owner.namespace {
            out.insert(key, obj);
            continue;
        }
        if assign_ns {
            meta::set_namespace(&mut obj, &owner.namespace);
        }
        let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
        if !owner.uid.is_empty() && !refs.iter().any(|r| r.uid == owner.uid) {
            refs.push(OwnerReference {
                api_version: owner.gvk.api_version(),
                kind: owner.gvk.kind.clone(),
                name: owner.name.clone(),
                uid: owner.uid.clone(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            });
        }
        if refs.is_empty() {
            obj.metadata.owner_references = None;
        }
        let key = if assign_ns { ObjectKey::new(owner.namespace.clone(), key.name) } else { key };
        out.insert(key, obj);
    }
    out
}

fn adjust_namespace(objs: ObjectsByKey, default_namespace: &str) -> ObjectsByKey {
    objs.into_iter()
        .map(|(key, mut obj)| {
            if !key.namespace.is_empty() {
                return (key, obj);
            }
            meta::set_namespace(&mut obj, default_namespace);
            (ObjectKey::new(default_namespace, key.name), obj)
        })
        .collect()
}

fn clear_namespace(objs: ObjectsByKey) -> ObjectsByKey {
    objs.into_iter()
        .map(|(key, mut obj)| {
            obj.metadata.namespace = None;
            (ObjectKey::cluster(key.name), obj)
        })
        .collect()
}

fn sort_keys(keys: &mut [ObjectKey]) {
    keys.sort_by_key(|k| k.to_string());
}

/// (create, delete, update), each sorted by key.
fn compare_sets(existing: &ObjectsByKey, desired: &ObjectsByKey) -> (Vec<ObjectKey>, Vec<ObjectKey>, Vec<ObjectKey>) {
    let mut create = Vec::new();
    let mut update = Vec::new();
    for (key, obj) in desired {
        if existing.contains_key(key) {
            if should(obj, ANNOTATION_CREATE) {
                update.push(key.clone());
            }
        } else if should(obj, ANNOTATION_UPDATE) {
            create.push(key.clone());
        }
    }
    let mut delete: Vec<ObjectKey> = existing
        .iter()
        .filter(|(key, obj)| !desired.contains_key(*key) && should(obj, ANNOTATION_PRUNE) && !meta::is_deleting(obj))
        .map(|(key, _)| key.clone())
        .collect();
    sort_keys(&mut create);
    sort_keys(&mut delete);
    sort_keys(&mut update);
    (create, delete, update)
}

/// Keep deletes whose group/kind + key is not desired under another version.
fn filter_cross_version(all: &ObjectSet, gvk: &Gvk, keys: Vec<ObjectKey>, default_namespace: &str) -> Vec<ObjectKey> {
    let gk = gvk.group_kind();
    keys.into_iter()
        .filter(|key| {
            if all.contains(&gk, key) {
                return false;
            }
            !(key.namespace == default_namespace && all.contains(&gk, &ObjectKey::cluster(key.name.clone())))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(ns: &str, name: &str, annotations: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": ns, "annotations": annotations}
        }))
        .unwrap()
    }

    fn map(objs: Vec<DynamicObject>) -> ObjectsByKey {
        objs.into_iter().map(|o| (meta::key_of(&o), o)).collect()
    }

    #[test]
    fn compare_sets_honours_opt_outs() {
        let desired = map(vec![
            obj("ns", "new", json!({})),
            obj("ns", "new-no-update", json!({ANNOTATION_UPDATE: "false"})),
            obj("ns", "both", json!({})),
            obj("ns", "both-no-create", json!({ANNOTATION_CREATE: "false"})),
        ]);
        let existing = map(vec![
            obj("ns", "both", json!({})),
            obj("ns", "both-no-create", json!({})),
            obj("ns", "stale", json!({})),
            obj("ns", "keep", json!({ANNOTATION_PRUNE: "false"})),
        ]);
        let (create, delete, update) = compare_sets(&existing, &desired);
        assert_eq!(create, vec![ObjectKey::new("ns", "new")]);
        assert_eq!(update, vec![ObjectKey::new("ns", "both")]);
        assert_eq!(delete, vec![ObjectKey::new("ns", "stale")]);
    }

    #[test]
    fn cross_version_keys_are_not_deleted() {
        let mut all = ObjectSet::new();
        all.insert(Gvk::new("example.com", "v2", "Widget"), obj("ns", "w", json!({})));
        all.insert(Gvk::new("example.com", "v2", "Widget"), obj("", "bare", json!({})));
        let old = Gvk::new("example.com", "v1", "Widget");
        let keys = vec![ObjectKey::new("ns", "w"), ObjectKey::new("ns", "bare"), ObjectKey::new("ns", "gone")];
        assert_eq!(filter_cross_version(&all, &old, keys, "ns"), vec![ObjectKey::new("ns", "gone")]);
    }

    #[test]
    fn owner_references_respect_scope() {
        let owner = OwnerRef { gvk: Gvk::new("", "v1", "ConfigMap"), namespace: "ns".into(), name: "p".into(), uid: "u1".into() };
        let objs = map(vec![obj("", "bare", json!({})), obj("other", "far", json!({})), obj("ns", "near", json!({}))]);
        let out = assign_owner_reference(&owner, true, true, objs);
        let bare = &out[&ObjectKey::new("ns", "bare")];
        assert_eq!(bare.metadata.owner_references.as_ref().unwrap()[0].uid, "u1");
        assert!(out[&ObjectKey::new("other", "far")].metadata.owner_references.is_none());
        assert_eq!(out[&ObjectKey::new("ns", "near")].metadata.owner_references.as_ref().unwrap().len(), 1);

        // a namespaced owner never owns cluster-scoped children
        let cluster = map(vec![obj("", "c", json!({}))]);
        let out = assign_owner_reference(&owner, true, false, cluster);
        assert!(out[&ObjectKey::cluster("c")].metadata.owner_references.is_none());
    }
}
