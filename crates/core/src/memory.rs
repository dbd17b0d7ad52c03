//! In-memory store implementing the full [`Backend`] contract: increasing
//! resource versions, finalizer-aware deletion, status subresource and
//! change notifications. Every write is journaled for inspection in tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::client::{Backend, Client, EventSink, ListOptions, PatchKind, Reader, Writer};
use crate::{merge, meta, Error, GroupKind, Gvk, ObjectKey, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Create { gvk: Gvk, key: ObjectKey },
    Update { gvk: Gvk, key: ObjectKey },
    Patch { gvk: Gvk, key: ObjectKey, kind: PatchKind, patch: Value },
    Delete { gvk: Gvk, key: ObjectKey },
    Status { gvk: Gvk, key: ObjectKey },
}

impl Write {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Write::Create { key, .. }
            | Write::Update { key, .. }
            | Write::Patch { key, .. }
            | Write::Delete { key, .. }
            | Write::Status { key, .. } => key,
        }
    }
}

struct State {
    objects: BTreeMap<Gvk, BTreeMap<ObjectKey, DynamicObject>>,
    cluster_scoped: HashSet<GroupKind>,
    sinks: HashMap<Gvk, Vec<Arc<dyn EventSink>>>,
    next_rv: u64,
    writes: Vec<Write>,
}

impl Default for State {
    fn default() -> Self {
        let cluster_scoped = [
            ("", "Namespace"),
            ("", "Node"),
            ("", "PersistentVolume"),
            ("rbac.authorization.k8s.io", "ClusterRole"),
            ("rbac.authorization.k8s.io", "ClusterRoleBinding"),
            ("apiextensions.k8s.io", "CustomResourceDefinition"),
            ("storage.k8s.io", "StorageClass"),
        ]
        .into_iter()
        .map(|(g, k)| GroupKind { group: g.into(), kind: k.into() })
        .collect();
        Self { objects: BTreeMap::new(), cluster_scoped, sinks: HashMap::new(), next_rv: 1, writes: Vec::new() }
    }
}

type Notify = Vec<(Arc<dyn EventSink>, Gvk, ObjectKey)>;

impl State {
    fn bump(&mut self, obj: &mut DynamicObject) {
        obj.metadata.resource_version = Some(self.next_rv.to_string());
        self.next_rv += 1;
    }

    fn notify(&self, gvk: &Gvk, key: &ObjectKey) -> Notify {
        self.sinks
            .get(gvk)
            .map(|sinks| sinks.iter().map(|s| (s.clone(), gvk.clone(), key.clone())).collect())
            .unwrap_or_default()
    }

    fn current(&self, gvk: &Gvk, key: &ObjectKey) -> Result<&DynamicObject> {
        self.objects
            .get(gvk)
            .and_then(|m| m.get(key))
            .ok_or_else(|| Error::NotFound { gvk: gvk.clone(), key: key.clone() })
    }

    fn check_rv(&self, gvk: &Gvk, key: &ObjectKey, current: &DynamicObject, incoming: &DynamicObject) -> Result<()> {
        let want = meta::resource_version(incoming);
        if !want.is_empty() && want != meta::resource_version(current) {
            return Err(Error::Conflict {
                gvk: gvk.clone(),
                key: key.clone(),
                message: format!("resourceVersion {} is stale (current {})", want, meta::resource_version(current)),
            });
        }
        Ok(())
    }

    /// Store `obj`, or drop it when it is deleting and has no finalizers left.
    fn store(&mut self, gvk: &Gvk, key: &ObjectKey, mut obj: DynamicObject) -> DynamicObject {
        self.bump(&mut obj);
        let objects = self.objects.entry(gvk.clone()).or_default();
        if meta::is_deleting(&obj) && meta::finalizers(&obj).is_empty() {
            objects.remove(key);
        } else {
            objects.insert(key.clone(), obj.clone());
        }
        obj
    }
}

/// Shared-state store; clones see the same objects.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<State>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("MemoryStore").field("gvks", &st.objects.len()).field("next_rv", &st.next_rv).finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deliver(notify: Notify) {
        for (sink, gvk, key) in notify {
            sink.enqueue(&gvk, key);
        }
    }

    pub fn set_namespaced(&self, gk: GroupKind, namespaced: bool) {
        let mut st = self.lock();
        if namespaced {
            st.cluster_scoped.remove(&gk);
        } else {
            st.cluster_scoped.insert(gk);
        }
    }

    /// Seed an object directly (no journal entry). Watchers are still notified.
    pub fn insert(&self, mut obj: DynamicObject) -> Result<DynamicObject> {
        let gvk = meta::gvk_of(&obj)?;
        let key = meta::key_of(&obj);
        let (stored, notify) = {
            let mut st = self.lock();
            if obj.metadata.uid.is_none() {
                obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
            }
            let stored = st.store(&gvk, &key, obj);
            (stored, st.notify(&gvk, &key))
        };
        Self::deliver(notify);
        Ok(stored)
    }

    /// Synchronous read used by assertions.
    pub fn object(&self, gvk: &Gvk, key: &ObjectKey) -> Option<DynamicObject> {
        self.lock().objects.get(gvk).and_then(|m| m.get(key)).cloned()
    }

    pub fn objects(&self, gvk: &Gvk) -> Vec<DynamicObject> {
        self.lock().objects.get(gvk).map(|m| m.values().cloned().collect()).unwrap_or_default()
    }

    pub fn writes(&self) -> Vec<Write> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }
}

#[async_trait]
impl Reader for MemoryStore {
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        Ok(self.object(gvk, key))
    }

    async fn list(&self, gvk: &Gvk, opts: &ListOptions) -> Result<Vec<DynamicObject>> {
        let st = self.lock();
        Ok(st
            .objects
            .get(gvk)
            .map(|m| m.values().filter(|o| opts.matches(o)).cloned().collect())
            .unwrap_or_default())
    }

    async fn is_namespaced(&self, gvk: &Gvk) -> Result<bool> {
        Ok(!self.lock().cluster_scoped.contains(&gvk.group_kind()))
    }
}

#[async_trait]
impl Writer for MemoryStore {
    async fn create(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        let mut obj = obj.clone();
        meta::set_gvk(&mut obj, gvk);
        let (stored, notify) = {
            let mut st = self.lock();
            if st.cluster_scoped.contains(&gvk.group_kind()) {
                obj.metadata.namespace = None;
            }
            if obj.metadata.name.as_deref().unwrap_or("").is_empty() {
                match obj.metadata.generate_name.as_deref() {
                    Some(prefix) if !prefix.is_empty() => {
                        let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(5).collect();
                        obj.metadata.name = Some(format!("{}{}", prefix, suffix));
                    }
                    _ => return Err(Error::InvalidObject(format!("{} object has no name", gvk))),
                }
            }
            let key = meta::key_of(&obj);
            if st.objects.get(gvk).map(|m| m.contains_key(&key)).unwrap_or(false) {
                return Err(Error::AlreadyExists { gvk: gvk.clone(), key });
            }
            obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
            obj.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
            obj.metadata.generation = Some(1);
            obj.metadata.deletion_timestamp = None;
            let stored = st.store(gvk, &key, obj);
            st.writes.push(Write::Create { gvk: gvk.clone(), key: key.clone() });
            trace!(gvk = %gvk, key = %key, "memory create");
            (stored, st.notify(gvk, &key))
        };
        Self::deliver(notify);
        Ok(stored)
    }

    async fn update(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = meta::key_of(obj);
        let (stored, notify) = {
            let mut st = self.lock();
            let current = st.current(gvk, &key)?.clone();
            st.check_rv(gvk, &key, &current, obj)?;
            let mut next = obj.clone();
            meta::set_gvk(&mut next, gvk);
            match current.data.get("status") {
                Some(status) => {
                    if let Value::Object(m) = &mut next.data {
                        m.insert("status".into(), status.clone());
                    }
                }
                None => {
                    if let Value::Object(m) = &mut next.data {
                        m.remove("status");
                    }
                }
            }
            keep_system_meta(&current, &mut next);
            if strip_status(&current.data) != strip_status(&next.data) {
                next.metadata.generation = Some(current.metadata.generation.unwrap_or(1) + 1);
            }
            let stored = st.store(gvk, &key, next);
            st.writes.push(Write::Update { gvk: gvk.clone(), key: key.clone() });
            (stored, st.notify(gvk, &key))
        };
        Self::deliver(notify);
        Ok(stored)
    }

    async fn patch(&self, gvk: &Gvk, key: &ObjectKey, kind: PatchKind, patch: &Value) -> Result<DynamicObject> {
        let (stored, notify) = {
            let mut st = self.lock();
            let current = st.current(gvk, key)?.clone();
            let mut doc = serde_json::to_value(&current)?;
            merge::apply_patch(&mut doc, kind, patch);
            let mut next: DynamicObject = serde_json::from_value(doc)?;
            meta::set_gvk(&mut next, gvk);
            next.metadata.name = current.metadata.name.clone();
            next.metadata.namespace = current.metadata.namespace.clone();
            keep_system_meta(&current, &mut next);
            if strip_status(&current.data) != strip_status(&next.data) {
                next.metadata.generation = Some(current.metadata.generation.unwrap_or(1) + 1);
            }
            let stored = st.store(gvk, key, next);
            st.writes.push(Write::Patch { gvk: gvk.clone(), key: key.clone(), kind, patch: patch.clone() });
            (stored, st.notify(gvk, key))
        };
        Self::deliver(notify);
        Ok(stored)
    }

    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> Result<()> {
        let notify = {
            let mut st = self.lock();
            let Some(current) = st.objects.get(gvk).and_then(|m| m.get(key)).cloned() else {
                return Ok(());
            };
            if meta::finalizers(&current).is_empty() {
                if let Some(m) = st.objects.get_mut(gvk) {
                    m.remove(key);
                }
            } else if !meta::is_deleting(&current) {
                let mut next = current;
                next.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                st.store(gvk, key, next);
            }
            st.writes.push(Write::Delete { gvk: gvk.clone(), key: key.clone() });
            st.notify(gvk, key)
        };
        Self::deliver(notify);
        Ok(())
    }

    async fn update_status(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = meta::key_of(obj);
        let (stored, notify) = {
            let mut st = self.lock();
            let current = st.current(gvk, &key)?.clone();
            st.check_rv(gvk, &key, &current, obj)?;
            let mut next = current;
            if let Value::Object(m) = &mut next.data {
                match obj.data.get("status") {
                    Some(status) => m.insert("status".into(), status.clone()),
                    None => m.remove("status"),
                };
            }
            let stored = st.store(gvk, &key, next);
            st.writes.push(Write::Status { gvk: gvk.clone(), key: key.clone() });
            (stored, st.notify(gvk, &key))
        };
        Self::deliver(notify);
        Ok(stored)
    }
}

#[async_trait]
impl Backend for MemoryStore {
    /// Existing objects are replayed to the new sink, like an initial list.
    async fn watch(&self, gvk: &Gvk, sink: Arc<dyn EventSink>) -> Result<()> {
        let existing: Vec<ObjectKey> = {
            let mut st = self.lock();
            st.sinks.entry(gvk.clone()).or_default().push(sink.clone());
            st.objects.get(gvk).map(|m| m.keys().cloned().collect()).unwrap_or_default()
        };
        for key in existing {
            sink.enqueue(gvk, key);
        }
        Ok(())
    }

    fn uncached(&self) -> Arc<dyn Client> {
        Arc::new(self.clone())
    }

    async fn start(&self, _shutdown: CancellationToken) -> Result<()> {
        Ok(())
    }
}

fn keep_system_meta(current: &DynamicObject, next: &mut DynamicObject) {
    next.metadata.uid = current.metadata.uid.clone();
    next.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
    next.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
    next.metadata.generation = current.metadata.generation;
}

fn strip_status(data: &Value) -> Value {
    let mut data = data.clone();
    if let Value::Object(m) = &mut data {
        m.remove("status");
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str, data: Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "ns"},
            "data": data
        }))
        .unwrap()
    }

    fn gvk() -> Gvk {
        Gvk::new("", "v1", "ConfigMap")
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ObjectKey>>);

    impl EventSink for Recorder {
        fn enqueue(&self, _gvk: &Gvk, key: ObjectKey) {
            self.0.lock().unwrap().push(key);
        }
    }

    #[tokio::test]
    async fn create_get_conflict_and_versions() {
        let store = MemoryStore::new();
        let created = store.create(&gvk(), &cm("a", json!({"k": "v"}))).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert_eq!(meta::resource_version(&created), "1");

        let err = store.create(&gvk(), &cm("a", json!({}))).await.unwrap_err();
        assert!(err.is_already_exists());

        let mut stale = created.clone();
        stale.metadata.resource_version = Some("0".into());
        assert!(store.update(&gvk(), &stale).await.unwrap_err().is_conflict());

        let patched = store
            .patch(&gvk(), &ObjectKey::new("ns", "a"), PatchKind::Merge, &json!({"data": {"k": "w"}}))
            .await
            .unwrap();
        assert_eq!(patched.data["data"]["k"], "w");
        assert_eq!(meta::resource_version(&patched), "2");
        assert_eq!(store.writes().len(), 2);
    }

    #[tokio::test]
    async fn finalizers_hold_deletion() {
        let store = MemoryStore::new();
        let mut obj = cm("a", json!({}));
        obj.metadata.finalizers = Some(vec!["f1".into()]);
        store.create(&gvk(), &obj).await.unwrap();
        let key = ObjectKey::new("ns", "a");

        store.delete(&gvk(), &key).await.unwrap();
        let deleting = store.object(&gvk(), &key).unwrap();
        assert!(meta::is_deleting(&deleting));

        let mut done = deleting.clone();
        done.metadata.finalizers = Some(vec![]);
        store.update(&gvk(), &done).await.unwrap();
        assert!(store.object(&gvk(), &key).is_none());
        // deleting something already gone is fine
        store.delete(&gvk(), &key).await.unwrap();
    }

    #[tokio::test]
    async fn status_is_separate_and_watchers_fire() {
        let store = MemoryStore::new();
        let rec = Arc::new(Recorder::default());
        store.watch(&gvk(), rec.clone()).await.unwrap();

        let mut obj = cm("a", json!({}));
        obj.data["status"] = json!({"ready": false});
        let created = store.create(&gvk(), &obj).await.unwrap();
        assert_eq!(created.data["status"]["ready"], false);

        let mut upd = created.clone();
        upd.data["status"] = json!({"ready": true});
        let after = store.update(&gvk(), &upd).await.unwrap();
        assert_eq!(after.data["status"]["ready"], false);

        let mut st = after.clone();
        st.data["status"] = json!({"ready": true});
        let after = store.update_status(&gvk(), &st).await.unwrap();
        assert_eq!(after.data["status"]["ready"], true);

        assert_eq!(rec.0.lock().unwrap().len(), 3);
        assert!(!store.is_namespaced(&Gvk::new("", "v1", "Namespace")).await.unwrap());
    }

    #[tokio::test]
    async fn late_watchers_see_existing_objects() {
        let store = MemoryStore::new();
        store.create(&gvk(), &cm("a", json!({}))).await.unwrap();
        store.create(&gvk(), &cm("b", json!({}))).await.unwrap();
        let rec = Arc::new(Recorder::default());
        store.watch(&gvk(), rec.clone()).await.unwrap();
        assert_eq!(*rec.0.lock().unwrap(), vec![ObjectKey::new("ns", "a"), ObjectKey::new("ns", "b")]);
    }
}
