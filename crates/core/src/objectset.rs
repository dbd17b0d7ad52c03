//! Desired objects for one reconciliation pass, indexed by GVK and key.

use std::collections::{BTreeMap, BTreeSet};

use kube::core::DynamicObject;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::{meta, GroupKind, Gvk, ObjectKey, Result};

pub type ObjectsByKey = BTreeMap<ObjectKey, DynamicObject>;

/// Ordered GVK -> (key -> object) mapping. A second object with the same
/// GVK and key replaces the first (last write wins).
#[derive(Debug, Clone, Default)]
pub struct ObjectSet {
    objects: FxHashMap<Gvk, ObjectsByKey>,
    by_group_kind: FxHashMap<GroupKind, FxHashSet<ObjectKey>>,
    order: Vec<(Gvk, ObjectKey)>,
    gvk_order: Vec<Gvk>,
}

impl ObjectSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_objects<I>(objs: I) -> Result<Self>
    where
        I: IntoIterator<Item = DynamicObject>,
    {
        let mut set = Self::new();
        for obj in objs {
            set.add(obj)?;
        }
        Ok(set)
    }

    /// Add an untyped object; its GVK comes from `apiVersion`/`kind`.
    pub fn add(&mut self, obj: DynamicObject) -> Result<()> {
        let gvk = meta::gvk_of(&obj)?;
        self.insert(gvk, obj);
        Ok(())
    }

    /// Add a typed API object using its static GVK.
    pub fn add_resource<K>(&mut self, obj: &K) -> Result<()>
    where
        K: kube::Resource<DynamicType = ()> + Serialize,
    {
        let dynamic = meta::resource_to_dynamic(obj)?;
        self.insert(Gvk::of::<K>(), dynamic);
        Ok(())
    }

    pub fn insert(&mut self, gvk: Gvk, obj: DynamicObject) {
        let key = meta::key_of(&obj);
        if !self.objects.contains_key(&gvk) {
            self.gvk_order.push(gvk.clone());
        }
        self.by_group_kind.entry(gvk.group_kind()).or_default().insert(key.clone());
        self.objects.entry(gvk.clone()).or_default().insert(key.clone(), obj);
        self.order.push((gvk, key));
    }

    pub fn contains(&self, gk: &GroupKind, key: &ObjectKey) -> bool {
        self.by_group_kind.get(gk).map(|keys| keys.contains(key)).unwrap_or(false)
    }

    pub fn objects_by_gvk(&self, gvk: &Gvk) -> Option<&ObjectsByKey> {
        self.objects.get(gvk)
    }

    /// First-seen GVK order, followed by any `known` GVKs that hold no
    /// objects in this set, sorted by their display form.
    pub fn gvk_order<'a, I>(&self, known: I) -> Vec<Gvk>
    where
        I: IntoIterator<Item = &'a Gvk>,
    {
        let mut rest: Vec<Gvk> = known
            .into_iter()
            .filter(|gvk| !self.objects.contains_key(*gvk))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        rest.sort_by_key(|gvk| gvk.to_string());
        let mut out = self.gvk_order.clone();
        out.extend(rest);
        out
    }

    pub fn gvks(&self) -> &[Gvk] {
        &self.gvk_order
    }

    /// Every object in insertion order (replaced objects appear once per insert).
    pub fn all(&self) -> impl Iterator<Item = (&Gvk, &DynamicObject)> + '_ {
        self.order.iter().filter_map(move |(gvk, key)| self.objects.get(gvk).and_then(|m| m.get(key)).map(|o| (gvk, o)))
    }

    /// Distinct namespaces of all objects (cluster-scoped objects contribute "").
    pub fn namespaces(&self) -> Vec<String> {
        self.objects
            .values()
            .flat_map(|m| m.keys().map(|k| k.namespace.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Number of distinct GVKs.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.values().all(|m| m.is_empty())
    }

    /// Apply `f` to every object, re-keying entries whose namespace/name changed.
    pub fn map_objects<F>(self, mut f: F) -> Result<Self>
    where
        F: FnMut(&Gvk, DynamicObject) -> Result<DynamicObject>,
    {
        let mut out = ObjectSet::new();
        for gvk in &self.gvk_order {
            if let Some(objs) = self.objects.get(gvk) {
                for obj in objs.values() {
                    out.insert(gvk.clone(), f(gvk, obj.clone())?);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn cm(ns: &str, name: &str, v: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), ..Default::default() },
            data: Some([("v".to_string(), v.to_string())].into()),
            ..Default::default()
        }
    }

    #[test]
    fn last_write_wins_and_order_is_first_seen() {
        let mut set = ObjectSet::new();
        set.add_resource(&cm("ns", "a", "1")).unwrap();
        set.add_resource(&Secret {
            metadata: ObjectMeta { name: Some("s".into()), namespace: Some("ns".into()), ..Default::default() },
            ..Default::default()
        })
        .unwrap();
        set.add_resource(&cm("ns", "a", "2")).unwrap();

        let cms = set.objects_by_gvk(&Gvk::of::<ConfigMap>()).unwrap();
        assert_eq!(cms.len(), 1);
        assert_eq!(cms[&ObjectKey::new("ns", "a")].data["data"]["v"], "2");
        assert_eq!(set.gvks(), &[Gvk::of::<ConfigMap>(), Gvk::of::<Secret>()]);
        assert!(set.contains(&Gvk::of::<ConfigMap>().group_kind(), &ObjectKey::new("ns", "a")));
        assert_eq!(set.namespaces(), vec!["ns".to_string()]);
    }

    #[test]
    fn known_gvks_are_appended_sorted() {
        let mut set = ObjectSet::new();
        set.add_resource(&cm("ns", "a", "1")).unwrap();
        let known = vec![Gvk::new("apps", "v1", "Deployment"), Gvk::of::<ConfigMap>(), Gvk::new("", "v1", "Secret")];
        let order = set.gvk_order(known.iter());
        assert_eq!(
            order,
            vec![Gvk::of::<ConfigMap>(), Gvk::new("apps", "v1", "Deployment"), Gvk::new("", "v1", "Secret")]
        );
    }
}
