//! Owner context: the labels and annotations stamped on every managed object
//! and the hash used to list an owner's children with one selector.

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use sha1::{Digest, Sha1};
use trellis_core::{meta, Gvk, LabelSelector, ObjectKey, Result};

pub const LABEL_PREFIX: &str = "apply.acorn.io/";

pub const LABEL_SUB_CONTEXT: &str = "apply.acorn.io/owner-sub-context";
pub const LABEL_GVK: &str = "apply.acorn.io/owner-gvk";
pub const LABEL_NAME: &str = "apply.acorn.io/owner-name";
pub const LABEL_NAMESPACE: &str = "apply.acorn.io/owner-namespace";
pub const LABEL_HASH: &str = "apply.acorn.io/hash";

pub const ANNOTATION_PRUNE: &str = "apply.acorn.io/prune";
pub const ANNOTATION_CREATE: &str = "apply.acorn.io/create";
pub const ANNOTATION_UPDATE: &str = "apply.acorn.io/update";
pub const ANNOTATION_APPLIED: &str = "apply.acorn.io/applied";

const HASH_ORDER: [&str; 4] = [LABEL_SUB_CONTEXT, LABEL_GVK, LABEL_NAME, LABEL_NAMESPACE];

/// Identity of the object that owns an applied set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub gvk: Gvk,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl OwnerRef {
    pub fn from_object(obj: &DynamicObject) -> Result<Self> {
        Ok(Self {
            gvk: meta::gvk_of(obj)?,
            namespace: meta::namespace_of(obj).to_string(),
            name: obj.metadata.name.clone().unwrap_or_default(),
            uid: obj.metadata.uid.clone().unwrap_or_default(),
        })
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Whose objects an apply pass manages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Owner {
    /// Plain upsert: no ownership labels, no pruning.
    #[default]
    Unowned,
    /// Scoped to a sub-context and, usually, an owner object.
    Owned { owner: Option<OwnerRef>, sub_context: String },
}

impl Owner {
    pub fn new(owner: OwnerRef, sub_context: impl Into<String>) -> Self {
        Owner::Owned { owner: Some(owner), sub_context: sub_context.into() }
    }

    pub fn owner_ref(&self) -> Option<&OwnerRef> {
        match self {
            Owner::Owned { owner, .. } => owner.as_ref(),
            Owner::Unowned => None,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Owner::Owned { .. })
    }

    /// Annotations describing the owner; empty for [`Owner::Unowned`].
    pub fn annotations(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let Owner::Owned { owner, sub_context } = self {
            out.insert(LABEL_SUB_CONTEXT.to_string(), sub_context.clone());
            if let Some(owner) = owner {
                out.insert(LABEL_GVK.to_string(), owner.gvk.legacy_string());
                out.insert(LABEL_NAME.to_string(), owner.name.clone());
                out.insert(LABEL_NAMESPACE.to_string(), owner.namespace.clone());
            }
        }
        out
    }

    /// `{hash-label: digest}` or empty when unowned.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let annotations = self.annotations();
        if annotations.is_empty() {
            return BTreeMap::new();
        }
        BTreeMap::from([(LABEL_HASH.to_string(), ownership_hash(&annotations))])
    }

    /// Equality selector on the hash label; `None` when unowned.
    pub fn selector(&self) -> Option<LabelSelector> {
        let labels = self.labels();
        if labels.is_empty() {
            None
        } else {
            Some(LabelSelector::from_labels(labels))
        }
    }

    /// Short description used in logs and error messages.
    pub fn debug_id(&self) -> String {
        match self {
            Owner::Unowned => String::new(),
            Owner::Owned { owner: None, sub_context } => sub_context.clone(),
            Owner::Owned { owner: Some(o), sub_context } => format!("{} {}", sub_context, o.key()),
        }
    }
}

/// SHA-1 over sub-context, owner GVK, owner name and owner namespace, hex encoded.
pub fn ownership_hash(annotations: &BTreeMap<String, String>) -> String {
    let mut dig = Sha1::new();
    for key in HASH_ORDER {
        dig.update(annotations.get(key).map(String::as_str).unwrap_or("").as_bytes());
    }
    hex::encode(dig.finalize())
}

/// Annotation gate: everything participates unless the annotation is `"false"`.
pub fn should(obj: &DynamicObject, annotation: &str) -> bool {
    meta::annotation(obj, annotation) != Some("false")
}

/// Merge owner labels and annotations into `obj`, dropping any stale applied snapshot.
pub fn stamp(obj: &mut DynamicObject, labels: &BTreeMap<String, String>, annotations: &BTreeMap<String, String>) {
    if !labels.is_empty() {
        let objects_labels = obj.metadata.labels.get_or_insert_with(BTreeMap::new);
        objects_labels.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    if let Some(a) = obj.metadata.annotations.as_mut() {
        a.remove(ANNOTATION_APPLIED);
    }
    if !annotations.is_empty() {
        let objects_annotations = obj.metadata.annotations.get_or_insert_with(BTreeMap::new);
        objects_annotations.extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

fn annotation_of<'a>(obj: &'a DynamicObject, key: &str) -> &'a str {
    meta::annotation(obj, key).unwrap_or("")
}

fn same_owner(existing: &DynamicObject, desired: &DynamicObject) -> bool {
    [LABEL_GVK, LABEL_NAMESPACE, LABEL_NAME].iter().all(|k| annotation_of(existing, k) == annotation_of(desired, k))
}

/// Existing object had no sub-context; the same owner now assigns one.
pub fn is_assigning_sub_context(existing: &DynamicObject, desired: &DynamicObject) -> bool {
    annotation_of(existing, LABEL_SUB_CONTEXT).is_empty()
        && !annotation_of(desired, LABEL_SUB_CONTEXT).is_empty()
        && same_owner(existing, desired)
}

/// Same owner moving between two sub-contexts listed as `"old => new"` in `allowed`.
pub fn is_allowed_owner_transition(existing: &DynamicObject, desired: &DynamicObject, allowed: &[String]) -> bool {
    let new_sub = annotation_of(desired, LABEL_SUB_CONTEXT);
    if new_sub.is_empty() || !same_owner(existing, desired) {
        return false;
    }
    let transition = format!("{} => {}", annotation_of(existing, LABEL_SUB_CONTEXT), new_sub);
    allowed.iter().any(|a| *a == transition)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> OwnerRef {
        OwnerRef { gvk: Gvk::new("", "v1", "ConfigMap"), namespace: "ns".into(), name: "parent".into(), uid: "u1".into() }
    }

    #[test]
    fn hash_is_stable_and_scoped() {
        let a = Owner::new(owner(), "ctl");
        let b = Owner::new(owner(), "other");
        assert_eq!(a.labels(), a.labels());
        assert_ne!(a.labels()[LABEL_HASH], b.labels()[LABEL_HASH]);
        assert_eq!(a.labels()[LABEL_HASH].len(), 40);
        assert_eq!(a.annotations()[LABEL_GVK], "/v1, Kind=ConfigMap");

        let mut by_hand = Sha1::new();
        by_hand.update(b"ctl/v1, Kind=ConfigMapparentns");
        assert_eq!(a.labels()[LABEL_HASH], hex::encode(by_hand.finalize()));

        assert!(Owner::Unowned.labels().is_empty());
        assert!(Owner::Unowned.selector().is_none());
        assert_eq!(a.debug_id(), "ctl ns/parent");
    }

    #[test]
    fn sub_context_transitions() {
        let mut existing: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s", "namespace": "ns"}
        }))
        .unwrap();
        let mut desired = existing.clone();
        stamp(&mut existing, &Owner::new(owner(), "").labels(), &Owner::new(owner(), "").annotations());
        stamp(&mut desired, &Owner::new(owner(), "new").labels(), &Owner::new(owner(), "new").annotations());
        assert!(is_assigning_sub_context(&existing, &desired));

        let mut old = existing.clone();
        stamp(&mut old, &BTreeMap::new(), &Owner::new(owner(), "old").annotations());
        assert!(!is_assigning_sub_context(&old, &desired));
        assert!(is_allowed_owner_transition(&old, &desired, &["old => new".to_string()]));
        assert!(!is_allowed_owner_transition(&old, &desired, &[]));
    }
}
