//! Small accessors over `DynamicObject` metadata.

use kube::core::{DynamicObject, TypeMeta};
use serde::{de::DeserializeOwned, Serialize};

use crate::{Error, Gvk, ObjectKey, Result};

/// GVK from the object's `apiVersion`/`kind`.
pub fn gvk_of(obj: &DynamicObject) -> Result<Gvk> {
    let types = obj
        .types
        .as_ref()
        .filter(|t| !t.kind.is_empty() && !t.api_version.is_empty())
        .ok_or_else(|| {
            Error::InvalidObject(format!(
                "object {} is missing apiVersion/kind",
                obj.metadata.name.as_deref().unwrap_or("<unnamed>")
            ))
        })?;
    Ok(Gvk::from_api_version(&types.api_version, &types.kind))
}

pub fn set_gvk(obj: &mut DynamicObject, gvk: &Gvk) {
    obj.types = Some(TypeMeta { api_version: gvk.api_version(), kind: gvk.kind.clone() });
}

pub fn key_of(obj: &DynamicObject) -> ObjectKey {
    ObjectKey::new(obj.metadata.namespace.clone().unwrap_or_default(), obj.metadata.name.clone().unwrap_or_default())
}

pub fn namespace_of(obj: &DynamicObject) -> &str {
    obj.metadata.namespace.as_deref().unwrap_or("")
}

pub fn set_namespace(obj: &mut DynamicObject, namespace: &str) {
    obj.metadata.namespace = if namespace.is_empty() { None } else { Some(namespace.to_string()) };
}

pub fn annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str)
}

pub fn label<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata.labels.as_ref().and_then(|l| l.get(key)).map(String::as_str)
}

pub fn resource_version(obj: &DynamicObject) -> &str {
    obj.metadata.resource_version.as_deref().unwrap_or("")
}

pub fn is_deleting(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

pub fn finalizers(obj: &DynamicObject) -> &[String] {
    obj.metadata.finalizers.as_deref().unwrap_or(&[])
}

/// The `status` sub-tree of an untyped object, if any.
pub fn status(obj: &DynamicObject) -> Option<&serde_json::Value> {
    obj.data.get("status")
}

/// Convert a typed API object (k8s-openapi or a derived CRD) into a dynamic one.
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Same as [`to_dynamic`] but stamps the statically known GVK, which some
/// serializers leave out.
pub fn resource_to_dynamic<K>(obj: &K) -> Result<DynamicObject>
where
    K: kube::Resource<DynamicType = ()> + Serialize,
{
    let mut dynamic = to_dynamic(obj)?;
    set_gvk(&mut dynamic, &Gvk::of::<K>());
    Ok(dynamic)
}

pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}
