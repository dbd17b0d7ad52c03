//! Trellis core types: resource identity, desired object sets, selectors,
//! the store traits every other crate talks through, and the shared error type.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod merge;
pub mod meta;
pub mod objectset;
pub mod selector;

pub use client::{Backend, Client, EventSink, ListOptions, PatchKind, Reader, Writer};
pub use config::EngineConfig;
pub use memory::MemoryStore;
pub use error::{Error, MultiError, Result};
pub use objectset::ObjectSet;
pub use selector::{FieldSelector, LabelSelector};

pub use kube::core::DynamicObject;

pub mod prelude {
    pub use super::{
        Backend, Client, DynamicObject, Error, Gvk, GroupKind, ListOptions, ObjectKey, ObjectSet, PatchKind, Reader,
        Result, Writer,
    };
}

/// Group/Version/Kind of a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Static mapping from a concrete API type to its GVK.
    pub fn of<K: kube::Resource<DynamicType = ()>>() -> Self {
        Self::new(K::group(&()), K::version(&()), K::kind(&()))
    }

    /// Build from an `apiVersion` string (`v1` or `group/v1`) and a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind { group: self.group.clone(), kind: self.kind.clone() }
    }

    /// Rendering stored in the owner-gvk annotation and fed into the ownership hash.
    /// Kept byte-compatible with objects already labelled by earlier controllers.
    pub fn legacy_string(&self) -> String {
        format!("{}/{}, Kind={}", self.group, self.version, self.kind)
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl FromStr for Gvk {
    type Err = Error;

    /// Accepts `v1/Kind` or `group/v1/Kind`.
    fn from_str(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] => Ok(Gvk::new("", *version, *kind)),
            [group, version, kind] => Ok(Gvk::new(*group, *version, *kind)),
            _ => Err(Error::InvalidObject(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

/// Namespace/name pair, unique within a GVK. Cluster-scoped objects use an empty namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: String::new(), name: name.into() }
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(&self.namespace) }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self> {
        let key = match key.split_once('/') {
            Some((ns, name)) => ObjectKey::new(ns, name),
            None => ObjectKey::cluster(key),
        };
        if key.name.is_empty() {
            return Err(Error::InvalidObject("object key has an empty name".into()));
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::ConfigMap;

    #[test]
    fn gvk_static_mapping_and_rendering() {
        let cm = Gvk::of::<ConfigMap>();
        assert_eq!(cm, Gvk::new("", "v1", "ConfigMap"));
        assert_eq!(cm.to_string(), "v1/ConfigMap");
        assert_eq!(cm.legacy_string(), "/v1, Kind=ConfigMap");
        assert_eq!(cm.api_version(), "v1");

        let deploy = Gvk::of::<Deployment>();
        assert_eq!(deploy.to_string(), "apps/v1/Deployment");
        assert_eq!(deploy.legacy_string(), "apps/v1, Kind=Deployment");
        assert_eq!(Gvk::from_api_version("apps/v1", "Deployment"), deploy);
    }

    #[test]
    fn gvk_and_key_parse() {
        assert_eq!("v1/Secret".parse::<Gvk>().unwrap(), Gvk::new("", "v1", "Secret"));
        assert_eq!("batch/v1/Job".parse::<Gvk>().unwrap(), Gvk::new("batch", "v1", "Job"));
        assert!("Job".parse::<Gvk>().is_err());

        let k: ObjectKey = "ns/a".parse().unwrap();
        assert_eq!(k, ObjectKey::new("ns", "a"));
        assert_eq!(k.to_string(), "ns/a");
        let c: ObjectKey = "node-1".parse().unwrap();
        assert_eq!(c.namespace(), None);
        assert_eq!(c.to_string(), "node-1");
        assert!("ns/".parse::<ObjectKey>().is_err());
    }
}
