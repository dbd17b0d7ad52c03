//! Per-kind detectors for changes the API server would reject as a patch
//! (immutable fields). A positive answer turns the update into delete + create.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::core::DynamicObject;
use trellis_core::{meta, Gvk, Result};

use crate::snapshot;

pub trait ReplaceDetector: Send + Sync {
    /// `original` is the last applied body (or the live object when there
    /// is none); `desired` already carries its new snapshot annotation.
    fn needs_replace(&self, original: &DynamicObject, desired: &DynamicObject) -> Result<bool>;
}

impl<F> ReplaceDetector for F
where
    F: Fn(&DynamicObject, &DynamicObject) -> Result<bool> + Send + Sync,
{
    fn needs_replace(&self, original: &DynamicObject, desired: &DynamicObject) -> Result<bool> {
        self(original, desired)
    }
}

fn secret_type(original: &DynamicObject, desired: &DynamicObject) -> Result<bool> {
    let old: Secret = meta::from_dynamic(original)?;
    let new: Secret = meta::from_dynamic(desired)?;
    let new_type = new.type_.unwrap_or_default();
    Ok(!new_type.is_empty() && old.type_.unwrap_or_default() != new_type)
}

fn service_type(original: &DynamicObject, desired: &DynamicObject) -> Result<bool> {
    let old: Service = meta::from_dynamic(original)?;
    let new: Service = meta::from_dynamic(desired)?;
    let kind = |s: Service| s.spec.and_then(|spec| spec.type_).unwrap_or_default();
    let new_type = kind(new);
    Ok(!new_type.is_empty() && kind(old) != new_type)
}

fn job_template(original: &DynamicObject, desired: &DynamicObject) -> Result<bool> {
    let old: Job = meta::from_dynamic(original)?;
    // compare against the snapshot form: long strings in the original are truncated
    let pruned = snapshot::original_object(&Gvk::of::<Job>(), desired)?;
    let new: Job = meta::from_dynamic(pruned.as_ref().unwrap_or(desired))?;
    Ok(old.spec.map(|s| s.template) != new.spec.map(|s| s.template))
}

fn deployment_selector(original: &DynamicObject, desired: &DynamicObject) -> Result<bool> {
    let old: Deployment = meta::from_dynamic(original)?;
    let new: Deployment = meta::from_dynamic(desired)?;
    Ok(old.spec.map(|s| s.selector) != new.spec.map(|s| s.selector))
}

fn daemonset_selector(original: &DynamicObject, desired: &DynamicObject) -> Result<bool> {
    let old: DaemonSet = meta::from_dynamic(original)?;
    let new: DaemonSet = meta::from_dynamic(desired)?;
    Ok(old.spec.map(|s| s.selector) != new.spec.map(|s| s.selector))
}

/// Static GVK -> detector table, built once and cloned cheaply.
#[derive(Clone)]
pub struct ReplaceRegistry {
    detectors: HashMap<Gvk, Arc<dyn ReplaceDetector>>,
}

impl Default for ReplaceRegistry {
    fn default() -> Self {
        let mut r = Self::empty();
        r.register(Gvk::of::<Secret>(), secret_type);
        r.register(Gvk::of::<Service>(), service_type);
        r.register(Gvk::of::<Job>(), job_template);
        r.register(Gvk::of::<Deployment>(), deployment_selector);
        r.register(Gvk::of::<DaemonSet>(), daemonset_selector);
        r
    }
}

impl std::fmt::Debug for ReplaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut gvks: Vec<String> = self.detectors.keys().map(|g| g.to_string()).collect();
        gvks.sort();
        f.debug_struct("ReplaceRegistry").field("gvks", &gvks).finish()
    }
}

impl ReplaceRegistry {
    pub fn empty() -> Self {
        Self { detectors: HashMap::new() }
    }

    /// Register or override the detector for `gvk`.
    pub fn register<D: ReplaceDetector + 'static>(&mut self, gvk: Gvk, detector: D) {
        self.detectors.insert(gvk, Arc::new(detector));
    }

    pub fn get(&self, gvk: &Gvk) -> Option<&Arc<dyn ReplaceDetector>> {
        self.detectors.get(gvk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: serde_json::Value) -> DynamicObject {
        serde_json::from_value(v).unwrap()
    }

    fn svc(t: Option<&str>) -> DynamicObject {
        let mut spec = json!({"ports": [{"port": 80}]});
        if let Some(t) = t {
            spec["type"] = json!(t);
        }
        obj(json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"}, "spec": spec}))
    }

    #[test]
    fn service_type_change_needs_replace() {
        let reg = ReplaceRegistry::default();
        let d = reg.get(&Gvk::of::<Service>()).unwrap();
        assert!(d.needs_replace(&svc(Some("ClusterIP")), &svc(Some("NodePort"))).unwrap());
        assert!(!d.needs_replace(&svc(Some("ClusterIP")), &svc(Some("ClusterIP"))).unwrap());
        // unset desired type never forces a replace
        assert!(!d.needs_replace(&svc(Some("ClusterIP")), &svc(None)).unwrap());
    }

    #[test]
    fn secret_and_deployment_detectors() {
        let reg = ReplaceRegistry::default();
        let secret = |t: &str| obj(json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s"}, "type": t}));
        assert!(reg.get(&Gvk::of::<Secret>()).unwrap().needs_replace(&secret("Opaque"), &secret("kubernetes.io/tls")).unwrap());

        let deploy = |app: &str| {
            obj(json!({
                "apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "d"},
                "spec": {"selector": {"matchLabels": {"app": app}}, "template": {}}
            }))
        };
        let d = reg.get(&Gvk::of::<Deployment>()).unwrap();
        assert!(d.needs_replace(&deploy("a"), &deploy("b")).unwrap());
        assert!(!d.needs_replace(&deploy("a"), &deploy("a")).unwrap());
    }

    #[test]
    fn custom_detectors_override() {
        let mut reg = ReplaceRegistry::empty();
        assert!(reg.get(&Gvk::of::<Service>()).is_none());
        reg.register(Gvk::of::<Service>(), |_: &DynamicObject, _: &DynamicObject| Ok::<_, trellis_core::Error>(true));
        assert!(reg.get(&Gvk::of::<Service>()).unwrap().needs_replace(&svc(None), &svc(None)).unwrap());
    }
}
