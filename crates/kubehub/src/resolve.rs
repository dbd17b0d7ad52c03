//! GVK -> API resource resolution backed by server discovery.

use std::sync::RwLock;

use kube::core::ApiResource;
use kube::discovery::{Discovery, Scope};
use rustc_hash::FxHashMap;
use tracing::debug;
use trellis_core::{Error, Gvk, Result};

#[derive(Debug, Clone)]
pub struct Resolved {
    pub resource: ApiResource,
    pub namespaced: bool,
}

/// Caches every served resource from one discovery run; a miss runs discovery again
/// so CRDs installed later are picked up.
pub struct Resolver {
    client: kube::Client,
    known: RwLock<FxHashMap<Gvk, Resolved>>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver").field("known", &self.len()).finish()
    }
}

impl Resolver {
    pub fn new(client: kube::Client) -> Self {
        Self { client, known: RwLock::new(FxHashMap::default()) }
    }

    pub fn len(&self) -> usize {
        self.known.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, gvk: &Gvk) -> Option<Resolved> {
        self.known.read().unwrap_or_else(|e| e.into_inner()).get(gvk).cloned()
    }

    /// Seed or override an entry without asking the server.
    pub fn insert(&self, gvk: Gvk, resolved: Resolved) {
        self.known.write().unwrap_or_else(|e| e.into_inner()).insert(gvk, resolved);
    }

    pub async fn resolve(&self, gvk: &Gvk) -> Result<Resolved> {
        if let Some(r) = self.cached(gvk) {
            return Ok(r);
        }
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(Error::backend)?;
        let mut found = FxHashMap::default();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                found.insert(Gvk::new(ar.group.clone(), ar.version.clone(), ar.kind.clone()), Resolved { resource: ar, namespaced });
            }
        }
        debug!(resources = found.len(), "discovery refreshed");
        let mut known = self.known.write().unwrap_or_else(|e| e.into_inner());
        known.extend(found);
        known
            .get(gvk)
            .cloned()
            .ok_or_else(|| Error::backend(format!("GVK not served: {}", gvk)))
    }
}

/// The `ApiResource` for a GVK whose plural is derived from the kind; used when
/// discovery is not available.
pub fn guessed(gvk: &Gvk, namespaced: bool) -> Resolved {
    let gvk = kube::core::GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
    Resolved { resource: ApiResource::from_gvk(&gvk), namespaced }
}
