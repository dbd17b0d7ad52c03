//! Persisting a handler pass: status first, then the emitted children.

use std::sync::Arc;

use tracing::debug;
use trellis_apply::Apply;
use trellis_core::{meta, Client, DynamicObject, Gvk, ObjectSet, Result};

use crate::handler::{Request, Response};

pub(crate) struct Saver {
    apply: Apply,
    client: Arc<dyn Client>,
}

/// True when the `status` sub-tree differs from the object as it was loaded.
pub fn status_changed(before: &DynamicObject, after: &DynamicObject) -> bool {
    meta::status(before) != meta::status(after)
}

impl Saver {
    pub(crate) fn new(client: Arc<dyn Client>, sub_context: &str) -> Self {
        Self { apply: Apply::new(client.clone()).with_owner_sub_context(sub_context), client }
    }

    /// Returns the object as it now stands (after any status write).
    pub(crate) async fn save(
        &self,
        unmodified: Option<&DynamicObject>,
        req: &Request,
        resp: &Response,
        watching: Vec<Gvk>,
    ) -> Result<Option<DynamicObject>> {
        let mut current = req.object.clone();
        if let (Some(before), Some(obj)) = (unmodified, req.object.as_ref()) {
            let changed = match resp.saved_status() {
                Some(persisted) => persisted != meta::status(obj),
                None => status_changed(before, obj),
            };
            if changed {
                debug!(gvk = %req.gvk, key = %req.key, "updating status");
                match self.client.update_status(&req.gvk, obj).await {
                    Ok(updated) => current = Some(updated),
                    Err(e) if e.is_not_found() && meta::is_deleting(obj) => {
                        debug!(gvk = %req.gvk, key = %req.key, "released before status write");
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let Some(owner) = current.as_ref() else { return Ok(None) };
        if meta::is_deleting(owner) && resp.emitted().is_empty() {
            return Ok(current);
        }

        let mut apply = self.apply.clone().with_prune_gvks(watching);
        if resp.prune_disabled() {
            apply = apply.with_no_prune();
        }
        let set = ObjectSet::from_objects(resp.emitted().iter().cloned())?;
        apply.apply(owner, &set).await?;
        Ok(current)
    }
}
