//! Finalizer ordering: each token's handler runs only once every token
//! ahead of it has been released.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use trellis_core::{meta, DynamicObject};

use crate::handler::{Handler, Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerState {
    /// Not deleting.
    Active,
    /// Deleting, but another token is ahead of this one.
    AwaitingTurn,
    /// Deleting and this token is at the head.
    Running,
    /// Deleting and this token is gone.
    Released,
}

pub fn state(obj: &DynamicObject, id: &str) -> FinalizerState {
    if !meta::is_deleting(obj) {
        return FinalizerState::Active;
    }
    let tokens = meta::finalizers(obj);
    match tokens.first() {
        Some(head) if head == id => FinalizerState::Running,
        _ if tokens.iter().any(|t| t == id) => FinalizerState::AwaitingTurn,
        _ => FinalizerState::Released,
    }
}

pub struct FinalizerHandler {
    pub id: String,
    pub next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for FinalizerHandler {
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()> {
        let Some(obj) = req.object.clone() else { return Ok(()) };
        match state(&obj, &self.id) {
            FinalizerState::Active => {
                if !meta::finalizers(&obj).iter().any(|t| *t == self.id) {
                    let mut next = obj;
                    next.metadata.finalizers.get_or_insert_with(Vec::new).push(self.id.clone());
                    debug!(gvk = %req.gvk, key = %req.key, finalizer = %self.id, "adding finalizer");
                    req.object = Some(req.client.update(&req.gvk, &next).await?);
                }
                self.next.handle(req, resp).await
            }
            FinalizerState::AwaitingTurn | FinalizerState::Released => Ok(()),
            FinalizerState::Running => {
                let mut private_req = req.clone();
                let mut private_resp = resp.private();
                self.next.handle(&mut private_req, &mut private_resp).await?;

                let saved = match req.set.clone() {
                    Some(set) => set.save(Some(&obj), &private_req, &private_resp).await?,
                    None => private_req.object.clone(),
                };
                resp.status_saved(saved.as_ref().and_then(meta::status).cloned());
                if let Some(delay) = private_resp.delay() {
                    resp.retry_after(delay);
                    req.object = saved;
                    return Ok(());
                }
                let Some(mut current) = saved else { return Ok(()) };
                if let Some(tokens) = current.metadata.finalizers.as_mut() {
                    if tokens.first().map(|t| *t == self.id).unwrap_or(false) {
                        tokens.remove(0);
                    }
                }
                info!(gvk = %req.gvk, key = %req.key, finalizer = %self.id, "releasing finalizer");
                req.object = Some(req.client.update(&req.gvk, &current).await?);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use trellis_core::{Gvk, MemoryStore, ObjectKey, Reader, Writer};

    fn obj(deleting: bool, tokens: &[&str]) -> DynamicObject {
        let mut v = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a", "finalizers": tokens}});
        if deleting {
            v["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
        }
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn states_follow_token_order() {
        assert_eq!(state(&obj(false, &[]), "f1"), FinalizerState::Active);
        assert_eq!(state(&obj(true, &["f1", "f2"]), "f1"), FinalizerState::Running);
        assert_eq!(state(&obj(true, &["f1", "f2"]), "f2"), FinalizerState::AwaitingTurn);
        assert_eq!(state(&obj(true, &["f2"]), "f1"), FinalizerState::Released);
    }

    async fn deleting(store: &MemoryStore) -> DynamicObject {
        let gvk = Gvk::new("", "v1", "ConfigMap");
        let seeded: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a", "namespace": "ns", "finalizers": ["f1", "f2"]}
        }))
        .unwrap();
        store.create(&gvk, &seeded).await.unwrap();
        store.delete(&gvk, &ObjectKey::new("ns", "a")).await.unwrap();
        store.get(&gvk, &ObjectKey::new("ns", "a")).await.unwrap().unwrap()
    }

    fn request(store: &MemoryStore, obj: DynamicObject) -> Request {
        Request::new(Gvk::new("", "v1", "ConfigMap"), ObjectKey::new("ns", "a"), Some(obj), Arc::new(store.clone()))
    }

    fn tokens(store: &MemoryStore) -> Option<Vec<String>> {
        store.object(&Gvk::new("", "v1", "ConfigMap"), &ObjectKey::new("ns", "a")).map(|o| meta::finalizers(&o).to_vec())
    }

    #[tokio::test]
    async fn retry_keeps_the_head_token() {
        let store = MemoryStore::new();
        let obj = deleting(&store).await;
        let retry = |_: &mut Request, resp: &mut Response| -> anyhow::Result<()> {
            resp.retry_after(Duration::from_secs(1));
            Ok(())
        };
        let h = FinalizerHandler { id: "f1".into(), next: Arc::new(retry) };
        let mut resp = Response::new();
        h.handle(&mut request(&store, obj), &mut resp).await.unwrap();

        assert_eq!(resp.delay(), Some(Duration::from_secs(1)));
        assert_eq!(tokens(&store), Some(vec!["f1".to_string(), "f2".to_string()]));
    }

    #[tokio::test]
    async fn head_token_is_released_in_turn() {
        let store = MemoryStore::new();
        let obj = deleting(&store).await;
        let done = |_: &mut Request, _: &mut Response| -> anyhow::Result<()> { Ok(()) };

        // f2 waits behind f1
        let f2 = FinalizerHandler { id: "f2".into(), next: Arc::new(done) };
        f2.handle(&mut request(&store, obj.clone()), &mut Response::new()).await.unwrap();
        assert_eq!(tokens(&store), Some(vec!["f1".to_string(), "f2".to_string()]));

        let f1 = FinalizerHandler { id: "f1".into(), next: Arc::new(done) };
        let mut req = request(&store, obj);
        f1.handle(&mut req, &mut Response::new()).await.unwrap();
        assert_eq!(tokens(&store), Some(vec!["f2".to_string()]));
        assert_eq!(req.object.as_ref().map(|o| meta::finalizers(o).to_vec()), Some(vec!["f2".to_string()]));

        f2.handle(&mut req, &mut Response::new()).await.unwrap();
        assert_eq!(tokens(&store), None);
    }
}
