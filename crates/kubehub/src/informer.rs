//! Per-GVK list+watch mirror feeding the backend's reads and event sinks.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use metrics::counter;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trellis_core::{meta, DynamicObject, EventSink, Gvk, ListOptions, ObjectKey};

use crate::direct::DirectClient;

/// Objects of one GVK as last seen by the watch.
#[derive(Debug, Default)]
pub struct Mirror {
    objects: BTreeMap<ObjectKey, DynamicObject>,
}

impl Mirror {
    /// Fold a watch event in; returns the keys that changed.
    pub fn apply(&mut self, gvk: &Gvk, event: Event<DynamicObject>) -> Vec<ObjectKey> {
        match event {
            Event::Applied(mut obj) => {
                meta::set_gvk(&mut obj, gvk);
                let key = meta::key_of(&obj);
                self.objects.insert(key.clone(), obj);
                vec![key]
            }
            Event::Deleted(obj) => {
                let key = meta::key_of(&obj);
                self.objects.remove(&key);
                vec![key]
            }
            Event::Restarted(list) => {
                let mut next = BTreeMap::new();
                for mut obj in list {
                    meta::set_gvk(&mut obj, gvk);
                    next.insert(meta::key_of(&obj), obj);
                }
                // removed while the watch was down
                let mut changed: Vec<ObjectKey> = self.objects.keys().filter(|k| !next.contains_key(*k)).cloned().collect();
                changed.extend(next.keys().cloned());
                self.objects = next;
                changed
            }
        }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&DynamicObject> {
        self.objects.get(key)
    }

    pub fn list(&self, opts: &ListOptions) -> Vec<DynamicObject> {
        self.objects.values().filter(|o| opts.matches(o)).cloned().collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

pub(crate) struct Informer {
    pub(crate) mirror: RwLock<Mirror>,
    sinks: Mutex<Vec<Arc<dyn EventSink>>>,
    synced: watch::Sender<bool>,
}

impl Informer {
    pub(crate) fn new() -> Arc<Self> {
        let (synced, _) = watch::channel(false);
        Arc::new(Self { mirror: RwLock::new(Mirror::default()), sinks: Mutex::new(Vec::new()), synced })
    }

    pub(crate) fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    /// A sink added after the initial list still sees every current object.
    pub(crate) fn add_sink(&self, gvk: &Gvk, sink: Arc<dyn EventSink>) {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).push(sink.clone());
        if self.is_synced() {
            let keys = self.mirror.read().unwrap_or_else(|e| e.into_inner()).keys();
            for key in keys {
                sink.enqueue(gvk, key);
            }
        }
    }

    fn notify(&self, gvk: &Gvk, keys: Vec<ObjectKey>) {
        let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for key in keys {
            for sink in &sinks {
                sink.enqueue(gvk, key.clone());
            }
        }
    }

    pub(crate) async fn run(self: Arc<Self>, gvk: Gvk, direct: DirectClient, timeout: Duration, shutdown: CancellationToken) {
        let api = match direct.api(&gvk, None).await {
            Ok(api) => api,
            Err(e) => {
                warn!(gvk = %gvk, error = %e, "cannot resolve watched kind");
                return;
            }
        };
        let cfg = watcher::Config::default().timeout(timeout.as_secs().min(u32::MAX as u64) as u32);
        let stream = watcher::watcher(api, cfg).default_backoff();
        futures::pin_mut!(stream);
        info!(gvk = %gvk, "watcher started");
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    let restarted = matches!(event, Event::Restarted(_));
                    let changed = self.mirror.write().unwrap_or_else(|e| e.into_inner()).apply(&gvk, event);
                    counter!("kube_watch_events_total", changed.len() as u64);
                    if restarted {
                        debug!(gvk = %gvk, count = changed.len(), "watch restart");
                        self.synced.send_replace(true);
                    }
                    self.notify(&gvk, changed);
                }
                Some(Err(e)) => {
                    counter!("kube_watch_errors_total", 1u64);
                    warn!(gvk = %gvk, error = %e, "watch error");
                }
                None => {
                    warn!(gvk = %gvk, "watcher stream ended");
                    break;
                }
            }
        }
        info!(gvk = %gvk, "watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str, rv: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "metadata": {"name": name, "namespace": "ns", "resourceVersion": rv}
        }))
        .unwrap()
    }

    #[test]
    fn events_fold_into_the_mirror() {
        let gvk = Gvk::new("", "v1", "ConfigMap");
        let mut m = Mirror::default();
        assert_eq!(m.apply(&gvk, Event::Restarted(vec![cm("a", "1"), cm("b", "1")])).len(), 2);
        // list items arrive without apiVersion/kind
        assert_eq!(meta::gvk_of(m.get(&ObjectKey::new("ns", "a")).unwrap()).unwrap(), gvk);

        m.apply(&gvk, Event::Applied(cm("a", "2")));
        assert_eq!(meta::resource_version(m.get(&ObjectKey::new("ns", "a")).unwrap()), "2");

        m.apply(&gvk, Event::Deleted(cm("b", "3")));
        assert_eq!(m.len(), 1);

        // c appeared and a vanished while disconnected
        let changed = m.apply(&gvk, Event::Restarted(vec![cm("c", "4")]));
        assert_eq!(changed, vec![ObjectKey::new("ns", "a"), ObjectKey::new("ns", "c")]);
        assert_eq!(m.keys(), vec![ObjectKey::new("ns", "c")]);
        assert_eq!(m.list(&ListOptions::in_namespace("other")).len(), 0);
    }
}
