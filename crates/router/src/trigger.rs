//! Dependency triggers derived from what handlers actually read and write.
//!
//! Every access made while processing a source key registers a matcher on
//! the touched GVK. When an object of that GVK changes, each source whose
//! matcher accepts it is enqueued again.

use std::collections::BTreeSet;
use std::sync::{Mutex, RwLock};

use rustc_hash::FxHashMap;
use trellis_core::{meta, DynamicObject, FieldSelector, Gvk, LabelSelector, ObjectKey};

/// The key being processed when a dependency was observed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Source {
    pub gvk: Gvk,
    pub key: ObjectKey,
}

/// What a source depends on within one target GVK.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Matcher {
    pub namespace: String,
    pub name: String,
    pub selector: Option<LabelSelector>,
    pub fields: Option<FieldSelector>,
}

impl Matcher {
    pub fn object(key: &ObjectKey) -> Self {
        Self { namespace: key.namespace.clone(), name: key.name.clone(), ..Default::default() }
    }

    /// A named matcher matches exactly that key. Otherwise the namespace (if
    /// any) must agree and every selector must accept the object. An absent
    /// object has no labels or fields to check, so selectors let it through.
    pub fn matches(&self, key: &ObjectKey, obj: Option<&DynamicObject>) -> bool {
        if !self.name.is_empty() {
            return self.name == key.name && self.namespace == key.namespace;
        }
        if !self.namespace.is_empty() && self.namespace != key.namespace {
            return false;
        }
        let Some(obj) = obj else { return true };
        if let Some(sel) = &self.selector {
            if !sel.matches(obj.metadata.labels.as_ref()) {
                return false;
            }
        }
        if let Some(fields) = &self.fields {
            if !fields.matches(obj) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug)]
struct Registered {
    matcher: Matcher,
    generation: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Generation {
    started: u64,
    finished: u64,
}

/// target GVK -> source -> matchers
type Table = FxHashMap<Gvk, FxHashMap<Source, Vec<Registered>>>;

#[derive(Debug, Default)]
pub struct Triggers {
    table: RwLock<Table>,
    generations: Mutex<FxHashMap<Source, Generation>>,
}

impl Triggers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a pass for `source`; registrations made during it carry the returned generation.
    pub fn begin(&self, source: &Source) -> u64 {
        let mut gens = self.generations.lock().unwrap_or_else(|e| e.into_inner());
        let g = gens.entry(source.clone()).or_default();
        g.started += 1;
        g.started
    }

    /// Mark a pass as completed; only completed passes make older entries stale.
    pub fn finish(&self, source: &Source, generation: u64) {
        let mut gens = self.generations.lock().unwrap_or_else(|e| e.into_inner());
        let g = gens.entry(source.clone()).or_default();
        g.finished = g.finished.max(generation);
    }

    fn current(&self, source: &Source) -> u64 {
        self.generations.lock().unwrap_or_else(|e| e.into_inner()).get(source).map(|g| g.started).unwrap_or(0)
    }

    /// Record that `source` depends on objects of `target` selected by `matcher`.
    /// Equal matchers are stored once; a repeat refreshes its generation.
    pub fn register(&self, source: &Source, target: &Gvk, matcher: Matcher) {
        let generation = self.current(source);
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        let entries = table.entry(target.clone()).or_default().entry(source.clone()).or_default();
        match entries.iter_mut().find(|r| r.matcher == matcher) {
            Some(existing) => existing.generation = existing.generation.max(generation),
            None => entries.push(Registered { matcher, generation }),
        }
    }

    /// Sources to enqueue because `key` of `gvk` changed. The changed object
    /// itself is never returned as its own dependant.
    pub fn matching(&self, gvk: &Gvk, key: &ObjectKey, obj: Option<&DynamicObject>) -> Vec<Source> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        let Some(sources) = table.get(gvk) else { return Vec::new() };
        let mut out: Vec<Source> = sources
            .iter()
            .filter(|(source, _)| !(source.gvk == *gvk && source.key == *key))
            .filter(|(_, entries)| entries.iter().any(|r| r.matcher.matches(key, obj)))
            .map(|(source, _)| source.clone())
            .collect();
        out.sort();
        out
    }

    /// Drop registrations a completed pass of their source did not refresh.
    /// Returns how many matchers were removed.
    pub fn collect_stale(&self) -> usize {
        let gens = self.generations.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for sources in table.values_mut() {
            for (source, entries) in sources.iter_mut() {
                let finished = gens.get(source).map(|g| g.finished).unwrap_or(0);
                let before = entries.len();
                entries.retain(|r| r.generation >= finished);
                removed += before - entries.len();
            }
            sources.retain(|_, entries| !entries.is_empty());
        }
        table.retain(|_, sources| !sources.is_empty());
        removed
    }

    /// Number of stored matchers.
    pub fn len(&self) -> usize {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table.values().flat_map(|s| s.values()).map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-pass view of the trigger table bound to one source key. Remembers
/// which GVKs it registered so the caller can make sure they are watched.
#[derive(Debug)]
pub struct Registry {
    source: Source,
    gvks: Mutex<BTreeSet<Gvk>>,
}

impl Registry {
    pub fn new(source: Source) -> Self {
        Self { source, gvks: Mutex::new(BTreeSet::new()) }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn watch(&self, triggers: &Triggers, target: &Gvk, matcher: Matcher) {
        triggers.register(&self.source, target, matcher);
        self.gvks.lock().unwrap_or_else(|e| e.into_inner()).insert(target.clone());
    }

    pub fn watch_object(&self, triggers: &Triggers, obj: &DynamicObject) {
        if let Ok(gvk) = meta::gvk_of(obj) {
            self.watch(triggers, &gvk, Matcher::object(&meta::key_of(obj)));
        }
    }

    pub fn gvks(&self) -> Vec<Gvk> {
        self.gvks.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn src(name: &str) -> Source {
        Source { gvk: Gvk::new("example.com", "v1", "App"), key: ObjectKey::new("ns", name) }
    }

    fn cm_gvk() -> Gvk {
        Gvk::new("", "v1", "ConfigMap")
    }

    fn cm(name: &str, labels: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "ns", "labels": labels}
        }))
        .unwrap()
    }

    #[test]
    fn matchers_by_name_and_selector() {
        let t = Triggers::new();
        t.register(&src("a"), &cm_gvk(), Matcher::object(&ObjectKey::new("ns", "conf")));
        t.register(&src("a"), &cm_gvk(), Matcher::object(&ObjectKey::new("ns", "conf")));
        let sel: LabelSelector = "app=web".parse().unwrap();
        t.register(&src("b"), &cm_gvk(), Matcher { namespace: "ns".into(), selector: Some(sel), ..Default::default() });
        assert_eq!(t.len(), 2);

        let conf = cm("conf", json!({}));
        assert_eq!(t.matching(&cm_gvk(), &ObjectKey::new("ns", "conf"), Some(&conf)), vec![src("a")]);
        let web = cm("other", json!({"app": "web"}));
        assert_eq!(t.matching(&cm_gvk(), &ObjectKey::new("ns", "other"), Some(&web)), vec![src("b")]);
        assert!(t.matching(&cm_gvk(), &ObjectKey::new("elsewhere", "other"), Some(&web)).is_empty());
        // deleted objects still reach selector-based dependants
        assert_eq!(t.matching(&cm_gvk(), &ObjectKey::new("ns", "gone"), None), vec![src("b")]);
    }

    #[test]
    fn self_triggers_are_skipped() {
        let t = Triggers::new();
        let me = src("a");
        t.register(&me, &me.gvk, Matcher::object(&me.key));
        assert!(t.matching(&me.gvk, &me.key, None).is_empty());
    }

    #[test]
    fn stale_entries_collected_only_after_a_completed_pass() {
        let t = Triggers::new();
        let s = src("a");
        let g1 = t.begin(&s);
        t.register(&s, &cm_gvk(), Matcher::object(&ObjectKey::new("ns", "old")));
        t.finish(&s, g1);

        let g2 = t.begin(&s);
        t.register(&s, &cm_gvk(), Matcher::object(&ObjectKey::new("ns", "new")));
        // pass two still running: nothing is stale yet
        assert_eq!(t.collect_stale(), 0);
        t.finish(&s, g2);
        assert_eq!(t.collect_stale(), 1);
        assert_eq!(t.matching(&cm_gvk(), &ObjectKey::new("ns", "new"), None), vec![s.clone()]);
        assert!(t.matching(&cm_gvk(), &ObjectKey::new("ns", "old"), None).is_empty());
    }
}
