//! Three-way patch generation (last applied, desired, live) and the
//! sanitizing pass applied before a patch is sent.

use serde_json::{Map, Value};
use trellis_core::merge::merge_key_for;
use trellis_core::{Gvk, PatchKind};

use crate::ownership::ANNOTATION_APPLIED;
use crate::snapshot::remove_server_metadata;

const BUILTIN_GROUPS: [&str; 16] = [
    "",
    "apps",
    "batch",
    "policy",
    "autoscaling",
    "networking.k8s.io",
    "rbac.authorization.k8s.io",
    "storage.k8s.io",
    "scheduling.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
    "node.k8s.io",
    "certificates.k8s.io",
    "admissionregistration.k8s.io",
    "apiextensions.k8s.io",
    "apiregistration.k8s.io",
];

/// Built-in kinds take strategic merge patches; everything else JSON merge.
pub fn patch_kind_for(gvk: &Gvk) -> PatchKind {
    if BUILTIN_GROUPS.contains(&gvk.group.as_str()) {
        PatchKind::Strategic
    } else {
        PatchKind::Merge
    }
}

/// Patch that moves `current` to `modified`, deleting only what `original`
/// had and `modified` dropped. Fields set by other writers survive.
pub fn three_way(kind: PatchKind, original: &Value, modified: &Value, current: &Value) -> Value {
    let strategic = kind == PatchKind::Strategic;
    let empty = Map::new();
    let as_map = |v: &Value| v.as_object().cloned().unwrap_or_else(|| empty.clone());
    let mut patch = deletions(&as_map(original), &as_map(modified), strategic);
    let adds = additions(&as_map(current), &as_map(modified), strategic);
    combine(&mut patch, adds, strategic);
    Value::Object(patch)
}

fn keyed<'a>(field: &str, items: &'a [Value], other: &'a [Value], strategic: bool) -> Option<&'static str> {
    if !strategic {
        return None;
    }
    let sample = items.iter().chain(other.iter()).find(|v| v.is_object());
    let mk = merge_key_for(field, sample)?;
    items.iter().chain(other.iter()).all(|v| v.get(mk).is_some()).then_some(mk)
}

fn additions(current: &Map<String, Value>, modified: &Map<String, Value>, strategic: bool) -> Map<String, Value> {
    let mut out = Map::new();
    for (k, mv) in modified {
        if mv.is_null() {
            continue;
        }
        let Some(cv) = current.get(k) else {
            out.insert(k.clone(), mv.clone());
            continue;
        };
        if cv == mv {
            continue;
        }
        match (cv, mv) {
            (Value::Object(c), Value::Object(m)) => {
                let sub = additions(c, m, strategic);
                if !sub.is_empty() {
                    out.insert(k.clone(), Value::Object(sub));
                }
            }
            (Value::Array(c), Value::Array(m)) => match keyed(k, m, c, strategic) {
                Some(mk) => {
                    let items = list_additions(c, m, mk, strategic);
                    if !items.is_empty() {
                        out.insert(k.clone(), Value::Array(items));
                    }
                }
                None => {
                    out.insert(k.clone(), mv.clone());
                }
            },
            _ => {
                out.insert(k.clone(), mv.clone());
            }
        }
    }
    out
}

fn list_additions(current: &[Value], modified: &[Value], mk: &str, strategic: bool) -> Vec<Value> {
    let mut out = Vec::new();
    for m in modified {
        let id = m.get(mk);
        match current.iter().find(|c| c.get(mk) == id) {
            None => out.push(m.clone()),
            Some(c) if c == m => {}
            Some(c) => {
                let mut sub = match (c, m) {
                    (Value::Object(c), Value::Object(m)) => additions(c, m, strategic),
                    _ => Map::new(),
                };
                if let Some(id) = id {
                    sub.insert(mk.to_string(), id.clone());
                }
                out.push(Value::Object(sub));
            }
        }
    }
    out
}

fn deletions(original: &Map<String, Value>, modified: &Map<String, Value>, strategic: bool) -> Map<String, Value> {
    let mut out = Map::new();
    for (k, ov) in original {
        match modified.get(k) {
            None | Some(Value::Null) => {
                out.insert(k.clone(), Value::Null);
            }
            Some(mv) => match (ov, mv) {
                (Value::Object(o), Value::Object(m)) => {
                    let sub = deletions(o, m, strategic);
                    if !sub.is_empty() {
                        out.insert(k.clone(), Value::Object(sub));
                    }
                }
                (Value::Array(o), Value::Array(m)) => {
                    if let Some(mk) = keyed(k, o, m, strategic) {
                        let items = list_deletions(o, m, mk, strategic);
                        if !items.is_empty() {
                            out.insert(k.clone(), Value::Array(items));
                        }
                    }
                }
                _ => {}
            },
        }
    }
    out
}

fn list_deletions(original: &[Value], modified: &[Value], mk: &str, strategic: bool) -> Vec<Value> {
    let mut out = Vec::new();
    for o in original {
        let Some(id) = o.get(mk) else { continue };
        match modified.iter().find(|m| m.get(mk) == Some(id)) {
            None => {
                let mut directive = Map::new();
                directive.insert(mk.to_string(), id.clone());
                directive.insert("$patch".to_string(), Value::String("delete".into()));
                out.push(Value::Object(directive));
            }
            Some(m) => {
                if let (Value::Object(o), Value::Object(m)) = (o, m) {
                    let mut sub = deletions(o, m, strategic);
                    if !sub.is_empty() {
                        sub.insert(mk.to_string(), id.clone());
                        out.push(Value::Object(sub));
                    }
                }
            }
        }
    }
    out
}

fn combine(base: &mut Map<String, Value>, adds: Map<String, Value>, strategic: bool) {
    for (k, av) in adds {
        match base.get_mut(&k) {
            Some(bv) => combine_value(&k, bv, av, strategic),
            None => {
                base.insert(k, av);
            }
        }
    }
}

fn combine_value(field: &str, base: &mut Value, add: Value, strategic: bool) {
    match add {
        Value::Object(a) if base.is_object() => {
            if let Value::Object(b) = base {
                combine(b, a, strategic);
            }
        }
        Value::Array(a) if base.is_array() => {
            let Value::Array(b) = base else { return };
            match keyed(field, b, &a, strategic) {
                Some(mk) => {
                    for item in a {
                        let id = item.get(mk).cloned();
                        match b.iter().position(|e| e.get(mk) == id.as_ref()) {
                            Some(i) => combine_value(field, &mut b[i], item, strategic),
                            None => b.push(item),
                        }
                    }
                }
                None => *b = a,
            }
        }
        other => *base = other,
    }
}

/// Only ever called on objects, so `None` keys mean "stop looking".
fn empty_maps(data: &Value, keys: &[&str]) -> bool {
    let mut cur = data.as_object();
    for key in keys.iter().copied().chain(std::iter::once("__invalid_key__")) {
        let Some(map) = cur else { return true };
        if map.is_empty() {
            return true;
        }
        if map.len() > 1 {
            return false;
        }
        match map.get(key) {
            None => return false,
            Some(v) => cur = v.as_object(),
        }
    }
    true
}

/// Strip fields a patch must never carry and collapse no-op patches
/// (nothing, or only the snapshot annotation) to `{}`.
pub fn sanitize(mut patch: Value) -> Value {
    if let Value::Object(m) = &mut patch {
        m.remove("kind");
        m.remove("apiVersion");
        m.remove("status");
    }
    remove_server_metadata(&mut patch);
    if empty_maps(&patch, &["metadata", "annotations"]) || empty_maps(&patch, &["metadata", "annotations", ANNOTATION_APPLIED]) {
        return Value::Object(Map::new());
    }
    patch
}

pub fn is_empty(patch: &Value) -> bool {
    patch.as_object().map(|m| m.is_empty()).unwrap_or(false)
}
