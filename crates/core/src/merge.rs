//! Applying JSON merge patches and the subset of strategic merge patches
//! that the apply engine produces (keyed list merge, `$patch: delete`).

use serde_json::{Map, Value};

use crate::PatchKind;

/// Merge key for well-known lists of built-in types; `None` means the list is
/// replaced wholesale. `sample` is any element of the list, used to pick
/// between `containerPort` and `port`.
pub fn merge_key_for(field: &str, sample: Option<&Value>) -> Option<&'static str> {
    match field {
        "containers" | "initContainers" | "ephemeralContainers" | "env" | "volumes" | "imagePullSecrets" => Some("name"),
        "ports" => match sample {
            Some(v) if v.get("containerPort").is_some() => Some("containerPort"),
            _ => Some("port"),
        },
        "volumeMounts" => Some("mountPath"),
        "volumeDevices" => Some("devicePath"),
        "hostAliases" => Some("ip"),
        "conditions" => Some("type"),
        "topologySpreadConstraints" => Some("topologyKey"),
        "ownerReferences" => Some("uid"),
        _ => None,
    }
}

pub fn apply_patch(target: &mut Value, kind: PatchKind, patch: &Value) {
    match kind {
        PatchKind::Merge => json_patch::merge(target, patch),
        PatchKind::Strategic => apply_strategic_patch(target, patch),
    }
}

pub fn apply_strategic_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if patch_map.get("$patch").and_then(Value::as_str) == Some("replace") {
        *target = strip_directives(patch);
        return;
    }
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target_map) = target else { return };
    for (key, value) in patch_map {
        if key.starts_with('$') {
            continue;
        }
        match value {
            Value::Null => {
                target_map.remove(key);
            }
            Value::Object(inner) if inner.get("$patch").and_then(Value::as_str) == Some("delete") => {
                target_map.remove(key);
            }
            Value::Object(_) => {
                let slot = target_map.entry(key.clone()).or_insert(Value::Null);
                apply_strategic_patch(slot, value);
            }
            Value::Array(items) => {
                let sample = items.iter().find(|i| i.is_object());
                let keyed = merge_key_for(key, sample).filter(|_| target_map.get(key).map(Value::is_array).unwrap_or(false));
                if let Some(mk) = keyed {
                    if let Some(Value::Array(existing)) = target_map.get_mut(key) {
                        merge_list(existing, items, mk);
                    }
                } else {
                    let kept: Vec<Value> = items
                        .iter()
                        .filter(|i| i.get("$patch").and_then(Value::as_str) != Some("delete"))
                        .map(strip_directives)
                        .collect();
                    target_map.insert(key.clone(), Value::Array(kept));
                }
            }
            other => {
                target_map.insert(key.clone(), other.clone());
            }
        }
    }
}

fn merge_list(existing: &mut Vec<Value>, items: &[Value], merge_key: &str) {
    for item in items {
        let id = item.get(merge_key).cloned();
        let pos = id.as_ref().and_then(|id| existing.iter().position(|e| e.get(merge_key) == Some(id)));
        let delete = item.get("$patch").and_then(Value::as_str) == Some("delete");
        match (pos, delete) {
            (Some(i), true) => {
                existing.remove(i);
            }
            (None, true) => {}
            (Some(i), false) => apply_strategic_patch(&mut existing[i], item),
            (None, false) => existing.push(strip_directives(item)),
        }
    }
}

/// Deep copy without `$` directive keys or null map values.
pub fn strip_directives(v: &Value) -> Value {
    match v {
        Value::Object(m) => Value::Object(
            m.iter()
                .filter(|(k, v)| !k.starts_with('$') && !v.is_null())
                .map(|(k, v)| (k.clone(), strip_directives(v)))
                .collect(),
        ),
        Value::Array(a) => Value::Array(a.iter().map(strip_directives).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keyed_lists_merge_by_name() {
        let mut target = json!({"spec": {"containers": [
            {"name": "a", "image": "a:1", "args": ["x"]},
            {"name": "b", "image": "b:1"}
        ]}});
        let patch = json!({"spec": {"containers": [
            {"name": "a", "image": "a:2"},
            {"name": "b", "$patch": "delete"},
            {"name": "c", "image": "c:1"}
        ]}});
        apply_strategic_patch(&mut target, &patch);
        assert_eq!(
            target,
            json!({"spec": {"containers": [
                {"name": "a", "image": "a:2", "args": ["x"]},
                {"name": "c", "image": "c:1"}
            ]}})
        );
    }

    #[test]
    fn unkeyed_lists_replace_and_nulls_delete() {
        let mut target = json!({"data": {"a": "1", "b": "2"}, "spec": {"args": ["x", "y"]}});
        apply_strategic_patch(&mut target, &json!({"data": {"a": null}, "spec": {"args": ["z"]}}));
        assert_eq!(target, json!({"data": {"b": "2"}, "spec": {"args": ["z"]}}));
    }

    #[test]
    fn ports_pick_container_port_key() {
        assert_eq!(merge_key_for("ports", Some(&json!({"containerPort": 80}))), Some("containerPort"));
        assert_eq!(merge_key_for("ports", Some(&json!({"port": 80}))), Some("port"));
        assert_eq!(merge_key_for("args", None), None);
    }

    #[test]
    fn merge_patch_replaces_lists() {
        let mut target = json!({"spec": {"containers": [{"name": "a"}, {"name": "b"}]}});
        apply_patch(&mut target, PatchKind::Merge, &json!({"spec": {"containers": [{"name": "c"}]}}));
        assert_eq!(target, json!({"spec": {"containers": [{"name": "c"}]}}));
    }
}
