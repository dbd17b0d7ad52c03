//! Applied snapshot: a pruned copy of the last applied body, gzip'd and
//! base64'd into an annotation on the object. It is the "original" side of
//! the three-way patch, so the format must stay readable by older writers.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use kube::core::DynamicObject;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use trellis_core::{meta, Gvk, Result};

use crate::ownership::ANNOTATION_APPLIED;

const MAX_STRING: usize = 64;

/// Scalar keys kept verbatim inside list elements; they identify the element.
const KNOWN_LIST_KEYS: [&str; 10] =
    ["apiVersion", "containerPort", "devicePath", "ip", "kind", "mountPath", "name", "port", "topologyKey", "type"];

/// Metadata the server owns; never part of a diff base.
pub(crate) const SERVER_METADATA: [&str; 5] =
    ["creationTimestamp", "generation", "resourceVersion", "uid", "managedFields"];

fn truncate(s: &str) -> String {
    let sum = hex::encode(Sha256::digest(s.as_bytes()));
    let head = &s.as_bytes()[..MAX_STRING];
    let mut out = match std::str::from_utf8(head) {
        Ok(v) => v.to_string(),
        Err(e) => {
            let valid = e.valid_up_to();
            let mut v = String::from_utf8_lossy(&head[..valid]).into_owned();
            // one replacement char per dangling byte of a split code point
            v.extend(std::iter::repeat('\u{FFFD}').take(head.len() - valid));
            v
        }
    };
    out.push_str(&sum[..8]);
    out
}

fn prune_list(items: &[Value]) -> Vec<Value> {
    items
        .iter()
        .map(|v| match v {
            Value::Object(m) => Value::Object(prune_values(m, true)),
            Value::Array(a) => Value::Array(prune_list(a)),
            other => other.clone(),
        })
        .collect()
}

fn prune_values(data: &Map<String, Value>, in_list: bool) -> Map<String, Value> {
    let mut out = Map::new();
    for (k, v) in data {
        let pruned = match v {
            Value::Object(m) => Value::Object(prune_values(m, false)),
            Value::Array(a) => Value::Array(prune_list(a)),
            Value::String(s) if !(in_list && KNOWN_LIST_KEYS.contains(&k.as_str())) && s.len() > MAX_STRING => {
                Value::String(truncate(s))
            }
            other => other.clone(),
        };
        out.insert(k.clone(), pruned);
    }
    out
}

/// Pruned JSON body of `obj`, the input to [`encode`].
pub fn serialize_applied(obj: &DynamicObject) -> Result<Vec<u8>> {
    let pruned = match serde_json::to_value(obj)? {
        Value::Object(m) => Value::Object(prune_values(&m, false)),
        other => other,
    };
    Ok(serde_json::to_vec(&pruned)?)
}

/// gzip then unpadded standard base64. Falls back to the raw JSON when compression fails.
pub fn encode(body: &[u8]) -> String {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    if enc.write_all(body).is_err() {
        return String::from_utf8_lossy(body).into_owned();
    }
    match enc.finish() {
        Ok(gz) => STANDARD_NO_PAD.encode(gz),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

/// Inverse of [`encode`]. Raw JSON (leading `{`) passes through; anything
/// undecodable yields an empty body, meaning "no snapshot".
pub fn decode(annotation: &str) -> Vec<u8> {
    if annotation.is_empty() || annotation.starts_with('{') {
        return annotation.as_bytes().to_vec();
    }
    let Ok(gz) = STANDARD_NO_PAD.decode(annotation) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    match GzDecoder::new(gz.as_slice()).read_to_end(&mut out) {
        Ok(_) => out,
        Err(_) => Vec::new(),
    }
}

/// Copy of `obj` carrying a fresh snapshot annotation and its GVK.
pub fn prepare_for_create(gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject> {
    let serialized = serialize_applied(obj)?;
    let mut out = obj.clone();
    out.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(ANNOTATION_APPLIED.to_string(), encode(&serialized));
    meta::set_gvk(&mut out, gvk);
    Ok(out)
}

pub(crate) fn remove_server_metadata(data: &mut Value) -> bool {
    let Some(Value::Object(md)) = data.get_mut("metadata") else {
        return false;
    };
    let mut removed = false;
    for key in SERVER_METADATA {
        removed |= md.remove(key).is_some();
    }
    removed
}

/// The last applied body recorded on `obj`, re-prepared so it compares
/// like a freshly prepared desired object. `None` when there is no snapshot.
pub fn original_object(gvk: &Gvk, obj: &DynamicObject) -> Result<Option<DynamicObject>> {
    let body = decode(meta::annotation(obj, ANNOTATION_APPLIED).unwrap_or(""));
    if body.is_empty() {
        return Ok(None);
    }
    let mut value: Value = serde_json::from_slice(&body)?;
    remove_server_metadata(&mut value);
    let original: DynamicObject = serde_json::from_value(value)?;
    Ok(Some(prepare_for_create(gvk, &original)?))
}

/// [`original_object`] as JSON, `{}` when absent.
pub fn original_value(gvk: &Gvk, obj: &DynamicObject) -> Result<Value> {
    match original_object(gvk, obj)? {
        Some(o) => Ok(serde_json::to_value(o)?),
        None => Ok(Value::Object(Map::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> DynamicObject {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn long_strings_are_truncated_with_hash_suffix() {
        let long = "x".repeat(100);
        let o = obj(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a"},
            "data": {"big": long, "small": "s"}
        }));
        let body: Value = serde_json::from_slice(&serialize_applied(&o).unwrap()).unwrap();
        let big = body["data"]["big"].as_str().unwrap();
        assert_eq!(big.len(), 72);
        assert!(big.starts_with(&"x".repeat(64)));
        assert_eq!(&big[64..], &hex::encode(Sha256::digest(long.as_bytes()))[..8]);
        assert_eq!(body["data"]["small"], "s");
    }

    #[test]
    fn list_identity_keys_survive() {
        let long_name = "n".repeat(80);
        let o = obj(json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"name": &long_name},
            "spec": {"containers": [{"name": &long_name, "image": "i".repeat(80)}]}
        }));
        let body: Value = serde_json::from_slice(&serialize_applied(&o).unwrap()).unwrap();
        assert_eq!(body["spec"]["containers"][0]["name"], long_name.as_str());
        assert_eq!(body["spec"]["containers"][0]["image"].as_str().unwrap().len(), 72);
        // metadata.name is not inside a list, so it is truncated
        assert_eq!(body["metadata"]["name"].as_str().unwrap().len(), 72);
    }

    #[test]
    fn split_code_points_become_replacement_chars() {
        let s = format!("{}é{}", "a".repeat(63), "b".repeat(10));
        let t = truncate(&s);
        assert!(t.starts_with(&format!("{}\u{FFFD}", "a".repeat(63))));
        assert_eq!(t.chars().count(), 63 + 1 + 8);
    }

    #[test]
    fn encode_decode_and_raw_fallbacks() {
        let body = br#"{"a":1}"#;
        let enc = encode(body);
        assert!(!enc.ends_with('='));
        assert_eq!(decode(&enc), body.to_vec());
        assert_eq!(decode(r#"{"raw":true}"#), br#"{"raw":true}"#.to_vec());
        assert!(decode("!!not base64!!").is_empty());
        assert!(decode("").is_empty());
    }

    #[test]
    fn original_object_strips_server_fields() {
        let gvk = Gvk::new("", "v1", "ConfigMap");
        let desired = obj(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a", "namespace": "ns", "resourceVersion": "7", "uid": "u"},
            "data": {"k": "v"}
        }));
        let live = prepare_for_create(&gvk, &desired).unwrap();
        let original = original_object(&gvk, &live).unwrap().unwrap();
        assert_eq!(original.metadata.resource_version, None);
        assert_eq!(original.metadata.uid, None);
        assert_eq!(original.data["data"]["k"], "v");
        assert!(original_object(&gvk, &desired).unwrap().is_none());
    }
}
