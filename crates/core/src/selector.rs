//! Label and field selectors in the usual string syntax
//! (`app=web,tier in (a,b),!legacy`, `spec.nodeName=n1`).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use kube::core::DynamicObject;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    NotExists(String),
}

impl Requirement {
    fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let get = |k: &str| labels.and_then(|l| l.get(k)).map(String::as_str);
        match self {
            Requirement::Equals(k, v) => get(k) == Some(v.as_str()),
            Requirement::NotEquals(k, v) => get(k) != Some(v.as_str()),
            Requirement::In(k, set) => get(k).map(|v| set.contains(v)).unwrap_or(false),
            Requirement::NotIn(k, set) => get(k).map(|v| !set.contains(v)).unwrap_or(true),
            Requirement::Exists(k) => get(k).is_some(),
            Requirement::NotExists(k) => get(k).is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Requirement::Equals(k, v) => write!(f, "{}={}", k, v),
            Requirement::NotEquals(k, v) => write!(f, "{}!={}", k, v),
            Requirement::In(k, set) => write!(f, "{} in ({})", k, join(set)),
            Requirement::NotIn(k, set) => write!(f, "{} notin ({})", k, join(set)),
            Requirement::Exists(k) => f.write_str(k),
            Requirement::NotExists(k) => write!(f, "!{}", k),
        }
    }
}

/// Conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    /// Selector requiring every given label to have exactly the given value.
    pub fn from_labels<K, V, I>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut requirements: Vec<_> =
            labels.into_iter().map(|(k, v)| Requirement::Equals(k.into(), v.into())).collect();
        requirements.sort_by_key(|r| r.to_string());
        Self { requirements }
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", r)?;
        }
        Ok(())
    }
}

impl FromStr for LabelSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |message: &str| Error::InvalidSelector { selector: s.to_string(), message: message.to_string() };
        let mut requirements = Vec::new();
        for term in split_top_level(s).map_err(|m| invalid(m))? {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            requirements.push(parse_requirement(term).map_err(|m| invalid(&m))?);
        }
        Ok(Self { requirements })
    }
}

/// Split on commas that are not inside a parenthesised value set.
fn split_top_level(s: &str) -> std::result::Result<Vec<&str>, &'static str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err("unbalanced parentheses");
                }
            }
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err("unbalanced parentheses");
    }
    out.push(&s[start..]);
    Ok(out)
}

fn parse_requirement(term: &str) -> std::result::Result<Requirement, String> {
    let check_key = |k: &str| -> std::result::Result<String, String> {
        let k = k.trim();
        if k.is_empty() || k.contains(char::is_whitespace) {
            Err(format!("invalid label key {:?}", k))
        } else {
            Ok(k.to_string())
        }
    };
    if let Some(rest) = term.strip_prefix('!') {
        return Ok(Requirement::NotExists(check_key(rest)?));
    }
    if let Some((k, v)) = term.split_once("!=") {
        return Ok(Requirement::NotEquals(check_key(k)?, v.trim().to_string()));
    }
    if let Some((k, v)) = term.split_once("==") {
        return Ok(Requirement::Equals(check_key(k)?, v.trim().to_string()));
    }
    if let Some((k, v)) = term.split_once('=') {
        return Ok(Requirement::Equals(check_key(k)?, v.trim().to_string()));
    }
    if let Some(open) = term.find('(') {
        let head = term[..open].trim();
        let body = term[open + 1..].strip_suffix(')').ok_or_else(|| format!("missing ')' in {:?}", term))?;
        let values: BTreeSet<String> =
            body.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect();
        let (key, op) = head.rsplit_once(char::is_whitespace).ok_or_else(|| format!("missing operator in {:?}", term))?;
        let key = check_key(key)?;
        return match op {
            "in" => Ok(Requirement::In(key, values)),
            "notin" => Ok(Requirement::NotIn(key, values)),
            other => Err(format!("unknown operator {:?}", other)),
        };
    }
    Ok(Requirement::Exists(check_key(term)?))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldRequirement {
    Equals(String, String),
    NotEquals(String, String),
}

/// Conjunction of `path=value` / `path!=value` terms over dotted JSON paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FieldSelector {
    requirements: Vec<FieldRequirement>,
}

impl FieldSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn equals(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self { requirements: vec![FieldRequirement::Equals(path.into(), value.into())] }
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Missing fields compare as the empty string.
    pub fn matches(&self, obj: &DynamicObject) -> bool {
        if self.requirements.is_empty() {
            return true;
        }
        let value = match serde_json::to_value(obj) {
            Ok(v) => v,
            Err(_) => return false,
        };
        self.requirements.iter().all(|r| match r {
            FieldRequirement::Equals(path, want) => field_value(&value, path) == *want,
            FieldRequirement::NotEquals(path, want) => field_value(&value, path) != *want,
        })
    }
}

fn field_value(root: &serde_json::Value, path: &str) -> String {
    let mut cur = root;
    for seg in path.split('.') {
        match cur.get(seg) {
            Some(v) => cur = v,
            None => return String::new(),
        }
    }
    match cur {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match r {
                FieldRequirement::Equals(p, v) => write!(f, "{}={}", p, v)?,
                FieldRequirement::NotEquals(p, v) => write!(f, "{}!={}", p, v)?,
            }
        }
        Ok(())
    }
}

impl FromStr for FieldSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let req = if let Some((p, v)) = term.split_once("!=") {
                FieldRequirement::NotEquals(p.trim().to_string(), v.trim().to_string())
            } else if let Some((p, v)) = term.split_once("==") {
                FieldRequirement::Equals(p.trim().to_string(), v.trim().to_string())
            } else if let Some((p, v)) = term.split_once('=') {
                FieldRequirement::Equals(p.trim().to_string(), v.trim().to_string())
            } else {
                return Err(Error::InvalidSelector {
                    selector: s.to_string(),
                    message: format!("term {:?} has no operator", term),
                });
            };
            let path = match &req {
                FieldRequirement::Equals(p, _) | FieldRequirement::NotEquals(p, _) => p,
            };
            if path.is_empty() {
                return Err(Error::InvalidSelector { selector: s.to_string(), message: "empty field path".into() });
            }
            requirements.push(req);
        }
        Ok(Self { requirements })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn label_selector_ops() {
        let sel: LabelSelector = "app=web, tier in (front, back),!legacy,env!=prod".parse().unwrap();
        assert_eq!(sel.requirements().len(), 4);
        assert!(sel.matches(Some(&labels(&[("app", "web"), ("tier", "front")]))));
        assert!(!sel.matches(Some(&labels(&[("app", "web"), ("tier", "db")]))));
        assert!(!sel.matches(Some(&labels(&[("app", "web"), ("tier", "front"), ("legacy", "")]))));
        assert!(!sel.matches(Some(&labels(&[("app", "web"), ("tier", "back"), ("env", "prod")]))));
        assert!(!sel.matches(None));

        let notin: LabelSelector = "tier notin (a),owner".parse().unwrap();
        assert!(notin.matches(Some(&labels(&[("owner", "x")]))));
        assert!(!notin.matches(Some(&labels(&[("owner", "x"), ("tier", "a")]))));
        assert_eq!(notin.to_string(), "tier notin (a),owner");

        assert!(LabelSelector::everything().matches(None));
        assert!("tier in (a".parse::<LabelSelector>().is_err());
        assert!("tier between (a)".parse::<LabelSelector>().is_err());
    }

    #[test]
    fn label_selector_from_labels_is_canonical() {
        let a = LabelSelector::from_labels([("b", "2"), ("a", "1")]);
        let b = LabelSelector::from_labels([("a", "1"), ("b", "2")]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "a=1,b=2");
    }

    #[test]
    fn field_selector_paths() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"name": "p", "namespace": "ns"},
            "spec": {"nodeName": "n1", "priority": 3}
        }))
        .unwrap();
        let sel: FieldSelector = "spec.nodeName=n1,metadata.namespace!=kube-system".parse().unwrap();
        assert!(sel.matches(&obj));
        assert!(FieldSelector::equals("spec.priority", "3").matches(&obj));
        assert!(!FieldSelector::equals("spec.nodeName", "n2").matches(&obj));
        assert!(FieldSelector::equals("spec.missing", "").matches(&obj));
        assert!("spec.nodeName".parse::<FieldSelector>().is_err());
    }
}
