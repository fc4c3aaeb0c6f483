//! Dot-separated paths into a JSON document (`modules.CONTROL_FS.priority`).

use serde_json::{Map, Value};

use crate::error::ConfigError;

/// Split `path` into segments; empty paths and empty segments are invalid.
pub fn split(path: &str) -> Result<Vec<&str>, ConfigError> {
    if path.is_empty() {
        return Err(ConfigError::InvalidPath);
    }
    let parts: Vec<&str> = path.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(ConfigError::InvalidPath);
    }
    Ok(parts)
}

pub fn get<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let parts = split(path).ok()?;
    parts.iter().try_fold(doc, |node, seg| node.as_object()?.get(*seg))
}

/// Set `path` to `value`, creating missing intermediate objects. Fails when
/// an existing non-object is in the way.
pub fn set(doc: &mut Value, path: &str, value: Value) -> Result<(), ConfigError> {
    let parts = split(path)?;
    let (last, parents) = parts.split_last().ok_or(ConfigError::InvalidPath)?;
    let mut node = doc;
    for seg in parents {
        let obj = node.as_object_mut().ok_or(ConfigError::InvalidPath)?;
        node = obj
            .entry((*seg).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let obj = node.as_object_mut().ok_or(ConfigError::InvalidPath)?;
    obj.insert((*last).to_string(), value);
    Ok(())
}

pub fn remove(doc: &mut Value, path: &str) -> Option<Value> {
    let parts = split(path).ok()?;
    let (last, parents) = parts.split_last()?;
    let mut node = doc;
    for seg in parents {
        node = node.as_object_mut()?.get_mut(*seg)?;
    }
    node.as_object_mut()?.remove(*last)
}

/// Resolve a rule pattern where `*` matches every key of an object.
///
/// Each concrete path is returned with its value (`None` when absent).
/// A wildcard over a missing or non-object node yields no instances.
pub fn expand<'a>(doc: &'a Value, pattern: &str) -> Vec<(String, Option<&'a Value>)> {
    let mut out = Vec::new();
    if let Ok(parts) = split(pattern) {
        walk(Some(doc), &parts, String::new(), &mut out);
    }
    out
}

fn walk<'a>(node: Option<&'a Value>, segs: &[&str], prefix: String, out: &mut Vec<(String, Option<&'a Value>)>) {
    let Some((seg, rest)) = segs.split_first() else {
        out.push((prefix, node));
        return;
    };
    let join = |key: &str| if prefix.is_empty() { key.to_string() } else { format!("{prefix}.{key}") };
    if *seg == "*" {
        if let Some(obj) = node.and_then(Value::as_object) {
            for (k, v) in obj {
                walk(Some(v), rest, join(k.as_str()), out);
            }
        }
    } else {
        let child = node.and_then(Value::as_object).and_then(|o| o.get(*seg));
        walk(child, rest, join(*seg), out);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn get_set_remove() {
        let mut doc = json!({"a": {"b": 1}, "n": 5});
        assert_eq!(get(&doc, "a.b"), Some(&json!(1)));
        assert_eq!(get(&doc, "a.x"), None);
        assert_eq!(get(&doc, "n.x"), None);

        set(&mut doc, "c.d.e", json!(true)).unwrap();
        assert_eq!(doc["c"]["d"]["e"], true);
        assert_eq!(set(&mut doc, "n.x", json!(1)), Err(ConfigError::InvalidPath));
        assert_eq!(set(&mut doc, "a..b", json!(1)), Err(ConfigError::InvalidPath));

        assert_eq!(remove(&mut doc, "a.b"), Some(json!(1)));
        assert_eq!(remove(&mut doc, "a.b"), None);
        assert_eq!(doc["a"], json!({}));
    }

    #[test]
    fn wildcard_expansion() {
        let doc = json!({"modules": {"A": {"p": 1}, "B": {}}});
        let hits = expand(&doc, "modules.*.p");
        assert_eq!(hits.len(), 2);
        assert!(hits.contains(&("modules.A.p".to_string(), Some(&json!(1)))));
        assert!(hits.contains(&("modules.B.p".to_string(), None)));

        assert!(expand(&json!({}), "modules.*.p").is_empty());
        assert_eq!(expand(&json!({}), "system.x"), vec![("system.x".to_string(), None)]);
    }
}
