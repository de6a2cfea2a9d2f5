//! Tree search and update primitives for serialized value trees.
//!
//! The engine stores job arguments and outputs as [`serde_json::Value`]
//! trees. This module provides the low-level walkers that the reference
//! resolver and the multi-store router are built on: locating keys and
//! key/value pairs anywhere inside nested maps and sequences, reading a
//! subtree at a path, and splicing a replacement back in at a path.
//!
//! # Examples
//!
//! ```
//! use jobflow::utils::find::{find_key, PathToken};
//! use serde_json::json;
//!
//! let data = json!({
//!     "a": [0, {"b": 1, "x": 3}],
//!     "c": {"d": {"x": 3}}
//! });
//!
//! let mut paths = find_key(&data, "x", true);
//! paths.sort();
//! assert_eq!(
//!     paths,
//!     vec![
//!         vec![PathToken::Key("a".into()), PathToken::Idx(1), PathToken::Key("x".into())],
//!         vec![PathToken::Key("c".into()), PathToken::Key("d".into()), PathToken::Key("x".into())],
//!     ]
//! );
//! ```

use serde_json::Value;

/// One step in a path through a value tree: a map key or a sequence index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathToken {
    /// Lookup by key in a mapping.
    Key(String),
    /// Lookup by position in a sequence.
    Idx(usize),
}

impl std::fmt::Display for PathToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathToken::Key(k) => write!(f, ".{k}"),
            PathToken::Idx(i) => write!(f, "[{i}]"),
        }
    }
}

/// Find the routes to every map that contains `key`.
///
/// Works on arbitrarily nested maps and sequences. When `include_end` is
/// true the matched key itself is appended to each route, so the route
/// addresses the value under the key rather than its enclosing map.
///
/// A map that contains `key` is not descended into any further; the match
/// terminates that branch of the walk.
pub fn find_key(tree: &Value, key: &str, include_end: bool) -> Vec<Vec<PathToken>> {
    let mut found = Vec::new();
    lookup_key(tree, key, include_end, &mut Vec::new(), &mut found);
    found
}

fn lookup_key(
    tree: &Value,
    key: &str,
    include_end: bool,
    path: &mut Vec<PathToken>,
    found: &mut Vec<Vec<PathToken>>,
) {
    match tree {
        Value::Object(map) => {
            if map.contains_key(key) {
                let mut hit = path.clone();
                if include_end {
                    hit.push(PathToken::Key(key.to_string()));
                }
                found.push(hit);
                return;
            }
            for (k, v) in map {
                path.push(PathToken::Key(k.clone()));
                lookup_key(v, key, include_end, path, found);
                path.pop();
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                path.push(PathToken::Idx(i));
                lookup_key(v, key, include_end, path, found);
                path.pop();
            }
        }
        _ => {}
    }
}

/// Find the routes to every map in which `key` maps exactly to `value`.
///
/// Unlike [`find_key`], matched maps are still descended into, so nested
/// matches are all reported.
pub fn find_key_value(tree: &Value, key: &str, value: &Value) -> Vec<Vec<PathToken>> {
    let mut found = Vec::new();
    lookup_key_value(tree, key, value, &mut Vec::new(), &mut found);
    found
}

fn lookup_key_value(
    tree: &Value,
    key: &str,
    value: &Value,
    path: &mut Vec<PathToken>,
    found: &mut Vec<Vec<PathToken>>,
) {
    match tree {
        Value::Object(map) => {
            if map.get(key) == Some(value) {
                found.push(path.clone());
            }
            for (k, v) in map {
                path.push(PathToken::Key(k.clone()));
                lookup_key_value(v, key, value, path, found);
                path.pop();
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                path.push(PathToken::Idx(i));
                lookup_key_value(v, key, value, path, found);
                path.pop();
            }
        }
        _ => {}
    }
}

/// Read the subtree at `path`, or `None` if any step does not apply.
pub fn get_at<'a>(tree: &'a Value, path: &[PathToken]) -> Option<&'a Value> {
    let mut current = tree;
    for token in path {
        current = match token {
            PathToken::Key(k) => current.get(k.as_str())?,
            PathToken::Idx(i) => current.get(*i)?,
        };
    }
    Some(current)
}

/// Replace the subtree at `path` with `replacement`.
///
/// Returns `false` (leaving the tree untouched) if the path does not
/// address an existing location.
pub fn update_at(tree: &mut Value, path: &[PathToken], replacement: Value) -> bool {
    let Some((last, prefix)) = path.split_last() else {
        *tree = replacement;
        return true;
    };
    let mut current = tree;
    for token in prefix {
        current = match token {
            PathToken::Key(k) => match current.get_mut(k.as_str()) {
                Some(v) => v,
                None => return false,
            },
            PathToken::Idx(i) => match current.get_mut(*i) {
                Some(v) => v,
                None => return false,
            },
        };
    }
    match last {
        PathToken::Key(k) => match current.as_object_mut() {
            Some(map) if map.contains_key(k) => {
                map.insert(k.clone(), replacement);
                true
            }
            _ => false,
        },
        PathToken::Idx(i) => match current.as_array_mut() {
            Some(items) if *i < items.len() => {
                items[*i] = replacement;
                true
            }
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "a": [0, {"b": 1, "x": 3}],
            "c": {"d": {"x": 3}}
        })
    }

    #[test]
    fn test_find_key_routes() {
        let mut paths = find_key(&sample(), "x", false);
        paths.sort();
        assert_eq!(
            paths,
            vec![
                vec![PathToken::Key("a".into()), PathToken::Idx(1)],
                vec![PathToken::Key("c".into()), PathToken::Key("d".into())],
            ]
        );
    }

    #[test]
    fn test_find_key_stops_at_match() {
        // The outer map matches, so the nested "x" is not reported.
        let data = json!({"x": {"x": 1}});
        let paths = find_key(&data, "x", false);
        assert_eq!(paths, vec![Vec::<PathToken>::new()]);
    }

    #[test]
    fn test_find_key_value_reports_nested() {
        let data = json!({"a": {"t": "m", "inner": {"t": "m"}}});
        let mut paths = find_key_value(&data, "t", &json!("m"));
        paths.sort();
        assert_eq!(
            paths,
            vec![
                vec![PathToken::Key("a".into())],
                vec![PathToken::Key("a".into()), PathToken::Key("inner".into())],
            ]
        );
    }

    #[test]
    fn test_get_at_and_update_at() {
        let mut data = sample();
        let path = vec![
            PathToken::Key("a".into()),
            PathToken::Idx(1),
            PathToken::Key("x".into()),
        ];
        assert_eq!(get_at(&data, &path), Some(&json!(3)));
        assert!(update_at(&mut data, &path, json!(100)));
        assert_eq!(get_at(&data, &path), Some(&json!(100)));
    }

    #[test]
    fn test_update_at_missing_location() {
        let mut data = sample();
        let path = vec![PathToken::Key("nope".into())];
        assert!(!update_at(&mut data, &path, json!(1)));
        assert_eq!(data, sample());
    }

    #[test]
    fn test_update_at_root() {
        let mut data = json!(1);
        assert!(update_at(&mut data, &[], json!({"replaced": true})));
        assert_eq!(data, json!({"replaced": true}));
    }
}
