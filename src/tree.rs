//! Path-addressable editing of manifest trees.
//!
//! Manifests stay untyped `serde_json::Value` trees; this module is the one
//! place that reads and writes them by path. A path is a dot-separated list
//! of segments:
//!
//! - `name` addresses an object key
//! - `name[3]` addresses element 3 of the array under `name`
//! - `["app.kubernetes.io/name"]` addresses a key containing dots
//!
//! Writes auto-vivify: missing objects and arrays are created, arrays are
//! padded with `null` up to the addressed index, and any node of the wrong
//! shape along the way is replaced by an empty one of the right shape.

use serde_json::{Map, Value};

use crate::{Error, Result};

/// One step of a parsed path
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// Object key
    Key(String),
    /// Array index
    Index(usize),
}

/// Parse a dotted path into segments
pub fn parse_path(path: &str) -> Result<Vec<Segment>> {
    if path.is_empty() {
        return Err(Error::invalid_path(path, "empty path"));
    }

    let mut segments = Vec::new();
    let chars: Vec<char> = path.chars().collect();
    let mut i = 0;
    let mut expect_segment = true;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                if expect_segment {
                    return Err(Error::invalid_path(path, "empty segment"));
                }
                expect_segment = true;
                i += 1;
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|p| p + i)
                    .ok_or_else(|| Error::invalid_path(path, "unterminated '['"))?;
                let inner: String = chars[i + 1..close].iter().collect();
                let quoted = (inner.starts_with('"') && inner.ends_with('"'))
                    || (inner.starts_with('\'') && inner.ends_with('\''));
                if quoted && inner.len() >= 2 {
                    segments.push(Segment::Key(inner[1..inner.len() - 1].to_string()));
                } else {
                    let index = inner.parse::<usize>().map_err(|_| {
                        Error::invalid_path(path, format!("'{}' is not an array index", inner))
                    })?;
                    segments.push(Segment::Index(index));
                }
                expect_segment = false;
                i = close + 1;
            }
            _ => {
                if !expect_segment {
                    return Err(Error::invalid_path(path, "missing '.' between segments"));
                }
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                segments.push(Segment::Key(chars[start..i].iter().collect()));
                expect_segment = false;
            }
        }
    }

    if expect_segment {
        return Err(Error::invalid_path(path, "trailing '.'"));
    }

    Ok(segments)
}

/// Read the value at `path`, or `None` when any step is missing.
///
/// Malformed paths read as missing.
pub fn get<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = parse_path(path).ok()?;
    let mut node = tree;
    for segment in &segments {
        node = match segment {
            Segment::Key(k) => node.as_object()?.get(k)?,
            Segment::Index(i) => node.as_array()?.get(*i)?,
        };
    }
    Some(node)
}

/// Mutable variant of [`get`]
pub fn get_mut<'a>(tree: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let segments = parse_path(path).ok()?;
    let mut node = tree;
    for segment in &segments {
        node = match segment {
            Segment::Key(k) => node.as_object_mut()?.get_mut(k)?,
            Segment::Index(i) => node.as_array_mut()?.get_mut(*i)?,
        };
    }
    Some(node)
}

/// Read a string at `path`, failing when absent, not a string, or blank.
pub fn get_required_str<'a>(tree: &'a Value, path: &str) -> Result<&'a str> {
    match get(tree, path).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(Error::missing_path(path, describe(tree))),
    }
}

/// Read a node at `path`, failing when absent or null.
pub fn get_required<'a>(tree: &'a Value, path: &str) -> Result<&'a Value> {
    match get(tree, path) {
        Some(v) if !v.is_null() => Ok(v),
        _ => Err(Error::missing_path(path, describe(tree))),
    }
}

/// Write `value` at `path`, creating intermediate nodes as needed.
pub fn set(tree: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments = parse_path(path)?;
    *vivify(tree, &segments) = value;
    Ok(())
}

/// Return the node at `path`, replacing it with an empty object unless it
/// already is one.
pub fn object_node<'a>(tree: &'a mut Value, path: &str) -> Result<&'a mut Value> {
    let segments = parse_path(path)?;
    let node = vivify(tree, &segments);
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    Ok(node)
}

/// Return the node at `path`, creating it as an empty object if absent.
pub fn ensure_object<'a>(tree: &'a mut Value, path: &str) -> Result<&'a mut Map<String, Value>> {
    object_node(tree, path)?
        .as_object_mut()
        .ok_or_else(|| Error::internal_with_context("tree", "object vivification failed"))
}

/// Return the node at `path`, creating it as an empty array if absent.
pub fn ensure_array<'a>(tree: &'a mut Value, path: &str) -> Result<&'a mut Vec<Value>> {
    let segments = parse_path(path)?;
    let node = vivify(tree, &segments);
    if !node.is_array() {
        *node = Value::Array(Vec::new());
    }
    node.as_array_mut()
        .ok_or_else(|| Error::internal_with_context("tree", "array vivification failed"))
}

/// Walk `segments`, shaping each node for the next step.
///
/// The final node is left untouched if it exists and becomes `null` if not.
fn vivify<'a>(tree: &'a mut Value, segments: &[Segment]) -> &'a mut Value {
    let mut node = tree;
    for segment in segments {
        node = match segment {
            Segment::Key(key) => {
                if !node.is_object() {
                    *node = Value::Object(Map::new());
                }
                match node {
                    Value::Object(map) => map.entry(key.clone()).or_insert(Value::Null),
                    _ => unreachable!("node was just made an object"),
                }
            }
            Segment::Index(index) => {
                if !node.is_array() {
                    *node = Value::Array(Vec::new());
                }
                match node {
                    Value::Array(items) => {
                        if items.len() <= *index {
                            items.resize(*index + 1, Value::Null);
                        }
                        &mut items[*index]
                    }
                    _ => unreachable!("node was just made an array"),
                }
            }
        };
    }
    node
}

/// Human-readable identity of a manifest for error messages
pub fn describe(tree: &Value) -> String {
    let kind = tree.get("kind").and_then(Value::as_str).unwrap_or("<unknown kind>");
    let name = tree
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>");
    match tree.pointer("/metadata/namespace").and_then(Value::as_str) {
        Some(ns) => format!("{}/{}/{}", kind, ns, name),
        None => format!("{}/{}", kind, name),
    }
}
