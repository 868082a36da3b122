//! JSON Pointer Utility
//!
//! RFC6901 addressing over `serde_json::Value`: get, set and delete by
//! "/"-delimited path with `~0`/`~1` unescaping and numeric index
//! detection. Pure and shared by coding analysis and patch application.

use crate::error::EngineError;
use serde_json::Value;

/// Split a pointer into unescaped segments.
///
/// The empty pointer addresses the document root and yields no segments.
pub fn split(pointer: &str) -> Result<Vec<String>, EngineError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    if !pointer.starts_with('/') {
        return Err(EngineError::Pointer(format!(
            "pointer must start with '/': {}",
            pointer
        )));
    }
    Ok(pointer[1..].split('/').map(unescape).collect())
}

/// Unescape one pointer segment (`~1` → `/`, `~0` → `~`).
pub fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Escape one pointer segment for embedding in a pointer string.
pub fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Append a segment to a pointer, escaping it.
pub fn join(pointer: &str, segment: &str) -> String {
    format!("{}/{}", pointer, escape(segment))
}

/// Resolve a pointer to a reference into the document.
pub fn get<'a>(document: &'a Value, pointer: &str) -> Option<&'a Value> {
    let segments = split(pointer).ok()?;
    let mut current = document;
    for segment in &segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(parse_index(segment, items.len())?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set the value at a pointer, inserting into objects and arrays.
///
/// Array segments accept an existing index or `-` / the one-past-the-end
/// index to append. Intermediate segments must already exist.
pub fn set(document: &mut Value, pointer: &str, value: Value) -> Result<(), EngineError> {
    let segments = split(pointer)?;
    let Some((last, parents)) = segments.split_last() else {
        *document = value;
        return Ok(());
    };
    let target = descend_mut(document, parents, pointer)?;
    match target {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
                return Ok(());
            }
            let index = parse_index(last, items.len() + 1).ok_or_else(|| {
                EngineError::Pointer(format!("invalid array index '{}' in {}", last, pointer))
            })?;
            if index == items.len() {
                items.push(value);
            } else {
                items[index] = value;
            }
            Ok(())
        }
        _ => Err(EngineError::Pointer(format!(
            "cannot set under a scalar at {}",
            pointer
        ))),
    }
}

/// Remove and return the value at a pointer.
pub fn delete(document: &mut Value, pointer: &str) -> Result<Value, EngineError> {
    let segments = split(pointer)?;
    let (last, parents) = segments.split_last().ok_or_else(|| {
        EngineError::Pointer("cannot delete the document root".to_string())
    })?;
    let target = descend_mut(document, parents, pointer)?;
    match target {
        Value::Object(map) => map.remove(last).ok_or_else(|| {
            EngineError::Pointer(format!("no member '{}' at {}", last, pointer))
        }),
        Value::Array(items) => {
            let index = parse_index(last, items.len()).ok_or_else(|| {
                EngineError::Pointer(format!("invalid array index '{}' in {}", last, pointer))
            })?;
            Ok(items.remove(index))
        }
        _ => Err(EngineError::Pointer(format!(
            "cannot delete under a scalar at {}",
            pointer
        ))),
    }
}

fn descend_mut<'a>(
    document: &'a mut Value,
    segments: &[String],
    pointer: &str,
) -> Result<&'a mut Value, EngineError> {
    let mut current = document;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get_mut(segment).ok_or_else(|| {
                EngineError::Pointer(format!("no member '{}' along {}", segment, pointer))
            })?,
            Value::Array(items) => {
                let len = items.len();
                let index = parse_index(segment, len).ok_or_else(|| {
                    EngineError::Pointer(format!(
                        "invalid array index '{}' along {}",
                        segment, pointer
                    ))
                })?;
                &mut items[index]
            }
            _ => {
                return Err(EngineError::Pointer(format!(
                    "scalar along path at '{}' in {}",
                    segment, pointer
                )))
            }
        };
    }
    Ok(current)
}

/// Numeric index detection: digits only, no leading zeros (except "0"),
/// in bounds.
fn parse_index(segment: &str, len: usize) -> Option<usize> {
    if segment.is_empty() || (segment.len() > 1 && segment.starts_with('0')) {
        return None;
    }
    let index: usize = segment.parse().ok()?;
    (index < len).then_some(index)
}
