//! Document buffers, field paths, and the encrypted-value representation.
//!
//! Documents travel as compact JSON with field order preserved. An encrypted
//! field is stored in extended-JSON binary form with subtype `06`:
//! ```text
//! {"$binary": {"base64": "<envelope>", "subType": "06"}}
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use std::fmt;

use crate::error::Error;

/// Binary subtype marking an encrypted value.
pub const ENCRYPTED_SUBTYPE: &str = "06";

/// One step in a field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Field of a document
    Key(String),
    /// Element of an array
    Index(usize),
}

/// Location of a value inside a document, e.g. `filter.ssn` or `documents.0.ssn`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPath(Vec<PathSegment>);

impl FieldPath {
    /// Creates an empty (root) path.
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    /// Returns the path extended with a document field.
    #[must_use]
    pub fn key(mut self, name: impl Into<String>) -> Self {
        self.0.push(PathSegment::Key(name.into()));
        self
    }

    /// Returns the path extended with an array index.
    #[must_use]
    pub fn index(mut self, index: usize) -> Self {
        self.0.push(PathSegment::Index(index));
        self
    }

    /// Returns the segments of the path.
    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub(crate) fn push(&mut self, segment: PathSegment) {
        self.0.push(segment);
    }

    pub(crate) fn pop(&mut self) {
        self.0.pop();
    }

    /// Resolves the path in `root`.
    #[must_use]
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.0.iter().try_fold(root, |value, segment| match segment {
            PathSegment::Key(name) => value.as_object()?.get(name),
            PathSegment::Index(i) => value.as_array()?.get(*i),
        })
    }

    /// Resolves the path in `root` for mutation.
    pub fn get_mut<'a>(&self, root: &'a mut Value) -> Option<&'a mut Value> {
        self.0.iter().try_fold(root, |value, segment| match segment {
            PathSegment::Key(name) => value.as_object_mut()?.get_mut(name),
            PathSegment::Index(i) => value.as_array_mut()?.get_mut(*i),
        })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match segment {
                PathSegment::Key(name) => f.write_str(name)?,
                PathSegment::Index(index) => write!(f, "{index}")?,
            }
        }
        Ok(())
    }
}

/// Parses a document buffer. The top level must be an object.
///
/// # Errors
///
/// Returns `Error::InvalidDocument` if the buffer is not a JSON object.
pub fn parse_document(buffer: &[u8]) -> Result<Value, Error> {
    let value: Value =
        serde_json::from_slice(buffer).map_err(|e| Error::InvalidDocument(e.to_string()))?;
    if !value.is_object() {
        return Err(Error::InvalidDocument("top-level value is not a document".to_string()));
    }
    Ok(value)
}

/// Serializes a document to a compact buffer.
///
/// # Errors
///
/// Returns `Error::InvalidDocument` if serialization fails.
pub fn to_buffer(document: &Value) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(document).map_err(|e| Error::InvalidDocument(e.to_string()))
}

/// Wraps an envelope as an encrypted value.
#[must_use]
pub fn encrypted_value(envelope: &[u8]) -> Value {
    json!({"$binary": {"base64": STANDARD.encode(envelope), "subType": ENCRYPTED_SUBTYPE}})
}

/// Extracts the envelope from an encrypted value.
///
/// Returns `None` if `value` is not an encrypted value, and `Some(Err(_))` if
/// it is marked encrypted but its payload is not valid base64.
#[must_use]
pub fn envelope_bytes(value: &Value) -> Option<Result<Vec<u8>, String>> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    let binary = object.get("$binary")?.as_object()?;
    if binary.get("subType")?.as_str()? != ENCRYPTED_SUBTYPE {
        return None;
    }
    let Some(encoded) = binary.get("base64").and_then(Value::as_str) else {
        return Some(Err("encrypted value has no base64 payload".to_string()));
    };
    Some(STANDARD.decode(encoded).map_err(|e| format!("envelope is not base64: {e}")))
}

/// Returns true if `value` is an encrypted value.
#[must_use]
pub fn is_encrypted(value: &Value) -> bool {
    envelope_bytes(value).is_some()
}

/// Finds every encrypted value in `document`, in traversal order.
#[must_use]
pub fn find_encrypted(document: &Value) -> Vec<(FieldPath, Result<Vec<u8>, String>)> {
    let mut found = Vec::new();
    let mut path = FieldPath::root();
    collect_encrypted(document, &mut path, &mut found);
    found
}

fn collect_encrypted(
    value: &Value,
    path: &mut FieldPath,
    found: &mut Vec<(FieldPath, Result<Vec<u8>, String>)>,
) {
    if let Some(envelope) = envelope_bytes(value) {
        found.push((path.clone(), envelope));
        return;
    }
    match value {
        Value::Object(fields) => {
            for (name, child) in fields {
                path.push(PathSegment::Key(name.clone()));
                collect_encrypted(child, path, found);
                path.pop();
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                path.push(PathSegment::Index(i));
                collect_encrypted(child, path, found);
                path.pop();
            }
        }
        _ => {}
    }
}
