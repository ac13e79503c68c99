//! Redaction of sensitive fields before payloads reach the cache, disk or logs.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Replacement written in place of a sensitive field.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Per-collection set of field names that must never be cached, persisted or logged.
///
/// Deserializes from a map of collection name to field list:
///
/// ```yaml
/// comments: [content]
/// profiles: [email, phone]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct FieldMask {
  collections: HashMap<String, BTreeSet<String>>,
}

impl FieldMask {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register sensitive fields for a collection. Repeated calls extend the set.
  pub fn with_collection<I, S>(mut self, collection: &str, fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self
      .collections
      .entry(collection.to_string())
      .or_default()
      .extend(fields.into_iter().map(Into::into));
    self
  }

  /// Shallow copy of `payload` with every sensitive field of `collection` replaced by
  /// [`REDACTION_MARKER`]. Arrays are treated as lists of rows.
  pub fn mask(&self, collection: &str, payload: &Value) -> Value {
    let Some(fields) = self.collections.get(collection) else {
      return payload.clone();
    };

    match payload {
      Value::Object(_) => mask_row(fields, payload),
      Value::Array(rows) => Value::Array(rows.iter().map(|row| mask_row(fields, row)).collect()),
      other => other.clone(),
    }
  }

  /// Whether masking would change anything in `payload`.
  pub fn redacts(&self, collection: &str, payload: &Value) -> bool {
    let Some(fields) = self.collections.get(collection) else {
      return false;
    };

    let row_has = |row: &Value| {
      row
        .as_object()
        .is_some_and(|obj| fields.iter().any(|f| obj.contains_key(f)))
    };

    match payload {
      Value::Array(rows) => rows.iter().any(row_has),
      other => row_has(other),
    }
  }

  /// Display adapter for log fields.
  pub fn display<'a>(&'a self, collection: &'a str, payload: &'a Value) -> Masked<'a> {
    Masked {
      mask: self,
      collection,
      payload,
    }
  }
}

fn mask_row(fields: &BTreeSet<String>, row: &Value) -> Value {
  let Value::Object(obj) = row else {
    return row.clone();
  };

  let mut out = obj.clone();
  for field in fields {
    if let Some(slot) = out.get_mut(field) {
      *slot = Value::String(REDACTION_MARKER.to_string());
    }
  }
  Value::Object(out)
}

/// Payload rendered with sensitive fields redacted.
pub struct Masked<'a> {
  mask: &'a FieldMask,
  collection: &'a str,
  payload: &'a Value,
}

impl fmt::Display for Masked<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.mask.mask(self.collection, self.payload))
  }
}
