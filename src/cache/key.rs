//! Query keys: ordered segment lists identifying a cached read.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// One segment of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySegment {
  Null,
  Bool(bool),
  Int(i64),
  Str(String),
}

impl From<&str> for KeySegment {
  fn from(s: &str) -> Self {
    KeySegment::Str(s.to_string())
  }
}

impl From<String> for KeySegment {
  fn from(s: String) -> Self {
    KeySegment::Str(s)
  }
}

impl From<i64> for KeySegment {
  fn from(n: i64) -> Self {
    KeySegment::Int(n)
  }
}

impl From<i32> for KeySegment {
  fn from(n: i32) -> Self {
    KeySegment::Int(n.into())
  }
}

impl From<u32> for KeySegment {
  fn from(n: u32) -> Self {
    KeySegment::Int(n.into())
  }
}

impl From<bool> for KeySegment {
  fn from(b: bool) -> Self {
    KeySegment::Bool(b)
  }
}

impl<T: Into<KeySegment>> From<Option<T>> for KeySegment {
  fn from(v: Option<T>) -> Self {
    v.map(Into::into).unwrap_or(KeySegment::Null)
  }
}

impl fmt::Display for KeySegment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeySegment::Null => write!(f, "null"),
      KeySegment::Bool(b) => write!(f, "{}", b),
      KeySegment::Int(n) => write!(f, "{}", n),
      KeySegment::Str(s) => write!(f, "{}", s),
    }
  }
}

/// Ordered sequence of segments, e.g. `["projects", "active", 2]` for page 2 of the
/// active project listing.
///
/// Two keys are equal iff their segments are equal element-wise. A key is a prefix of
/// another when its segments match the other's leading segments, which is how
/// invalidation selects dependent reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeySegment>);

impl QueryKey {
  /// Key with a single leading segment, normally the collection name.
  pub fn new(first: impl Into<KeySegment>) -> Self {
    Self(vec![first.into()])
  }

  pub fn from_segments<I, S>(segments: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<KeySegment>,
  {
    Self(segments.into_iter().map(Into::into).collect())
  }

  /// Append a segment.
  pub fn with(mut self, segment: impl Into<KeySegment>) -> Self {
    self.0.push(segment.into());
    self
  }

  pub fn segments(&self) -> &[KeySegment] {
    &self.0
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Collection the cached value belongs to: the first segment when it is a string.
  pub fn collection(&self) -> Option<&str> {
    match self.0.first() {
      Some(KeySegment::Str(s)) => Some(s),
      _ => None,
    }
  }

  /// Whether `prefix` matches the leading segments of this key. The empty key matches
  /// everything.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// SHA256 hash of the segments for stable, fixed-length storage keys.
  pub fn cache_hash(&self) -> String {
    let encoded = serde_json::to_string(&self.0).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[")?;
    for (i, segment) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, ", ")?;
      }
      write!(f, "{}", segment)?;
    }
    write!(f, "]")
  }
}
