//! Mutation descriptors: the unit of optimistic application and queued replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::cache::QueryKey;

/// Unique mutation id. UUIDv7, so ids sort roughly by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(Uuid);

impl MutationId {
  pub fn new() -> Self {
    Self(Uuid::now_v7())
  }

  pub fn as_uuid(&self) -> &Uuid {
    &self.0
  }
}

impl Default for MutationId {
  fn default() -> Self {
    Self::new()
  }
}

impl From<Uuid> for MutationId {
  fn from(id: Uuid) -> Self {
    Self(id)
  }
}

impl fmt::Display for MutationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl std::str::FromStr for MutationId {
  type Err = uuid::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Uuid::parse_str(s).map(Self)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
  Insert,
  Update,
  Delete,
  BulkInsert,
  BulkUpdate,
  Upsert,
  /// Server-side function call; `collection` holds the function name
  RemoteCall,
}

impl Operation {
  pub fn is_bulk(self) -> bool {
    matches!(self, Operation::BulkInsert | Operation::BulkUpdate)
  }
}

/// Immutable description of a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationDescriptor {
  pub id: MutationId,
  pub collection: String,
  pub operation: Operation,
  pub variables: Value,
  /// Natural key the backend reconciles upserts on
  pub conflict_target: Option<String>,
  pub affected_keys: BTreeSet<QueryKey>,
  pub created_at: DateTime<Utc>,
  /// Primary-key value of the targeted row, when the payload names exactly one. Upserts
  /// with a conflict target use its `column=value` pairs instead.
  pub identity: Option<String>,
}

impl MutationDescriptor {
  /// Build a descriptor, deriving the row identity from `primary_key` in `variables`.
  pub fn new(
    collection: impl Into<String>,
    operation: Operation,
    variables: Value,
    created_at: DateTime<Utc>,
    primary_key: &str,
  ) -> Self {
    let identity = derive_identity(operation, &variables, primary_key);
    Self {
      id: MutationId::new(),
      collection: collection.into(),
      operation,
      variables,
      conflict_target: None,
      affected_keys: BTreeSet::new(),
      created_at,
      identity,
    }
  }

  pub fn with_conflict_target(mut self, target: impl Into<String>) -> Self {
    let target = target.into();
    if self.operation == Operation::Upsert {
      self.identity = conflict_identity(&self.variables, &target);
    }
    self.conflict_target = Some(target);
    self
  }

  pub fn with_affected_keys<I>(mut self, keys: I) -> Self
  where
    I: IntoIterator<Item = QueryKey>,
  {
    self.affected_keys.extend(keys);
    self
  }

  /// Ordering group for replay.
  pub fn entity_group(&self) -> EntityGroup {
    match self.operation {
      Operation::RemoteCall => EntityGroup {
        collection: format!("rpc:{}", self.collection),
        identity: None,
      },
      _ => EntityGroup {
        collection: self.collection.clone(),
        identity: self.identity.clone(),
      },
    }
  }
}

fn derive_identity(operation: Operation, variables: &Value, primary_key: &str) -> Option<String> {
  if operation.is_bulk() || operation == Operation::RemoteCall {
    return None;
  }
  scalar(variables.get(primary_key)?)
}

/// The row an upsert lands on is decided by its conflict columns, not its primary key.
/// Missing columns or a row array fall back to the whole collection.
fn conflict_identity(variables: &Value, target: &str) -> Option<String> {
  let columns = target
    .split(',')
    .map(|column| {
      let column = column.trim();
      scalar(variables.get(column)?).map(|value| format!("{}={}", column, value))
    })
    .collect::<Option<Vec<_>>>()?;
  Some(columns.join(","))
}

fn scalar(value: &Value) -> Option<String> {
  match value {
    Value::Null | Value::Array(_) | Value::Object(_) => None,
    Value::String(s) => Some(s.clone()),
    other => Some(other.to_string()),
  }
}

/// Entity a mutation writes to: a row when `identity` is known, otherwise the whole
/// collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityGroup {
  pub collection: String,
  pub identity: Option<String>,
}

impl EntityGroup {
  /// Mutations in conflicting groups must never be in flight together and replay in
  /// submission order.
  pub fn conflicts_with(&self, other: &EntityGroup) -> bool {
    if self.collection != other.collection {
      return false;
    }
    match (&self.identity, &other.identity) {
      (Some(a), Some(b)) => a == b,
      _ => true,
    }
  }
}

impl fmt::Display for EntityGroup {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.identity {
      Some(id) => write!(f, "{}/{}", self.collection, id),
      None => write!(f, "{}/*", self.collection),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn descriptor(collection: &str, operation: Operation, variables: Value) -> MutationDescriptor {
    MutationDescriptor::new(collection, operation, variables, Utc::now(), "id")
  }

  #[test]
  fn test_identity_from_primary_key() {
    let m = descriptor("projects", Operation::Update, json!({"id": 7, "name": "Roof"}));
    assert_eq!(m.identity.as_deref(), Some("7"));
    assert_eq!(m.entity_group().to_string(), "projects/7");

    let m = descriptor("profiles", Operation::Update, json!({"id": "u-1", "role": "admin"}));
    assert_eq!(m.identity.as_deref(), Some("u-1"));
  }

  #[test]
  fn test_collection_wide_groups() {
    let insert = descriptor("projects", Operation::Insert, json!({"name": "New"}));
    assert_eq!(insert.identity, None);

    let bulk = descriptor("projects", Operation::BulkUpdate, json!([{"id": 1}, {"id": 2}]));
    assert_eq!(bulk.identity, None);

    let rpc = descriptor("recalculate_totals", Operation::RemoteCall, json!({"id": 3}));
    assert_eq!(rpc.entity_group().to_string(), "rpc:recalculate_totals/*");
  }

  #[test]
  fn test_upsert_identity_from_conflict_target() {
    let first = descriptor(
      "financial_settings",
      Operation::Upsert,
      json!({"id": 10, "project_id": 3, "vat": 21}),
    )
    .with_conflict_target("project_id");
    let second = descriptor(
      "financial_settings",
      Operation::Upsert,
      json!({"id": 11, "project_id": 3, "vat": 9}),
    )
    .with_conflict_target("project_id");

    assert_eq!(first.entity_group().to_string(), "financial_settings/project_id=3");
    assert!(first.entity_group().conflicts_with(&second.entity_group()));

    let composite = descriptor(
      "line_items",
      Operation::Upsert,
      json!({"project_id": 3, "code": "A1", "qty": 2}),
    )
    .with_conflict_target("project_id, code");
    assert_eq!(composite.identity.as_deref(), Some("project_id=3,code=A1"));

    // A target column missing from the payload locks the whole collection.
    let partial = descriptor("line_items", Operation::Upsert, json!({"id": 4, "qty": 2}))
      .with_conflict_target("project_id,code");
    assert_eq!(partial.identity, None);
  }

  #[test]
  fn test_group_conflicts() {
    let row = |id: Option<&str>| EntityGroup {
      collection: "projects".to_string(),
      identity: id.map(String::from),
    };

    assert!(row(Some("1")).conflicts_with(&row(Some("1"))));
    assert!(!row(Some("1")).conflicts_with(&row(Some("2"))));
    assert!(row(None).conflicts_with(&row(Some("2"))));
    assert!(row(Some("2")).conflicts_with(&row(None)));

    let other = EntityGroup {
      collection: "profiles".to_string(),
      identity: Some("1".to_string()),
    };
    assert!(!row(Some("1")).conflicts_with(&other));
  }

  #[test]
  fn test_ids_are_unique() {
    assert_ne!(MutationId::new(), MutationId::new());
  }
}
