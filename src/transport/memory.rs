//! In-process backend with relational semantics close enough to the real one for
//! exercising replay, conflict targets and failure handling.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::Transport;
use crate::error::{ErrorKind, TransportError};
use crate::mutation::{MutationDescriptor, MutationId, Operation};

type RemoteFn = Arc<dyn Fn(&Value) -> Result<Value, TransportError> + Send + Sync>;

/// A mutation the backend applied, in application order.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedMutation {
  pub id: MutationId,
  pub collection: String,
  pub operation: Operation,
  pub group: String,
}

#[derive(Default)]
struct Backend {
  tables: HashMap<String, Vec<Map<String, Value>>>,
  functions: HashMap<String, RemoteFn>,
  next_id: i64,
  reachable: bool,
  faults: VecDeque<ErrorKind>,
  drop_acks: usize,
  applied: Vec<AppliedMutation>,
  in_flight: HashMap<String, usize>,
  peak_per_group: usize,
  in_flight_total: usize,
  peak_total: usize,
  sends: usize,
}

/// In-memory [`Transport`] keyed by collection name.
#[derive(Clone)]
pub struct MemoryTransport {
  backend: Arc<Mutex<Backend>>,
  latency: Duration,
  primary_key: String,
}

impl Default for MemoryTransport {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryTransport {
  pub fn new() -> Self {
    Self {
      backend: Arc::new(Mutex::new(Backend {
        next_id: 1,
        reachable: true,
        ..Backend::default()
      })),
      latency: Duration::ZERO,
      primary_key: "id".to_string(),
    }
  }

  /// Delay every send, to make overlap observable.
  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  /// Register a remote function for [`Operation::RemoteCall`].
  pub fn with_function<F>(self, name: &str, f: F) -> Self
  where
    F: Fn(&Value) -> Result<Value, TransportError> + Send + Sync + 'static,
  {
    self.lock().functions.insert(name.to_string(), Arc::new(f));
    self
  }

  /// Seed a table with rows.
  pub fn seed(&self, collection: &str, rows: Vec<Value>) {
    let mut backend = self.lock();
    let table = backend.tables.entry(collection.to_string()).or_default();
    table.extend(rows.into_iter().filter_map(|r| r.as_object().cloned()));
  }

  /// While unreachable every send fails with a network error.
  pub fn set_reachable(&self, reachable: bool) {
    self.lock().reachable = reachable;
  }

  /// Fail the next send with `kind` without touching any table.
  pub fn fail_next(&self, kind: ErrorKind) {
    self.lock().faults.push_back(kind);
  }

  /// Apply the next write but report a network error, as if the acknowledgment was lost.
  pub fn drop_next_ack(&self) {
    self.lock().drop_acks += 1;
  }

  pub fn rows(&self, collection: &str) -> Vec<Value> {
    self
      .lock()
      .tables
      .get(collection)
      .map(|rows| rows.iter().cloned().map(Value::Object).collect())
      .unwrap_or_default()
  }

  pub fn applied(&self) -> Vec<AppliedMutation> {
    self.lock().applied.clone()
  }

  /// Number of send attempts, failed ones included.
  pub fn sends(&self) -> usize {
    self.lock().sends
  }

  /// Highest number of concurrent sends against one entity group.
  pub fn peak_per_group(&self) -> usize {
    self.lock().peak_per_group
  }

  /// Highest number of concurrent sends overall.
  pub fn peak_concurrency(&self) -> usize {
    self.lock().peak_total
  }

  fn lock(&self) -> MutexGuard<'_, Backend> {
    self.backend.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

#[async_trait]
impl Transport for MemoryTransport {
  async fn send(&self, mutation: &MutationDescriptor) -> Result<Value, TransportError> {
    let group = mutation.entity_group().to_string();
    {
      let mut backend = self.lock();
      backend.sends += 1;
      let count = backend.in_flight.entry(group.clone()).or_default();
      *count += 1;
      let count = *count;
      backend.peak_per_group = backend.peak_per_group.max(count);
      backend.in_flight_total += 1;
      backend.peak_total = backend.peak_total.max(backend.in_flight_total);
    }

    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }

    let mut backend = self.lock();
    if let Some(count) = backend.in_flight.get_mut(&group) {
      *count -= 1;
    }
    backend.in_flight_total -= 1;

    if !backend.reachable {
      return Err(TransportError::network("backend unreachable"));
    }
    if let Some(kind) = backend.faults.pop_front() {
      return Err(TransportError::new(kind, "injected failure"));
    }

    let result = backend.apply(mutation, &self.primary_key)?;
    backend.applied.push(AppliedMutation {
      id: mutation.id,
      collection: mutation.collection.clone(),
      operation: mutation.operation,
      group,
    });

    if backend.drop_acks > 0 {
      backend.drop_acks -= 1;
      return Err(TransportError::network("connection reset before acknowledgment"));
    }
    Ok(result)
  }

  async fn ping(&self) -> Result<(), TransportError> {
    if self.lock().reachable {
      Ok(())
    } else {
      Err(TransportError::network("backend unreachable"))
    }
  }
}

impl Backend {
  fn apply(&mut self, m: &MutationDescriptor, pk: &str) -> Result<Value, TransportError> {
    match m.operation {
      Operation::Insert => self.insert(&m.collection, row(&m.variables)?, pk),
      Operation::BulkInsert => {
        let rows = rows(&m.variables)?;
        let table = self.tables.entry(m.collection.clone()).or_default();
        for r in &rows {
          if let Some(id) = r.get(pk) {
            if table.iter().any(|existing| existing.get(pk) == Some(id)) {
              return Err(TransportError::conflict(format!("duplicate {} {}", pk, id)));
            }
          }
        }
        let inserted = rows
          .into_iter()
          .map(|r| self.insert(&m.collection, r, pk))
          .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::Array(inserted))
      }
      Operation::Update => self.update(&m.collection, row(&m.variables)?, pk),
      Operation::BulkUpdate => {
        let updated = rows(&m.variables)?
          .into_iter()
          .map(|r| self.update(&m.collection, r, pk))
          .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::Array(updated))
      }
      Operation::Delete => {
        let target = row(&m.variables)?;
        let id = target
          .get(pk)
          .ok_or_else(|| TransportError::validation(format!("delete requires {}", pk)))?;
        let table = self.tables.entry(m.collection.clone()).or_default();
        let at = table
          .iter()
          .position(|r| r.get(pk) == Some(id))
          .ok_or_else(|| TransportError::not_found(format!("{} {} not found", m.collection, id)))?;
        Ok(Value::Object(table.remove(at)))
      }
      Operation::Upsert => {
        let target: Vec<String> = m
          .conflict_target
          .as_deref()
          .unwrap_or(pk)
          .split(',')
          .map(|c| c.trim().to_string())
          .collect();
        match &m.variables {
          Value::Array(_) => {
            let upserted = rows(&m.variables)?
              .into_iter()
              .map(|r| self.upsert(&m.collection, r, &target, pk))
              .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(upserted))
          }
          _ => self.upsert(&m.collection, row(&m.variables)?, &target, pk),
        }
      }
      Operation::RemoteCall => {
        let f = self.functions.get(&m.collection).cloned().ok_or_else(|| {
          TransportError::not_found(format!("function {} not found", m.collection))
        })?;
        f(&m.variables)
      }
    }
  }

  fn insert(
    &mut self,
    collection: &str,
    mut row: Map<String, Value>,
    pk: &str,
  ) -> Result<Value, TransportError> {
    let table = self.tables.entry(collection.to_string()).or_default();
    match row.get(pk) {
      Some(id) if table.iter().any(|r| r.get(pk) == Some(id)) => {
        return Err(TransportError::conflict(format!("duplicate {} {}", pk, id)));
      }
      Some(_) => {}
      None => {
        row.insert(pk.to_string(), Value::from(self.next_id));
        self.next_id += 1;
      }
    }
    table.push(row.clone());
    Ok(Value::Object(row))
  }

  fn update(
    &mut self,
    collection: &str,
    changes: Map<String, Value>,
    pk: &str,
  ) -> Result<Value, TransportError> {
    let id = changes
      .get(pk)
      .ok_or_else(|| TransportError::validation(format!("update requires {}", pk)))?;
    let table = self.tables.entry(collection.to_string()).or_default();
    let existing = table
      .iter_mut()
      .find(|r| r.get(pk) == Some(id))
      .ok_or_else(|| TransportError::not_found(format!("{} {} not found", collection, id)))?;
    for (k, v) in &changes {
      existing.insert(k.clone(), v.clone());
    }
    Ok(Value::Object(existing.clone()))
  }

  fn upsert(
    &mut self,
    collection: &str,
    row: Map<String, Value>,
    target: &[String],
    pk: &str,
  ) -> Result<Value, TransportError> {
    if target.iter().any(|col| !row.contains_key(col)) {
      return Err(TransportError::validation(format!(
        "upsert row is missing conflict target {}",
        target.join(",")
      )));
    }

    let table = self.tables.entry(collection.to_string()).or_default();
    let existing = table
      .iter_mut()
      .find(|r| target.iter().all(|col| r.get(col) == row.get(col)));

    match existing {
      Some(existing) => {
        for (k, v) in &row {
          existing.insert(k.clone(), v.clone());
        }
        Ok(Value::Object(existing.clone()))
      }
      None => self.insert(collection, row, pk),
    }
  }
}

fn row(variables: &Value) -> Result<Map<String, Value>, TransportError> {
  variables
    .as_object()
    .cloned()
    .ok_or_else(|| TransportError::validation("expected a single row object"))
}

fn rows(variables: &Value) -> Result<Vec<Map<String, Value>>, TransportError> {
  let list = variables
    .as_array()
    .ok_or_else(|| TransportError::validation("expected an array of rows"))?;
  list.iter().map(row).collect()
}
