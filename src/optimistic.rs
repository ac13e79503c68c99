//! Optimistic patches: reversible cache edits applied before the backend answers.
//!
//! Every patched key carries an ordered stack of patches over its last committed value.
//! The visible value is always `committed` with every remaining patch's updater replayed
//! on top, in submission order. Rolling back one patch removes only that patch and
//! replays the rest, so an older failure never clobbers a newer pending edit.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::QueryKey;
use crate::mask::FieldMask;
use crate::mutation::{MutationDescriptor, MutationId};

/// Computes the provisional value of a key from its current value and the mutation.
pub type Updater = Arc<dyn Fn(Option<&Value>, &MutationDescriptor) -> Value + Send + Sync>;

/// Wrap a closure as an [`Updater`].
pub fn updater<F>(f: F) -> Updater
where
  F: Fn(Option<&Value>, &MutationDescriptor) -> Value + Send + Sync + 'static,
{
  Arc::new(f)
}

/// A reversible edit record.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticPatch {
  pub mutation_id: MutationId,
  pub query_key: QueryKey,
  pub previous_value: Option<Value>,
  pub applied_value: Value,
}

struct PatchRecord {
  patch: OptimisticPatch,
  mutation: Arc<MutationDescriptor>,
  updater: Updater,
  /// Backend accepted the mutation but returned nothing to replace the patch with
  confirmed: bool,
}

struct KeyStack {
  committed: Option<Value>,
  records: Vec<PatchRecord>,
}

impl KeyStack {
  fn visible(&self) -> Option<Value> {
    self
      .records
      .last()
      .map(|r| r.patch.applied_value.clone())
      .or_else(|| self.committed.clone())
  }

  fn has_pending(&self) -> bool {
    self.records.iter().any(|r| !r.confirmed)
  }

  fn replay(&mut self, mask: &FieldMask, key: &QueryKey) {
    let collection = key.collection().unwrap_or_default();
    let mut current = self.committed.clone();
    for record in &mut self.records {
      let applied = mask.mask(collection, &(record.updater)(current.as_ref(), &record.mutation));
      record.patch.previous_value = current;
      record.patch.applied_value = applied.clone();
      current = Some(applied);
    }
  }

  /// Confirmed patches at the bottom of the stack become part of the committed value.
  fn fold_confirmed(&mut self) {
    while self.records.first().is_some_and(|r| r.confirmed) {
      let record = self.records.remove(0);
      self.committed = Some(record.patch.applied_value);
    }
  }
}

/// Visible state of a key after the patch book changed it.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
  pub key: QueryKey,
  pub value: Option<Value>,
  /// Unconfirmed patches remain on the key
  pub optimistic: bool,
}

/// Per-key patch stacks, indexed by mutation for commit and rollback.
pub struct PatchBook {
  stacks: HashMap<QueryKey, KeyStack>,
  by_mutation: HashMap<MutationId, Vec<QueryKey>>,
  mask: Arc<FieldMask>,
}

impl PatchBook {
  pub fn new(mask: Arc<FieldMask>) -> Self {
    Self {
      stacks: HashMap::new(),
      by_mutation: HashMap::new(),
      mask,
    }
  }

  /// Patch every affected key of `mutation`. `current` supplies the committed value of
  /// keys that have no stack yet.
  pub fn apply<F>(
    &mut self,
    mutation: &Arc<MutationDescriptor>,
    updater: &Updater,
    current: F,
  ) -> Vec<Reconciled>
  where
    F: Fn(&QueryKey) -> Option<Value>,
  {
    let mut out = Vec::with_capacity(mutation.affected_keys.len());

    for key in &mutation.affected_keys {
      let stack = self.stacks.entry(key.clone()).or_insert_with(|| KeyStack {
        committed: current(key),
        records: Vec::new(),
      });

      let previous = stack.visible();
      let applied = self.mask.mask(
        key.collection().unwrap_or_default(),
        &updater(previous.as_ref(), mutation),
      );

      stack.records.push(PatchRecord {
        patch: OptimisticPatch {
          mutation_id: mutation.id,
          query_key: key.clone(),
          previous_value: previous,
          applied_value: applied.clone(),
        },
        mutation: Arc::clone(mutation),
        updater: Arc::clone(updater),
        confirmed: false,
      });

      out.push(Reconciled {
        key: key.clone(),
        value: Some(applied),
        optimistic: true,
      });
    }

    if !out.is_empty() {
      self
        .by_mutation
        .insert(mutation.id, out.iter().map(|r| r.key.clone()).collect());
    }
    out
  }

  /// Resolve a mutation's patches successfully. With a server result, that result becomes
  /// the committed value of every patched key; without one, the optimistic value is kept.
  pub fn commit(&mut self, id: MutationId, server_result: Option<&Value>) -> Vec<Reconciled> {
    let Some(keys) = self.by_mutation.remove(&id) else {
      return Vec::new();
    };

    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
      let Some(stack) = self.stacks.get_mut(&key) else {
        continue;
      };

      match server_result {
        Some(result) => {
          stack.records.retain(|r| r.patch.mutation_id != id);
          stack.committed = Some(self.mask.mask(key.collection().unwrap_or_default(), result));
          stack.replay(&self.mask, &key);
        }
        None => {
          for record in stack.records.iter_mut() {
            if record.patch.mutation_id == id {
              record.confirmed = true;
            }
          }
        }
      }
      stack.fold_confirmed();
      out.push(self.settle(key));
    }
    out
  }

  /// Undo a mutation's patches, re-deriving each key from what remains.
  pub fn rollback(&mut self, id: MutationId) -> Vec<Reconciled> {
    let Some(keys) = self.by_mutation.remove(&id) else {
      return Vec::new();
    };

    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
      let Some(stack) = self.stacks.get_mut(&key) else {
        continue;
      };
      stack.records.retain(|r| r.patch.mutation_id != id);
      stack.replay(&self.mask, &key);
      stack.fold_confirmed();
      out.push(self.settle(key));
    }
    out
  }

  /// A real fetch landed on a patched key: it becomes the committed value and pending
  /// patches are replayed on top of it. Returns `None` when the key has no patches.
  pub fn rebase(&mut self, key: &QueryKey, fetched: Value) -> Option<Reconciled> {
    let stack = self.stacks.get_mut(key)?;
    stack.committed = Some(fetched);
    // The fetch already reflects everything the backend confirmed.
    stack.records.retain(|r| !r.confirmed);
    stack.replay(&self.mask, key);
    Some(self.settle(key.clone()))
  }

  pub fn is_patched(&self, key: &QueryKey) -> bool {
    self.stacks.contains_key(key)
  }

  pub fn contains(&self, id: MutationId) -> bool {
    self.by_mutation.contains_key(&id)
  }

  /// Patches currently stacked on `key`, oldest first.
  pub fn patches(&self, key: &QueryKey) -> Vec<OptimisticPatch> {
    self
      .stacks
      .get(key)
      .map(|s| s.records.iter().map(|r| r.patch.clone()).collect())
      .unwrap_or_default()
  }

  pub fn clear(&mut self) {
    self.stacks.clear();
    self.by_mutation.clear();
  }

  fn settle(&mut self, key: QueryKey) -> Reconciled {
    let (value, optimistic, empty) = match self.stacks.get(&key) {
      Some(stack) => (stack.visible(), stack.has_pending(), stack.records.is_empty()),
      None => (None, false, true),
    };
    if empty {
      self.stacks.remove(&key);
    }
    Reconciled {
      key,
      value,
      optimistic,
    }
  }
}
