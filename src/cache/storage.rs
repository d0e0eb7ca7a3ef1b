//! Keyed in-memory container for one entity family.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::traits::{CacheKind, ProjectId};

/// Last successfully fetched payload per project for a single [`CacheKind`].
///
/// Each store carries its own lock so that writes to one entity family never
/// block readers of another. Guards are never held across an await point.
#[derive(Debug)]
pub struct CacheStore {
  kind: CacheKind,
  entries: RwLock<HashMap<ProjectId, Value>>,
}

impl CacheStore {
  pub fn new(kind: CacheKind) -> Self {
    Self {
      kind,
      entries: RwLock::new(HashMap::new()),
    }
  }

  pub fn kind(&self) -> CacheKind {
    self.kind
  }

  // Poisoning is ignored: every mutation is a single insert or remove.
  fn read(&self) -> RwLockReadGuard<'_, HashMap<ProjectId, Value>> {
    self.entries.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn write(&self) -> RwLockWriteGuard<'_, HashMap<ProjectId, Value>> {
    self.entries.write().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn get(&self, id: &ProjectId) -> Option<Value> {
    self.read().get(id).cloned()
  }

  #[cfg(test)]
  pub fn contains(&self, id: &ProjectId) -> bool {
    self.read().contains_key(id)
  }

  /// Insert or overwrite; returns the previous payload.
  pub fn insert(&self, id: ProjectId, payload: Value) -> Option<Value> {
    self.write().insert(id, payload)
  }

  /// Remove an entry. Removing an absent entry is a no-op.
  pub fn remove(&self, id: &ProjectId) -> Option<Value> {
    self.write().remove(id)
  }

  pub fn len(&self) -> usize {
    self.read().len()
  }

  #[allow(dead_code)]
  pub fn is_empty(&self) -> bool {
    self.read().is_empty()
  }

  /// Project ids currently held, sorted.
  #[cfg(test)]
  pub fn ids(&self) -> Vec<ProjectId> {
    let mut ids: Vec<ProjectId> = self.read().keys().cloned().collect();
    ids.sort();
    ids
  }

  /// Point-in-time copy of every entry, sorted by project id.
  pub fn snapshot(&self) -> Vec<(ProjectId, Value)> {
    let mut entries: Vec<(ProjectId, Value)> = self
      .read()
      .iter()
      .map(|(id, value)| (id.clone(), value.clone()))
      .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::Arc;

  #[test]
  fn test_insert_overwrites_single_entry() {
    let store = CacheStore::new(CacheKind::Commit);
    assert!(store.insert("1".into(), json!(["a"])).is_none());
    assert_eq!(store.insert("1".into(), json!(["b"])), Some(json!(["a"])));
    assert_eq!(store.len(), 1);
    assert_eq!(store.get(&"1".into()), Some(json!(["b"])));
  }

  #[test]
  fn test_remove_absent_is_noop() {
    let store = CacheStore::new(CacheKind::Tree);
    assert!(store.remove(&"9".into()).is_none());
    store.insert("9".into(), json!([]));
    assert!(store.remove(&"9".into()).is_some());
    assert!(store.remove(&"9".into()).is_none());
    assert!(store.is_empty());
  }

  #[test]
  fn test_snapshot_is_sorted() {
    let store = CacheStore::new(CacheKind::Project);
    store.insert("b".into(), json!(2));
    store.insert("a".into(), json!(1));
    let snap = store.snapshot();
    assert_eq!(snap[0], ("a".into(), json!(1)));
    assert_eq!(snap[1], ("b".into(), json!(2)));
    assert_eq!(store.ids(), vec![ProjectId::from("a"), ProjectId::from("b")]);
  }

  #[test]
  fn test_concurrent_writers_keep_one_entry_per_key() {
    let store = Arc::new(CacheStore::new(CacheKind::Branch));
    let handles: Vec<_> = (0..8)
      .map(|n| {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
          for i in 0..100u64 {
            store.insert(ProjectId::from(i % 10), json!(n));
          }
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }
    assert_eq!(store.len(), 10);
  }
}
