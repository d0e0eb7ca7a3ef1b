//! Fixed mapping from entity family to its store and fetcher.

use std::collections::HashMap;
use std::sync::Arc;

use super::storage::CacheStore;
use super::traits::{CacheKind, EntityFetcher, ProjectLister};
use crate::error::{Error, Result};

struct Slot {
  store: CacheStore,
  fetcher: Arc<dyn EntityFetcher>,
}

/// Every [`CacheKind`] has exactly one store and one fetcher. The shape is
/// fixed at construction; only the stores' contents change afterwards.
pub struct CacheRegistry {
  slots: Vec<Slot>,
  lister: Arc<dyn ProjectLister>,
}

impl CacheRegistry {
  pub fn new(
    lister: Arc<dyn ProjectLister>,
    mut fetchers: HashMap<CacheKind, Arc<dyn EntityFetcher>>,
  ) -> Result<Self> {
    let mut slots = Vec::with_capacity(CacheKind::ALL.len());
    for kind in CacheKind::ALL {
      let fetcher = fetchers
        .remove(&kind)
        .ok_or_else(|| Error::Registry(format!("no fetcher for {}", kind)))?;
      slots.push(Slot {
        store: CacheStore::new(kind),
        fetcher,
      });
    }
    Ok(Self { slots, lister })
  }

  // Slots are laid out in `CacheKind::ALL` order.
  fn slot(&self, kind: CacheKind) -> &Slot {
    &self.slots[kind as usize]
  }

  pub fn store(&self, kind: CacheKind) -> &CacheStore {
    &self.slot(kind).store
  }

  pub fn fetcher(&self, kind: CacheKind) -> &Arc<dyn EntityFetcher> {
    &self.slot(kind).fetcher
  }

  pub fn lister(&self) -> &Arc<dyn ProjectLister> {
    &self.lister
  }

  pub fn stores(&self) -> impl Iterator<Item = &CacheStore> {
    self.slots.iter().map(|s| &s.store)
  }
}
