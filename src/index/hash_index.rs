//! Hash Index for Equality Lookups
//!
//! Sharded value -> entity-id posting lists (DashMap + RoaringTreemap).
//! Keys are the canonical JSON encoding of the indexed value tuple, so
//! composite values compare exactly.

use crate::error::{IndexError, Result};
use crate::types::{EntityId, IndexEntryUpdate, IndexId, UpdateMode};
use dashmap::DashMap;
use roaring::RoaringTreemap;
use serde_json::Value;
use std::hash::BuildHasherDefault;

type SeaBuildHasher = BuildHasherDefault<seahash::SeaHasher>;

/// Equality index over value tuples
pub struct HashIndex {
    index_id: IndexId,
    unique: bool,
    /// value key -> set of entity ids
    index: DashMap<String, RoaringTreemap, SeaBuildHasher>,
    /// Reverse index for removals: entity id -> value key
    reverse: DashMap<EntityId, String, SeaBuildHasher>,
}

impl HashIndex {
    pub fn new(index_id: IndexId, unique: bool) -> Self {
        Self {
            index_id,
            unique,
            index: DashMap::with_hasher(SeaBuildHasher::default()),
            reverse: DashMap::with_hasher(SeaBuildHasher::default()),
        }
    }

    /// Canonical key of a value tuple
    fn value_key(values: &[Value]) -> String {
        Value::Array(values.to_vec()).to_string()
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Index `entity_id` under `values`, replacing any previous entry
    pub fn insert(&self, entity_id: EntityId, values: &[Value]) -> Result<()> {
        let key = Self::value_key(values);
        if self.reverse.get(&entity_id).is_some_and(|k| *k == key) {
            return Ok(());
        }
        if self.unique {
            if let Some(holders) = self.index.get(&key) {
                if let Some(existing) = holders.iter().find(|id| *id != entity_id) {
                    return Err(IndexError::EntryConflict {
                        index: self.index_id,
                        existing,
                        added: entity_id,
                        value: key,
                    });
                }
            }
        }
        self.remove(entity_id);
        self.index.entry(key.clone()).or_default().insert(entity_id);
        self.reverse.insert(entity_id, key);
        Ok(())
    }

    pub fn remove(&self, entity_id: EntityId) {
        if let Some((_, old_key)) = self.reverse.remove(&entity_id) {
            let now_empty = match self.index.get_mut(&old_key) {
                Some(mut ids) => {
                    ids.remove(entity_id);
                    ids.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.index.remove_if(&old_key, |_, ids| ids.is_empty());
            }
        }
    }

    /// Apply one update
    pub fn apply(&self, update: &IndexEntryUpdate) -> Result<()> {
        match update.mode() {
            UpdateMode::Added | UpdateMode::Changed => self.insert(update.entity_id(), update.values()),
            UpdateMode::Removed => {
                self.remove(update.entity_id());
                Ok(())
            }
        }
    }

    pub fn lookup(&self, values: &[Value]) -> Vec<EntityId> {
        self.index
            .get(&Self::value_key(values))
            .map(|ids| ids.iter().collect())
            .unwrap_or_default()
    }

    /// Number of indexed entities
    pub fn count(&self) -> u64 {
        self.reverse.len() as u64
    }

    pub fn unique_values(&self) -> u64 {
        self.index.len() as u64
    }

    pub fn clear(&self) {
        self.index.clear();
        self.reverse.clear();
    }
}
