//! Index registry
//!
//! `IndexMap` is an immutable snapshot: proxies by id plus lookups by
//! (entity type, token) and (entity type, property key). All mutation goes
//! through `IndexMapReference::modify`, which edits a private copy and
//! publishes it in one swap. Readers hold an `Arc<IndexMap>` and never see
//! a half-built map.
//!
//! `IndexUpdaterMap` is the per-transaction side: one lazily created
//! updater per touched index, all closed together.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ahash::AHashMap;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::warn;

use crate::error::{IndexError, Result};
use crate::index::IndexUpdater;
use crate::proxy::IndexProxy;
use crate::types::{EntityType, IndexId, IndexUpdateMode, PropertyKeyId, SchemaDescriptor, TokenId};

#[derive(Clone, Default)]
pub struct IndexMap {
    by_id: BTreeMap<IndexId, Arc<dyn IndexProxy>>,
    by_token: AHashMap<(EntityType, TokenId), BTreeSet<IndexId>>,
    by_property: AHashMap<(EntityType, PropertyKeyId), BTreeSet<IndexId>>,
}

impl IndexMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index_id: IndexId) -> Option<Arc<dyn IndexProxy>> {
        self.by_id.get(&index_id).cloned()
    }

    pub fn contains(&self, index_id: IndexId) -> bool {
        self.by_id.contains_key(&index_id)
    }

    /// Register (or replace) the proxy of an index
    pub fn put(&mut self, proxy: Arc<dyn IndexProxy>) {
        let id = proxy.descriptor().id();
        self.by_id.insert(id, proxy);
        self.rebuild_lookups();
    }

    pub fn remove(&mut self, index_id: IndexId) -> Option<Arc<dyn IndexProxy>> {
        let removed = self.by_id.remove(&index_id);
        if removed.is_some() {
            self.rebuild_lookups();
        }
        removed
    }

    fn rebuild_lookups(&mut self) {
        self.by_token.clear();
        self.by_property.clear();
        for (id, proxy) in &self.by_id {
            let descriptor = proxy.descriptor();
            let schema = descriptor.schema();
            for token in schema.entity_tokens() {
                self.by_token.entry((schema.entity_type(), *token)).or_default().insert(*id);
            }
            for key in schema.property_keys() {
                self.by_property.entry((schema.entity_type(), *key)).or_default().insert(*id);
            }
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = IndexId> + '_ {
        self.by_id.keys().copied()
    }

    pub fn proxies(&self) -> impl Iterator<Item = &Arc<dyn IndexProxy>> + '_ {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Indexes on `token`, as known by the token lookup
    pub fn indexes_by_token(&self, entity_type: EntityType, token: TokenId) -> Vec<IndexId> {
        self.by_token
            .get(&(entity_type, token))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Indexes on `key`, as known by the property lookup
    pub fn indexes_by_property(&self, entity_type: EntityType, key: PropertyKeyId) -> Vec<IndexId> {
        self.by_property
            .get(&(entity_type, key))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Indexes affected by a change to one entity, each returned once.
    ///
    /// - token added/removed, complete property list: indexes on that token
    ///   whose every key is among `property_keys`
    /// - token added/removed, partial property list: every index on that
    ///   token (the missing values get loaded by the caller)
    /// - unchanged tokens: indexes on them sharing any key with `property_keys`
    pub fn related_indexes(
        &self,
        changed_tokens: &[TokenId],
        unchanged_tokens: &[TokenId],
        property_keys: &[PropertyKeyId],
        property_list_is_complete: bool,
        entity_type: EntityType,
    ) -> Vec<Arc<dyn IndexProxy>> {
        let mut related = BTreeSet::new();
        for token in changed_tokens {
            for id in self.by_token.get(&(entity_type, *token)).into_iter().flatten() {
                let covered = !property_list_is_complete
                    || self.schema_of(*id).is_some_and(|schema| {
                        schema.property_keys().iter().all(|k| property_keys.contains(k))
                    });
                if covered {
                    related.insert(*id);
                }
            }
        }
        if !unchanged_tokens.is_empty() {
            for key in property_keys {
                for id in self.by_property.get(&(entity_type, *key)).into_iter().flatten() {
                    let on_token = self.schema_of(*id).is_some_and(|schema| {
                        schema.entity_tokens().iter().any(|t| unchanged_tokens.contains(t))
                    });
                    if on_token {
                        related.insert(*id);
                    }
                }
            }
        }
        related.into_iter().filter_map(|id| self.get(id)).collect()
    }

    fn schema_of(&self, index_id: IndexId) -> Option<SchemaDescriptor> {
        self.by_id.get(&index_id).map(|p| p.descriptor().schema().clone())
    }
}

/// Shared, atomically replaced `IndexMap`
pub struct IndexMapReference {
    current: ArcSwap<IndexMap>,
    writer: Mutex<()>,
}

impl IndexMapReference {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(IndexMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Consistent view of every index
    pub fn snapshot(&self) -> Arc<IndexMap> {
        self.current.load_full()
    }

    /// Apply `f` to a copy of the map and publish the result.
    /// Writers are serialized; readers are never blocked.
    pub fn modify<R>(&self, f: impl FnOnce(&mut IndexMap) -> R) -> R {
        let _writer = self.writer.lock();
        let mut copy = IndexMap::clone(&self.current.load());
        let result = f(&mut copy);
        self.current.store(Arc::new(copy));
        result
    }

    pub fn get_index_proxy(&self, index_id: IndexId) -> Result<Arc<dyn IndexProxy>> {
        self.current.load().get(index_id).ok_or(IndexError::IndexNotFound(index_id))
    }
}

impl Default for IndexMapReference {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-transaction updaters, created on first use and closed once
pub struct IndexUpdaterMap {
    index_map: Arc<IndexMap>,
    mode: IndexUpdateMode,
    updaters: BTreeMap<IndexId, Box<dyn IndexUpdater>>,
}

impl IndexUpdaterMap {
    pub fn new(index_map: Arc<IndexMap>, mode: IndexUpdateMode) -> Self {
        Self {
            index_map,
            mode,
            updaters: BTreeMap::new(),
        }
    }

    /// Updater for `index_id`, or `None` if the index isn't in the map
    pub fn get_updater(&mut self, index_id: IndexId) -> Result<Option<&mut Box<dyn IndexUpdater>>> {
        if !self.updaters.contains_key(&index_id) {
            let Some(proxy) = self.index_map.get(index_id) else {
                return Ok(None);
            };
            let updater = proxy.new_updater(self.mode)?;
            self.updaters.insert(index_id, updater);
        }
        Ok(self.updaters.get_mut(&index_id))
    }

    pub fn len(&self) -> usize {
        self.updaters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updaters.is_empty()
    }

    /// Close every updater; all are closed even if some fail, the first
    /// error is returned
    pub fn close(&mut self) -> Result<()> {
        let mut first_error = None;
        for (id, mut updater) in std::mem::take(&mut self.updaters) {
            if let Err(e) = updater.close() {
                warn!(index_id = id, error = %e, "failed to close index updater");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for IndexUpdaterMap {
    fn drop(&mut self) {
        if !self.updaters.is_empty() {
            if let Err(e) = self.close() {
                warn!(error = %e, "failed to close index updaters on drop");
            }
        }
    }
}
