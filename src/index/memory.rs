//! In-memory index provider
//!
//! Every index is a `HashIndex`. Provider-level maps stand in for the
//! persisted index state (online / populating / failed + failure text), so a
//! service built on top can recover indexes the way it would from disk.

use super::{HashIndex, IndexAccessor, IndexPopulator, IndexProvider, IndexReader, IndexUpdater};
use crate::error::{IndexError, Result};
use crate::store::PropertyAccessor;
use crate::types::{
    EntityId, IndexDescriptor, IndexEntryUpdate, IndexId, IndexSample, IndexState, IndexUpdateMode,
    ProviderDescriptor, UpdateMode,
};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct ProviderState {
    indexes: DashMap<IndexId, Arc<HashIndex>>,
    states: DashMap<IndexId, IndexState>,
    failures: DashMap<IndexId, String>,
}

impl ProviderState {
    fn index_for(&self, descriptor: &IndexDescriptor) -> Arc<HashIndex> {
        Arc::clone(
            self.indexes
                .entry(descriptor.id())
                .or_insert_with(|| Arc::new(HashIndex::new(descriptor.id(), descriptor.is_unique())))
                .value(),
        )
    }

    fn forget(&self, index_id: IndexId) {
        if let Some((_, index)) = self.indexes.remove(&index_id) {
            index.clear();
        }
        self.states.remove(&index_id);
        self.failures.remove(&index_id);
    }
}

/// In-process index engine
#[derive(Clone)]
pub struct MemoryIndexProvider {
    descriptor: ProviderDescriptor,
    state: Arc<ProviderState>,
}

impl MemoryIndexProvider {
    pub fn new() -> Self {
        Self {
            descriptor: ProviderDescriptor::new("memory-hash", "1.0"),
            state: Arc::new(ProviderState::default()),
        }
    }

    /// Persisted state of an index, `None` if the provider never saw it
    pub fn stored_state(&self, index_id: IndexId) -> Option<IndexState> {
        self.state.states.get(&index_id).map(|s| *s)
    }

    /// Direct lookup, independent of any proxy
    pub fn lookup(&self, index_id: IndexId, values: &[Value]) -> Vec<EntityId> {
        self.state.indexes.get(&index_id).map(|i| i.lookup(values)).unwrap_or_default()
    }
}

impl Default for MemoryIndexProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexProvider for MemoryIndexProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn populator(&self, descriptor: &IndexDescriptor) -> Result<Arc<dyn IndexPopulator>> {
        Ok(Arc::new(MemoryIndexPopulator {
            descriptor: descriptor.clone(),
            state: Arc::clone(&self.state),
            sampled: AtomicU64::new(0),
        }))
    }

    fn online_accessor(&self, descriptor: &IndexDescriptor) -> Result<Arc<dyn IndexAccessor>> {
        Ok(Arc::new(MemoryIndexAccessor {
            descriptor: descriptor.clone(),
            index: self.state.index_for(descriptor),
            state: Arc::clone(&self.state),
        }))
    }

    fn initial_state(&self, descriptor: &IndexDescriptor) -> IndexState {
        self.stored_state(descriptor.id()).unwrap_or(IndexState::Populating)
    }

    fn population_failure(&self, descriptor: &IndexDescriptor) -> Option<String> {
        self.state.failures.get(&descriptor.id()).map(|f| f.clone())
    }
}

pub struct MemoryIndexPopulator {
    descriptor: IndexDescriptor,
    state: Arc<ProviderState>,
    sampled: AtomicU64,
}

impl MemoryIndexPopulator {
    fn index(&self) -> Arc<HashIndex> {
        self.state.index_for(&self.descriptor)
    }
}

impl IndexPopulator for MemoryIndexPopulator {
    fn create(&self) -> Result<()> {
        let id = self.descriptor.id();
        self.index().clear();
        self.state.states.insert(id, IndexState::Populating);
        self.state.failures.remove(&id);
        self.sampled.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn drop_index(&self) -> Result<()> {
        self.state.forget(self.descriptor.id());
        Ok(())
    }

    fn add(&self, updates: Vec<IndexEntryUpdate>) -> Result<()> {
        let index = self.index();
        for update in &updates {
            index.apply(update)?;
        }
        Ok(())
    }

    fn new_populating_updater(&self, _accessor: Arc<dyn PropertyAccessor>) -> Result<Box<dyn IndexUpdater>> {
        Ok(Box::new(MemoryIndexUpdater {
            index: self.index(),
            mode: IndexUpdateMode::Online,
            closed: false,
        }))
    }

    fn include_sample(&self, _update: &IndexEntryUpdate) {
        self.sampled.fetch_add(1, Ordering::Relaxed);
    }

    fn sample_result(&self) -> Result<IndexSample> {
        let index = self.index();
        Ok(IndexSample::new(index.count(), index.unique_values(), self.sampled.load(Ordering::Relaxed)))
    }

    fn mark_as_failed(&self, failure: &str) -> Result<()> {
        let id = self.descriptor.id();
        self.state.failures.insert(id, failure.to_string());
        self.state.states.insert(id, IndexState::Failed);
        Ok(())
    }

    fn close(&self, populated: bool) -> Result<()> {
        if populated {
            self.state.states.insert(self.descriptor.id(), IndexState::Online);
        }
        debug!(index = self.descriptor.name(), populated, "memory populator closed");
        Ok(())
    }
}

pub struct MemoryIndexAccessor {
    descriptor: IndexDescriptor,
    index: Arc<HashIndex>,
    state: Arc<ProviderState>,
}

impl IndexAccessor for MemoryIndexAccessor {
    fn new_updater(&self, mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater>> {
        Ok(Box::new(MemoryIndexUpdater {
            index: Arc::clone(&self.index),
            mode,
            closed: false,
        }))
    }

    fn new_reader(&self) -> Result<Box<dyn IndexReader>> {
        Ok(Box::new(MemoryIndexReader {
            index: Arc::clone(&self.index),
        }))
    }

    fn drop_index(&self) -> Result<()> {
        self.state.forget(self.descriptor.id());
        Ok(())
    }

    fn force(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryIndexUpdater {
    index: Arc<HashIndex>,
    mode: IndexUpdateMode,
    closed: bool,
}

impl IndexUpdater for MemoryIndexUpdater {
    fn process(&mut self, update: IndexEntryUpdate) -> Result<()> {
        if self.closed {
            return Err(IndexError::illegal_state("updater is closed"));
        }
        match (self.index.apply(&update), self.mode) {
            // Replayed changes may collide with entries that are removed later in the log
            (Err(IndexError::EntryConflict { .. }), IndexUpdateMode::Recovery) => {
                if update.mode() != UpdateMode::Removed {
                    self.index.remove(update.entity_id());
                }
                Ok(())
            }
            (result, _) => result,
        }
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

struct MemoryIndexReader {
    index: Arc<HashIndex>,
}

impl IndexReader for MemoryIndexReader {
    fn lookup(&self, values: &[Value]) -> Vec<EntityId> {
        self.index.lookup(values)
    }

    fn size(&self) -> u64 {
        self.index.count()
    }
}
