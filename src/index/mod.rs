//! Index Engine Capabilities
//!
//! The population core talks to index engines only through these traits:
//! - `IndexPopulator`: write side used while an index is being built
//! - `IndexAccessor`: read/write side of an online index
//! - `IndexUpdater`: applies `IndexEntryUpdate`s, closed exactly once
//! - `IndexProvider`: opens populators/accessors and reports persisted state
//!
//! `MemoryIndexProvider` is the in-process engine (sharded value -> entity
//! id posting lists).

mod hash_index;
mod memory;

pub use hash_index::HashIndex;
pub use memory::{MemoryIndexAccessor, MemoryIndexPopulator, MemoryIndexProvider};

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::store::PropertyAccessor;
use crate::types::{
    EntityId, IndexDescriptor, IndexEntryUpdate, IndexSample, IndexState, IndexUpdateMode, PopulationProgress,
    ProviderDescriptor,
};

/// Applies index updates. Must be closed once after use.
pub trait IndexUpdater: Send {
    fn process(&mut self, update: IndexEntryUpdate) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Query side of an online index
pub trait IndexReader: Send {
    /// Entities whose indexed values equal `values`
    fn lookup(&self, values: &[Value]) -> Vec<EntityId>;

    /// Number of indexed entities
    fn size(&self) -> u64;
}

/// Write side of an index under construction
pub trait IndexPopulator: Send + Sync {
    /// Create the (empty) index structures
    fn create(&self) -> Result<()>;

    fn drop_index(&self) -> Result<()>;

    /// Add a batch of entries produced by the store scan
    fn add(&self, updates: Vec<IndexEntryUpdate>) -> Result<()>;

    /// Updater for concurrent changes that raced the store scan
    fn new_populating_updater(&self, accessor: Arc<dyn PropertyAccessor>) -> Result<Box<dyn IndexUpdater>>;

    /// Feed one entry to the sampler
    fn include_sample(&self, _update: &IndexEntryUpdate) {}

    /// Called once the store scan is done, before the flip
    fn scan_completed(&self) -> Result<()> {
        Ok(())
    }

    fn verify_deferred_constraints(&self, _accessor: &dyn PropertyAccessor) -> Result<()> {
        Ok(())
    }

    fn sample_result(&self) -> Result<IndexSample>;

    /// Persist a failure description for this index
    fn mark_as_failed(&self, failure: &str) -> Result<()>;

    /// Terminal call. `populated` marks the index as completely built.
    fn close(&self, populated: bool) -> Result<()>;

    fn progress(&self, scan_progress: PopulationProgress) -> PopulationProgress {
        scan_progress
    }
}

/// Read/write side of an online index
pub trait IndexAccessor: Send + Sync {
    fn new_updater(&self, mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater>>;

    fn new_reader(&self) -> Result<Box<dyn IndexReader>>;

    fn drop_index(&self) -> Result<()>;

    fn force(&self) -> Result<()>;

    fn refresh(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()>;

    fn verify_deferred_constraints(&self, _accessor: &dyn PropertyAccessor) -> Result<()> {
        Ok(())
    }
}

/// Factory for populators and accessors of one provider
pub trait IndexProvider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    fn populator(&self, descriptor: &IndexDescriptor) -> Result<Arc<dyn IndexPopulator>>;

    fn online_accessor(&self, descriptor: &IndexDescriptor) -> Result<Arc<dyn IndexAccessor>>;

    /// State persisted for this index by an earlier run
    fn initial_state(&self, descriptor: &IndexDescriptor) -> IndexState;

    /// Failure description persisted through `IndexPopulator::mark_as_failed`
    fn population_failure(&self, descriptor: &IndexDescriptor) -> Option<String>;
}

/// Updater that ignores everything (failed indexes)
pub struct SwallowingIndexUpdater;

impl IndexUpdater for SwallowingIndexUpdater {
    fn process(&mut self, _update: IndexEntryUpdate) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
