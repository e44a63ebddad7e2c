//! Store View Module
//!
//! The indexing core never reads node/relationship records directly. It asks
//! an `IndexStoreView` for a `StoreScan` over existing entities and for a
//! `PropertyAccessor` to load property values on demand.
//!
//! # Scan contract
//! - Entities are visited in ascending id order, in chunks
//! - After every chunk the scan asks its `ExternalUpdatesCheck` whether
//!   queued concurrent updates must be applied, passing the id of the last
//!   entity it has passed (the scan cursor)
//! - `stop()` may be called from any thread and makes `run()` return early

mod memory;

pub use memory::{EntityRecord, MemoryPropertyAccessor, MemoryStoreView};

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::index::IndexUpdater;
use crate::types::{
    EntityId, EntityType, EntityUpdates, IndexEntryUpdate, IndexId, IndexSample, PopulationProgress,
    PropertyKeyId, TokenId,
};

/// Which property keys a scan should report
pub type PropertyKeyFilter = Arc<dyn Fn(PropertyKeyId) -> bool + Send + Sync>;

/// Loads property values of committed entities
pub trait PropertyAccessor: Send + Sync {
    fn property_value(&self, entity_id: EntityId, property_key: PropertyKeyId) -> Result<Option<Value>>;
}

/// Receives chunks of scanned entities
pub trait EntityUpdatesVisitor: Send {
    /// Visit one chunk. Returning `Ok(true)` stops the scan.
    fn visit(&mut self, updates: &[EntityUpdates]) -> Result<bool>;
}

impl<F> EntityUpdatesVisitor for F
where
    F: FnMut(&[EntityUpdates]) -> Result<bool> + Send,
{
    fn visit(&mut self, updates: &[EntityUpdates]) -> Result<bool> {
        self(updates)
    }
}

/// Receives the token set of every scanned entity (token index population)
pub trait TokenUpdateVisitor: Send {
    fn visit(&mut self, entity_id: EntityId, tokens: &[TokenId]) -> Result<()>;
}

/// Hook through which a running scan folds in concurrent updates
pub trait ExternalUpdatesCheck: Sync {
    fn need_to_apply_external_updates(&self) -> bool;

    /// Apply queued updates for entities up to and including `current_entity_id`
    fn apply_external_updates(&self, current_entity_id: EntityId) -> Result<()>;
}

/// Check used when nothing is queued alongside a scan
pub struct NoExternalUpdates;

impl ExternalUpdatesCheck for NoExternalUpdates {
    fn need_to_apply_external_updates(&self) -> bool {
        false
    }

    fn apply_external_updates(&self, _current_entity_id: EntityId) -> Result<()> {
        Ok(())
    }
}

/// A running (or runnable) full pass over the entity store
pub trait StoreScan: Send + Sync {
    /// Blocking. Drives the visitor until the store is exhausted or the scan is stopped.
    fn run(&self, check: &dyn ExternalUpdatesCheck) -> Result<()>;

    fn stop(&self);

    fn progress(&self) -> PopulationProgress;

    /// Route a queued concurrent update. Entities at or before the cursor
    /// have already been visited, so the update must be applied here;
    /// entities after it will be read in their new state by the scan.
    fn accept_update(
        &self,
        updater: &mut dyn IndexUpdater,
        update: IndexEntryUpdate,
        current_entity_id: EntityId,
    ) -> Result<()> {
        if update.entity_id() <= current_entity_id {
            updater.process(update)?;
        }
        Ok(())
    }
}

/// View of the entity store used to populate indexes
pub trait IndexStoreView: Send + Sync {
    /// Create a scan over entities of `entity_type` carrying any of
    /// `entity_token_filter` (all entities when `force_full_scan`).
    fn visit_entities(
        &self,
        entity_type: EntityType,
        entity_token_filter: &[TokenId],
        property_filter: PropertyKeyFilter,
        visitor: Box<dyn EntityUpdatesVisitor>,
        token_visitor: Option<Box<dyn TokenUpdateVisitor>>,
        force_full_scan: bool,
    ) -> Box<dyn StoreScan>;

    fn new_property_accessor(&self, entity_type: EntityType) -> Arc<dyn PropertyAccessor>;

    /// Overwrite the persisted statistics of an index
    fn replace_index_counts(&self, index_id: IndexId, unique_values: u64, size: u64, updates: u64);

    fn index_counts(&self, index_id: IndexId) -> Option<IndexSample>;
}
