//! In-memory entity store
//!
//! Nodes and relationships keyed by id in ordered maps, so scans naturally
//! walk ascending ids. Writers get back the `EntityUpdates` describing their
//! change, which is what transactions feed to the indexing service.

use super::{
    EntityUpdatesVisitor, ExternalUpdatesCheck, IndexStoreView, PropertyAccessor, PropertyKeyFilter, StoreScan,
    TokenUpdateVisitor,
};
use crate::error::Result;
use crate::types::{
    EntityId, EntityType, EntityUpdates, IndexId, IndexSample, PopulationProgress, PropertyKeyId, TokenId, TokenSet,
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

type Records = Arc<RwLock<BTreeMap<EntityId, EntityRecord>>>;

/// Committed state of one entity
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntityRecord {
    pub tokens: TokenSet,
    pub properties: BTreeMap<PropertyKeyId, Value>,
}

pub struct MemoryStoreView {
    nodes: Records,
    relationships: Records,
    /// index_id -> persisted statistics
    counts: DashMap<IndexId, IndexSample>,
    /// Entities examined per scan chunk
    scan_chunk_size: usize,
}

impl MemoryStoreView {
    pub fn new() -> Self {
        Self::with_chunk_size(1_000)
    }

    pub fn with_chunk_size(scan_chunk_size: usize) -> Self {
        Self {
            nodes: Arc::new(RwLock::new(BTreeMap::new())),
            relationships: Arc::new(RwLock::new(BTreeMap::new())),
            counts: DashMap::new(),
            scan_chunk_size: scan_chunk_size.max(1),
        }
    }

    fn records(&self, entity_type: EntityType) -> &Records {
        match entity_type {
            EntityType::Node => &self.nodes,
            EntityType::Relationship => &self.relationships,
        }
    }

    /// Replace the full state of an entity, creating it if needed
    pub fn write(
        &self,
        entity_type: EntityType,
        entity_id: EntityId,
        tokens: &[TokenId],
        properties: impl IntoIterator<Item = (PropertyKeyId, Value)>,
    ) -> EntityUpdates {
        let record = EntityRecord {
            tokens: tokens.iter().copied().collect(),
            properties: properties.into_iter().collect(),
        };
        let previous = self.records(entity_type).write().insert(entity_id, record.clone());
        diff(entity_type, entity_id, previous.as_ref(), Some(&record))
    }

    /// Set a single property. The returned updates only know that property.
    pub fn set_property(
        &self,
        entity_type: EntityType,
        entity_id: EntityId,
        key: PropertyKeyId,
        value: Value,
    ) -> Option<EntityUpdates> {
        let mut records = self.records(entity_type).write();
        let record = records.get_mut(&entity_id)?;
        let before = record.properties.insert(key, value.clone());
        let builder = EntityUpdates::builder(entity_type, entity_id).with_tokens(&record.tokens, &record.tokens);
        let builder = match before {
            Some(before) => builder.changed(key, before, value),
            None => builder.added(key, value),
        };
        Some(builder.build())
    }

    pub fn delete(&self, entity_type: EntityType, entity_id: EntityId) -> Option<EntityUpdates> {
        let previous = self.records(entity_type).write().remove(&entity_id)?;
        Some(diff(entity_type, entity_id, Some(&previous), None))
    }

    pub fn get(&self, entity_type: EntityType, entity_id: EntityId) -> Option<EntityRecord> {
        self.records(entity_type).read().get(&entity_id).cloned()
    }

    pub fn len(&self, entity_type: EntityType) -> usize {
        self.records(entity_type).read().len()
    }

    pub fn is_empty(&self, entity_type: EntityType) -> bool {
        self.len(entity_type) == 0
    }
}

impl Default for MemoryStoreView {
    fn default() -> Self {
        Self::new()
    }
}

fn diff(
    entity_type: EntityType,
    entity_id: EntityId,
    before: Option<&EntityRecord>,
    after: Option<&EntityRecord>,
) -> EntityUpdates {
    let empty = EntityRecord::default();
    let before = before.unwrap_or(&empty);
    let after = after.unwrap_or(&empty);
    let mut builder = EntityUpdates::builder(entity_type, entity_id).with_tokens(&before.tokens, &after.tokens);
    for (key, old) in &before.properties {
        builder = match after.properties.get(key) {
            Some(new) if new == old => builder.existing(*key, new.clone()),
            Some(new) => builder.changed(*key, old.clone(), new.clone()),
            None => builder.removed(*key, old.clone()),
        };
    }
    for (key, new) in &after.properties {
        if !before.properties.contains_key(key) {
            builder = builder.added(*key, new.clone());
        }
    }
    builder.complete().build()
}

impl IndexStoreView for MemoryStoreView {
    fn visit_entities(
        &self,
        entity_type: EntityType,
        entity_token_filter: &[TokenId],
        property_filter: PropertyKeyFilter,
        visitor: Box<dyn EntityUpdatesVisitor>,
        token_visitor: Option<Box<dyn TokenUpdateVisitor>>,
        force_full_scan: bool,
    ) -> Box<dyn StoreScan> {
        Box::new(MemoryStoreScan {
            records: Arc::clone(self.records(entity_type)),
            entity_type,
            token_filter: entity_token_filter.iter().copied().collect(),
            property_filter,
            force_full_scan,
            visitor: Mutex::new(visitor),
            token_visitor: Mutex::new(token_visitor),
            chunk_size: self.scan_chunk_size,
            stopped: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            total: AtomicU64::new(0),
        })
    }

    fn new_property_accessor(&self, entity_type: EntityType) -> Arc<dyn PropertyAccessor> {
        Arc::new(MemoryPropertyAccessor {
            records: Arc::clone(self.records(entity_type)),
        })
    }

    fn replace_index_counts(&self, index_id: IndexId, unique_values: u64, size: u64, updates: u64) {
        self.counts.insert(
            index_id,
            IndexSample {
                index_size: size,
                unique_values,
                sample_size: size,
                updates,
            },
        );
    }

    fn index_counts(&self, index_id: IndexId) -> Option<IndexSample> {
        self.counts.get(&index_id).map(|c| *c)
    }
}

pub struct MemoryPropertyAccessor {
    records: Records,
}

impl PropertyAccessor for MemoryPropertyAccessor {
    fn property_value(&self, entity_id: EntityId, property_key: PropertyKeyId) -> Result<Option<Value>> {
        Ok(self
            .records
            .read()
            .get(&entity_id)
            .and_then(|r| r.properties.get(&property_key).cloned()))
    }
}

struct MemoryStoreScan {
    records: Records,
    entity_type: EntityType,
    token_filter: TokenSet,
    property_filter: PropertyKeyFilter,
    force_full_scan: bool,
    visitor: Mutex<Box<dyn EntityUpdatesVisitor>>,
    token_visitor: Mutex<Option<Box<dyn TokenUpdateVisitor>>>,
    chunk_size: usize,
    stopped: AtomicBool,
    completed: AtomicU64,
    total: AtomicU64,
}

impl MemoryStoreScan {
    /// Read the next chunk after `cursor`. Returns the relevant entities and
    /// the last id examined, relevant or not.
    fn next_chunk(&self, cursor: Option<EntityId>) -> Result<(Vec<EntityUpdates>, Option<EntityId>, u64)> {
        let records = self.records.read();
        let lower = match cursor {
            Some(c) => Bound::Excluded(c),
            None => Bound::Unbounded,
        };
        let mut chunk = Vec::new();
        let mut last = None;
        let mut examined = 0;
        let mut token_visitor = self.token_visitor.lock();
        for (id, record) in records.range((lower, Bound::Unbounded)).take(self.chunk_size) {
            last = Some(*id);
            examined += 1;
            if let Some(tv) = token_visitor.as_mut() {
                tv.visit(*id, &record.tokens)?;
            }
            let relevant = self.force_full_scan
                || self.token_filter.is_empty()
                || self.token_filter.iter().any(|t| record.tokens.contains(t));
            if !relevant {
                continue;
            }
            let properties: Vec<(PropertyKeyId, Value)> = record
                .properties
                .iter()
                .filter(|(key, _)| (self.property_filter)(**key))
                .map(|(key, value)| (*key, value.clone()))
                .collect();
            if properties.is_empty() && !self.force_full_scan {
                continue;
            }
            chunk.push(EntityUpdates::from_scan(self.entity_type, *id, &record.tokens, properties));
        }
        Ok((chunk, last, examined))
    }
}

impl StoreScan for MemoryStoreScan {
    fn run(&self, check: &dyn ExternalUpdatesCheck) -> Result<()> {
        self.total.store(self.records.read().len() as u64, Ordering::Relaxed);
        let mut cursor = None;
        while !self.stopped.load(Ordering::Acquire) {
            let (chunk, last, examined) = self.next_chunk(cursor)?;
            let Some(last) = last else { break };
            cursor = Some(last);
            if !chunk.is_empty() && self.visitor.lock().visit(&chunk)? {
                break;
            }
            self.completed.fetch_add(examined, Ordering::Relaxed);
            if check.need_to_apply_external_updates() {
                check.apply_external_updates(last)?;
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn progress(&self) -> PopulationProgress {
        let total = self.total.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed).min(total);
        PopulationProgress::new(completed, total)
    }
}
