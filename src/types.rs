use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

pub type EntityId = u64;
pub type TokenId = u32;
pub type PropertyKeyId = u32;
pub type IndexId = u64;

/// Token sets are tiny (one label, a handful for multi-token indexes)
pub type TokenSet = SmallVec<[TokenId; 4]>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Node,
    Relationship,
}

/// Which entities and properties an index covers.
///
/// Entity tokens are kept sorted and deduplicated so two descriptors built
/// from the same tokens in a different order compare equal. Property key
/// order is significant (composite key order).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    entity_type: EntityType,
    entity_tokens: TokenSet,
    property_keys: SmallVec<[PropertyKeyId; 4]>,
}

impl SchemaDescriptor {
    pub fn new(entity_type: EntityType, entity_tokens: &[TokenId], property_keys: &[PropertyKeyId]) -> Self {
        let mut tokens: TokenSet = entity_tokens.iter().copied().collect();
        tokens.sort_unstable();
        tokens.dedup();
        Self {
            entity_type,
            entity_tokens: tokens,
            property_keys: property_keys.iter().copied().collect(),
        }
    }

    pub fn for_label(label: TokenId, property_keys: &[PropertyKeyId]) -> Self {
        Self::new(EntityType::Node, &[label], property_keys)
    }

    pub fn for_rel_type(rel_type: TokenId, property_keys: &[PropertyKeyId]) -> Self {
        Self::new(EntityType::Relationship, &[rel_type], property_keys)
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn entity_tokens(&self) -> &[TokenId] {
        &self.entity_tokens
    }

    pub fn property_keys(&self) -> &[PropertyKeyId] {
        &self.property_keys
    }

    /// True if an entity carrying `tokens` belongs to this schema
    pub fn matches_tokens(&self, tokens: &[TokenId]) -> bool {
        self.entity_tokens.iter().any(|t| tokens.contains(t))
    }
}

impl fmt::Display for SchemaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.entity_type {
            EntityType::Node => ":",
            EntityType::Relationship => "-[:",
        };
        let tokens: Vec<String> = self.entity_tokens.iter().map(|t| t.to_string()).collect();
        let keys: Vec<String> = self.property_keys.iter().map(|k| k.to_string()).collect();
        write!(f, "{}{}({})", prefix, tokens.join("|"), keys.join(","))
    }
}

/// Index provider identity
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub key: String,
    pub version: String,
}

impl ProviderDescriptor {
    pub fn new(key: &str, version: &str) -> Self {
        Self {
            key: key.to_string(),
            version: version.to_string(),
        }
    }
}

/// Identity of one schema index
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDescriptor {
    id: IndexId,
    name: String,
    schema: SchemaDescriptor,
    unique: bool,
    provider: ProviderDescriptor,
}

impl IndexDescriptor {
    pub fn new(id: IndexId, name: &str, schema: SchemaDescriptor, provider: ProviderDescriptor) -> Self {
        Self {
            id,
            name: name.to_string(),
            schema,
            unique: false,
            provider,
        }
    }

    /// Index backing a uniqueness constraint
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn id(&self) -> IndexId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn provider(&self) -> &ProviderDescriptor {
        &self.provider
    }

    /// Human readable description used in logs and failure messages
    pub fn user_description(&self) -> String {
        let kind = if self.unique { "UNIQUE" } else { "GENERAL" };
        format!("Index( id={}, name='{}', type='{} BTREE', schema={} )", self.id, self.name, kind, self.schema)
    }
}

/// Externally visible state of an index.
///
/// Transitions only move forward: `Populating -> {Online | Failed | Tentative}`
/// and `Tentative -> Online`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexState {
    Populating,
    Online,
    Failed,
    /// Constraint index done populating, waiting for its constraint to commit
    Tentative,
}

/// How an online updater applies changes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IndexUpdateMode {
    Online,
    /// Tolerates re-applying changes that are already in the index
    OnlineIdempotent,
    Recovery,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpdateMode {
    Added,
    Changed,
    Removed,
}

/// One change to one index for one entity
#[derive(Clone, Debug, PartialEq)]
pub struct IndexEntryUpdate {
    entity_id: EntityId,
    schema: SchemaDescriptor,
    mode: UpdateMode,
    before: Option<Vec<Value>>,
    values: Vec<Value>,
}

impl IndexEntryUpdate {
    pub fn add(entity_id: EntityId, schema: SchemaDescriptor, values: Vec<Value>) -> Self {
        Self {
            entity_id,
            schema,
            mode: UpdateMode::Added,
            before: None,
            values,
        }
    }

    pub fn change(entity_id: EntityId, schema: SchemaDescriptor, before: Vec<Value>, after: Vec<Value>) -> Self {
        Self {
            entity_id,
            schema,
            mode: UpdateMode::Changed,
            before: Some(before),
            values: after,
        }
    }

    pub fn remove(entity_id: EntityId, schema: SchemaDescriptor, values: Vec<Value>) -> Self {
        Self {
            entity_id,
            schema,
            mode: UpdateMode::Removed,
            before: None,
            values,
        }
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    /// Values before a change. `None` unless the mode is `Changed`.
    pub fn before_values(&self) -> Option<&[Value]> {
        self.before.as_deref()
    }

    /// Values after the update, or the removed values for `Removed`
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Rough heap footprint, used to bound the concurrent update queue
    pub fn rough_size(&self) -> usize {
        let values: usize = self.values.iter().chain(self.before.iter().flatten()).map(rough_value_size).sum();
        std::mem::size_of::<Self>() + values
    }
}

fn rough_value_size(value: &Value) -> usize {
    match value {
        Value::String(s) => 24 + s.len(),
        Value::Array(items) => 24 + items.iter().map(rough_value_size).sum::<usize>(),
        Value::Object(map) => 48 + map.iter().map(|(k, v)| k.len() + rough_value_size(v)).sum::<usize>(),
        _ => 16,
    }
}

/// Before/after state of one property on one entity
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyChange {
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// All changes made to one entity by one transaction (or the full state of
/// an entity as seen by a store scan).
#[derive(Clone, Debug, PartialEq)]
pub struct EntityUpdates {
    entity_id: EntityId,
    entity_type: EntityType,
    tokens_before: TokenSet,
    tokens_after: TokenSet,
    properties: BTreeMap<PropertyKeyId, PropertyChange>,
    /// True when `properties` holds every property of the entity
    complete: bool,
}

impl EntityUpdates {
    pub fn builder(entity_type: EntityType, entity_id: EntityId) -> EntityUpdatesBuilder {
        EntityUpdatesBuilder {
            updates: EntityUpdates {
                entity_id,
                entity_type,
                tokens_before: TokenSet::new(),
                tokens_after: TokenSet::new(),
                properties: BTreeMap::new(),
                complete: false,
            },
        }
    }

    /// Entity as found by a full store scan: everything is "added"
    pub fn from_scan(
        entity_type: EntityType,
        entity_id: EntityId,
        tokens: &[TokenId],
        properties: impl IntoIterator<Item = (PropertyKeyId, Value)>,
    ) -> Self {
        let mut builder = Self::builder(entity_type, entity_id).with_tokens_after(tokens);
        for (key, value) in properties {
            builder = builder.added(key, value);
        }
        builder.complete().build()
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn tokens_after(&self) -> &[TokenId] {
        &self.tokens_after
    }

    pub fn tokens_before(&self) -> &[TokenId] {
        &self.tokens_before
    }

    pub fn property_changes(&self) -> &BTreeMap<PropertyKeyId, PropertyChange> {
        &self.properties
    }

    pub fn is_property_list_complete(&self) -> bool {
        self.complete
    }

    /// Tokens added or removed
    pub fn changed_tokens(&self) -> TokenSet {
        let mut changed: TokenSet = self
            .tokens_before
            .iter()
            .filter(|t| !self.tokens_after.contains(*t))
            .chain(self.tokens_after.iter().filter(|t| !self.tokens_before.contains(*t)))
            .copied()
            .collect();
        changed.sort_unstable();
        changed
    }

    /// Tokens present both before and after
    pub fn unchanged_tokens(&self) -> TokenSet {
        self.tokens_before.iter().filter(|t| self.tokens_after.contains(*t)).copied().collect()
    }

    /// Keys whose value differs before and after (or every key when the list is complete)
    pub fn changed_property_keys(&self) -> Vec<PropertyKeyId> {
        self.properties
            .iter()
            .filter(|(_, change)| self.complete || change.before != change.after)
            .map(|(key, _)| *key)
            .collect()
    }

    /// Index updates this entity change produces for the given schemas.
    ///
    /// Every property of a schema must be known to this `EntityUpdates`;
    /// callers holding an incomplete property list load the missing values
    /// first (see [`EntityUpdates::with_loaded_properties`]).
    pub fn for_indexes<'a, I>(&self, schemas: I) -> Vec<IndexEntryUpdate>
    where
        I: IntoIterator<Item = &'a SchemaDescriptor>,
    {
        let mut updates = Vec::new();
        for schema in schemas {
            if schema.entity_type() != self.entity_type {
                continue;
            }
            let before = self.values_for(schema, true);
            let after = self.values_for(schema, false);
            match (before, after) {
                (None, Some(after)) => updates.push(IndexEntryUpdate::add(self.entity_id, schema.clone(), after)),
                (Some(before), None) => updates.push(IndexEntryUpdate::remove(self.entity_id, schema.clone(), before)),
                (Some(before), Some(after)) if before != after => {
                    updates.push(IndexEntryUpdate::change(self.entity_id, schema.clone(), before, after))
                }
                _ => {}
            }
        }
        updates
    }

    /// Fill in unchanged properties the transaction didn't touch
    pub fn with_loaded_properties<F>(mut self, keys: &[PropertyKeyId], mut load: F) -> crate::error::Result<Self>
    where
        F: FnMut(EntityId, PropertyKeyId) -> crate::error::Result<Option<Value>>,
    {
        for key in keys {
            if self.properties.contains_key(key) {
                continue;
            }
            if let Some(value) = load(self.entity_id, *key)? {
                self.properties.insert(
                    *key,
                    PropertyChange {
                        before: Some(value.clone()),
                        after: Some(value),
                    },
                );
            }
        }
        Ok(self)
    }

    fn values_for(&self, schema: &SchemaDescriptor, before: bool) -> Option<Vec<Value>> {
        let tokens = if before { &self.tokens_before } else { &self.tokens_after };
        if !schema.matches_tokens(tokens) {
            return None;
        }
        schema
            .property_keys()
            .iter()
            .map(|key| {
                let change = self.properties.get(key)?;
                if before { change.before.clone() } else { change.after.clone() }
            })
            .collect()
    }
}

pub struct EntityUpdatesBuilder {
    updates: EntityUpdates,
}

impl EntityUpdatesBuilder {
    pub fn with_tokens(mut self, before: &[TokenId], after: &[TokenId]) -> Self {
        self.updates.tokens_before = before.iter().copied().collect();
        self.updates.tokens_after = after.iter().copied().collect();
        self
    }

    pub fn with_tokens_after(mut self, after: &[TokenId]) -> Self {
        self.updates.tokens_after = after.iter().copied().collect();
        self
    }

    pub fn added(mut self, key: PropertyKeyId, value: Value) -> Self {
        self.updates.properties.insert(key, PropertyChange { before: None, after: Some(value) });
        self
    }

    pub fn changed(mut self, key: PropertyKeyId, before: Value, after: Value) -> Self {
        self.updates.properties.insert(
            key,
            PropertyChange {
                before: Some(before),
                after: Some(after),
            },
        );
        self
    }

    pub fn removed(mut self, key: PropertyKeyId, value: Value) -> Self {
        self.updates.properties.insert(key, PropertyChange { before: Some(value), after: None });
        self
    }

    /// Unchanged property, known to the caller
    pub fn existing(mut self, key: PropertyKeyId, value: Value) -> Self {
        self.updates.properties.insert(
            key,
            PropertyChange {
                before: Some(value.clone()),
                after: Some(value),
            },
        );
        self
    }

    pub fn complete(mut self) -> Self {
        self.updates.complete = true;
        self
    }

    pub fn build(self) -> EntityUpdates {
        self.updates
    }
}

/// Statistics sampled from a populated index
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSample {
    pub index_size: u64,
    pub unique_values: u64,
    pub sample_size: u64,
    pub updates: u64,
}

impl IndexSample {
    pub fn new(index_size: u64, unique_values: u64, sample_size: u64) -> Self {
        Self {
            index_size,
            unique_values,
            sample_size,
            updates: 0,
        }
    }
}

/// Progress of a store scan or of one index population
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PopulationProgress {
    pub completed: u64,
    pub total: u64,
}

impl PopulationProgress {
    pub const NONE: PopulationProgress = PopulationProgress { completed: 0, total: 0 };
    pub const DONE: PopulationProgress = PopulationProgress { completed: 1, total: 1 };

    pub fn new(completed: u64, total: u64) -> Self {
        Self { completed, total }
    }

    pub fn progress(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            (self.completed as f32 / self.total as f32).min(1.0)
        }
    }
}
