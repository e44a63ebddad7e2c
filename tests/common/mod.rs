//! Shared test doubles for the population scenario tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use sekejap_indexing::error::{IndexError, IndexPopulationFailure, Result};
use sekejap_indexing::index::{IndexAccessor, IndexPopulator, IndexReader, IndexUpdater, SwallowingIndexUpdater};
use sekejap_indexing::populate::{IndexPopulation, MultipleIndexPopulator, PopulationConfig, SchemaState};
use sekejap_indexing::proxy::{
    FailedIndexProxy, FailedIndexProxyFactory, FlippableIndexProxy, IndexProxy, IndexProxyFactory, OnlineIndexProxy,
};
use sekejap_indexing::store::{IndexStoreView, MemoryStoreView, PropertyAccessor};
use sekejap_indexing::types::{
    EntityId, EntityType, IndexDescriptor, IndexEntryUpdate, IndexId, IndexSample, IndexUpdateMode, PropertyKeyId,
    ProviderDescriptor, SchemaDescriptor, TokenId,
};

pub type Entry = (EntityId, Vec<Value>);

/// Populator that records every call made to it
#[derive(Default)]
pub struct RecordingPopulator {
    events: Mutex<Vec<String>>,
    batches: Mutex<Vec<Vec<Entry>>>,
    processed: Arc<Mutex<Vec<Entry>>>,
    sampled: Mutex<Vec<EntityId>>,
    fail_create: bool,
    fail_add_for: Option<EntityId>,
}

impl RecordingPopulator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_create() -> Arc<Self> {
        Arc::new(Self {
            fail_create: true,
            ..Self::default()
        })
    }

    /// `add` fails for any batch containing `entity_id`
    pub fn failing_add_for(entity_id: EntityId) -> Arc<Self> {
        Arc::new(Self {
            fail_add_for: Some(entity_id),
            ..Self::default()
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn batches(&self) -> Vec<Vec<Entry>> {
        self.batches.lock().clone()
    }

    pub fn added_ids(&self) -> Vec<EntityId> {
        self.batches.lock().iter().flatten().map(|(id, _)| *id).collect()
    }

    pub fn processed(&self) -> Vec<Entry> {
        self.processed.lock().clone()
    }

    pub fn sampled_ids(&self) -> Vec<EntityId> {
        self.sampled.lock().clone()
    }

    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }
}

impl IndexPopulator for RecordingPopulator {
    fn create(&self) -> Result<()> {
        self.record("create");
        if self.fail_create {
            return Err(IndexError::Backend("create failed".into()));
        }
        Ok(())
    }

    fn drop_index(&self) -> Result<()> {
        self.record("drop");
        Ok(())
    }

    fn add(&self, updates: Vec<IndexEntryUpdate>) -> Result<()> {
        let batch: Vec<Entry> = updates.iter().map(|u| (u.entity_id(), u.values().to_vec())).collect();
        let fail = self
            .fail_add_for
            .is_some_and(|id| batch.iter().any(|(entity, _)| *entity == id));
        self.batches.lock().push(batch);
        self.record("add");
        if fail {
            return Err(IndexError::Backend("add failed".into()));
        }
        Ok(())
    }

    fn new_populating_updater(&self, _accessor: Arc<dyn PropertyAccessor>) -> Result<Box<dyn IndexUpdater>> {
        Ok(Box::new(RecordingUpdater {
            processed: Arc::clone(&self.processed),
        }))
    }

    fn include_sample(&self, update: &IndexEntryUpdate) {
        self.sampled.lock().push(update.entity_id());
    }

    fn sample_result(&self) -> Result<IndexSample> {
        let size = self.sampled.lock().len() as u64;
        Ok(IndexSample::new(size, size, size))
    }

    fn mark_as_failed(&self, _failure: &str) -> Result<()> {
        self.record("mark_as_failed");
        Ok(())
    }

    fn close(&self, populated: bool) -> Result<()> {
        self.record(format!("close({populated})"));
        Ok(())
    }
}

struct RecordingUpdater {
    processed: Arc<Mutex<Vec<Entry>>>,
}

impl IndexUpdater for RecordingUpdater {
    fn process(&mut self, update: IndexEntryUpdate) -> Result<()> {
        self.processed.lock().push((update.entity_id(), update.values().to_vec()));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Accessor backing the online proxies of flipped test indexes
pub struct NullAccessor;

impl IndexAccessor for NullAccessor {
    fn new_updater(&self, _mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater>> {
        Ok(Box::new(SwallowingIndexUpdater))
    }

    fn new_reader(&self) -> Result<Box<dyn IndexReader>> {
        Err(IndexError::Backend("no reader".into()))
    }

    fn drop_index(&self) -> Result<()> {
        Ok(())
    }

    fn force(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingSchemaState {
    pub clears: AtomicUsize,
}

impl SchemaState for CountingSchemaState {
    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn descriptor(id: IndexId, label: TokenId, key: PropertyKeyId) -> Arc<IndexDescriptor> {
    Arc::new(IndexDescriptor::new(
        id,
        &format!("index_{id}"),
        SchemaDescriptor::for_label(label, &[key]),
        ProviderDescriptor::new("recording", "1.0"),
    ))
}

pub fn node_populator(store: &Arc<MemoryStoreView>, config: PopulationConfig) -> Arc<MultipleIndexPopulator> {
    let store_view: Arc<dyn IndexStoreView> = Arc::clone(store) as Arc<dyn IndexStoreView>;
    Arc::new(MultipleIndexPopulator::new(
        store_view,
        EntityType::Node,
        config,
        Arc::new(CountingSchemaState::default()),
    ))
}

pub fn online_target(descriptor: Arc<IndexDescriptor>) -> Arc<dyn IndexProxyFactory> {
    Arc::new(move || -> Result<Arc<dyn IndexProxy>> {
        Ok(Arc::new(OnlineIndexProxy::new(Arc::clone(&descriptor), Arc::new(NullAccessor))))
    })
}

pub fn failed_factory(
    descriptor: Arc<IndexDescriptor>,
    populator: Arc<dyn IndexPopulator>,
) -> Arc<dyn FailedIndexProxyFactory> {
    Arc::new(move |failure: IndexPopulationFailure| -> Arc<dyn IndexProxy> {
        Arc::new(FailedIndexProxy::new(Arc::clone(&descriptor), Arc::clone(&populator), failure))
    })
}

/// Register `recording` for `descriptor`, flipping to an online proxy on success
pub fn register(
    populator: &MultipleIndexPopulator,
    recording: &Arc<RecordingPopulator>,
    descriptor: Arc<IndexDescriptor>,
) -> Arc<IndexPopulation> {
    let flipper = Arc::new(FlippableIndexProxy::new(Arc::clone(&descriptor)));
    flipper.set_flip_target(online_target(Arc::clone(&descriptor)));
    let as_populator: Arc<dyn IndexPopulator> = Arc::clone(recording) as Arc<dyn IndexPopulator>;
    populator
        .add_populator(
            Arc::clone(&as_populator),
            Arc::clone(&descriptor),
            flipper,
            failed_factory(Arc::clone(&descriptor), as_populator),
            &descriptor.user_description(),
        )
        .unwrap()
}
