//! Indexing Service
//!
//! Owns the `IndexMap` and drives every index through its lifecycle:
//! recovery on `init`/`start`, population jobs for new indexes, routing of
//! committed entity changes to online indexes and running populations.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{IndexError, IndexPopulationFailure, Result};
use crate::index::IndexProvider;
use crate::map::{IndexMap, IndexMapReference, IndexUpdaterMap};
use crate::populate::{IndexPopulationJob, MultipleIndexPopulator, PopulationConfig, SchemaState};
use crate::proxy::{
    ContractCheckingIndexProxy, FailedIndexProxy, FailedIndexProxyFactory, FlippableIndexProxy, IndexProxy,
    OnlineIndexProxy, PopulatingIndexProxy, TentativeConstraintIndexProxy,
};
use crate::store::IndexStoreView;
use crate::types::{
    EntityType, EntityUpdates, IndexDescriptor, IndexId, IndexState, IndexUpdateMode, PropertyKeyId,
};

/// Schema-derived values cached by callers, dropped whenever an index flips
#[derive(Default)]
pub struct SchemaStateCache {
    entries: DashMap<String, Value>,
    clears: AtomicU64,
}

impl SchemaStateCache {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|v| v.clone())
    }

    pub fn put(&self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
    }

    /// How many times the cache was cleared
    pub fn clears(&self) -> u64 {
        self.clears.load(Ordering::Relaxed)
    }
}

impl SchemaState for SchemaStateCache {
    fn clear(&self) {
        self.entries.clear();
        self.clears.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    NotStarted,
    Running,
    Stopped,
}

struct RunningJob {
    job: Arc<IndexPopulationJob>,
    handle: Option<JoinHandle<()>>,
}

pub struct IndexingService {
    provider: Arc<dyn IndexProvider>,
    store_view: Arc<dyn IndexStoreView>,
    config: PopulationConfig,
    index_map: IndexMapReference,
    schema_state: Arc<SchemaStateCache>,
    jobs: Mutex<Vec<RunningJob>>,
    state: Mutex<ServiceState>,
    rebuild: Mutex<Vec<IndexDescriptor>>,
}

impl IndexingService {
    pub fn new(
        provider: Arc<dyn IndexProvider>,
        store_view: Arc<dyn IndexStoreView>,
        config: PopulationConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            provider,
            store_view,
            config,
            index_map: IndexMapReference::new(),
            schema_state: Arc::new(SchemaStateCache::default()),
            jobs: Mutex::new(Vec::new()),
            state: Mutex::new(ServiceState::NotStarted),
            rebuild: Mutex::new(Vec::new()),
        })
    }

    pub fn schema_state(&self) -> &Arc<SchemaStateCache> {
        &self.schema_state
    }

    pub fn index_map(&self) -> Arc<IndexMap> {
        self.index_map.snapshot()
    }

    /// Build proxies for indexes known from an earlier run
    pub fn init(&self, descriptors: Vec<IndexDescriptor>) -> Result<()> {
        if *self.state.lock() != ServiceState::NotStarted {
            return Err(IndexError::illegal_state("indexing service already initialized"));
        }
        let mut by_state: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut proxies = Vec::new();
        for descriptor in descriptors {
            let state = self.provider.initial_state(&descriptor);
            by_state
                .entry(format!("{state:?}"))
                .or_default()
                .push(descriptor.user_description());
            match state {
                IndexState::Online => proxies.push(self.online_proxy(Arc::new(descriptor))?),
                IndexState::Failed => proxies.push(self.failed_proxy(Arc::new(descriptor))?),
                IndexState::Populating | IndexState::Tentative => self.rebuild.lock().push(descriptor),
            }
        }
        self.index_map.modify(|map| {
            for proxy in proxies {
                map.put(proxy);
            }
        });
        for (state, indexes) in by_state {
            info!(state = %state, count = indexes.len(), indexes = ?indexes, "IndexingService.init: indexes in state");
        }
        Ok(())
    }

    /// Start recovered proxies and rebuild indexes that never finished populating
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ServiceState::NotStarted {
                return Err(IndexError::illegal_state("indexing service already started"));
            }
            *state = ServiceState::Running;
        }
        for proxy in self.index_map.snapshot().proxies() {
            proxy.start()?;
        }
        let rebuild = std::mem::take(&mut *self.rebuild.lock());
        if !rebuild.is_empty() {
            info!(count = rebuild.len(), "rebuilding indexes that were populating");
            self.create_indexes(rebuild)?;
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        match *self.state.lock() {
            ServiceState::Running => Ok(()),
            other => Err(IndexError::illegal_state(format!("indexing service is {other:?}"))),
        }
    }

    /// Start populating new indexes: one job (and worker thread) per entity type
    pub fn create_indexes(&self, descriptors: Vec<IndexDescriptor>) -> Result<()> {
        self.ensure_running()?;
        let mut by_type: BTreeMap<EntityType, Vec<IndexDescriptor>> = BTreeMap::new();
        for descriptor in descriptors {
            if self.index_map.snapshot().contains(descriptor.id()) {
                warn!(index = %descriptor.user_description(), "index already exists, not creating it again");
                continue;
            }
            by_type.entry(descriptor.schema().entity_type()).or_default().push(descriptor);
        }

        for (entity_type, descriptors) in by_type {
            let verify_before_flipping = descriptors.iter().any(IndexDescriptor::is_unique);
            let populator = MultipleIndexPopulator::new(
                Arc::clone(&self.store_view),
                entity_type,
                self.config.clone(),
                Arc::clone(&self.schema_state) as Arc<dyn SchemaState>,
            );
            let job = Arc::new(IndexPopulationJob::new(populator, verify_before_flipping));
            let mut proxies = Vec::new();
            for descriptor in descriptors {
                proxies.push(self.populating_proxy(&job, descriptor)?);
            }
            self.index_map.modify(|map| {
                for proxy in proxies {
                    map.put(proxy);
                }
            });

            let worker = Arc::clone(&job);
            let handle = std::thread::Builder::new()
                .name(format!("index-population-{entity_type:?}").to_lowercase())
                .spawn(move || {
                    if let Err(e) = worker.run() {
                        error!(error = %e, "index population job failed");
                    }
                })?;
            let mut jobs = self.jobs.lock();
            jobs.retain(|running| !running.job.is_done());
            jobs.push(RunningJob {
                job,
                handle: Some(handle),
            });
        }
        Ok(())
    }

    fn online_proxy(&self, descriptor: Arc<IndexDescriptor>) -> Result<Arc<dyn IndexProxy>> {
        let accessor = self.provider.online_accessor(&descriptor)?;
        let online = Arc::new(OnlineIndexProxy::new(descriptor, accessor));
        Ok(Arc::new(ContractCheckingIndexProxy::new(online)))
    }

    fn failed_proxy(&self, descriptor: Arc<IndexDescriptor>) -> Result<Arc<dyn IndexProxy>> {
        let failure = self
            .provider
            .population_failure(&descriptor)
            .unwrap_or_else(|| "population failed for an unknown reason".to_string());
        let populator = self.provider.populator(&descriptor)?;
        let failed = Arc::new(FailedIndexProxy::new(descriptor, populator, IndexPopulationFailure::new(failure)));
        Ok(Arc::new(ContractCheckingIndexProxy::new(failed)))
    }

    fn populating_proxy(
        &self,
        job: &Arc<IndexPopulationJob>,
        descriptor: IndexDescriptor,
    ) -> Result<Arc<dyn IndexProxy>> {
        let descriptor = Arc::new(descriptor);
        let populator = self.provider.populator(&descriptor)?;
        let flipper = Arc::new(FlippableIndexProxy::new(Arc::clone(&descriptor)));

        let failed_factory: Arc<dyn FailedIndexProxyFactory> = {
            let descriptor = Arc::clone(&descriptor);
            let populator = Arc::clone(&populator);
            Arc::new(move |failure: IndexPopulationFailure| -> Arc<dyn IndexProxy> {
                Arc::new(FailedIndexProxy::new(Arc::clone(&descriptor), Arc::clone(&populator), failure))
            })
        };
        let population = job.add_populator(
            populator,
            Arc::clone(&descriptor),
            Arc::clone(&flipper),
            failed_factory,
        )?;
        flipper.flip_to(Arc::new(PopulatingIndexProxy::new(
            Arc::clone(&descriptor),
            Arc::clone(job),
            population,
        )))?;

        let provider = Arc::clone(&self.provider);
        let weak_flipper = Arc::downgrade(&flipper);
        flipper.set_flip_target(Arc::new(move || -> Result<Arc<dyn IndexProxy>> {
            let accessor = provider.online_accessor(&descriptor)?;
            let online: Arc<dyn IndexProxy> = Arc::new(OnlineIndexProxy::new(Arc::clone(&descriptor), accessor));
            if descriptor.is_unique() {
                Ok(Arc::new(TentativeConstraintIndexProxy::new(weak_flipper.clone(), online)))
            } else {
                Ok(online)
            }
        }));

        let proxy: Arc<dyn IndexProxy> = Arc::new(ContractCheckingIndexProxy::new(flipper));
        proxy.start()?;
        Ok(proxy)
    }

    pub fn index_proxy(&self, index_id: IndexId) -> Result<Arc<dyn IndexProxy>> {
        self.index_map.get_index_proxy(index_id)
    }

    pub fn index_state(&self, index_id: IndexId) -> Result<IndexState> {
        Ok(self.index_proxy(index_id)?.state())
    }

    pub fn population_failure(&self, index_id: IndexId) -> Result<Option<IndexPopulationFailure>> {
        Ok(self.index_proxy(index_id)?.population_failure())
    }

    pub fn await_store_scan_completed(&self, index_id: IndexId, timeout: Duration) -> Result<bool> {
        self.index_proxy(index_id)?.await_store_scan_completed(timeout)
    }

    /// Promote a populated constraint index to online
    pub fn activate_index(&self, index_id: IndexId) -> Result<()> {
        let proxy = self.index_proxy(index_id)?;
        if proxy.state() == IndexState::Populating && !proxy.await_store_scan_completed(self.await_timeout())? {
            return Err(IndexError::ActivationFailed {
                index: index_id,
                reason: "index is still populating".to_string(),
            });
        }
        proxy.activate()
    }

    pub fn drop_index(&self, index_id: IndexId) -> Result<()> {
        let proxy = self
            .index_map
            .modify(|map| map.remove(index_id))
            .ok_or(IndexError::IndexNotFound(index_id))?;
        proxy.drop_index()
    }

    /// Route committed entity changes to every related index.
    ///
    /// Populating indexes queue them into their running population, online
    /// indexes apply them directly. All updaters are closed before returning.
    pub fn apply_updates(&self, updates: &[EntityUpdates], mode: IndexUpdateMode) -> Result<()> {
        let map = self.index_map.snapshot();
        let mut updaters = IndexUpdaterMap::new(Arc::clone(&map), mode);
        let routed = self.route_updates(&map, &mut updaters, updates);
        let closed = updaters.close();
        routed.and(closed)
    }

    fn route_updates(&self, map: &IndexMap, updaters: &mut IndexUpdaterMap, updates: &[EntityUpdates]) -> Result<()> {
        for entity in updates {
            let related = map.related_indexes(
                &entity.changed_tokens(),
                &entity.unchanged_tokens(),
                &entity.changed_property_keys(),
                entity.is_property_list_complete(),
                entity.entity_type(),
            );
            if related.is_empty() {
                continue;
            }
            let descriptors: Vec<Arc<IndexDescriptor>> = related.iter().map(|p| p.descriptor()).collect();

            let loaded;
            let entity = if entity.is_property_list_complete() {
                entity
            } else {
                let mut keys: Vec<PropertyKeyId> = descriptors
                    .iter()
                    .flat_map(|d| d.schema().property_keys().iter().copied())
                    .collect();
                keys.sort_unstable();
                keys.dedup();
                let accessor = self.store_view.new_property_accessor(entity.entity_type());
                loaded = entity
                    .clone()
                    .with_loaded_properties(&keys, |id, key| accessor.property_value(id, key))?;
                &loaded
            };

            for update in entity.for_indexes(descriptors.iter().map(|d| d.schema())) {
                for descriptor in descriptors.iter().filter(|d| d.schema() == update.schema()) {
                    if let Some(updater) = updaters.get_updater(descriptor.id())? {
                        updater.process(update.clone())?;
                    }
                }
            }
        }
        Ok(())
    }

    fn await_timeout(&self) -> Duration {
        Duration::from_secs(self.config.await_timeout_minutes.saturating_mul(60))
    }

    /// Wait for every running population job
    pub fn await_populations(&self, timeout: Duration) -> bool {
        let jobs: Vec<Arc<IndexPopulationJob>> = self.jobs.lock().iter().map(|r| Arc::clone(&r.job)).collect();
        jobs.iter().all(|job| job.await_completion(timeout))
    }

    /// Cancel population jobs, wait for them, close every index
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == ServiceState::Stopped {
                return Ok(());
            }
            *state = ServiceState::Stopped;
        }
        let jobs = std::mem::take(&mut *self.jobs.lock());
        for running in &jobs {
            running.job.cancel();
        }
        let timeout = self.await_timeout();
        for mut running in jobs {
            if !running.job.await_completion(timeout) {
                warn!(timeout = ?timeout, "index population job did not stop in time");
                continue;
            }
            if let Some(handle) = running.handle.take() {
                if handle.join().is_err() {
                    error!("index population worker panicked");
                }
            }
        }
        let map = self.index_map.modify(std::mem::take);
        for proxy in map.proxies() {
            if let Err(e) = proxy.close() {
                warn!(index = %proxy.descriptor().user_description(), error = %e, "failed to close index");
            }
        }
        Ok(())
    }
}
