//! Multiple Index Populator
//!
//! Populates N indexes from a single store scan:
//! 1. `create()` every populator; a failing one only fails its own index
//! 2. the scan visitor turns entities into per-index batches of
//!    `batch_size`, flushed in parallel (one task per index, in order)
//! 3. concurrent writes are queued; when the queue crosses its threshold
//!    they are applied through populating updaters, but only for entities
//!    at or before the scan cursor (later ones are read by the scan itself)
//! 4. `flip_after_population()` drains what is left and flips each index
//!    to its online (or failed) proxy
//!
//! Failures are captured as `IndexPopulationFailure` and never cross index
//! boundaries. Only a failure of the scan itself aborts the whole run.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use super::{PopulationConfig, SchemaState, UpdatesTracker};
use crate::error::{IndexError, IndexPopulationFailure, Result};
use crate::index::{IndexPopulator, IndexUpdater};
use crate::proxy::{FailedIndexProxyFactory, FlipOutcome, FlippableIndexProxy};
use crate::reservation::{AggregatedReservation, MemoryReservation, MemoryTracker};
use crate::store::{ExternalUpdatesCheck, IndexStoreView, PropertyAccessor, StoreScan};
use crate::types::{
    EntityId, EntityType, EntityUpdates, IndexDescriptor, IndexEntryUpdate, PopulationProgress, PropertyKeyId,
    SchemaDescriptor, TokenId,
};

/// Where one index population stands
#[derive(Debug, Clone, PartialEq)]
pub enum PopulationStatus {
    Created,
    Populating,
    Flipped,
    Failed(IndexPopulationFailure),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerState {
    NotStarted,
    Populating,
    Stopped,
}

type PopulationFailures = Vec<(Arc<IndexPopulation>, IndexPopulationFailure)>;

/// Population session of one index
pub struct IndexPopulation {
    populator: Arc<dyn IndexPopulator>,
    descriptor: Arc<IndexDescriptor>,
    flipper: Arc<FlippableIndexProxy>,
    failed_factory: Arc<dyn FailedIndexProxyFactory>,
    user_description: String,
    status: Mutex<PopulationStatus>,
    batch: Mutex<Vec<IndexEntryUpdate>>,
    /// Set once the populator got its terminal `close` (or `drop_index`)
    populator_closed: AtomicBool,
    /// Held across `create`, the flip body and terminal close/drop
    populator_lock: Mutex<()>,
    tracker: UpdatesTracker,
    done: Mutex<bool>,
    done_signal: Condvar,
}

impl IndexPopulation {
    pub fn descriptor(&self) -> &Arc<IndexDescriptor> {
        &self.descriptor
    }

    pub fn user_description(&self) -> &str {
        &self.user_description
    }

    pub fn populator(&self) -> &Arc<dyn IndexPopulator> {
        &self.populator
    }

    pub fn flipper(&self) -> &Arc<FlippableIndexProxy> {
        &self.flipper
    }

    pub fn status(&self) -> PopulationStatus {
        self.status.lock().clone()
    }

    pub fn failure(&self) -> Option<IndexPopulationFailure> {
        match &*self.status.lock() {
            PopulationStatus::Failed(failure) => Some(failure.clone()),
            _ => None,
        }
    }

    pub fn tracker(&self) -> &UpdatesTracker {
        &self.tracker
    }

    /// Wait until this population flipped, failed or was cancelled
    pub fn await_done(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if !*done {
            self.done_signal.wait_while_for(&mut done, |done: &mut bool| !*done, timeout);
        }
        *done
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock()
    }

    fn schema(&self) -> &SchemaDescriptor {
        self.descriptor.schema()
    }

    fn is_active(&self) -> bool {
        matches!(*self.status.lock(), PopulationStatus::Created | PopulationStatus::Populating)
    }

    /// Move out of an active state. False if no longer active.
    fn transition(&self, to: PopulationStatus) -> bool {
        let mut status = self.status.lock();
        if matches!(*status, PopulationStatus::Created | PopulationStatus::Populating) {
            *status = to;
            true
        } else {
            false
        }
    }

    /// Record a failure. A flip that failed after committing to `Flipped`
    /// may still turn into a failure.
    fn mark_failed(&self, failure: IndexPopulationFailure, from_flipped: bool) -> bool {
        let mut status = self.status.lock();
        let allowed = match *status {
            PopulationStatus::Created | PopulationStatus::Populating => true,
            PopulationStatus::Flipped => from_flipped,
            _ => false,
        };
        if allowed {
            *status = PopulationStatus::Failed(failure);
        }
        allowed
    }

    /// Flip action result for a population that left the active states.
    /// A cancelled one keeps its populating proxy.
    fn inactive_flip(&self) -> Result<bool> {
        match *self.status.lock() {
            PopulationStatus::Cancelled => Err(IndexError::PopulationCancelled(self.user_description.clone())),
            _ => Ok(false),
        }
    }

    fn close_populator(&self, populated: bool) -> Result<()> {
        if self.populator_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.populator.close(populated)
    }

    fn take_batch(&self) -> Vec<IndexEntryUpdate> {
        std::mem::take(&mut *self.batch.lock())
    }

    fn signal_done(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.done_signal.notify_all();
    }
}

pub struct MultipleIndexPopulator {
    store_view: Arc<dyn IndexStoreView>,
    entity_type: EntityType,
    config: PopulationConfig,
    schema_state: Arc<dyn SchemaState>,
    property_accessor: Arc<dyn PropertyAccessor>,
    populations: ArcSwap<Vec<Arc<IndexPopulation>>>,
    queue: Mutex<VecDeque<IndexEntryUpdate>>,
    queued_bytes: AtomicUsize,
    controller: Mutex<ControllerState>,
    store_scan: Mutex<Option<Arc<dyn StoreScan>>>,
    memory: Arc<MemoryTracker>,
}

impl MultipleIndexPopulator {
    pub fn new(
        store_view: Arc<dyn IndexStoreView>,
        entity_type: EntityType,
        config: PopulationConfig,
        schema_state: Arc<dyn SchemaState>,
    ) -> Self {
        let property_accessor = store_view.new_property_accessor(entity_type);
        Self {
            store_view,
            entity_type,
            config,
            schema_state,
            property_accessor,
            populations: ArcSwap::from_pointee(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            queued_bytes: AtomicUsize::new(0),
            controller: Mutex::new(ControllerState::NotStarted),
            store_scan: Mutex::new(None),
            memory: MemoryTracker::new(),
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn config(&self) -> &PopulationConfig {
        &self.config
    }

    /// Bytes currently held by in-flight batch flushes
    pub fn memory(&self) -> &Arc<MemoryTracker> {
        &self.memory
    }

    /// Register one more index. Only allowed before `create()`.
    pub fn add_populator(
        &self,
        populator: Arc<dyn IndexPopulator>,
        descriptor: Arc<IndexDescriptor>,
        flipper: Arc<FlippableIndexProxy>,
        failed_factory: Arc<dyn FailedIndexProxyFactory>,
        user_description: &str,
    ) -> Result<Arc<IndexPopulation>> {
        if descriptor.schema().entity_type() != self.entity_type {
            return Err(IndexError::illegal_state(format!(
                "{user_description} indexes {:?} entities, this population scans {:?}",
                descriptor.schema().entity_type(),
                self.entity_type
            )));
        }
        if *self.controller.lock() != ControllerState::NotStarted {
            return Err(IndexError::illegal_state("population has already started"));
        }
        let population = Arc::new(IndexPopulation {
            populator,
            descriptor,
            flipper,
            failed_factory,
            user_description: user_description.to_string(),
            status: Mutex::new(PopulationStatus::Created),
            batch: Mutex::new(Vec::new()),
            populator_closed: AtomicBool::new(false),
            populator_lock: Mutex::new(()),
            tracker: UpdatesTracker::default(),
            done: Mutex::new(false),
            done_signal: Condvar::new(),
        });
        let added = Arc::clone(&population);
        self.populations.rcu(move |current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&added));
            next
        });
        Ok(population)
    }

    /// Populations that are still being built
    pub fn populations(&self) -> Arc<Vec<Arc<IndexPopulation>>> {
        self.populations.load_full()
    }

    pub fn has_populators(&self) -> bool {
        !self.populations.load().is_empty()
    }

    fn remove_population(&self, population: &Arc<IndexPopulation>) -> bool {
        let mut removed = false;
        self.populations.rcu(|current| {
            removed = current.iter().any(|p| Arc::ptr_eq(p, population));
            current
                .iter()
                .filter(|p| !Arc::ptr_eq(p, population))
                .cloned()
                .collect::<Vec<_>>()
        });
        removed
    }

    /// Create every index. Failures only affect their own index.
    pub fn create(&self) {
        {
            let mut controller = self.controller.lock();
            if *controller == ControllerState::NotStarted {
                *controller = ControllerState::Populating;
            }
        }
        for population in self.populations().iter() {
            let created = {
                let _guard = population.populator_lock.lock();
                if !population.is_active() {
                    continue;
                }
                info!(index = %population.user_description, "Index population started");
                population.populator.create()
            };
            match created {
                Ok(()) => {
                    population.transition(PopulationStatus::Populating);
                }
                Err(e) => self.fail(population, IndexPopulationFailure::from(&e)),
            }
        }
    }

    /// Build the store scan covering every registered index
    pub fn create_store_scan(self: &Arc<Self>) -> Arc<dyn StoreScan> {
        let populations = self.populations();
        let mut tokens: Vec<TokenId> = populations
            .iter()
            .flat_map(|p| p.schema().entity_tokens().iter().copied())
            .collect();
        tokens.sort_unstable();
        tokens.dedup();
        let keys: BTreeSet<PropertyKeyId> = populations
            .iter()
            .flat_map(|p| p.schema().property_keys().iter().copied())
            .collect();

        let weak = Arc::downgrade(self);
        let visitor = move |entities: &[EntityUpdates]| -> Result<bool> {
            match weak.upgrade() {
                Some(populator) => populator.add_scanned(entities),
                None => Ok(true),
            }
        };
        let scan: Arc<dyn StoreScan> = Arc::from(self.store_view.visit_entities(
            self.entity_type,
            &tokens,
            Arc::new(move |key: PropertyKeyId| keys.contains(&key)),
            Box::new(visitor),
            None,
            false,
        ));
        *self.store_scan.lock() = Some(Arc::clone(&scan));
        scan
    }

    /// Run the store scan to completion and flush what is left in the batches
    pub fn index_all_entities(self: &Arc<Self>) -> Result<()> {
        let scan = self.create_store_scan();
        scan.run(&**self)?;
        for (population, failure) in self.flush_all() {
            self.fail(&population, failure);
        }
        let populations = self.populations();
        for population in populations.iter() {
            population.tracker.notify_population_completed();
        }
        info!(
            indexes = populations.len(),
            queued = self.queued_updates(),
            progress = ?scan.progress(),
            "store scan completed"
        );
        Ok(())
    }

    /// Queue a committed change that raced the store scan
    pub fn queue_concurrent_update(&self, update: IndexEntryUpdate) {
        let size = update.rough_size();
        let mut queue = self.queue.lock();
        queue.push_back(update);
        self.queued_bytes.fetch_add(size, Ordering::AcqRel);
    }

    pub fn queued_updates(&self) -> usize {
        self.queue.lock().len()
    }

    /// Rough size of the queued updates
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Acquire)
    }

    /// Scan visitor: batch entries per index, flush full batches
    fn add_scanned(&self, entities: &[EntityUpdates]) -> Result<bool> {
        if *self.controller.lock() == ControllerState::Stopped {
            return Ok(true);
        }
        let mut work = Vec::new();
        for population in self.populations().iter() {
            if !population.is_active() {
                continue;
            }
            let schema = population.schema();
            let mut full = Vec::new();
            {
                let mut batch = population.batch.lock();
                for entity in entities {
                    if !schema.matches_tokens(entity.tokens_after()) {
                        continue;
                    }
                    for update in entity.for_indexes([schema]) {
                        population.populator.include_sample(&update);
                        batch.push(update);
                        if batch.len() >= self.config.batch_size {
                            full.push(std::mem::take(&mut *batch));
                        }
                    }
                }
            }
            if !full.is_empty() {
                work.push((Arc::clone(population), full));
            }
        }
        self.flush_batches(work);
        Ok(false)
    }

    /// Flush full batches, one task per index so each index sees its
    /// batches in scan order
    fn flush_batches(&self, work: Vec<(Arc<IndexPopulation>, Vec<Vec<IndexEntryUpdate>>)>) {
        if work.is_empty() {
            return;
        }
        let mut reservation = AggregatedReservation::new();
        for batch in work.iter().flat_map(|(_, batches)| batches) {
            let bytes = batch.iter().map(IndexEntryUpdate::rough_size).sum();
            reservation.add(Box::new(self.memory.reserve(bytes)));
        }
        let failures: PopulationFailures = work
            .into_par_iter()
            .filter_map(|(population, batches)| {
                for batch in batches {
                    if let Err(e) = self.flush(&population, batch) {
                        return Some((population, IndexPopulationFailure::from(&e)));
                    }
                }
                None
            })
            .collect();
        if let Err(e) = reservation.release() {
            warn!(error = %e, "failed to release batch memory");
        }
        for (population, failure) in failures {
            self.fail(&population, failure);
        }
    }

    fn flush(&self, population: &IndexPopulation, batch: Vec<IndexEntryUpdate>) -> Result<()> {
        if batch.is_empty() || !population.is_active() {
            return Ok(());
        }
        let entries = batch.len();
        let started = Instant::now();
        population.populator.add(batch)?;
        population.tracker.track_flush(entries, started.elapsed());
        if self.config.print_debug {
            debug!(index = %population.user_description, entries, "flushed batch");
        }
        Ok(())
    }

    /// Flush every partial batch. Failures are returned, not acted on.
    fn flush_all(&self) -> PopulationFailures {
        let work: Vec<(Arc<IndexPopulation>, Vec<IndexEntryUpdate>)> = self
            .populations()
            .iter()
            .filter(|p| p.is_active())
            .filter_map(|p| {
                let batch = p.take_batch();
                (!batch.is_empty()).then(|| (Arc::clone(p), batch))
            })
            .collect();
        work.into_par_iter()
            .filter_map(|(population, batch)| {
                self.flush(&population, batch)
                    .err()
                    .map(|e| (population, IndexPopulationFailure::from(&e)))
            })
            .collect()
    }

    /// Flush the batches, then apply queued updates for entities up to
    /// `cursor`. Failures are returned so callers holding a flip can
    /// decide how to route them.
    fn drain_queue(&self, cursor: EntityId) -> PopulationFailures {
        let failures = self.flush_all();
        let updates: Vec<IndexEntryUpdate> = {
            let mut queue = self.queue.lock();
            self.queued_bytes.store(0, Ordering::Release);
            queue.drain(..).collect()
        };
        if updates.is_empty() {
            return failures;
        }
        debug!(count = updates.len(), cursor, "applying queued concurrent updates");

        let scan = self.store_scan.lock().clone();
        let populations = self.populations();
        let mut updater = MultipleIndexUpdater::new(Arc::clone(&self.property_accessor), failures);
        for update in updates {
            let population = populations
                .iter()
                .find(|p| p.schema() == update.schema() && p.is_active());
            if let Some(population) = population {
                updater.process(population, update, cursor, scan.as_deref());
            }
        }
        updater.close()
    }

    /// Flip every remaining population to its target proxy
    pub fn flip_after_population(&self, verify_before_flipping: bool) {
        for population in self.populations().iter() {
            if !population.is_active() {
                continue;
            }
            if let Err(e) = population.populator.scan_completed() {
                self.fail(population, IndexPopulationFailure::from(&e));
                continue;
            }
            let mut deferred = Vec::new();
            let outcome = population.flipper.flip(
                || self.flip_population(population, verify_before_flipping, &mut deferred),
                population.failed_factory.as_ref(),
            );
            match outcome {
                Ok(FlipOutcome::Flipped) => {
                    self.remove_population(population);
                    info!(
                        index = %population.user_description,
                        updates = ?population.tracker.snapshot(),
                        "Index population completed"
                    );
                    population.signal_done();
                }
                Ok(FlipOutcome::Failed(failure)) => self.after_failed_flip(population, failure),
                Ok(FlipOutcome::Cancelled) => {
                    debug!(index = %population.user_description, "population cancelled before the flip");
                    self.remove_population(population);
                    population.signal_done();
                }
                Err(e) => {
                    // Closed or dropped underneath us
                    warn!(index = %population.user_description, error = %e, "index was not flipped");
                    let _guard = population.populator_lock.lock();
                    if population.transition(PopulationStatus::Cancelled) {
                        if let Err(e) = population.close_populator(false) {
                            error!(index = %population.user_description, error = %e, "Unable to close populator");
                        }
                    }
                    self.remove_population(population);
                    population.signal_done();
                }
            }
            for (other, failure) in deferred {
                self.fail(&other, failure);
            }
        }
    }

    /// Runs under the flip lock of `population`, then its populator lock
    fn flip_population(
        &self,
        population: &Arc<IndexPopulation>,
        verify_before_flipping: bool,
        deferred: &mut PopulationFailures,
    ) -> Result<bool> {
        let _guard = population.populator_lock.lock();
        if !population.is_active() {
            return population.inactive_flip();
        }
        let mut own_failure = None;
        for (failed, failure) in self.drain_queue(EntityId::MAX) {
            if Arc::ptr_eq(&failed, population) {
                own_failure = Some(failure);
            } else {
                deferred.push((failed, failure));
            }
        }
        if let Some(failure) = own_failure {
            return Err(IndexError::PopulationFailed {
                index: population.user_description.clone(),
                failure,
            });
        }
        if verify_before_flipping {
            population
                .populator
                .verify_deferred_constraints(self.property_accessor.as_ref())?;
        }
        let sample = population.populator.sample_result()?;
        if !population.transition(PopulationStatus::Flipped) {
            return population.inactive_flip();
        }
        self.store_view
            .replace_index_counts(population.descriptor.id(), sample.unique_values, sample.index_size, 0);
        population.close_populator(true)?;
        self.schema_state.clear();
        Ok(true)
    }

    fn after_failed_flip(&self, population: &Arc<IndexPopulation>, failure: IndexPopulationFailure) {
        self.remove_population(population);
        population.take_batch();
        if population.mark_failed(failure.clone(), true) {
            error!(index = %population.user_description, failure = %failure, "Failed to populate index");
            self.finish_failed(population, &failure);
        } else {
            population.signal_done();
        }
    }

    /// Fail one population: flip it to its failed proxy, persist the
    /// failure, close its populator. Sibling populations are untouched.
    pub fn fail(&self, population: &Arc<IndexPopulation>, failure: IndexPopulationFailure) {
        if !population.mark_failed(failure.clone(), false) {
            return;
        }
        self.remove_population(population);
        population.take_batch();
        error!(index = %population.user_description, failure = %failure, "Failed to populate index");
        let failed = population.failed_factory.create(failure.clone());
        if let Err(e) = population.flipper.flip_to(failed) {
            warn!(index = %population.user_description, error = %e, "could not flip to failed proxy");
        }
        self.finish_failed(population, &failure);
    }

    fn finish_failed(&self, population: &IndexPopulation, failure: &IndexPopulationFailure) {
        let _guard = population.populator_lock.lock();
        if let Err(e) = population.populator.mark_as_failed(&failure.as_string()) {
            error!(index = %population.user_description, error = %e, "Unable to persist index failure");
        }
        if let Err(e) = population.close_populator(false) {
            error!(index = %population.user_description, error = %e, "Unable to close failed populator");
        }
        population.signal_done();
    }

    /// Stop populating one index without flipping or failing it.
    /// Its populator is closed as not populated and its counts reset.
    pub fn cancel_index_population(&self, population: &Arc<IndexPopulation>) {
        let _guard = population.populator_lock.lock();
        if !population.transition(PopulationStatus::Cancelled) {
            return;
        }
        self.remove_population(population);
        population.take_batch();
        if let Err(e) = population.close_populator(false) {
            error!(index = %population.user_description, error = %e, "Unable to close populator");
        }
        self.store_view.replace_index_counts(population.descriptor.id(), 0, 0, 0);
        population.signal_done();
    }

    pub fn stop_population(&self, population: &Arc<IndexPopulation>) {
        self.cancel_index_population(population);
    }

    /// Stop populating one index and drop everything it built
    pub fn drop_index_population(&self, population: &Arc<IndexPopulation>) {
        let _guard = population.populator_lock.lock();
        if !population.transition(PopulationStatus::Cancelled) {
            return;
        }
        self.remove_population(population);
        population.take_batch();
        population.populator_closed.store(true, Ordering::Release);
        if let Err(e) = population.populator.drop_index() {
            error!(index = %population.user_description, error = %e, "Unable to drop populator");
        }
        population.signal_done();
    }

    /// Make a running scan return as soon as possible
    pub fn stop_scan(&self) {
        *self.controller.lock() = ControllerState::Stopped;
        if let Some(scan) = self.store_scan.lock().as_ref() {
            scan.stop();
        }
    }

    /// Stop everything. Indexes stay populating and get rebuilt later.
    pub fn stop(&self) {
        self.stop_scan();
        for population in self.populations().iter() {
            self.cancel_index_population(population);
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.controller.lock() == ControllerState::Stopped
    }

    /// Fail every remaining population and reset their counts
    pub fn cancel(&self, failure: IndexPopulationFailure) {
        let populations = self.populations();
        for population in populations.iter() {
            self.fail(population, failure.clone());
        }
        for population in populations.iter() {
            self.store_view.replace_index_counts(population.descriptor.id(), 0, 0, 0);
        }
    }

    /// Terminal close of every populator that is still registered
    pub fn close(&self, success: bool) {
        for population in self.populations().iter() {
            {
                let _guard = population.populator_lock.lock();
                population.transition(PopulationStatus::Cancelled);
                if let Err(e) = population.close_populator(success) {
                    error!(index = %population.user_description, error = %e, "Unable to close populator");
                }
            }
            self.remove_population(population);
            population.signal_done();
        }
    }

    pub fn reset_index_counts(&self) {
        for population in self.populations().iter() {
            self.store_view.replace_index_counts(population.descriptor.id(), 0, 0, 0);
        }
    }

    pub fn progress(&self, population: &IndexPopulation) -> PopulationProgress {
        let scan_progress = match self.store_scan.lock().as_ref() {
            Some(scan) => scan.progress(),
            None => PopulationProgress::NONE,
        };
        population.populator.progress(scan_progress)
    }
}

impl ExternalUpdatesCheck for MultipleIndexPopulator {
    fn need_to_apply_external_updates(&self) -> bool {
        let queued = self.queue.lock().len();
        queued > 0
            && (queued >= self.config.queue_threshold
                || self.queued_bytes.load(Ordering::Acquire) >= self.config.batch_max_bytes)
    }

    fn apply_external_updates(&self, current_entity_id: EntityId) -> Result<()> {
        for (population, failure) in self.drain_queue(current_entity_id) {
            self.fail(&population, failure);
        }
        Ok(())
    }
}

/// Routes queued updates to one populating updater per index.
/// A failing index has its updater closed and gets no further updates.
struct MultipleIndexUpdater {
    accessor: Arc<dyn PropertyAccessor>,
    updaters: Vec<(Arc<IndexPopulation>, Box<dyn IndexUpdater>)>,
    failures: PopulationFailures,
}

impl MultipleIndexUpdater {
    fn new(accessor: Arc<dyn PropertyAccessor>, failures: PopulationFailures) -> Self {
        Self {
            accessor,
            updaters: Vec::new(),
            failures,
        }
    }

    fn process(
        &mut self,
        population: &Arc<IndexPopulation>,
        update: IndexEntryUpdate,
        cursor: EntityId,
        scan: Option<&dyn StoreScan>,
    ) {
        if self.failures.iter().any(|(p, _)| Arc::ptr_eq(p, population)) {
            return;
        }
        let slot = match self.updaters.iter().position(|(p, _)| Arc::ptr_eq(p, population)) {
            Some(slot) => slot,
            None => match population.populator.new_populating_updater(Arc::clone(&self.accessor)) {
                Ok(updater) => {
                    self.updaters.push((Arc::clone(population), updater));
                    self.updaters.len() - 1
                }
                Err(e) => {
                    self.failures.push((Arc::clone(population), IndexPopulationFailure::from(&e)));
                    return;
                }
            },
        };
        if update.entity_id() > cursor {
            return;
        }
        population.populator.include_sample(&update);
        let updater = self.updaters[slot].1.as_mut();
        let result = match scan {
            Some(scan) => scan.accept_update(updater, update, cursor),
            None => updater.process(update),
        };
        if let Err(e) = result {
            let (population, mut updater) = self.updaters.swap_remove(slot);
            if let Err(close_error) = updater.close() {
                warn!(index = %population.user_description, error = %close_error, "failed to close updater");
            }
            self.failures.push((population, IndexPopulationFailure::from(&e)));
        }
    }

    fn close(mut self) -> PopulationFailures {
        for (population, mut updater) in std::mem::take(&mut self.updaters) {
            if let Err(e) = updater.close() {
                self.failures.push((population, IndexPopulationFailure::from(&e)));
            }
        }
        self.failures
    }
}
