//! Index Population Job
//!
//! One scheduled unit of population work around a `MultipleIndexPopulator`:
//! create, reset counts, scan, then flip (or stop), and always close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::error;

use super::{IndexPopulation, MultipleIndexPopulator};
use crate::error::{IndexPopulationFailure, Result};
use crate::index::IndexPopulator;
use crate::proxy::{FailedIndexProxyFactory, FlippableIndexProxy};
use crate::types::{IndexDescriptor, IndexEntryUpdate, PopulationProgress};

pub struct IndexPopulationJob {
    populator: Arc<MultipleIndexPopulator>,
    verify_before_flipping: bool,
    stopped: AtomicBool,
    done: Mutex<bool>,
    done_signal: Condvar,
}

impl IndexPopulationJob {
    pub fn new(populator: MultipleIndexPopulator, verify_before_flipping: bool) -> Self {
        Self {
            populator: Arc::new(populator),
            verify_before_flipping,
            stopped: AtomicBool::new(false),
            done: Mutex::new(false),
            done_signal: Condvar::new(),
        }
    }

    pub fn populator(&self) -> &Arc<MultipleIndexPopulator> {
        &self.populator
    }

    pub fn add_populator(
        &self,
        populator: Arc<dyn IndexPopulator>,
        descriptor: Arc<IndexDescriptor>,
        flipper: Arc<FlippableIndexProxy>,
        failed_factory: Arc<dyn FailedIndexProxyFactory>,
    ) -> Result<Arc<IndexPopulation>> {
        let description = descriptor.user_description();
        self.populator
            .add_populator(populator, descriptor, flipper, failed_factory, &description)
    }

    /// Blocking. Populates every registered index.
    ///
    /// A failure of the store scan fails all populations of this job and
    /// is returned; failures of single indexes are not.
    pub fn run(&self) -> Result<()> {
        let result = self.populate();
        if let Err(e) = &result {
            error!(error = %e, "Failed to populate index batch");
            self.populator.cancel(IndexPopulationFailure::from(e));
        }
        self.populator.close(false);
        self.signal_done();
        result
    }

    fn populate(&self) -> Result<()> {
        if !self.populator.has_populators() {
            return Ok(());
        }
        self.populator.create();
        self.populator.reset_index_counts();
        if self.is_stopped() {
            self.populator.stop();
            return Ok(());
        }
        self.populator.index_all_entities()?;
        if self.is_stopped() {
            self.populator.stop();
        } else {
            self.populator.flip_after_population(self.verify_before_flipping);
        }
        Ok(())
    }

    /// Ask a running job to stop; remaining indexes stay populating
    pub fn cancel(&self) {
        self.stopped.store(true, Ordering::Release);
        self.populator.stop_scan();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn stop_population(&self, population: &Arc<IndexPopulation>) {
        self.populator.stop_population(population);
        self.cancel_if_empty();
    }

    pub fn drop_population(&self, population: &Arc<IndexPopulation>) {
        self.populator.drop_index_population(population);
        self.cancel_if_empty();
    }

    fn cancel_if_empty(&self) {
        if !self.populator.has_populators() {
            self.cancel();
        }
    }

    /// Queue a concurrent update for the running scan
    pub fn update(&self, update: IndexEntryUpdate) {
        self.populator.queue_concurrent_update(update);
    }

    pub fn progress(&self, population: &IndexPopulation) -> PopulationProgress {
        self.populator.progress(population)
    }

    pub fn await_completion(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if !*done {
            self.done_signal.wait_while_for(&mut done, |done: &mut bool| !*done, timeout);
        }
        *done
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock()
    }

    fn signal_done(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.done_signal.notify_all();
    }
}
