use std::sync::Arc;
use std::time::Duration;

use super::IndexProxy;
use crate::error::{IndexError, IndexPopulationFailure, Result};
use crate::index::{IndexReader, IndexUpdater};
use crate::populate::{IndexPopulation, IndexPopulationJob};
use crate::types::{IndexDescriptor, IndexEntryUpdate, IndexState, IndexUpdateMode, PopulationProgress};

/// Index while its store scan runs. Updates go to the job's concurrent queue.
pub struct PopulatingIndexProxy {
    descriptor: Arc<IndexDescriptor>,
    job: Arc<IndexPopulationJob>,
    population: Arc<IndexPopulation>,
}

impl PopulatingIndexProxy {
    pub fn new(descriptor: Arc<IndexDescriptor>, job: Arc<IndexPopulationJob>, population: Arc<IndexPopulation>) -> Self {
        Self {
            descriptor,
            job,
            population,
        }
    }
}

impl IndexProxy for PopulatingIndexProxy {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn new_updater(&self, _mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater>> {
        Ok(Box::new(QueueingUpdater {
            job: Arc::clone(&self.job),
            population: Arc::clone(&self.population),
        }))
    }

    fn drop_index(&self) -> Result<()> {
        self.job.drop_population(&self.population);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.job.stop_population(&self.population);
        Ok(())
    }

    fn force(&self) -> Result<()> {
        Ok(())
    }

    fn refresh(&self) -> Result<()> {
        Ok(())
    }

    fn descriptor(&self) -> Arc<IndexDescriptor> {
        Arc::clone(&self.descriptor)
    }

    fn state(&self) -> IndexState {
        IndexState::Populating
    }

    fn population_failure(&self) -> Option<IndexPopulationFailure> {
        None
    }

    fn activate(&self) -> Result<()> {
        Err(IndexError::illegal_state(format!(
            "cannot activate {} while it is populating",
            self.descriptor.user_description()
        )))
    }

    fn validate(&self) -> Result<()> {
        Err(IndexError::illegal_state(format!(
            "cannot validate {} while it is populating",
            self.descriptor.user_description()
        )))
    }

    fn new_reader(&self) -> Result<Box<dyn IndexReader>> {
        Err(IndexError::NotOnline {
            index: self.descriptor.id(),
            state: IndexState::Populating,
        })
    }

    fn await_store_scan_completed(&self, timeout: Duration) -> Result<bool> {
        Ok(self.population.await_done(timeout))
    }

    fn index_population_progress(&self) -> PopulationProgress {
        self.job.progress(&self.population)
    }
}

struct QueueingUpdater {
    job: Arc<IndexPopulationJob>,
    population: Arc<IndexPopulation>,
}

impl IndexUpdater for QueueingUpdater {
    fn process(&mut self, update: IndexEntryUpdate) -> Result<()> {
        self.population.tracker().track(&update);
        self.job.update(update);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
