use std::sync::Arc;
use std::time::Duration;

use super::IndexProxy;
use crate::error::{IndexError, IndexPopulationFailure, Result};
use crate::index::{IndexPopulator, IndexReader, IndexUpdater, SwallowingIndexUpdater};
use crate::types::{IndexDescriptor, IndexState, IndexUpdateMode, PopulationProgress};

/// Terminal proxy of an index whose population failed.
///
/// Updates are swallowed; the index only supports being dropped.
pub struct FailedIndexProxy {
    descriptor: Arc<IndexDescriptor>,
    populator: Arc<dyn IndexPopulator>,
    failure: IndexPopulationFailure,
}

impl FailedIndexProxy {
    pub fn new(
        descriptor: Arc<IndexDescriptor>,
        populator: Arc<dyn IndexPopulator>,
        failure: IndexPopulationFailure,
    ) -> Self {
        Self {
            descriptor,
            populator,
            failure,
        }
    }

    fn failure_error(&self) -> IndexError {
        IndexError::PopulationFailed {
            index: self.descriptor.user_description(),
            failure: self.failure.clone(),
        }
    }
}

impl IndexProxy for FailedIndexProxy {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn new_updater(&self, _mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater>> {
        Ok(Box::new(SwallowingIndexUpdater))
    }

    fn drop_index(&self) -> Result<()> {
        self.populator.drop_index()
    }

    fn close(&self) -> Result<()> {
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
        IndexState::Failed
    }

    fn population_failure(&self) -> Option<IndexPopulationFailure> {
        Some(self.failure.clone())
    }

    fn activate(&self) -> Result<()> {
        Err(self.failure_error())
    }

    fn validate(&self) -> Result<()> {
        Err(self.failure_error())
    }

    fn new_reader(&self) -> Result<Box<dyn IndexReader>> {
        Err(self.failure_error())
    }

    fn await_store_scan_completed(&self, _timeout: Duration) -> Result<bool> {
        Err(self.failure_error())
    }

    fn index_population_progress(&self) -> PopulationProgress {
        PopulationProgress::NONE
    }
}
