use std::sync::Arc;
use std::time::Duration;

use super::IndexProxy;
use crate::error::{IndexPopulationFailure, Result};
use crate::index::{IndexAccessor, IndexReader, IndexUpdater};
use crate::types::{IndexDescriptor, IndexState, IndexUpdateMode, PopulationProgress};

/// Online index backed by an accessor
pub struct OnlineIndexProxy {
    descriptor: Arc<IndexDescriptor>,
    accessor: Arc<dyn IndexAccessor>,
}

impl OnlineIndexProxy {
    pub fn new(descriptor: Arc<IndexDescriptor>, accessor: Arc<dyn IndexAccessor>) -> Self {
        Self { descriptor, accessor }
    }

    pub fn accessor(&self) -> &Arc<dyn IndexAccessor> {
        &self.accessor
    }
}

impl IndexProxy for OnlineIndexProxy {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn new_updater(&self, mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater>> {
        self.accessor.new_updater(mode)
    }

    fn drop_index(&self) -> Result<()> {
        self.accessor.drop_index()
    }

    fn close(&self) -> Result<()> {
        self.accessor.close()
    }

    fn force(&self) -> Result<()> {
        self.accessor.force()
    }

    fn refresh(&self) -> Result<()> {
        self.accessor.refresh()
    }

    fn descriptor(&self) -> Arc<IndexDescriptor> {
        Arc::clone(&self.descriptor)
    }

    fn state(&self) -> IndexState {
        IndexState::Online
    }

    fn population_failure(&self) -> Option<IndexPopulationFailure> {
        None
    }

    fn activate(&self) -> Result<()> {
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn new_reader(&self) -> Result<Box<dyn IndexReader>> {
        self.accessor.new_reader()
    }

    fn await_store_scan_completed(&self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    fn index_population_progress(&self) -> PopulationProgress {
        PopulationProgress::DONE
    }
}
