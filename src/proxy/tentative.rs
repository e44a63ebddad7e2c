use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use super::{FlippableIndexProxy, IndexProxy};
use crate::error::{IndexError, IndexPopulationFailure, Result};
use crate::index::{IndexReader, IndexUpdater};
use crate::types::{IndexDescriptor, IndexEntryUpdate, IndexState, IndexUpdateMode, PopulationProgress};

/// Populated uniqueness index whose constraint has not committed yet.
///
/// Online updates are applied to the target but uniqueness conflicts are
/// collected instead of failing the writer. `activate()` flips to the target
/// if no conflict was seen.
pub struct TentativeConstraintIndexProxy {
    flipper: Weak<FlippableIndexProxy>,
    target: Arc<dyn IndexProxy>,
    conflicts: Arc<Mutex<Vec<String>>>,
}

impl TentativeConstraintIndexProxy {
    pub fn new(flipper: Weak<FlippableIndexProxy>, target: Arc<dyn IndexProxy>) -> Self {
        Self {
            flipper,
            target,
            conflicts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn conflict_error(&self) -> Option<IndexError> {
        let conflicts = self.conflicts.lock();
        if conflicts.is_empty() {
            return None;
        }
        Some(IndexError::ActivationFailed {
            index: self.target.descriptor().id(),
            reason: conflicts.join("; "),
        })
    }
}

impl IndexProxy for TentativeConstraintIndexProxy {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn new_updater(&self, mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater>> {
        let inner = self.target.new_updater(mode)?;
        match mode {
            IndexUpdateMode::Online | IndexUpdateMode::OnlineIdempotent => Ok(Box::new(ConflictCollectingUpdater {
                inner,
                conflicts: Arc::clone(&self.conflicts),
            })),
            IndexUpdateMode::Recovery => Ok(inner),
        }
    }

    fn drop_index(&self) -> Result<()> {
        self.target.drop_index()
    }

    fn close(&self) -> Result<()> {
        self.target.close()
    }

    fn force(&self) -> Result<()> {
        self.target.force()
    }

    fn refresh(&self) -> Result<()> {
        self.target.refresh()
    }

    fn descriptor(&self) -> Arc<IndexDescriptor> {
        self.target.descriptor()
    }

    fn state(&self) -> IndexState {
        if self.conflicts.lock().is_empty() {
            IndexState::Tentative
        } else {
            IndexState::Failed
        }
    }

    fn population_failure(&self) -> Option<IndexPopulationFailure> {
        self.conflict_error().map(|e| IndexPopulationFailure::from(&e))
    }

    fn activate(&self) -> Result<()> {
        if let Some(error) = self.conflict_error() {
            return Err(error);
        }
        let flipper = self
            .flipper
            .upgrade()
            .ok_or_else(|| IndexError::illegal_state("index proxy is gone"))?;
        flipper.flip_to(Arc::clone(&self.target))
    }

    fn validate(&self) -> Result<()> {
        match self.conflict_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn new_reader(&self) -> Result<Box<dyn IndexReader>> {
        Err(IndexError::NotOnline {
            index: self.target.descriptor().id(),
            state: IndexState::Tentative,
        })
    }

    fn await_store_scan_completed(&self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    fn index_population_progress(&self) -> PopulationProgress {
        PopulationProgress::DONE
    }
}

struct ConflictCollectingUpdater {
    inner: Box<dyn IndexUpdater>,
    conflicts: Arc<Mutex<Vec<String>>>,
}

impl IndexUpdater for ConflictCollectingUpdater {
    fn process(&mut self, update: IndexEntryUpdate) -> Result<()> {
        match self.inner.process(update) {
            Err(e @ IndexError::EntryConflict { .. }) => {
                warn!(error = %e, "uniqueness conflict on tentative index");
                self.conflicts.lock().push(e.to_string());
                Ok(())
            }
            other => other,
        }
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}
