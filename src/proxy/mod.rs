//! Index Proxies
//!
//! An `IndexProxy` is the current behavior of one index. Concrete proxies:
//! - `PopulatingIndexProxy`: updates are queued into the running population
//! - `OnlineIndexProxy`: wraps an `IndexAccessor`
//! - `FailedIndexProxy`: swallows updates, reports the population failure
//! - `TentativeConstraintIndexProxy`: constraint index waiting for activation
//!
//! `FlippableIndexProxy` swaps between them exactly once (populating to its
//! terminal proxy) and `ContractCheckingIndexProxy` enforces the lifecycle
//! contract in front of everything else.
//!
//! States only move forward:
//! ```text
//! Populating -> Online
//!            -> Failed
//!            -> Tentative -> Online
//! ```

mod contract;
mod failed;
mod flippable;
mod online;
mod populating;
mod tentative;

pub use contract::ContractCheckingIndexProxy;
pub use failed::FailedIndexProxy;
pub use flippable::{FlipOutcome, FlippableIndexProxy};
pub use online::OnlineIndexProxy;
pub use populating::PopulatingIndexProxy;
pub use tentative::TentativeConstraintIndexProxy;

use std::sync::Arc;
use std::time::Duration;

use crate::error::{IndexPopulationFailure, Result};
use crate::index::{IndexReader, IndexUpdater};
use crate::types::{IndexDescriptor, IndexState, IndexUpdateMode, PopulationProgress};

/// Uniform interface over every index state
pub trait IndexProxy: Send + Sync {
    fn start(&self) -> Result<()>;

    fn new_updater(&self, mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater>>;

    /// Remove the index and all its data
    fn drop_index(&self) -> Result<()>;

    /// Release resources, keeping the index data
    fn close(&self) -> Result<()>;

    fn force(&self) -> Result<()>;

    fn refresh(&self) -> Result<()>;

    fn descriptor(&self) -> Arc<IndexDescriptor>;

    fn state(&self) -> IndexState;

    fn population_failure(&self) -> Option<IndexPopulationFailure>;

    /// Promote a tentative constraint index to online
    fn activate(&self) -> Result<()>;

    /// Check that the index can back its constraint
    fn validate(&self) -> Result<()>;

    fn new_reader(&self) -> Result<Box<dyn IndexReader>>;

    /// Block until the store scan that populates this index has completed.
    ///
    /// `Ok(true)` once the index is online (or tentative), `Ok(false)` if the
    /// wait timed out or the index went away, an error if population failed.
    fn await_store_scan_completed(&self, timeout: Duration) -> Result<bool>;

    fn index_population_progress(&self) -> PopulationProgress;
}

/// Creates the proxy an index flips to after a successful population
pub trait IndexProxyFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn IndexProxy>>;
}

impl<F> IndexProxyFactory for F
where
    F: Fn() -> Result<Arc<dyn IndexProxy>> + Send + Sync,
{
    fn create(&self) -> Result<Arc<dyn IndexProxy>> {
        self()
    }
}

/// Creates the terminal proxy of an index whose population failed
pub trait FailedIndexProxyFactory: Send + Sync {
    fn create(&self, failure: IndexPopulationFailure) -> Arc<dyn IndexProxy>;
}

impl<F> FailedIndexProxyFactory for F
where
    F: Fn(IndexPopulationFailure) -> Arc<dyn IndexProxy> + Send + Sync,
{
    fn create(&self, failure: IndexPopulationFailure) -> Arc<dyn IndexProxy> {
        self(failure)
    }
}
