//! Flippable index proxy
//!
//! Holds the current delegate behind a `parking_lot::RwLock`. Ordinary calls
//! run under the read lock; `flip`, `flip_to`, `close` and `drop_index` take
//! the write lock, so they wait for each other and for every open updater.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{ArcRwLockReadGuard, RawRwLock, RwLock};
use tracing::{debug, warn};

use super::{FailedIndexProxyFactory, IndexProxy, IndexProxyFactory};
use crate::error::{IndexError, IndexPopulationFailure, Result};
use crate::index::{IndexReader, IndexUpdater};
use crate::types::{IndexDescriptor, IndexEntryUpdate, IndexState, IndexUpdateMode, PopulationProgress};

/// Result of a completed flip
#[derive(Debug, Clone, PartialEq)]
pub enum FlipOutcome {
    /// The delegate is now the flip target
    Flipped,
    /// The flip action failed; the delegate is now the failed proxy
    Failed(IndexPopulationFailure),
    /// The population was cancelled; the delegate is unchanged
    Cancelled,
}

struct FlipState {
    delegate: Option<Arc<dyn IndexProxy>>,
    flip_target: Option<Arc<dyn IndexProxyFactory>>,
    started: bool,
    closed: bool,
    flipped: bool,
}

pub struct FlippableIndexProxy {
    descriptor: Arc<IndexDescriptor>,
    state: Arc<RwLock<FlipState>>,
}

fn same_proxy(a: &Arc<dyn IndexProxy>, b: &Arc<dyn IndexProxy>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl FlippableIndexProxy {
    /// Proxy without a delegate yet; call `flip_to` before use
    pub fn new(descriptor: Arc<IndexDescriptor>) -> Self {
        Self {
            descriptor,
            state: Arc::new(RwLock::new(FlipState {
                delegate: None,
                flip_target: None,
                started: false,
                closed: false,
                flipped: false,
            })),
        }
    }

    pub fn with_delegate(descriptor: Arc<IndexDescriptor>, delegate: Arc<dyn IndexProxy>) -> Self {
        let proxy = Self::new(descriptor);
        proxy.state.write().delegate = Some(delegate);
        proxy
    }

    /// Factory used by the next `flip`. Last call wins.
    pub fn set_flip_target(&self, target: Arc<dyn IndexProxyFactory>) {
        self.state.write().flip_target = Some(target);
    }

    /// Flip exactly once.
    ///
    /// `action` runs under the write lock. If it returns `Ok(true)` the
    /// delegate becomes the flip target; if it returns `Ok(false)`, fails, or
    /// the target can't be created, the delegate becomes the failed proxy.
    /// Fails without running `action` if the proxy is closed or already flipped.
    /// An action failing with `PopulationCancelled` leaves the delegate as it is.
    pub fn flip<F>(&self, action: F, failed: &dyn FailedIndexProxyFactory) -> Result<FlipOutcome>
    where
        F: FnOnce() -> Result<bool>,
    {
        let mut state = self.state.write();
        if state.closed {
            return Err(IndexError::illegal_state(format!(
                "{} is already closed",
                self.descriptor.user_description()
            )));
        }
        if state.flipped {
            return Err(IndexError::illegal_state(format!(
                "{} has already been flipped",
                self.descriptor.user_description()
            )));
        }
        state.flipped = true;

        let decision = action();
        if let Err(IndexError::PopulationCancelled(index)) = &decision {
            debug!(index = %index, "flip skipped, population cancelled");
            state.flipped = false;
            return Ok(FlipOutcome::Cancelled);
        }
        let target = match decision {
            Ok(true) => match state.flip_target.as_ref() {
                Some(factory) => factory.create(),
                None => Err(IndexError::illegal_state("no flip target")),
            },
            Ok(false) => Err(IndexError::illegal_state("population is no longer active")),
            Err(e) => Err(e),
        };
        let (proxy, outcome) = match target {
            Ok(proxy) => (proxy, FlipOutcome::Flipped),
            Err(e) => {
                let failure = IndexPopulationFailure::from(&e);
                (failed.create(failure.clone()), FlipOutcome::Failed(failure))
            }
        };
        if state.started {
            if let Err(e) = proxy.start() {
                warn!(index = %self.descriptor.user_description(), error = %e, "failed to start flipped proxy");
            }
        }
        debug!(index = %self.descriptor.user_description(), state = ?proxy.state(), "flipped");
        state.delegate = Some(proxy);
        Ok(outcome)
    }

    /// Swap the delegate directly. Never returns to populating once left.
    pub fn flip_to(&self, proxy: Arc<dyn IndexProxy>) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(IndexError::illegal_state(format!(
                "{} is already closed",
                self.descriptor.user_description()
            )));
        }
        let target_state = proxy.state();
        if let Some(current) = state.delegate.as_ref() {
            if current.state() != IndexState::Populating && target_state == IndexState::Populating {
                return Err(IndexError::illegal_state(format!(
                    "{} can't go back to populating",
                    self.descriptor.user_description()
                )));
            }
        }
        if state.started {
            proxy.start()?;
        }
        if target_state != IndexState::Populating {
            state.flipped = true;
        }
        state.delegate = Some(proxy);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state.read_recursive().closed
    }

    fn snapshot(&self) -> Result<Arc<dyn IndexProxy>> {
        self.state
            .read_recursive()
            .delegate
            .clone()
            .ok_or_else(|| IndexError::illegal_state("index proxy has no delegate"))
    }

    /// Run `f` against the delegate while holding the read lock
    fn with_current<T>(&self, f: impl FnOnce(&Arc<dyn IndexProxy>) -> Result<T>) -> Result<T> {
        let state = self.state.read_recursive();
        match state.delegate.as_ref() {
            Some(delegate) => f(delegate),
            None => Err(IndexError::illegal_state("index proxy has no delegate")),
        }
    }
}

impl IndexProxy for FlippableIndexProxy {
    fn start(&self) -> Result<()> {
        let mut state = self.state.write();
        if let Some(delegate) = state.delegate.as_ref() {
            delegate.start()?;
        }
        state.started = true;
        Ok(())
    }

    fn new_updater(&self, mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater>> {
        let guard = self.state.read_arc();
        let inner = match guard.delegate.as_ref() {
            Some(delegate) => delegate.new_updater(mode)?,
            None => return Err(IndexError::illegal_state("index proxy has no delegate")),
        };
        Ok(Box::new(LockingIndexUpdater {
            inner,
            guard: Some(guard),
        }))
    }

    fn drop_index(&self) -> Result<()> {
        let mut state = self.state.write();
        state.closed = true;
        match state.delegate.as_ref() {
            Some(delegate) => delegate.drop_index(),
            None => Ok(()),
        }
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        state.closed = true;
        match state.delegate.as_ref() {
            Some(delegate) => delegate.close(),
            None => Ok(()),
        }
    }

    fn force(&self) -> Result<()> {
        self.with_current(|d| d.force())
    }

    fn refresh(&self) -> Result<()> {
        self.with_current(|d| d.refresh())
    }

    fn descriptor(&self) -> Arc<IndexDescriptor> {
        Arc::clone(&self.descriptor)
    }

    fn state(&self) -> IndexState {
        self.with_current(|d| Ok(d.state())).unwrap_or(IndexState::Populating)
    }

    fn population_failure(&self) -> Option<IndexPopulationFailure> {
        self.with_current(|d| Ok(d.population_failure())).ok().flatten()
    }

    fn activate(&self) -> Result<()> {
        // Tentative activation flips this proxy, so it must run outside the lock
        let delegate = self.snapshot()?;
        delegate.activate()
    }

    fn validate(&self) -> Result<()> {
        self.with_current(|d| d.validate())
    }

    fn new_reader(&self) -> Result<Box<dyn IndexReader>> {
        self.with_current(|d| d.new_reader())
    }

    fn await_store_scan_completed(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let (delegate, closed) = {
                let state = self.state.read_recursive();
                (state.delegate.clone(), state.closed)
            };
            let Some(delegate) = delegate else { return Ok(false) };
            if closed {
                return Ok(false);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !delegate.await_store_scan_completed(remaining)? {
                return Ok(false);
            }
            let state = self.state.read_recursive();
            if state.closed {
                return Ok(false);
            }
            match state.delegate.as_ref() {
                Some(current) if same_proxy(current, &delegate) => {
                    return Ok(delegate.state() != IndexState::Populating);
                }
                // Flipped while we waited; ask the new delegate
                _ => continue,
            }
        }
    }

    fn index_population_progress(&self) -> PopulationProgress {
        self.with_current(|d| Ok(d.index_population_progress()))
            .unwrap_or(PopulationProgress::NONE)
    }
}

/// Updater holding the flip read lock until closed, so a flip never lands
/// between two updates of the same batch.
struct LockingIndexUpdater {
    inner: Box<dyn IndexUpdater>,
    guard: Option<ArcRwLockReadGuard<RawRwLock, FlipState>>,
}

impl IndexUpdater for LockingIndexUpdater {
    fn process(&mut self, update: IndexEntryUpdate) -> Result<()> {
        if self.guard.is_none() {
            return Err(IndexError::illegal_state("updater is closed"));
        }
        self.inner.process(update)
    }

    fn close(&mut self) -> Result<()> {
        let result = self.inner.close();
        self.guard.take();
        result
    }
}
