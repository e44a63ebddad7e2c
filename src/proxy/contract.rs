//! Lifecycle contract enforcement
//!
//! ```text
//! Init --start()--> Starting --> Started --close()/drop_index()--> Closed
//! ```
//! - `start` only from `Init`, exactly once
//! - updaters, `force` and `refresh` need `Started` (they wait out `Starting`)
//! - `close` / `drop_index` wait for `start` to finish and for every open
//!   call and updater to complete, then run exactly once

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::IndexProxy;
use crate::error::{IndexError, IndexPopulationFailure, Result};
use crate::index::{IndexReader, IndexUpdater};
use crate::types::{IndexDescriptor, IndexEntryUpdate, IndexState, IndexUpdateMode, PopulationProgress};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Lifecycle {
    Init,
    Starting,
    Started,
    Closed,
}

struct Contract {
    lifecycle: Lifecycle,
    open_calls: usize,
}

struct Monitor {
    contract: Mutex<Contract>,
    changed: Condvar,
}

impl Monitor {
    fn enter(&self, operation: &str) -> Result<()> {
        let mut contract = self.contract.lock();
        while contract.lifecycle == Lifecycle::Starting {
            self.changed.wait(&mut contract);
        }
        match contract.lifecycle {
            Lifecycle::Started => {
                contract.open_calls += 1;
                Ok(())
            }
            Lifecycle::Init => Err(IndexError::illegal_state(format!("{operation} called before start"))),
            _ => Err(IndexError::illegal_state(format!("{operation} called after close"))),
        }
    }

    fn exit(&self) {
        let mut contract = self.contract.lock();
        contract.open_calls = contract.open_calls.saturating_sub(1);
        if contract.open_calls == 0 {
            self.changed.notify_all();
        }
    }
}

/// Decorator enforcing the proxy lifecycle contract
pub struct ContractCheckingIndexProxy {
    inner: Arc<dyn IndexProxy>,
    monitor: Arc<Monitor>,
}

impl ContractCheckingIndexProxy {
    pub fn new(inner: Arc<dyn IndexProxy>) -> Self {
        Self {
            inner,
            monitor: Arc::new(Monitor {
                contract: Mutex::new(Contract {
                    lifecycle: Lifecycle::Init,
                    open_calls: 0,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn inner(&self) -> &Arc<dyn IndexProxy> {
        &self.inner
    }

    fn guarded<T>(&self, operation: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.monitor.enter(operation)?;
        let result = f();
        self.monitor.exit();
        result
    }

    /// Move to `Closed` once nothing is in flight, then run `f`
    fn terminate(&self, operation: &str, f: impl FnOnce() -> Result<()>) -> Result<()> {
        {
            let mut contract = self.monitor.contract.lock();
            while contract.lifecycle == Lifecycle::Starting {
                self.monitor.changed.wait(&mut contract);
            }
            if contract.lifecycle == Lifecycle::Closed {
                return Err(IndexError::illegal_state(format!("{operation} called on a closed index proxy")));
            }
            contract.lifecycle = Lifecycle::Closed;
            while contract.open_calls > 0 {
                self.monitor.changed.wait(&mut contract);
            }
        }
        f()
    }
}

impl IndexProxy for ContractCheckingIndexProxy {
    fn start(&self) -> Result<()> {
        {
            let mut contract = self.monitor.contract.lock();
            if contract.lifecycle != Lifecycle::Init {
                return Err(IndexError::illegal_state(format!(
                    "start called in state {:?}",
                    contract.lifecycle
                )));
            }
            contract.lifecycle = Lifecycle::Starting;
        }
        let result = self.inner.start();
        let mut contract = self.monitor.contract.lock();
        contract.lifecycle = Lifecycle::Started;
        self.monitor.changed.notify_all();
        result
    }

    fn new_updater(&self, mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater>> {
        self.monitor.enter("new_updater")?;
        match self.inner.new_updater(mode) {
            Ok(inner) => Ok(Box::new(ContractUpdater {
                inner,
                monitor: Some(Arc::clone(&self.monitor)),
            })),
            Err(e) => {
                self.monitor.exit();
                Err(e)
            }
        }
    }

    fn drop_index(&self) -> Result<()> {
        self.terminate("drop_index", || self.inner.drop_index())
    }

    fn close(&self) -> Result<()> {
        self.terminate("close", || self.inner.close())
    }

    fn force(&self) -> Result<()> {
        self.guarded("force", || self.inner.force())
    }

    fn refresh(&self) -> Result<()> {
        self.guarded("refresh", || self.inner.refresh())
    }

    fn descriptor(&self) -> Arc<IndexDescriptor> {
        self.inner.descriptor()
    }

    fn state(&self) -> IndexState {
        self.inner.state()
    }

    fn population_failure(&self) -> Option<IndexPopulationFailure> {
        self.inner.population_failure()
    }

    fn activate(&self) -> Result<()> {
        self.inner.activate()
    }

    fn validate(&self) -> Result<()> {
        self.inner.validate()
    }

    fn new_reader(&self) -> Result<Box<dyn IndexReader>> {
        self.inner.new_reader()
    }

    fn await_store_scan_completed(&self, timeout: Duration) -> Result<bool> {
        self.inner.await_store_scan_completed(timeout)
    }

    fn index_population_progress(&self) -> PopulationProgress {
        self.inner.index_population_progress()
    }
}

/// Counts as an open call until closed or dropped
struct ContractUpdater {
    inner: Box<dyn IndexUpdater>,
    monitor: Option<Arc<Monitor>>,
}

impl IndexUpdater for ContractUpdater {
    fn process(&mut self, update: IndexEntryUpdate) -> Result<()> {
        if self.monitor.is_none() {
            return Err(IndexError::illegal_state("updater is closed"));
        }
        self.inner.process(update)
    }

    fn close(&mut self) -> Result<()> {
        let Some(monitor) = self.monitor.take() else {
            return Err(IndexError::illegal_state("updater closed twice"));
        };
        let result = self.inner.close();
        monitor.exit();
        result
    }
}

impl Drop for ContractUpdater {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.exit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SwallowingIndexUpdater;
    use crate::types::{ProviderDescriptor, SchemaDescriptor};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct CountingProxy {
        starts: AtomicUsize,
        closes: AtomicUsize,
        drops: AtomicUsize,
        slow_start: AtomicBool,
    }

    impl IndexProxy for CountingProxy {
        fn start(&self) -> Result<()> {
            if self.slow_start.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(50));
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn new_updater(&self, _mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater>> {
            Ok(Box::new(SwallowingIndexUpdater))
        }
        fn drop_index(&self) -> Result<()> {
            self.drops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn force(&self) -> Result<()> {
            Ok(())
        }
        fn refresh(&self) -> Result<()> {
            Ok(())
        }
        fn descriptor(&self) -> Arc<IndexDescriptor> {
            Arc::new(IndexDescriptor::new(
                1,
                "idx",
                SchemaDescriptor::for_label(1, &[1]),
                ProviderDescriptor::new("test", "1"),
            ))
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
            Err(IndexError::illegal_state("no reader"))
        }
        fn await_store_scan_completed(&self, _timeout: Duration) -> Result<bool> {
            Ok(true)
        }
        fn index_population_progress(&self) -> PopulationProgress {
            PopulationProgress::DONE
        }
    }

    fn checked() -> (Arc<CountingProxy>, ContractCheckingIndexProxy) {
        let inner = Arc::new(CountingProxy::default());
        let proxy = ContractCheckingIndexProxy::new(inner.clone());
        (inner, proxy)
    }

    #[test]
    fn test_start_twice_fails() {
        let (inner, proxy) = checked();
        proxy.start().unwrap();
        assert!(proxy.start().unwrap_err().is_illegal_state());
        assert_eq!(inner.starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_updater_before_start_fails() {
        let (_inner, proxy) = checked();
        assert!(proxy.new_updater(IndexUpdateMode::Online).err().unwrap().is_illegal_state());
        assert!(proxy.force().unwrap_err().is_illegal_state());
    }

    #[test]
    fn test_close_twice_fails() {
        let (inner, proxy) = checked();
        proxy.start().unwrap();
        proxy.close().unwrap();
        assert!(proxy.close().unwrap_err().is_illegal_state());
        assert_eq!(inner.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_after_close_fails() {
        let (inner, proxy) = checked();
        proxy.start().unwrap();
        proxy.close().unwrap();
        assert!(proxy.drop_index().unwrap_err().is_illegal_state());
        assert_eq!(inner.drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_updater_after_close_fails() {
        let (_inner, proxy) = checked();
        proxy.start().unwrap();
        proxy.drop_index().unwrap();
        assert!(proxy.new_updater(IndexUpdateMode::Online).err().unwrap().is_illegal_state());
    }

    #[test]
    fn test_close_waits_for_open_updater() {
        let (inner, proxy) = checked();
        let proxy = Arc::new(proxy);
        proxy.start().unwrap();
        let mut updater = proxy.new_updater(IndexUpdateMode::Online).unwrap();

        let closer = {
            let proxy = Arc::clone(&proxy);
            thread::spawn(move || proxy.close())
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(inner.closes.load(Ordering::SeqCst), 0);

        updater.close().unwrap();
        closer.join().unwrap().unwrap();
        assert_eq!(inner.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_updater_releases_close() {
        let (inner, proxy) = checked();
        proxy.start().unwrap();
        drop(proxy.new_updater(IndexUpdateMode::Online).unwrap());
        proxy.close().unwrap();
        assert_eq!(inner.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_waits_for_start() {
        let (inner, proxy) = checked();
        inner.slow_start.store(true, Ordering::SeqCst);
        let proxy = Arc::new(proxy);
        let starter = {
            let proxy = Arc::clone(&proxy);
            thread::spawn(move || proxy.start())
        };
        // Spin until start has begun
        while proxy.monitor.contract.lock().lifecycle == Lifecycle::Init {
            thread::yield_now();
        }
        proxy.close().unwrap();
        starter.join().unwrap().unwrap();
        assert_eq!(inner.starts.load(Ordering::SeqCst), 1);
        assert_eq!(inner.closes.load(Ordering::SeqCst), 1);
    }
}
