//! Per-population update counters. Diagnostics only.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::types::{IndexEntryUpdate, UpdateMode};

#[derive(Default)]
pub struct UpdatesTracker {
    created: AtomicU64,
    updated: AtomicU64,
    deleted: AtomicU64,
    created_after_population: AtomicU64,
    updated_after_population: AtomicU64,
    deleted_after_population: AtomicU64,
    flushes: AtomicU64,
    flushed_entries: AtomicU64,
    flush_micros: AtomicU64,
    population_completed: AtomicBool,
}

/// Point-in-time copy of an `UpdatesTracker`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdatesSnapshot {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub created_after_population: u64,
    pub updated_after_population: u64,
    pub deleted_after_population: u64,
    pub flushes: u64,
    pub flushed_entries: u64,
    pub flush_time: Duration,
}

impl UpdatesTracker {
    /// Count one concurrent update
    pub fn track(&self, update: &IndexEntryUpdate) {
        let after = self.population_completed.load(Ordering::Acquire);
        let counter = match (update.mode(), after) {
            (UpdateMode::Added, false) => &self.created,
            (UpdateMode::Changed, false) => &self.updated,
            (UpdateMode::Removed, false) => &self.deleted,
            (UpdateMode::Added, true) => &self.created_after_population,
            (UpdateMode::Changed, true) => &self.updated_after_population,
            (UpdateMode::Removed, true) => &self.deleted_after_population,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_flush(&self, entries: usize, elapsed: Duration) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.flushed_entries.fetch_add(entries as u64, Ordering::Relaxed);
        self.flush_micros.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn notify_population_completed(&self) {
        self.population_completed.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> UpdatesSnapshot {
        UpdatesSnapshot {
            created: self.created.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            created_after_population: self.created_after_population.load(Ordering::Relaxed),
            updated_after_population: self.updated_after_population.load(Ordering::Relaxed),
            deleted_after_population: self.deleted_after_population.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flushed_entries: self.flushed_entries.load(Ordering::Relaxed),
            flush_time: Duration::from_micros(self.flush_micros.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SchemaDescriptor;
    use serde_json::json;

    #[test]
    fn test_counts_split_by_population_phase() {
        let tracker = UpdatesTracker::default();
        let schema = SchemaDescriptor::for_label(1, &[1]);
        tracker.track(&IndexEntryUpdate::add(1, schema.clone(), vec![json!(1)]));
        tracker.track(&IndexEntryUpdate::remove(2, schema.clone(), vec![json!(1)]));
        tracker.notify_population_completed();
        tracker.track(&IndexEntryUpdate::change(1, schema, vec![json!(1)], vec![json!(2)]));
        tracker.track_flush(10, Duration::from_micros(5));

        let snapshot = tracker.snapshot();
        assert_eq!((snapshot.created, snapshot.deleted, snapshot.updated), (1, 1, 0));
        assert_eq!(snapshot.updated_after_population, 1);
        assert_eq!((snapshot.flushes, snapshot.flushed_entries), (1, 10));
    }
}
