//! Scenario tests for multi-index population
//!
//! Run individual groups with:
//! cargo test tc_create -- --nocapture
//! cargo test population -- --nocapture

mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use common::*;
use sekejap_indexing::error::{IndexError, Result};
use sekejap_indexing::index::{IndexPopulator, IndexUpdater};
use sekejap_indexing::populate::{
    IndexPopulation, IndexPopulationJob, MultipleIndexPopulator, PopulationConfig, PopulationStatus,
};
use sekejap_indexing::proxy::{FlippableIndexProxy, IndexProxy, PopulatingIndexProxy};
use sekejap_indexing::store::{
    EntityUpdatesVisitor, ExternalUpdatesCheck, IndexStoreView, MemoryStoreView, PropertyAccessor, PropertyKeyFilter,
    StoreScan, TokenUpdateVisitor,
};
use sekejap_indexing::types::{
    EntityId, EntityType, IndexEntryUpdate, IndexId, IndexSample, IndexState, PopulationProgress, TokenId,
};

fn store_with(chunk_size: usize, entities: &[(EntityId, TokenId, Vec<(u32, serde_json::Value)>)]) -> Arc<MemoryStoreView> {
    let store = Arc::new(MemoryStoreView::with_chunk_size(chunk_size));
    for (id, label, properties) in entities {
        store.write(EntityType::Node, *id, &[*label], properties.clone());
    }
    store
}

mod tc_create_failure_isolation {
    use super::*;

    #[test]
    fn test_one_failing_create_leaves_siblings_populating() {
        let store = store_with(100, &[(1, 1, vec![(1, json!("a"))])]);
        let populator = node_populator(&store, PopulationConfig::default());
        let recordings = [
            RecordingPopulator::new(),
            RecordingPopulator::failing_create(),
            RecordingPopulator::new(),
        ];
        let populations: Vec<_> = recordings
            .iter()
            .enumerate()
            .map(|(i, recording)| register(&populator, recording, descriptor(i as IndexId + 1, 1, 1)))
            .collect();

        populator.create();

        for recording in &recordings {
            assert_eq!(recording.events()[0], "create");
        }
        assert!(matches!(populations[1].status(), PopulationStatus::Failed(_)));
        assert_eq!(populations[1].flipper().state(), IndexState::Failed);
        let failure = populations[1].flipper().population_failure().unwrap();
        assert!(failure.message().contains("create failed"));
        assert_eq!(recordings[1].events(), vec!["create", "mark_as_failed", "close(false)"]);
        assert_eq!(populations[0].status(), PopulationStatus::Populating);
        assert_eq!(populations[2].status(), PopulationStatus::Populating);

        populator.index_all_entities().unwrap();
        populator.flip_after_population(false);

        for i in [0, 2] {
            assert_eq!(populations[i].flipper().state(), IndexState::Online);
            assert_eq!(recordings[i].events(), vec!["create", "add", "close(true)"]);
        }
        assert!(recordings[1].batches().is_empty());
        assert!(!populator.has_populators());
    }
}

mod tc_batching {
    use super::*;

    #[test]
    fn test_batch_size_splits_adds_in_scan_order() {
        let store = store_with(
            100,
            &[
                (3, 1, vec![(1, json!("c"))]),
                (1, 1, vec![(1, json!("a"))]),
                (2, 1, vec![(1, json!("b"))]),
            ],
        );
        let populator = node_populator(&store, PopulationConfig::default().batch_size(2));
        let recording = RecordingPopulator::new();
        register(&populator, &recording, descriptor(1, 1, 1));

        populator.create();
        populator.index_all_entities().unwrap();

        assert_eq!(
            recording.batches(),
            vec![
                vec![(1, vec![json!("a")]), (2, vec![json!("b")])],
                vec![(3, vec![json!("c")])],
            ]
        );
    }

    #[test]
    fn test_flush_tracking_and_memory_released() {
        let entities: Vec<_> = (1..=5).map(|id| (id, 1, vec![(1, json!(id))])).collect();
        let store = store_with(2, &entities);
        let populator = node_populator(&store, PopulationConfig::default().batch_size(2));
        let recording = RecordingPopulator::new();
        let population = register(&populator, &recording, descriptor(1, 1, 1));

        populator.create();
        populator.index_all_entities().unwrap();

        let snapshot = population.tracker().snapshot();
        assert_eq!(snapshot.flushes, 3);
        assert_eq!(snapshot.flushed_entries, 5);
        assert_eq!(populator.memory().used(), 0);
        assert!(populator.memory().peak() > 0);
    }
}

mod tc_concurrent_queue {
    use super::*;

    #[test]
    fn test_queue_flushes_only_at_threshold() {
        let store = store_with(100, &[]);
        let populator = node_populator(&store, PopulationConfig::default().queue_threshold(2));
        let recording = RecordingPopulator::new();
        let index = descriptor(1, 1, 1);
        register(&populator, &recording, Arc::clone(&index));
        populator.create();
        let schema = index.schema().clone();

        populator.queue_concurrent_update(IndexEntryUpdate::add(7, schema.clone(), vec![json!("x")]));
        assert!(!populator.need_to_apply_external_updates());
        assert!(recording.processed().is_empty());

        populator.queue_concurrent_update(IndexEntryUpdate::change(7, schema, vec![json!("x")], vec![json!("y")]));
        assert!(populator.need_to_apply_external_updates());
        populator.apply_external_updates(EntityId::MAX).unwrap();

        assert_eq!(recording.processed(), vec![(7, vec![json!("x")]), (7, vec![json!("y")])]);
        assert_eq!(populator.queued_updates(), 0);
        assert!(!populator.need_to_apply_external_updates());
        assert!(recording.batches().is_empty());
    }

    #[test]
    fn test_queue_byte_limit_triggers_flush() {
        let store = store_with(100, &[]);
        let config = PopulationConfig::default().queue_threshold(1_000).batch_max_bytes(1);
        let populator = node_populator(&store, config);
        let recording = RecordingPopulator::new();
        let index = descriptor(1, 1, 1);
        register(&populator, &recording, Arc::clone(&index));
        populator.create();

        populator.queue_concurrent_update(IndexEntryUpdate::add(1, index.schema().clone(), vec![json!("x")]));
        assert!(populator.need_to_apply_external_updates());
    }

    #[test]
    fn test_update_at_cursor_is_applied_and_later_ones_left_to_scan() {
        let entities: Vec<_> = (1..=3).map(|id| (id, 1, vec![(1, json!(format!("scan-{id}")))])).collect();
        let store = store_with(1, &entities);
        let populator = node_populator(&store, PopulationConfig::default().queue_threshold(1));
        let recording = RecordingPopulator::new();
        let index = descriptor(1, 1, 1);
        register(&populator, &recording, Arc::clone(&index));
        populator.create();

        let schema = index.schema().clone();
        populator.queue_concurrent_update(IndexEntryUpdate::add(1, schema.clone(), vec![json!("late-1")]));
        populator.queue_concurrent_update(IndexEntryUpdate::add(3, schema, vec![json!("late-3")]));
        populator.index_all_entities().unwrap();

        // drained after the first chunk, cursor at entity 1
        assert_eq!(recording.processed(), vec![(1, vec![json!("late-1")])]);
        assert_eq!(recording.added_ids(), vec![1, 2, 3]);
        assert_eq!(populator.queued_updates(), 0);
    }

    #[test]
    fn test_flip_drains_everything_left_in_the_queue() {
        let store = store_with(100, &[(1, 1, vec![(1, json!("a"))])]);
        let populator = node_populator(&store, PopulationConfig::default());
        let recording = RecordingPopulator::new();
        let index = descriptor(1, 1, 1);
        let population = register(&populator, &recording, Arc::clone(&index));
        populator.create();
        populator.index_all_entities().unwrap();

        populator.queue_concurrent_update(IndexEntryUpdate::add(99, index.schema().clone(), vec![json!("z")]));
        populator.flip_after_population(false);

        assert_eq!(recording.processed(), vec![(99, vec![json!("z")])]);
        assert_eq!(population.status(), PopulationStatus::Flipped);
        assert!(population.is_done());
    }

    #[test]
    fn test_queued_updates_are_sampled() {
        let store = store_with(100, &[(1, 1, vec![(1, json!("a"))])]);
        let populator = node_populator(&store, PopulationConfig::default());
        let recording = RecordingPopulator::new();
        let index = descriptor(1, 1, 1);
        register(&populator, &recording, Arc::clone(&index));
        populator.create();
        populator.index_all_entities().unwrap();

        populator.queue_concurrent_update(IndexEntryUpdate::add(2, index.schema().clone(), vec![json!("b")]));
        populator.flip_after_population(false);

        assert_eq!(recording.sampled_ids(), vec![1, 2]);
        assert_eq!(store.index_counts(1), Some(IndexSample::new(2, 2, 2)));
    }

    #[test]
    fn test_updates_past_the_cursor_are_not_sampled() {
        let entities: Vec<_> = (1..=3).map(|id| (id, 1, vec![(1, json!(id))])).collect();
        let store = store_with(1, &entities);
        let populator = node_populator(&store, PopulationConfig::default().queue_threshold(1));
        let recording = RecordingPopulator::new();
        let index = descriptor(1, 1, 1);
        register(&populator, &recording, Arc::clone(&index));
        populator.create();

        populator.queue_concurrent_update(IndexEntryUpdate::add(3, index.schema().clone(), vec![json!("late")]));
        populator.index_all_entities().unwrap();

        // the scan reads entity 3 itself, so it is sampled once
        assert_eq!(recording.sampled_ids(), vec![1, 2, 3]);
        assert!(recording.processed().is_empty());
    }

    #[test]
    fn test_queued_bytes_settle_at_zero_with_racing_writers() {
        let store = store_with(100, &[]);
        let populator = node_populator(&store, PopulationConfig::default());
        let recording = RecordingPopulator::new();
        let index = descriptor(1, 1, 1);
        register(&populator, &recording, Arc::clone(&index));
        populator.create();

        let writers: Vec<_> = (0..4u64)
            .map(|w| {
                let populator = Arc::clone(&populator);
                let schema = index.schema().clone();
                thread::spawn(move || {
                    for i in 0..200u64 {
                        populator.queue_concurrent_update(IndexEntryUpdate::add(w * 1_000 + i, schema.clone(), vec![json!(i)]));
                    }
                })
            })
            .collect();
        while writers.iter().any(|w| !w.is_finished()) {
            populator.apply_external_updates(EntityId::MAX).unwrap();
        }
        for writer in writers {
            writer.join().unwrap();
        }
        populator.apply_external_updates(EntityId::MAX).unwrap();

        assert_eq!(populator.queued_updates(), 0);
        assert_eq!(populator.queued_bytes(), 0);
        assert_eq!(recording.processed().len(), 800);
    }
}

mod tc_end_to_end {
    use super::*;

    #[test]
    fn test_two_indexes_get_their_own_entities_and_flip_online() {
        let store = store_with(
            100,
            &[(1, 1, vec![(1, json!("foo"))]), (2, 2, vec![(2, json!("bar"))])],
        );
        let populator = node_populator(&store, PopulationConfig::default());
        let first = RecordingPopulator::new();
        let second = RecordingPopulator::new();
        let p1 = register(&populator, &first, descriptor(1, 1, 1));
        let p2 = register(&populator, &second, descriptor(2, 2, 2));

        populator.create();
        populator.index_all_entities().unwrap();
        populator.flip_after_population(false);

        assert_eq!(first.batches(), vec![vec![(1, vec![json!("foo")])]]);
        assert_eq!(second.batches(), vec![vec![(2, vec![json!("bar")])]]);
        assert_eq!(p1.flipper().state(), IndexState::Online);
        assert_eq!(p2.flipper().state(), IndexState::Online);
        assert_eq!(first.events(), vec!["create", "add", "close(true)"]);
        assert_eq!(store.index_counts(1), Some(IndexSample::new(1, 1, 1)));
        assert_eq!(store.index_counts(2), Some(IndexSample::new(1, 1, 1)));
    }

    #[test]
    fn test_failing_batch_only_fails_its_index() {
        let entities: Vec<_> = (1..=5)
            .map(|id| (id, 1, vec![(1, json!(format!("a{id}"))), (2, json!(format!("b{id}")))]))
            .collect();
        let store = store_with(1, &entities);
        let populator = node_populator(&store, PopulationConfig::default().batch_size(2));
        let failing = RecordingPopulator::failing_add_for(3);
        let healthy = RecordingPopulator::new();
        let p1 = register(&populator, &failing, descriptor(1, 1, 1));
        let p2 = register(&populator, &healthy, descriptor(2, 1, 2));

        populator.create();
        populator.index_all_entities().unwrap();
        populator.flip_after_population(false);

        assert_eq!(failing.events(), vec!["create", "add", "add", "mark_as_failed", "close(false)"]);
        assert_eq!(failing.added_ids(), vec![1, 2, 3, 4]);
        assert_eq!(p1.flipper().state(), IndexState::Failed);
        assert!(matches!(p1.status(), PopulationStatus::Failed(_)));

        assert_eq!(healthy.events(), vec!["create", "add", "add", "add", "close(true)"]);
        assert_eq!(healthy.added_ids(), vec![1, 2, 3, 4, 5]);
        assert_eq!(p2.flipper().state(), IndexState::Online);
    }

    #[test]
    fn test_cancelled_population_does_not_affect_sibling() {
        let store = store_with(100, &[(1, 1, vec![(1, json!("a")), (2, json!("b"))])]);
        let populator = node_populator(&store, PopulationConfig::default());
        let cancelled = RecordingPopulator::new();
        let kept = RecordingPopulator::new();
        let p1 = register(&populator, &cancelled, descriptor(1, 1, 1));
        let p2 = register(&populator, &kept, descriptor(2, 1, 2));

        populator.create();
        populator.cancel_index_population(&p1);
        populator.index_all_entities().unwrap();
        populator.flip_after_population(false);

        assert_eq!(p1.status(), PopulationStatus::Cancelled);
        assert_eq!(cancelled.events(), vec!["create", "close(false)"]);
        assert_eq!(p1.flipper().state(), IndexState::Populating);
        assert_eq!(p2.flipper().state(), IndexState::Online);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Create,
    ScanCompleted,
}

/// Populator that waits at a barrier in one stage, then lingers there
struct GatedPopulator {
    inner: Arc<RecordingPopulator>,
    gate: Gate,
    reached: Barrier,
}

impl GatedPopulator {
    fn new(gate: Gate) -> Arc<Self> {
        Arc::new(Self {
            inner: RecordingPopulator::new(),
            gate,
            reached: Barrier::new(2),
        })
    }

    fn pass(&self, stage: &str) {
        self.inner.record(format!("{stage}-begin"));
        self.reached.wait();
        thread::sleep(Duration::from_millis(100));
        self.inner.record(format!("{stage}-end"));
    }
}

impl IndexPopulator for GatedPopulator {
    fn create(&self) -> Result<()> {
        if self.gate == Gate::Create {
            self.pass("create");
            return Ok(());
        }
        self.inner.create()
    }

    fn drop_index(&self) -> Result<()> {
        self.inner.drop_index()
    }

    fn add(&self, updates: Vec<IndexEntryUpdate>) -> Result<()> {
        self.inner.add(updates)
    }

    fn new_populating_updater(&self, accessor: Arc<dyn PropertyAccessor>) -> Result<Box<dyn IndexUpdater>> {
        self.inner.new_populating_updater(accessor)
    }

    fn include_sample(&self, update: &IndexEntryUpdate) {
        self.inner.include_sample(update)
    }

    fn scan_completed(&self) -> Result<()> {
        if self.gate == Gate::ScanCompleted {
            self.pass("scan_completed");
        }
        Ok(())
    }

    fn sample_result(&self) -> Result<IndexSample> {
        self.inner.sample_result()
    }

    fn mark_as_failed(&self, failure: &str) -> Result<()> {
        self.inner.mark_as_failed(failure)
    }

    fn close(&self, populated: bool) -> Result<()> {
        self.inner.close(populated)
    }
}

fn register_gated(populator: &MultipleIndexPopulator, gated: &Arc<GatedPopulator>) -> Arc<IndexPopulation> {
    let index = descriptor(1, 1, 1);
    let flipper = Arc::new(FlippableIndexProxy::new(Arc::clone(&index)));
    flipper.set_flip_target(online_target(Arc::clone(&index)));
    let as_populator: Arc<dyn IndexPopulator> = Arc::clone(gated) as Arc<dyn IndexPopulator>;
    populator
        .add_populator(
            Arc::clone(&as_populator),
            Arc::clone(&index),
            flipper,
            failed_factory(Arc::clone(&index), as_populator),
            "gated",
        )
        .unwrap()
}

mod tc_populator_lock {
    use super::*;

    #[test]
    fn test_drop_waits_for_create_in_flight() {
        let store = store_with(100, &[]);
        let populator = node_populator(&store, PopulationConfig::default());
        let gated = GatedPopulator::new(Gate::Create);
        let population = register_gated(&populator, &gated);

        let creator = {
            let populator = Arc::clone(&populator);
            thread::spawn(move || populator.create())
        };
        gated.reached.wait();
        populator.drop_index_population(&population);
        creator.join().unwrap();

        assert_eq!(gated.inner.events(), vec!["create-begin", "create-end", "drop"]);
        assert_eq!(population.status(), PopulationStatus::Cancelled);
        assert!(population.is_done());
        assert!(!populator.has_populators());
    }

    #[test]
    fn test_stop_racing_the_flip_keeps_index_populating() {
        let store = store_with(100, &[(1, 1, vec![(1, json!("a"))])]);
        let populator = node_populator(&store, PopulationConfig::default());
        let gated = GatedPopulator::new(Gate::ScanCompleted);
        let population = register_gated(&populator, &gated);
        populator.create();
        populator.index_all_entities().unwrap();

        let flipping = {
            let populator = Arc::clone(&populator);
            thread::spawn(move || populator.flip_after_population(false))
        };
        gated.reached.wait();
        populator.stop_population(&population);
        flipping.join().unwrap();

        assert_eq!(population.status(), PopulationStatus::Cancelled);
        assert_eq!(population.flipper().state(), IndexState::Populating);
        assert!(population.flipper().population_failure().is_none());
        assert_eq!(
            gated.inner.events(),
            vec!["create", "add", "scan_completed-begin", "close(false)", "scan_completed-end"]
        );
        assert!(population.is_done());
    }
}

/// Store view whose scans always fail
struct BrokenStoreView {
    inner: MemoryStoreView,
}

struct BrokenScan;

impl StoreScan for BrokenScan {
    fn run(&self, _check: &dyn ExternalUpdatesCheck) -> Result<()> {
        Err(IndexError::StoreScan("disk went away".into()))
    }

    fn stop(&self) {}

    fn progress(&self) -> PopulationProgress {
        PopulationProgress::NONE
    }
}

impl IndexStoreView for BrokenStoreView {
    fn visit_entities(
        &self,
        _entity_type: EntityType,
        _entity_token_filter: &[TokenId],
        _property_filter: PropertyKeyFilter,
        _visitor: Box<dyn EntityUpdatesVisitor>,
        _token_visitor: Option<Box<dyn TokenUpdateVisitor>>,
        _force_full_scan: bool,
    ) -> Box<dyn StoreScan> {
        Box::new(BrokenScan)
    }

    fn new_property_accessor(&self, entity_type: EntityType) -> Arc<dyn PropertyAccessor> {
        self.inner.new_property_accessor(entity_type)
    }

    fn replace_index_counts(&self, index_id: IndexId, unique_values: u64, size: u64, updates: u64) {
        self.inner.replace_index_counts(index_id, unique_values, size, updates)
    }

    fn index_counts(&self, index_id: IndexId) -> Option<IndexSample> {
        self.inner.index_counts(index_id)
    }
}

fn job_over(store_view: Arc<dyn IndexStoreView>) -> Arc<IndexPopulationJob> {
    let populator = MultipleIndexPopulator::new(
        store_view,
        EntityType::Node,
        PopulationConfig::default(),
        Arc::new(CountingSchemaState::default()),
    );
    Arc::new(IndexPopulationJob::new(populator, false))
}

fn add_to_job(job: &Arc<IndexPopulationJob>, recording: &Arc<RecordingPopulator>, id: IndexId) -> Arc<FlippableIndexProxy> {
    let index = descriptor(id, 1, 1);
    let flipper = Arc::new(FlippableIndexProxy::new(Arc::clone(&index)));
    flipper.set_flip_target(online_target(Arc::clone(&index)));
    let as_populator: Arc<dyn IndexPopulator> = Arc::clone(recording) as Arc<dyn IndexPopulator>;
    let population = job
        .add_populator(
            Arc::clone(&as_populator),
            Arc::clone(&index),
            Arc::clone(&flipper),
            failed_factory(Arc::clone(&index), as_populator),
        )
        .unwrap();
    flipper
        .flip_to(Arc::new(PopulatingIndexProxy::new(index, Arc::clone(job), population)))
        .unwrap();
    flipper
}

mod tc_population_job {
    use super::*;

    #[test]
    fn test_job_runs_to_online() {
        let store = store_with(100, &[(1, 1, vec![(1, json!("a"))]), (2, 1, vec![(1, json!("b"))])]);
        let job = job_over(store);
        let recording = RecordingPopulator::new();
        let flipper = add_to_job(&job, &recording, 1);
        assert_eq!(flipper.state(), IndexState::Populating);

        let worker = Arc::clone(&job);
        let handle = thread::spawn(move || worker.run());
        assert!(job.await_completion(Duration::from_secs(30)));
        handle.join().unwrap().unwrap();

        assert_eq!(flipper.state(), IndexState::Online);
        assert!(flipper.await_store_scan_completed(Duration::from_secs(1)).unwrap());
        assert_eq!(recording.added_ids(), vec![1, 2]);
    }

    #[test]
    fn test_scan_failure_fails_every_index() {
        let store_view: Arc<dyn IndexStoreView> = Arc::new(BrokenStoreView {
            inner: MemoryStoreView::new(),
        });
        let job = job_over(store_view);
        let first = RecordingPopulator::new();
        let second = RecordingPopulator::new();
        let f1 = add_to_job(&job, &first, 1);
        let f2 = add_to_job(&job, &second, 2);

        let err = job.run().unwrap_err();
        assert!(matches!(err, IndexError::StoreScan(_)));
        for (flipper, recording) in [(&f1, &first), (&f2, &second)] {
            assert_eq!(flipper.state(), IndexState::Failed);
            assert!(flipper.population_failure().unwrap().message().contains("disk went away"));
            assert_eq!(recording.events(), vec!["create", "mark_as_failed", "close(false)"]);
        }
        assert!(job.is_done());
    }

    #[test]
    fn test_cancelled_job_leaves_indexes_populating() {
        let store = store_with(100, &[(1, 1, vec![(1, json!("a"))])]);
        let job = job_over(store);
        let recording = RecordingPopulator::new();
        let flipper = add_to_job(&job, &recording, 1);

        job.cancel();
        job.run().unwrap();

        assert_eq!(flipper.state(), IndexState::Populating);
        assert_eq!(recording.events(), vec!["create", "close(false)"]);
        assert!(recording.batches().is_empty());
    }

    #[test]
    fn test_drop_wakes_store_scan_waiters() {
        let store = store_with(100, &[]);
        let job = job_over(store);
        let recording = RecordingPopulator::new();
        let flipper = add_to_job(&job, &recording, 1);

        let waiting = Arc::clone(&flipper);
        let waiter = thread::spawn(move || {
            let started = Instant::now();
            let completed = waiting.await_store_scan_completed(Duration::from_secs(60));
            (completed, started.elapsed())
        });
        thread::sleep(Duration::from_millis(50));
        flipper.drop_index().unwrap();

        let (completed, waited) = waiter.join().unwrap();
        assert!(!completed.unwrap());
        assert!(waited < Duration::from_secs(30));
        assert_eq!(recording.events(), vec!["drop"]);
        assert!(job.is_stopped());
    }
}
