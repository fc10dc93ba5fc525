/// Pipeline behavior against an in-process broker
///
/// Most tests drive the pipeline cycle by cycle with a scripted sink; the last
/// ones run it end to end against a real database file.
use super::*;
use crate::broker::memory::{self, MemoryProducer, MemorySource};
use crate::config::{ExecutionMode, ModeConfig, Namespace};
use crate::database::fixtures::reference_targets;
use crate::database::models::Measurement;
use crate::database::{MeasurementStore, Outcome, Storage};
use crate::pool::build_pool;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

/// Sink replaying scripted outcomes; commits whatever it gets once the
/// script runs out.
#[derive(Default)]
struct ScriptedSink {
    script: Mutex<VecDeque<BatchOutcome>>,
    calls: Mutex<Vec<Vec<Measurement>>>,
}

impl ScriptedSink {
    fn with_script(outcomes: impl IntoIterator<Item = BatchOutcome>) -> Self {
        Self { script: Mutex::new(outcomes.into_iter().collect()), calls: Mutex::default() }
    }

    fn calls(&self) -> Vec<Vec<Measurement>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MeasurementSink for ScriptedSink {
    async fn insert_batch(&self, measurements: &[Measurement]) -> BatchOutcome {
        self.calls.lock().unwrap().push(measurements.to_vec());
        if measurements.is_empty() {
            return BatchOutcome::Empty;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(BatchOutcome::Committed(measurements.len()))
    }
}

fn config(batch_size: usize, flush_interval_ms: u64) -> PipelineConfig {
    PipelineConfig {
        batch_size,
        flush_interval_ms,
        retry_initial_ms: 1,
        retry_max_ms: 5,
        retry_multiplier: 2.0,
    }
}

fn measurement(url_id: i64, offset_s: i64) -> Measurement {
    let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap() + ChronoDuration::seconds(offset_s);
    Measurement::at(ts, url_id, 200, 0.1, true)
}

async fn publish(producer: &MemoryProducer, measurements: impl IntoIterator<Item = Measurement>) {
    for m in measurements {
        producer.publish_measurement(m).await.unwrap();
    }
}

fn pipeline(
    sink: ScriptedSink,
    config: PipelineConfig,
) -> (MemoryProducer, IngestionPipeline<MemorySource, ScriptedSink>) {
    let (producer, source) = memory::channel(64);
    (producer, IngestionPipeline::new(source, sink, config, Span::none()))
}

const MISSING: BatchOutcome = BatchOutcome::Failed(FailureKind::Constraint(Violation::MissingTarget));
const DUPLICATE: BatchOutcome = BatchOutcome::Failed(FailureKind::Constraint(Violation::DuplicateKey));

#[tokio::test]
async fn test_flushes_when_batch_is_full() {
    let (producer, mut pipeline) = pipeline(ScriptedSink::default(), config(3, 60_000));
    publish(&producer, (0..3).map(|i| measurement(1, i))).await;

    pipeline.step().await.unwrap();

    assert_eq!(pipeline.sink().calls().len(), 1);
    assert_eq!(pipeline.sink().calls()[0].len(), 3);
    assert_eq!(pipeline.source().committed(), 3);
    assert_eq!(pipeline.state(), PipelineState::Idle);
    assert_eq!(pipeline.stats().batches_committed, 1);
    assert_eq!(pipeline.stats().measurements_committed, 3);
}

#[tokio::test]
async fn test_flushes_partial_batch_after_interval() {
    let (producer, mut pipeline) = pipeline(ScriptedSink::default(), config(10, 20));
    publish(&producer, [measurement(1, 0), measurement(2, 0)]).await;

    pipeline.step().await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Accumulating);
    assert_eq!(pipeline.buffered(), 2);
    assert!(pipeline.sink().calls().is_empty());

    // Nothing else arrives; the poll waits out the interval
    pipeline.step().await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Idle);
    assert_eq!(pipeline.source().committed(), 2);
}

#[tokio::test]
async fn test_retryable_failure_keeps_events_until_commit() {
    let sink = ScriptedSink::with_script([
        BatchOutcome::Failed(FailureKind::Connectivity),
        BatchOutcome::Failed(FailureKind::Backend),
    ]);
    let (producer, mut pipeline) = pipeline(sink, config(2, 60_000));
    publish(&producer, [measurement(1, 0), measurement(1, 1)]).await;

    pipeline.step().await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Accumulating);
    assert_eq!(pipeline.buffered(), 2);
    // Not acknowledged before a commit
    assert_eq!(pipeline.source().committed(), 0);
    assert_eq!(pipeline.source().in_flight(), 2);

    pipeline.step().await.unwrap();
    assert_eq!(pipeline.stats().flush_failures, 2);
    assert_eq!(pipeline.source().committed(), 0);

    pipeline.step().await.unwrap();
    assert_eq!(pipeline.source().committed(), 2);
    assert_eq!(pipeline.state(), PipelineState::Idle);

    let calls = pipeline.sink().calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|batch| batch == &calls[0]));
}

#[tokio::test]
async fn test_constraint_failure_settles_each_event() {
    // Batch fails, then: first commits, second has no target, third is stored already
    let sink = ScriptedSink::with_script([MISSING, BatchOutcome::Committed(1), MISSING, DUPLICATE]);
    let (producer, mut pipeline) = pipeline(sink, config(3, 60_000));
    publish(&producer, [measurement(1, 0), measurement(99, 0), measurement(1, 2)]).await;

    pipeline.step().await.unwrap();

    let stats = pipeline.stats();
    assert_eq!(stats.batches_committed, 0);
    assert_eq!(stats.measurements_committed, 1);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.duplicates_dropped, 1);
    assert_eq!(stats.flush_failures, 0);

    assert_eq!(pipeline.source().committed(), 2);
    assert_eq!(pipeline.source().rejected(), 1);
    assert_eq!(pipeline.source().in_flight(), 0);
    assert_eq!(pipeline.state(), PipelineState::Idle);

    let calls = pipeline.sink().calls();
    assert_eq!(calls.len(), 4);
    assert!(calls[1..].iter().all(|batch| batch.len() == 1));
}

#[tokio::test]
async fn test_outage_while_settling_keeps_the_rest() {
    let sink = ScriptedSink::with_script([
        BatchOutcome::Failed(FailureKind::Constraint(Violation::Check)),
        BatchOutcome::Committed(1),
        BatchOutcome::Failed(FailureKind::Connectivity),
    ]);
    let (producer, mut pipeline) = pipeline(sink, config(3, 60_000));
    publish(&producer, (0..3).map(|i| measurement(1, i))).await;

    pipeline.step().await.unwrap();
    // Third event was never tried once the backend went away
    assert_eq!(pipeline.sink().calls().len(), 3);
    assert_eq!(pipeline.buffered(), 2);
    assert_eq!(pipeline.source().committed(), 1);
    assert_eq!(pipeline.stats().flush_failures, 1);
    assert_eq!(pipeline.state(), PipelineState::Accumulating);

    pipeline.flush().await.unwrap();
    assert_eq!(pipeline.source().committed(), 3);
    assert_eq!(pipeline.buffered(), 0);
}

/// Source whose committed acknowledgements never get through
struct LosesCommittedAcks {
    inner: MemorySource,
}

#[async_trait]
impl MeasurementSource for LosesCommittedAcks {
    async fn poll(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery>, BrokerError> {
        self.inner.poll(max, wait).await
    }

    async fn ack(&mut self, tags: &[DeliveryTag], status: AckStatus) -> Result<(), BrokerError> {
        match status {
            AckStatus::Committed => Err(BrokerError::Worker("ack channel down".into())),
            AckStatus::Rejected => self.inner.ack(tags, status).await,
        }
    }

    async fn release(&mut self, tags: &[DeliveryTag]) -> Result<(), BrokerError> {
        self.inner.release(tags).await
    }
}

#[tokio::test]
async fn test_rejections_are_acked_when_commit_ack_fails() {
    let (producer, source) = memory::channel(8);
    let sink = ScriptedSink::with_script([MISSING, BatchOutcome::Committed(1), MISSING]);
    let mut pipeline =
        IngestionPipeline::new(LosesCommittedAcks { inner: source }, sink, config(2, 60_000), Span::none());
    publish(&producer, [measurement(1, 0), measurement(99, 0)]).await;

    assert!(matches!(pipeline.step().await, Err(BrokerError::Worker(_))));

    assert_eq!(pipeline.buffered(), 0);
    assert_eq!(pipeline.source().inner.rejected(), 1);
    // The committed event is still in flight and will be redelivered as a duplicate
    assert_eq!(pipeline.source().inner.in_flight(), 1);
}

#[tokio::test]
async fn test_redelivered_event_is_buffered_once() {
    let (producer, mut pipeline) = pipeline(ScriptedSink::default(), config(10, 60_000));
    let event = MeasurementEvent::new(measurement(1, 0));
    producer.publish(event.clone()).await.unwrap();
    producer.publish(event.clone()).await.unwrap();

    pipeline.step().await.unwrap();
    assert_eq!(pipeline.buffered(), 1);

    pipeline.flush().await.unwrap();
    assert_eq!(pipeline.sink().calls(), [vec![event.measurement]]);
    assert_eq!(pipeline.source().in_flight(), 0);
}

#[tokio::test]
async fn test_closed_broker_triggers_final_flush() {
    let (producer, mut pipeline) = pipeline(ScriptedSink::default(), config(10, 60_000));
    publish(&producer, [measurement(1, 0), measurement(2, 0)]).await;
    drop(producer);

    let (_tx, rx) = watch::channel(false);
    let stats = pipeline.run(rx).await.unwrap();

    assert_eq!(stats.measurements_committed, 2);
    assert_eq!(pipeline.source().committed(), 2);
    assert_eq!(pipeline.state(), PipelineState::Idle);
}

#[tokio::test]
async fn test_shutdown_releases_what_could_not_be_stored() {
    let sink = ScriptedSink::with_script([BatchOutcome::Failed(FailureKind::Connectivity)]);
    let (producer, mut pipeline) = pipeline(sink, config(10, 60_000));
    publish(&producer, [measurement(1, 0), measurement(2, 0)]).await;
    drop(producer);

    let (_tx, rx) = watch::channel(false);
    let stats = pipeline.run(rx).await.unwrap();

    assert_eq!(stats.flush_failures, 1);
    assert_eq!(stats.measurements_committed, 0);
    assert_eq!(pipeline.buffered(), 0);
    assert_eq!(pipeline.source().in_flight(), 0);
    assert_eq!(pipeline.source().pending_redelivery(), 2);
}

#[tokio::test]
async fn test_shutdown_signal_stops_before_next_cycle() {
    let (producer, mut pipeline) = pipeline(ScriptedSink::default(), config(10, 60_000));
    publish(&producer, [measurement(1, 0)]).await;

    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let stats = pipeline.run(rx).await.unwrap();

    assert_eq!(stats, PipelineStats::default());
    assert!(pipeline.sink().calls().is_empty());
}

async fn seeded_store() -> (Storage, TempDir) {
    let dir = tempdir().unwrap();
    let db = libsql::Builder::new_local(dir.path().join("metrics.db")).build().await.unwrap();
    let pool = build_pool(db, 2).unwrap();
    let mode = ModeConfig { namespace: Namespace::Testing, execution: ExecutionMode::Live };
    let storage = Storage::from_pool(pool, &mode);
    assert_eq!(storage.schema().provision().await, Outcome::Applied);
    assert_eq!(storage.registry().seed(&reference_targets("http://simulator:8000")).await, Outcome::Applied);
    (storage, dir)
}

fn store_pipeline(storage: &Storage) -> (MemoryProducer, IngestionPipeline<MemorySource, MeasurementStore>) {
    let (producer, source) = memory::channel(64);
    (producer, IngestionPipeline::new(source, storage.measurements(), config(10, 60_000), Span::none()))
}

#[tokio::test]
async fn test_orphan_measurement_is_rejected_and_rest_stored() {
    let (storage, _dir) = seeded_store().await;
    let (producer, mut pipeline) = store_pipeline(&storage);
    publish(&producer, [measurement(1, 0), measurement(2, 0), measurement(999, 0)]).await;
    drop(producer);

    let (_tx, rx) = watch::channel(false);
    let stats = pipeline.run(rx).await.unwrap();

    assert_eq!(stats.measurements_committed, 2);
    assert_eq!(stats.rejected, 1);
    assert_eq!(pipeline.source().committed(), 2);
    assert_eq!(pipeline.source().rejected(), 1);
    assert_eq!(storage.measurements().count(None).await.unwrap(), 2);
}

#[tokio::test]
async fn test_redelivery_after_lost_ack_stores_nothing_twice() {
    let (storage, _dir) = seeded_store().await;
    let batch = [measurement(5, 0), measurement(6, 0)];

    // A previous consumer committed these but died before acknowledging
    assert!(storage.measurements().insert_batch(&batch).await.succeeded());

    let (producer, mut pipeline) = store_pipeline(&storage);
    publish(&producer, batch.clone()).await;
    drop(producer);

    let (_tx, rx) = watch::channel(false);
    let stats = pipeline.run(rx).await.unwrap();

    assert_eq!(stats.duplicates_dropped, 2);
    assert_eq!(stats.measurements_committed, 0);
    assert_eq!(pipeline.source().committed(), 2);
    assert_eq!(pipeline.source().in_flight(), 0);
    assert_eq!(storage.measurements().count(None).await.unwrap(), 2);
}
