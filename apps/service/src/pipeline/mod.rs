//! Ingestion pipeline: drains the broker in batches, commits them through a
//! `MeasurementSink` and acknowledges events only once they are settled.
//!
//! An event is settled when its row is committed, when its row turns out to be
//! committed already (duplicate key), or when its row can never be stored
//! (missing target, check violation). Everything else stays buffered until a
//! later flush succeeds, or is released back to the broker on shutdown.

mod backoff;

#[cfg(test)]
mod tests;

pub use backoff::Backoff;

use std::fmt;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{Instrument, Span, debug, info, warn};

use crate::broker::{AckStatus, BrokerError, Delivery, DeliveryTag, MeasurementEvent, MeasurementSource};
use crate::config::PipelineConfig;
use crate::database::{BatchOutcome, FailureKind, MeasurementSink, Violation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Nothing buffered
    Idle,
    /// Buffering events until the batch is full or the flush interval passes
    Accumulating,
    /// A commit is in progress
    Flushing,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "idle"),
            PipelineState::Accumulating => write!(f, "accumulating"),
            PipelineState::Flushing => write!(f, "flushing"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub batches_committed: u64,
    pub measurements_committed: u64,
    /// Events whose row was already stored by an earlier delivery
    pub duplicates_dropped: u64,
    /// Events acknowledged as rejected because their row can never be stored
    pub rejected: u64,
    pub flush_failures: u64,
}

/// A buffered event and every delivery of it received so far
struct Buffered {
    event: MeasurementEvent,
    tags: Vec<DeliveryTag>,
}

pub struct IngestionPipeline<S, K> {
    source: S,
    sink: K,
    config: PipelineConfig,
    buffer: Vec<Buffered>,
    accumulating_since: Option<Instant>,
    state: PipelineState,
    stats: PipelineStats,
    backoff: Backoff,
    span: Span,
}

impl<S: MeasurementSource, K: MeasurementSink> IngestionPipeline<S, K> {
    pub fn new(source: S, sink: K, config: PipelineConfig, span: Span) -> Self {
        let backoff = Backoff::from_config(&config);
        Self {
            source,
            sink,
            config,
            buffer: Vec::new(),
            accumulating_since: None,
            state: PipelineState::Idle,
            stats: PipelineStats::default(),
            backoff,
            span,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Events held in memory and not yet settled
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    fn flush_due(&self) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        self.buffer.len() >= self.config.batch_size
            || self
                .accumulating_since
                .is_some_and(|since| since.elapsed() >= self.config.flush_interval())
    }

    fn absorb(&mut self, deliveries: Vec<Delivery>) {
        for Delivery { tag, event } in deliveries {
            match self.buffer.iter_mut().find(|b| b.event.event_id == event.event_id) {
                Some(buffered) => {
                    debug!(event_id = %event.event_id, "Event delivered again while buffered");
                    buffered.tags.push(tag);
                }
                None => self.buffer.push(Buffered { event, tags: vec![tag] }),
            }
        }

        if !self.buffer.is_empty() && self.state == PipelineState::Idle {
            self.state = PipelineState::Accumulating;
            self.accumulating_since = Some(Instant::now());
        }
    }

    /// One cycle: poll the broker for room left in the batch, then flush if
    /// the batch is full or has waited long enough.
    pub async fn step(&mut self) -> Result<(), BrokerError> {
        let room = self.config.batch_size.saturating_sub(self.buffer.len());
        if room > 0 {
            let wait = match self.accumulating_since {
                Some(since) => self.config.flush_interval().saturating_sub(since.elapsed()),
                None => self.config.flush_interval(),
            };
            let deliveries = self.source.poll(room, wait).await?;
            self.absorb(deliveries);
        }

        if self.flush_due() {
            self.flush().await?;
        }
        Ok(())
    }

    /// Commit the buffer now. On a retryable failure the events stay buffered
    /// and this waits out the backoff delay before returning.
    pub async fn flush(&mut self) -> Result<(), BrokerError> {
        if let Some(kind) = self.try_flush().await? {
            self.stats.flush_failures += 1;
            let delay = self.backoff.next_delay();
            warn!(
                %kind,
                attempt = self.backoff.attempts(),
                retained = self.buffer.len(),
                "Flush failed, retrying in {:?}",
                delay
            );
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// Returns the failure that left events buffered, if any.
    async fn try_flush(&mut self) -> Result<Option<FailureKind>, BrokerError> {
        if self.buffer.is_empty() {
            self.state = PipelineState::Idle;
            return Ok(None);
        }

        self.state = PipelineState::Flushing;
        let batch: Vec<_> = self.buffer.iter().map(|b| b.event.measurement.clone()).collect();

        let failure = match self.sink.insert_batch(&batch).await {
            BatchOutcome::Committed(count) => {
                let tags: Vec<DeliveryTag> = self.buffer.drain(..).flat_map(|b| b.tags).collect();
                self.stats.batches_committed += 1;
                self.stats.measurements_committed += count as u64;
                debug!(count, "Batch committed");
                self.source.ack(&tags, AckStatus::Committed).await?;
                None
            }
            BatchOutcome::Failed(FailureKind::Constraint(violation)) => {
                debug!(?violation, rows = batch.len(), "Batch hit a constraint, settling events one by one");
                self.settle_individually().await?
            }
            BatchOutcome::Failed(kind) => Some(kind),
            BatchOutcome::Empty => Some(FailureKind::Backend),
        };

        match failure {
            Some(_) => self.state = PipelineState::Accumulating,
            None => {
                self.state = PipelineState::Idle;
                self.accumulating_since = None;
                self.backoff.reset();
            }
        }
        Ok(failure)
    }

    /// Insert buffered events one at a time so a single bad row does not hold
    /// back the rest. Stops at the first retryable failure and keeps the
    /// unsettled events buffered.
    async fn settle_individually(&mut self) -> Result<Option<FailureKind>, BrokerError> {
        let mut retained = Vec::new();
        let mut committed = Vec::new();
        let mut rejected = Vec::new();
        let mut failure = None;

        for buffered in std::mem::take(&mut self.buffer) {
            if failure.is_some() {
                retained.push(buffered);
                continue;
            }

            let measurement = std::slice::from_ref(&buffered.event.measurement);
            match self.sink.insert_batch(measurement).await {
                BatchOutcome::Committed(count) => {
                    self.stats.measurements_committed += count as u64;
                    committed.extend(buffered.tags);
                }
                BatchOutcome::Failed(FailureKind::Constraint(Violation::DuplicateKey)) => {
                    debug!(event_id = %buffered.event.event_id, "Measurement already stored");
                    self.stats.duplicates_dropped += 1;
                    committed.extend(buffered.tags);
                }
                BatchOutcome::Failed(FailureKind::Constraint(violation)) => {
                    warn!(
                        event_id = %buffered.event.event_id,
                        url_id = buffered.event.measurement.url_id,
                        ?violation,
                        "Rejecting measurement that can never be stored"
                    );
                    self.stats.rejected += 1;
                    rejected.extend(buffered.tags);
                }
                BatchOutcome::Failed(kind) => {
                    failure = Some(kind);
                    retained.push(buffered);
                }
                BatchOutcome::Empty => {
                    failure = Some(FailureKind::Backend);
                    retained.push(buffered);
                }
            }
        }

        self.buffer = retained;

        // Both groups have left the buffer, so try both before reporting an error
        let committed_acked = match committed.is_empty() {
            true => Ok(()),
            false => self.source.ack(&committed, AckStatus::Committed).await,
        };
        let rejected_acked = match rejected.is_empty() {
            true => Ok(()),
            false => self.source.ack(&rejected, AckStatus::Rejected).await,
        };
        committed_acked?;
        rejected_acked?;
        Ok(failure)
    }

    /// Last flush attempt, then hand anything unsettled back to the broker.
    async fn finish(&mut self) -> Result<(), BrokerError> {
        if let Some(kind) = self.try_flush().await? {
            self.stats.flush_failures += 1;
            warn!(%kind, "Final flush failed");
        }

        if !self.buffer.is_empty() {
            let tags: Vec<DeliveryTag> = self.buffer.drain(..).flat_map(|b| b.tags).collect();
            info!(count = tags.len(), "Releasing uncommitted events");
            self.source.release(&tags).await?;
        }
        self.state = PipelineState::Idle;
        self.accumulating_since = None;
        Ok(())
    }

    /// Drain the broker until `shutdown` turns true or the broker closes.
    ///
    /// Shutdown is only observed between cycles.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<PipelineStats, BrokerError> {
        let span = self.span.clone();
        async move {
            info!(
                batch_size = self.config.batch_size,
                flush_interval_ms = self.config.flush_interval_ms,
                "Ingestion pipeline started"
            );

            let outcome = loop {
                if *shutdown.borrow() {
                    info!("Shutdown requested");
                    break Ok(());
                }
                match self.step().await {
                    Ok(()) => {}
                    Err(BrokerError::Closed) => {
                        info!("Broker closed");
                        break Ok(());
                    }
                    Err(err) => break Err(err),
                }
            };

            let finished = self.finish().await;
            outcome?;
            finished?;

            info!(
                batches = self.stats.batches_committed,
                measurements = self.stats.measurements_committed,
                duplicates = self.stats.duplicates_dropped,
                rejected = self.stats.rejected,
                flush_failures = self.stats.flush_failures,
                "Ingestion pipeline stopped"
            );
            Ok(self.stats)
        }
        .instrument(span)
        .await
    }
}
