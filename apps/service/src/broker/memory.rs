//! In-process broker for running the prober and the pipeline in one process,
//! and for exercising delivery semantics in tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::timeout;
use uuid::Uuid;

use super::{AckStatus, BrokerError, Delivery, DeliveryTag, MeasurementEvent, MeasurementSource};
use crate::database::models::Measurement;

/// Create a connected producer/source pair buffering up to `capacity` events
pub fn channel(capacity: usize) -> (MemoryProducer, MemorySource) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        MemoryProducer { tx },
        MemorySource {
            rx,
            redeliver: VecDeque::new(),
            in_flight: HashMap::new(),
            committed: 0,
            rejected: 0,
            closed: false,
        },
    )
}

#[derive(Debug, Clone)]
pub struct MemoryProducer {
    tx: mpsc::Sender<MeasurementEvent>,
}

impl MemoryProducer {
    pub async fn publish(&self, event: MeasurementEvent) -> Result<(), BrokerError> {
        self.tx.send(event).await.map_err(|_| BrokerError::Closed)
    }

    /// Wrap `measurement` in a new event and publish it
    pub async fn publish_measurement(&self, measurement: Measurement) -> Result<Uuid, BrokerError> {
        let event = MeasurementEvent::new(measurement);
        let event_id = event.event_id;
        self.publish(event).await?;
        Ok(event_id)
    }
}

/// Consumer end of `channel`. Keeps every handed-out event until it is
/// acknowledged or released.
#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::Receiver<MeasurementEvent>,
    redeliver: VecDeque<MeasurementEvent>,
    in_flight: HashMap<Uuid, MeasurementEvent>,
    committed: usize,
    rejected: usize,
    closed: bool,
}

impl MemorySource {
    fn hand_out(&mut self, event: MeasurementEvent) -> Delivery {
        self.in_flight.insert(event.event_id, event.clone());
        Delivery { tag: DeliveryTag::local(event.event_id), event }
    }

    /// Events handed out and not yet settled
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Events waiting to be delivered again
    pub fn pending_redelivery(&self) -> usize {
        self.redeliver.len()
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Queue every unacknowledged event for delivery again, as a broker does
    /// when its consumer goes away.
    pub fn redeliver_unacked(&mut self) -> usize {
        let count = self.in_flight.len();
        self.redeliver.extend(self.in_flight.drain().map(|(_, event)| event));
        count
    }
}

#[async_trait]
impl MeasurementSource for MemorySource {
    async fn poll(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery>, BrokerError> {
        let mut deliveries = Vec::new();

        while deliveries.len() < max {
            match self.redeliver.pop_front() {
                Some(event) => deliveries.push(self.hand_out(event)),
                None => break,
            }
        }

        if deliveries.is_empty() && !self.closed && max > 0 {
            match timeout(wait, self.rx.recv()).await {
                Ok(Some(event)) => deliveries.push(self.hand_out(event)),
                Ok(None) => self.closed = true,
                Err(_) => return Ok(deliveries),
            }
        }

        while deliveries.len() < max && !self.closed {
            match self.rx.try_recv() {
                Ok(event) => deliveries.push(self.hand_out(event)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.closed = true,
            }
        }

        if deliveries.is_empty() && self.closed {
            return Err(BrokerError::Closed);
        }
        Ok(deliveries)
    }

    async fn ack(&mut self, tags: &[DeliveryTag], status: AckStatus) -> Result<(), BrokerError> {
        for tag in tags {
            if self.in_flight.remove(&tag.event_id).is_some() {
                match status {
                    AckStatus::Committed => self.committed += 1,
                    AckStatus::Rejected => self.rejected += 1,
                }
            }
        }
        Ok(())
    }

    async fn release(&mut self, tags: &[DeliveryTag]) -> Result<(), BrokerError> {
        for tag in tags {
            if let Some(event) = self.in_flight.remove(&tag.event_id) {
                self.redeliver.push_back(event);
            }
        }
        Ok(())
    }
}
