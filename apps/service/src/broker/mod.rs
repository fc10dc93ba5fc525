/// Broker transport between the prober and the persister
///
/// Producers place `MeasurementEvent`s on a broker; the ingestion pipeline
/// drains them through a `MeasurementSource` and acknowledges each event once
/// it is durably stored. Anything not acknowledged is eventually delivered
/// again, so a source may hand out the same event more than once.
pub mod event;
pub mod memory;
pub mod zeromq;

pub use event::{AckFrame, AckStatus, EventError, MeasurementEvent};
pub use memory::{MemoryProducer, MemorySource};
pub use zeromq::{ZmqProducer, ZmqSource};

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No more events will arrive
    #[error("broker closed")]
    Closed,
    #[error("zeromq: {0}")]
    Zmq(#[from] zmq::Error),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("transport worker failed: {0}")]
    Worker(String),
}

/// Identifies one delivery for acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    /// Transport routing information, e.g. the ZeroMQ peer identity
    pub route: Vec<u8>,
    pub event_id: Uuid,
}

impl DeliveryTag {
    pub fn local(event_id: Uuid) -> Self {
        Self { route: Vec::new(), event_id }
    }
}

/// An event handed out by a source and not yet acknowledged
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub event: MeasurementEvent,
}

/// Consumer side of a broker.
#[async_trait]
pub trait MeasurementSource: Send {
    /// Wait up to `wait` for events and return at most `max` of them.
    ///
    /// Returns an empty vector when nothing arrived in time and
    /// `BrokerError::Closed` once the broker is drained and shut.
    async fn poll(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery>, BrokerError>;

    /// The events behind `tags` are settled and must not be delivered again.
    async fn ack(&mut self, tags: &[DeliveryTag], status: AckStatus) -> Result<(), BrokerError>;

    /// The events behind `tags` were not settled; deliver them again later.
    async fn release(&mut self, tags: &[DeliveryTag]) -> Result<(), BrokerError>;
}
