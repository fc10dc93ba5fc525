//! ZeroMQ transport with explicit acknowledgements.
//!
//! The consumer binds a ROUTER socket. Producers connect DEALER sockets and
//! send one JSON event per message. Once an event is settled the consumer
//! replies with an `AckFrame` routed back to the producer that sent it;
//! producers resend anything left unacknowledged past their timeout.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AckFrame, AckStatus, BrokerError, Delivery, DeliveryTag, EventError, MeasurementEvent,
    MeasurementSource,
};

/// Consumer end: a bound ROUTER socket.
///
/// Socket calls block, so they run on tokio's blocking pool.
pub struct ZmqSource {
    socket: Arc<Mutex<zmq::Socket>>,
}

impl ZmqSource {
    pub fn bind(context: &zmq::Context, endpoint: &str) -> Result<Self, BrokerError> {
        let socket = context.socket(zmq::ROUTER)?;
        socket.set_linger(0)?;
        socket.bind(endpoint)?;
        info!("Listening for measurement events on {}", endpoint);
        Ok(Self { socket: Arc::new(Mutex::new(socket)) })
    }

    async fn with_socket<T, F>(&self, work: F) -> Result<T, BrokerError>
    where
        F: FnOnce(&zmq::Socket) -> Result<T, BrokerError> + Send + 'static,
        T: Send + 'static,
    {
        let socket = self.socket.clone();
        tokio::task::spawn_blocking(move || {
            let socket = socket
                .lock()
                .map_err(|_| BrokerError::Worker("socket lock poisoned".into()))?;
            work(&socket)
        })
        .await
        .map_err(|err| BrokerError::Worker(err.to_string()))?
    }
}

fn reply(socket: &zmq::Socket, route: &[u8], ack: &AckFrame) -> Result<(), BrokerError> {
    let payload = serde_json::to_vec(ack).map_err(EventError::from)?;
    socket.send_multipart([route.to_vec(), payload], 0)?;
    Ok(())
}

fn receive(socket: &zmq::Socket, max: usize, wait: Duration) -> Result<Vec<Delivery>, BrokerError> {
    let deadline = Instant::now() + wait;
    let mut deliveries = Vec::new();

    while deliveries.len() < max {
        // Wait for the first event only; after that take what is already queued
        let timeout_ms = if deliveries.is_empty() {
            deadline.saturating_duration_since(Instant::now()).as_millis() as i64
        } else {
            0
        };
        if socket.poll(zmq::POLLIN, timeout_ms)? == 0 {
            break;
        }

        let mut frames = socket.recv_multipart(0)?;
        if frames.len() != 2 {
            warn!("Dropping message with {} frames, expected 2", frames.len());
            continue;
        }
        let payload = frames.pop().unwrap_or_default();
        let route = frames.pop().unwrap_or_default();

        match MeasurementEvent::decode(&payload) {
            Ok(event) => {
                let tag = DeliveryTag { route, event_id: event.event_id };
                deliveries.push(Delivery { tag, event });
            }
            Err(EventError::Invalid { event_id, reason }) => {
                warn!(%event_id, "Rejecting event: {}", reason);
                reply(socket, &route, &AckFrame { event_id, status: AckStatus::Rejected })?;
            }
            Err(err) => warn!("Dropping undecodable event: {}", err),
        }
    }

    Ok(deliveries)
}

#[async_trait]
impl MeasurementSource for ZmqSource {
    async fn poll(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery>, BrokerError> {
        self.with_socket(move |socket| receive(socket, max, wait)).await
    }

    async fn ack(&mut self, tags: &[DeliveryTag], status: AckStatus) -> Result<(), BrokerError> {
        let tags = tags.to_vec();
        self.with_socket(move |socket| {
            for tag in &tags {
                reply(socket, &tag.route, &AckFrame { event_id: tag.event_id, status })?;
            }
            debug!(count = tags.len(), ?status, "Acknowledged events");
            Ok(())
        })
        .await
    }

    /// Producers resend whatever stays unacknowledged, so nothing to do here.
    async fn release(&mut self, tags: &[DeliveryTag]) -> Result<(), BrokerError> {
        debug!(count = tags.len(), "Released events; producers will resend");
        Ok(())
    }
}

struct Pending {
    payload: Vec<u8>,
    sent_at: Instant,
}

/// Producer end used by the prober: a DEALER socket that remembers every
/// event until the consumer acknowledges it.
///
/// Blocking; run it on a thread of its own.
pub struct ZmqProducer {
    socket: zmq::Socket,
    pending: HashMap<Uuid, Pending>,
    resend_after: Duration,
}

impl ZmqProducer {
    pub fn connect(
        context: &zmq::Context,
        endpoint: &str,
        resend_after: Duration,
    ) -> Result<Self, BrokerError> {
        let socket = context.socket(zmq::DEALER)?;
        socket.set_linger(0)?;
        socket.connect(endpoint)?;
        Ok(Self { socket, pending: HashMap::new(), resend_after })
    }

    pub fn publish(&mut self, event: &MeasurementEvent) -> Result<(), BrokerError> {
        let payload = event.encode()?;
        self.socket.send(payload.as_slice(), 0)?;
        self.pending.insert(event.event_id, Pending { payload, sent_at: Instant::now() });
        Ok(())
    }

    /// Read acknowledgements for up to `wait` and forget the settled events.
    pub fn collect_acks(&mut self, wait: Duration) -> Result<Vec<AckFrame>, BrokerError> {
        let mut acks = Vec::new();
        let mut timeout_ms = wait.as_millis() as i64;

        while self.socket.poll(zmq::POLLIN, timeout_ms)? > 0 {
            let bytes = self.socket.recv_bytes(0)?;
            match serde_json::from_slice::<AckFrame>(&bytes) {
                Ok(ack) => {
                    self.pending.remove(&ack.event_id);
                    acks.push(ack);
                }
                Err(err) => warn!("Ignoring malformed acknowledgement: {}", err),
            }
            timeout_ms = 0;
        }

        Ok(acks)
    }

    /// Send again every event unacknowledged for longer than the timeout
    pub fn resend_expired(&mut self) -> Result<usize, BrokerError> {
        let now = Instant::now();
        let mut resent = 0;
        for (event_id, pending) in self.pending.iter_mut() {
            if now.duration_since(pending.sent_at) >= self.resend_after {
                debug!(%event_id, "Resending unacknowledged event");
                self.socket.send(pending.payload.as_slice(), 0)?;
                pending.sent_at = now;
                resent += 1;
            }
        }
        Ok(resent)
    }

    /// Events sent and not yet acknowledged
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::Measurement;

    fn event(response_time: f64) -> MeasurementEvent {
        MeasurementEvent::new(Measurement::new(1, 200, response_time, true))
    }

    #[tokio::test]
    async fn test_round_trip_with_ack() {
        let context = zmq::Context::new();
        let mut source = ZmqSource::bind(&context, "inproc://measurements-ack").unwrap();
        let mut producer =
            ZmqProducer::connect(&context, "inproc://measurements-ack", Duration::from_secs(30)).unwrap();

        let sent = event(0.25);
        producer.publish(&sent).unwrap();
        assert_eq!(producer.pending(), 1);

        let deliveries = source.poll(10, Duration::from_secs(2)).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].event, sent);

        source.ack(&[deliveries[0].tag.clone()], AckStatus::Committed).await.unwrap();
        let acks = producer.collect_acks(Duration::from_secs(2)).unwrap();
        assert_eq!(acks, [AckFrame { event_id: sent.event_id, status: AckStatus::Committed }]);
        assert_eq!(producer.pending(), 0);
    }

    #[tokio::test]
    async fn test_invalid_event_is_rejected_at_the_transport() {
        let context = zmq::Context::new();
        let mut source = ZmqSource::bind(&context, "inproc://measurements-invalid").unwrap();
        let mut producer =
            ZmqProducer::connect(&context, "inproc://measurements-invalid", Duration::from_secs(30)).unwrap();

        let bad = event(-1.0);
        producer.publish(&bad).unwrap();

        let deliveries = source.poll(10, Duration::from_millis(300)).await.unwrap();
        assert!(deliveries.is_empty());

        let acks = producer.collect_acks(Duration::from_secs(2)).unwrap();
        assert_eq!(acks[0].status, AckStatus::Rejected);
        assert_eq!(producer.pending(), 0);
    }

    #[tokio::test]
    async fn test_unacked_event_is_resent() {
        let context = zmq::Context::new();
        let mut source = ZmqSource::bind(&context, "inproc://measurements-resend").unwrap();
        let mut producer =
            ZmqProducer::connect(&context, "inproc://measurements-resend", Duration::ZERO).unwrap();

        let sent = event(0.1);
        producer.publish(&sent).unwrap();
        let first = source.poll(10, Duration::from_secs(2)).await.unwrap();
        assert_eq!(first.len(), 1);

        // Never acknowledged, so the producer sends it again
        assert_eq!(producer.resend_expired().unwrap(), 1);
        let second = source.poll(10, Duration::from_secs(2)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].event.event_id, sent.event_id);
    }
}
