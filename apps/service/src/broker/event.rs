use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::models::Measurement;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid event {event_id}: {reason}")]
    Invalid { event_id: Uuid, reason: String },
}

/// A measurement in flight between the prober and the persister
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementEvent {
    /// Assigned by the producer; acknowledgements refer to it
    pub event_id: Uuid,
    #[serde(flatten)]
    pub measurement: Measurement,
}

impl MeasurementEvent {
    pub fn new(measurement: Measurement) -> Self {
        Self { event_id: Uuid::new_v4(), measurement }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and sanity-check an event received from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        let mut event: Self = serde_json::from_slice(bytes)?;
        // Producers may send nanosecond timestamps; storage keeps microseconds
        let m = &event.measurement;
        event.measurement =
            Measurement::at(m.sample_timestamp, m.url_id, m.response_code, m.response_time, m.match_found);
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), EventError> {
        let m = &self.measurement;
        let reason = if !m.response_time.is_finite() || m.response_time < 0.0 {
            format!("response_time must be a non-negative number, got {}", m.response_time)
        } else if m.url_id <= 0 {
            format!("url_id must be positive, got {}", m.url_id)
        } else {
            return Ok(());
        };
        Err(EventError::Invalid { event_id: self.event_id, reason })
    }
}

/// Whether the consumer stored an event or gave up on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Committed,
    Rejected,
}

/// Reply sent back to a producer for each settled event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFrame {
    pub event_id: Uuid,
    pub status: AckStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_wire_shape_is_flat() {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let event = MeasurementEvent::new(Measurement::at(ts, 3, 200, 0.42, true));

        let value: serde_json::Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(value["url_id"], 3);
        assert_eq!(value["response_code"], 200);
        assert_eq!(value["match_found"], true);
        assert_eq!(value["sample_timestamp"], "2023-11-14T22:13:20Z");
        assert_eq!(value["event_id"], event.event_id.to_string());
    }

    #[test]
    fn test_decode_truncates_nanoseconds() {
        let raw = br#"{"event_id":"67e55044-10b1-426f-9247-bb680e5fe0c8","sample_timestamp":"2024-01-01T00:00:00.123456789Z","url_id":1,"response_code":200,"response_time":0.1,"match_found":false}"#;
        let event = MeasurementEvent::decode(raw).unwrap();
        assert_eq!(event.measurement.sample_timestamp.timestamp_subsec_nanos(), 123_456_000);
    }

    #[test]
    fn test_decode_rejects_negative_latency() {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let event = MeasurementEvent::new(Measurement::at(ts, 1, 200, -0.5, true));
        let err = MeasurementEvent::decode(&event.encode().unwrap()).unwrap_err();
        assert!(matches!(err, EventError::Invalid { event_id, .. } if event_id == event.event_id));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(MeasurementEvent::decode(b"not json"), Err(EventError::Malformed(_))));
        assert!(matches!(MeasurementEvent::decode(br#"{"event_id":"x"}"#), Err(EventError::Malformed(_))));
    }

    #[test]
    fn test_ack_frame_format() {
        let ack = AckFrame { event_id: Uuid::nil(), status: AckStatus::Committed };
        assert_eq!(
            serde_json::to_string(&ack).unwrap(),
            r#"{"event_id":"00000000-0000-0000-0000-000000000000","status":"committed"}"#
        );
    }
}
