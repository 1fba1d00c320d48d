//! Event envelope codec — the wire format for queued notification events.
//!
//! Events travel through the queue as versioned JSON envelopes:
//! `{ "v": 1, "event": { .. } }`. The version field lets the format evolve
//! without guessing at old bytes; anything that fails to decode (truncated
//! input, invalid JSON, unsupported version) is a `MalformedEnvelope` and is
//! dead-lettered by the consumer, never retried.

use serde::Deserialize;

use courier_common::error::DispatchError;
use courier_common::types::NotificationEvent;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    v: u32,
    #[serde(default)]
    event: serde_json::Value,
}

/// Serialize an event into envelope bytes.
pub fn encode(event: &NotificationEvent) -> Result<Vec<u8>, DispatchError> {
    let envelope = serde_json::json!({ "v": ENVELOPE_VERSION, "event": event });
    serde_json::to_vec(&envelope)
        .map_err(|e| DispatchError::MalformedEnvelope(format!("encode failed: {e}")))
}

/// Decode envelope bytes back into an event.
///
/// Round-trip law: `decode(encode(event)) == event` for every field.
pub fn decode(bytes: &[u8]) -> Result<NotificationEvent, DispatchError> {
    let raw: RawEnvelope = serde_json::from_slice(bytes)
        .map_err(|e| DispatchError::MalformedEnvelope(format!("invalid envelope: {e}")))?;

    if raw.v != ENVELOPE_VERSION {
        return Err(DispatchError::MalformedEnvelope(format!(
            "unsupported envelope version {}",
            raw.v
        )));
    }

    serde_json::from_value(raw.event)
        .map_err(|e| DispatchError::MalformedEnvelope(format!("invalid event: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_event() -> NotificationEvent {
        NotificationEvent::new(
            "user-42",
            "order.shipped",
            serde_json::json!({ "order_id": 9931, "carrier": "dhl" }),
        )
    }

    #[test]
    fn test_round_trip_preserves_every_field() {
        let event = make_event();
        let bytes = encode(&event).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_round_trip_preserves_attempt_count() {
        let mut event = make_event();
        event.attempt = 3;
        let decoded = decode(&encode(&event).unwrap()).unwrap();
        assert_eq!(decoded.attempt, 3);
    }

    #[test]
    fn test_truncated_bytes_are_malformed() {
        let bytes = encode(&make_event()).unwrap();
        let err = decode(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, DispatchError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_garbage_bytes_are_malformed() {
        let err = decode(b"\x00\xffnot json").unwrap_err();
        assert!(matches!(err, DispatchError::MalformedEnvelope(_)));
        let err = decode(b"").unwrap_err();
        assert!(matches!(err, DispatchError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_unsupported_version_is_malformed() {
        let bytes = serde_json::to_vec(&serde_json::json!({ "v": 99, "event": {} })).unwrap();
        let err = decode(&bytes).unwrap_err();
        match err {
            DispatchError::MalformedEnvelope(msg) => {
                assert!(msg.contains("unsupported envelope version 99"))
            }
            other => panic!("expected MalformedEnvelope, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_event_fields_are_malformed() {
        let bytes =
            serde_json::to_vec(&serde_json::json!({ "v": 1, "event": { "topic": "x" } })).unwrap();
        assert!(matches!(
            decode(&bytes),
            Err(DispatchError::MalformedEnvelope(_))
        ));
    }
}
