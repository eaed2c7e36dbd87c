//! Inbound event envelopes.
//!
//! Two shapes arrive at the detector:
//!
//! - the **notification body** delivered by the queue, an S3 event
//!   notification `{"Records":[{"s3":{"bucket":{"name":..},"object":{"key":..}}}]}`
//! - the **host envelope** used by function-style invocations, a batch
//!   `{"Records":[{"body":"<notification body>"}]}` whose first record's
//!   body is the notification.
//!
//! Parsing walks the JSON by hand rather than through derived structs so
//! that an unparsable body and a missing key stay distinguishable.

use crate::analysis::ImageRef;
use serde_json::Value;
use thiserror::Error;

/// Errors for envelopes that can never be processed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Message body is not valid JSON: {0}")]
    InvalidFormat(String),

    #[error("Missing required key in message: {0}")]
    MissingField(&'static str),

    #[error("Storage test event carries no object")]
    TestEvent,
}

impl EventError {
    /// Short text returned to the caller; no parser detail crosses the boundary
    pub fn public_message(&self) -> &'static str {
        match self {
            EventError::InvalidFormat(_) => "Invalid message format",
            EventError::MissingField(_) | EventError::TestEvent => {
                "Missing required key in message"
            }
        }
    }
}

/// Un-parsed inbound message as handed over by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEnvelope {
    /// Notification body straight from the queue
    Notification(String),
    /// Function-host batch envelope wrapping a notification body
    HostBatch(Vec<u8>),
}

impl RawEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            RawEnvelope::Notification(_) => "notification",
            RawEnvelope::HostBatch(_) => "host_batch",
        }
    }
}

/// One object written to storage
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionEvent {
    /// Bucket and key of the new object
    pub image: ImageRef,
    /// Event name reported by storage, e.g. `ObjectCreated:Put`
    pub event_name: Option<String>,
    /// The notification record the event was read from
    pub raw: Value,
}

impl IngestionEvent {
    /// Parse any supported envelope into an event
    pub fn parse(envelope: &RawEnvelope) -> Result<Self, EventError> {
        match envelope {
            RawEnvelope::Notification(body) => Self::from_notification_body(body),
            RawEnvelope::HostBatch(bytes) => {
                let body = host_batch_body(bytes)?;
                Self::from_notification_body(&body)
            }
        }
    }

    /// Parse an S3 event notification body
    pub fn from_notification_body(body: &str) -> Result<Self, EventError> {
        let message: Value =
            serde_json::from_str(body).map_err(|e| EventError::InvalidFormat(e.to_string()))?;

        if message.get("Event").and_then(Value::as_str) == Some("s3:TestEvent") {
            return Err(EventError::TestEvent);
        }

        let record = message
            .get("Records")
            .and_then(|records| records.get(0))
            .ok_or(EventError::MissingField("Records"))?;

        let s3 = record.get("s3").ok_or(EventError::MissingField("s3"))?;

        let bucket = s3
            .get("bucket")
            .and_then(|b| b.get("name"))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or(EventError::MissingField("bucket.name"))?;

        let key = s3
            .get("object")
            .and_then(|o| o.get("key"))
            .and_then(Value::as_str)
            .filter(|key| !key.is_empty())
            .ok_or(EventError::MissingField("object.key"))?;

        let event_name = record
            .get("eventName")
            .and_then(Value::as_str)
            .map(String::from);

        Ok(Self {
            image: ImageRef::new(bucket, key),
            event_name,
            raw: record.clone(),
        })
    }

    /// Object key, used as the image identifier
    pub fn image_id(&self) -> &str {
        &self.image.key
    }
}

/// Extract `Records[0].body` from a host batch envelope
fn host_batch_body(bytes: &[u8]) -> Result<String, EventError> {
    let batch: Value =
        serde_json::from_slice(bytes).map_err(|e| EventError::InvalidFormat(e.to_string()))?;

    batch
        .get("Records")
        .and_then(|records| records.get(0))
        .and_then(|record| record.get("body"))
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or(EventError::MissingField("Records[0].body"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification(bucket: &str, key: &str) -> String {
        json!({
            "Records": [{
                "eventSource": "aws:s3",
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": { "name": bucket },
                    "object": { "key": key, "size": 1024 }
                }
            }]
        })
        .to_string()
    }

    #[test]
    fn test_parse_notification_body() {
        let event = IngestionEvent::from_notification_body(&notification("images", "car1.jpg"))
            .unwrap();

        assert_eq!(event.image, ImageRef::new("images", "car1.jpg"));
        assert_eq!(event.image_id(), "car1.jpg");
        assert_eq!(event.event_name.as_deref(), Some("ObjectCreated:Put"));
        assert_eq!(event.raw["s3"]["object"]["size"], 1024);
    }

    #[test]
    fn test_parse_host_batch() {
        let batch = json!({
            "Records": [{ "messageId": "m-1", "body": notification("images", "car2.jpg") }]
        });
        let envelope = RawEnvelope::HostBatch(serde_json::to_vec(&batch).unwrap());

        let event = IngestionEvent::parse(&envelope).unwrap();
        assert_eq!(event.image.key, "car2.jpg");
    }

    #[test]
    fn test_invalid_json_is_invalid_format() {
        let err = IngestionEvent::parse(&RawEnvelope::Notification("not json {".into()))
            .unwrap_err();
        assert!(matches!(err, EventError::InvalidFormat(_)));
        assert_eq!(err.public_message(), "Invalid message format");

        let batch = json!({ "Records": [{ "body": "<xml/>" }] });
        let err = IngestionEvent::parse(&RawEnvelope::HostBatch(
            serde_json::to_vec(&batch).unwrap(),
        ))
        .unwrap_err();
        assert!(matches!(err, EventError::InvalidFormat(_)));
    }

    #[test]
    fn test_missing_keys() {
        let cases = [
            (json!({}), "Records"),
            (json!({ "Records": [] }), "Records"),
            (json!({ "Records": [{}] }), "s3"),
            (
                json!({ "Records": [{ "s3": { "object": { "key": "a.jpg" } } }] }),
                "bucket.name",
            ),
            (
                json!({ "Records": [{ "s3": { "bucket": { "name": "images" } } }] }),
                "object.key",
            ),
            (
                json!({ "Records": [{ "s3": { "bucket": { "name": "images" }, "object": { "key": "" } } }] }),
                "object.key",
            ),
        ];

        for (body, field) in cases {
            let err = IngestionEvent::from_notification_body(&body.to_string()).unwrap_err();
            assert_eq!(err, EventError::MissingField(field), "body: {}", body);
            assert_eq!(err.public_message(), "Missing required key in message");
        }
    }

    #[test]
    fn test_host_batch_without_body() {
        let batch = json!({ "Records": [{ "messageId": "m-1" }] });
        let err = IngestionEvent::parse(&RawEnvelope::HostBatch(
            serde_json::to_vec(&batch).unwrap(),
        ))
        .unwrap_err();
        assert_eq!(err, EventError::MissingField("Records[0].body"));
    }

    #[test]
    fn test_storage_test_event_is_rejected() {
        let body = json!({
            "Service": "Amazon S3",
            "Event": "s3:TestEvent",
            "Bucket": "images"
        });
        let err = IngestionEvent::from_notification_body(&body.to_string()).unwrap_err();
        assert_eq!(err, EventError::TestEvent);
    }
}
