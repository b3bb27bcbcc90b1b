//! Decoding of storage-change notifications carried in queue message bodies.
//!
//! Accepted shapes:
//! - object-storage event notifications (`{"Records":[{"s3":{...}}]}`),
//!   whose object keys are form-urlencoded;
//! - the same notification wrapped by a pub/sub fan-out
//!   (`{"Type":"Notification","Message":"<json>"}`);
//! - event-bus "Object Created" events (`{"detail":{"bucket":..,"object":..}}`),
//!   whose keys are plain.

use fundsync_core::ObjectLocation;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotificationError {
    #[error("message body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("storage test event carries no object")]
    TestEvent,
    #[error("notification carries no storage location")]
    MissingLocation,
    #[error("notification record {index} has no {field}")]
    IncompleteRecord { index: usize, field: &'static str },
    #[error("object key `{0}` is not valid percent-encoding")]
    InvalidKeyEncoding(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Records", default)]
    records: Vec<EventRecord>,
    #[serde(rename = "Event")]
    event: Option<String>,
    #[serde(rename = "Type")]
    kind: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
    detail: Option<StorageRefs>,
}

#[derive(Debug, Deserialize)]
struct EventRecord {
    s3: Option<StorageRefs>,
}

#[derive(Debug, Deserialize)]
struct StorageRefs {
    bucket: Option<BucketRef>,
    object: Option<ObjectRef>,
}

#[derive(Debug, Deserialize)]
struct BucketRef {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectRef {
    key: Option<String>,
}

/// Form-urlencoded key as it appears in event notifications.
pub fn decode_object_key(raw: &str) -> Result<String, NotificationError> {
    urlencoding::decode(&raw.replace('+', " "))
        .map(|key| key.into_owned())
        .map_err(|_| NotificationError::InvalidKeyEncoding(raw.to_string()))
}

/// Extracts every object location announced by a message body.
pub fn parse_notification(body: &str) -> Result<Vec<ObjectLocation>, NotificationError> {
    parse_envelope(body, true)
}

fn parse_envelope(body: &str, allow_unwrap: bool) -> Result<Vec<ObjectLocation>, NotificationError> {
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| NotificationError::InvalidJson(e.to_string()))?;

    if allow_unwrap && envelope.kind.as_deref() == Some("Notification") {
        if let Some(inner) = envelope.message.as_deref() {
            return parse_envelope(inner, false);
        }
    }
    if envelope.event.as_deref() == Some("s3:TestEvent") {
        return Err(NotificationError::TestEvent);
    }

    if !envelope.records.is_empty() {
        return envelope
            .records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                let refs = record
                    .s3
                    .as_ref()
                    .ok_or(NotificationError::IncompleteRecord { index, field: "s3 entity" })?;
                let (bucket, raw_key) = storage_refs(refs, index)?;
                Ok(ObjectLocation::new(bucket, decode_object_key(raw_key)?))
            })
            .collect();
    }

    if let Some(detail) = &envelope.detail {
        let (bucket, key) = storage_refs(detail, 0)?;
        return Ok(vec![ObjectLocation::new(bucket, key)]);
    }

    Err(NotificationError::MissingLocation)
}

fn storage_refs(refs: &StorageRefs, index: usize) -> Result<(&str, &str), NotificationError> {
    let bucket = refs
        .bucket
        .as_ref()
        .and_then(|b| b.name.as_deref())
        .filter(|name| !name.is_empty())
        .ok_or(NotificationError::IncompleteRecord { index, field: "bucket name" })?;
    let key = refs
        .object
        .as_ref()
        .and_then(|o| o.key.as_deref())
        .filter(|key| !key.is_empty())
        .ok_or(NotificationError::IncompleteRecord { index, field: "object key" })?;
    Ok((bucket, key))
}
