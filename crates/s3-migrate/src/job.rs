//! Job data model and queue-message normalization.
//!
//! A job is the immutable unit of work: one source object to copy to one
//! destination location. Jobs arrive on the queue either as the structured
//! shape produced by the jobsender, or as a raw S3 event notification that
//! must be mapped onto the structured shape using a configured default
//! destination.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// One object to migrate. Field names follow the queue wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "Src_bucket")]
    pub src_bucket: String,

    #[serde(rename = "Src_key")]
    pub src_key: String,

    #[serde(rename = "Size")]
    pub size: i64,

    #[serde(rename = "Des_bucket")]
    pub des_bucket: String,

    #[serde(rename = "Des_key")]
    pub des_key: String,

    /// Source object version, when version-aware transfer is enabled.
    /// The wire format uses the literal string "null" for "no version".
    #[serde(
        rename = "versionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub version_id: Option<String>,
}

impl Job {
    /// `"bucket/key"` form used for logging and as the ledger key.
    /// A trailing `/` (zero-byte directory object) is preserved.
    pub fn ledger_key(&self) -> String {
        format!("{}/{}", self.src_bucket, self.src_key)
    }

    /// Version id for ranged GETs, treating the wire sentinel "null" as none.
    pub fn effective_version(&self) -> Option<&str> {
        match self.version_id.as_deref() {
            None | Some("null") | Some("") => None,
            Some(v) => Some(v),
        }
    }
}

/// Default destination applied to raw storage-event notifications.
#[derive(Debug, Clone, Default)]
pub struct EventDestination {
    pub bucket: Option<String>,
    pub prefix: String,
}

/// Result of normalizing one queue message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedMessage {
    /// A transferable job.
    Job(Job),
    /// The broker self-test message sent at bucket-notification setup time.
    /// Must be acknowledged without processing.
    TestEvent,
    /// A recognized but non-transferable event; acknowledged and skipped.
    OtherEvent(String),
}

/// Join a destination prefix and a source key into a destination key,
/// preserving a trailing `/` on directory objects.
pub fn join_dest_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", prefix, key)
    }
}

/// Decode an S3-event object key: `+` means space, then percent-decoding.
fn decode_event_key(raw: &str) -> String {
    let plus_decoded = raw.replace('+', " ");
    percent_decode_str(&plus_decoded)
        .decode_utf8_lossy()
        .into_owned()
}

/// Normalize one queue message body into a [`ParsedMessage`].
///
/// Accepted shapes, checked in order:
/// 1. S3 event notification: `{"Records":[{"s3":{...}}]}` - mapped onto a
///    job using the configured default destination.
/// 2. Broker event: `{"Event":"s3:TestEvent"}` and friends.
/// 3. Structured jobsender message (the [`Job`] wire shape).
///
/// A message missing a destination bucket after normalization is a permanent
/// format error.
pub fn parse_message(body: &str, defaults: &EventDestination) -> Result<ParsedMessage> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| MigrateError::BadMessage(format!("not JSON: {}", e)))?;

    if let Some(records) = value.get("Records").and_then(|r| r.as_array()) {
        for record in records {
            let Some(s3) = record.get("s3") else { continue };
            return job_from_event(s3, defaults).map(ParsedMessage::Job);
        }
        return Err(MigrateError::BadMessage(
            "event notification without an s3 record".into(),
        ));
    }

    if let Some(event) = value.get("Event").and_then(|e| e.as_str()) {
        if event == "s3:TestEvent" {
            return Ok(ParsedMessage::TestEvent);
        }
        return Ok(ParsedMessage::OtherEvent(event.to_string()));
    }

    let job: Job = serde_json::from_value(value)
        .map_err(|e| MigrateError::BadMessage(format!("missing required field: {}", e)))?;
    if job.des_bucket.is_empty() {
        return Err(MigrateError::BadMessage("empty destination bucket".into()));
    }
    Ok(ParsedMessage::Job(job))
}

fn job_from_event(s3: &serde_json::Value, defaults: &EventDestination) -> Result<Job> {
    let src_bucket = s3
        .pointer("/bucket/name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| MigrateError::BadMessage("event missing bucket.name".into()))?
        .to_string();
    let raw_key = s3
        .pointer("/object/key")
        .and_then(|v| v.as_str())
        .ok_or_else(|| MigrateError::BadMessage("event missing object.key".into()))?;
    let size = s3
        .pointer("/object/size")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let version_id = s3
        .pointer("/object/versionId")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    let des_bucket = defaults.bucket.clone().ok_or_else(|| {
        MigrateError::BadMessage("event job has no default destination bucket configured".into())
    })?;

    let src_key = decode_event_key(raw_key);
    let des_key = join_dest_key(&defaults.prefix, &src_key);

    Ok(Job {
        src_bucket,
        src_key,
        size,
        des_bucket,
        des_key,
        version_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> EventDestination {
        EventDestination {
            bucket: Some("backup-bucket".into()),
            prefix: "mirror".into(),
        }
    }

    #[test]
    fn test_parse_structured_job() {
        let body = r#"{"Src_bucket":"a","Src_key":"data/file.bin","Size":123,
                       "Des_bucket":"b","Des_key":"data/file.bin","versionId":"v1"}"#;
        let parsed = parse_message(body, &EventDestination::default()).unwrap();
        match parsed {
            ParsedMessage::Job(job) => {
                assert_eq!(job.src_bucket, "a");
                assert_eq!(job.size, 123);
                assert_eq!(job.effective_version(), Some("v1"));
            }
            other => panic!("expected job, got {:?}", other),
        }
    }

    #[test]
    fn test_null_version_sentinel() {
        let body = r#"{"Src_bucket":"a","Src_key":"k","Size":1,
                       "Des_bucket":"b","Des_key":"k","versionId":"null"}"#;
        let ParsedMessage::Job(job) = parse_message(body, &EventDestination::default()).unwrap()
        else {
            panic!("expected job");
        };
        assert_eq!(job.effective_version(), None);
    }

    #[test]
    fn test_parse_s3_event_notification() {
        let body = r#"{"Records":[{"s3":{
            "bucket":{"name":"src-bucket"},
            "object":{"key":"photos/my+pic%20one.jpg","size":2048,"versionId":"v7"}
        }}]}"#;
        let ParsedMessage::Job(job) = parse_message(body, &defaults()).unwrap() else {
            panic!("expected job");
        };
        assert_eq!(job.src_bucket, "src-bucket");
        assert_eq!(job.src_key, "photos/my pic one.jpg");
        assert_eq!(job.des_bucket, "backup-bucket");
        assert_eq!(job.des_key, "mirror/photos/my pic one.jpg");
        assert_eq!(job.size, 2048);
        assert_eq!(job.version_id.as_deref(), Some("v7"));
    }

    #[test]
    fn test_event_without_default_destination_is_rejected() {
        let body = r#"{"Records":[{"s3":{"bucket":{"name":"x"},"object":{"key":"k","size":1}}}]}"#;
        let err = parse_message(body, &EventDestination::default()).unwrap_err();
        assert!(matches!(err, MigrateError::BadMessage(_)));
    }

    #[test]
    fn test_test_event_is_acknowledged() {
        let body = r#"{"Event":"s3:TestEvent"}"#;
        assert_eq!(
            parse_message(body, &EventDestination::default()).unwrap(),
            ParsedMessage::TestEvent
        );
    }

    #[test]
    fn test_other_event_is_skipped() {
        let body = r#"{"Event":"s3:Unknown"}"#;
        assert_eq!(
            parse_message(body, &EventDestination::default()).unwrap(),
            ParsedMessage::OtherEvent("s3:Unknown".into())
        );
    }

    #[test]
    fn test_missing_destination_is_permanent_error() {
        let body = r#"{"Src_bucket":"a","Src_key":"k","Size":1}"#;
        assert!(parse_message(body, &EventDestination::default()).is_err());
    }

    #[test]
    fn test_directory_object_keeps_trailing_slash() {
        let body = r#"{"Records":[{"s3":{
            "bucket":{"name":"src"},
            "object":{"key":"logs/2024/","size":0}
        }}]}"#;
        let ParsedMessage::Job(job) = parse_message(body, &defaults()).unwrap() else {
            panic!("expected job");
        };
        assert_eq!(job.des_key, "mirror/logs/2024/");
        assert_eq!(job.ledger_key(), "src/logs/2024/");
    }

    #[test]
    fn test_join_dest_key_empty_prefix() {
        assert_eq!(join_dest_key("", "a/b"), "a/b");
        assert_eq!(join_dest_key("/", "a/b"), "a/b");
        assert_eq!(join_dest_key("p", "a/b"), "p/a/b");
    }
}
