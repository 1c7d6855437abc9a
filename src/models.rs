//! Core data models used throughout mailtrace.
//!
//! These types represent the messages, candidate items, and persisted
//! records that flow through the extraction pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::{fingerprint, validate_message_id, MessageIdCheck};

/// How completely the upstream parser could identify a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Complete,
    MissingMessageId,
    MalformedMessageId,
}

/// Attachment metadata. Binary content never enters the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
}

/// Raw record handed over by a message parser before normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(default, alias = "message-id")]
    pub message_id: Option<String>,
    #[serde(default, alias = "from")]
    pub sender: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default, alias = "date")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
}

/// A parsed, fingerprinted message. Read-only input to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    /// 64-char hex SHA-256 over (message id, date, sender).
    pub fingerprint: String,
    /// Normalized `<local@domain>` when valid, raw value when malformed.
    pub message_id: Option<String>,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub body: String,
    pub attachments: Vec<AttachmentMeta>,
    pub extraction_status: ExtractionStatus,
}

impl Message {
    /// Normalize a parser record: classify the Message-ID, bound the body,
    /// and derive the fingerprint.
    pub fn from_record(record: MessageRecord, max_body_bytes: usize) -> Self {
        let (message_id, extraction_status) = match validate_message_id(record.message_id.as_deref())
        {
            MessageIdCheck::Valid(normalized) => (Some(normalized), ExtractionStatus::Complete),
            MessageIdCheck::Missing => (None, ExtractionStatus::MissingMessageId),
            MessageIdCheck::Malformed(_) => (
                record.message_id.as_deref().map(|s| s.trim().to_string()),
                ExtractionStatus::MalformedMessageId,
            ),
        };

        let sender = record
            .sender
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let fingerprint = fingerprint(message_id.as_deref(), record.sent_at, sender.as_deref());

        Self {
            fingerprint,
            message_id,
            sender,
            subject: record.subject,
            sent_at: record.sent_at,
            body: truncate_on_char_boundary(record.body, max_body_bytes),
            attachments: record.attachments,
            extraction_status,
        }
    }

    /// Short fingerprint prefix used in log fields.
    pub fn fp_prefix(&self) -> &str {
        &self.fingerprint[..self.fingerprint.len().min(12)]
    }

    pub fn has_valid_message_id(&self) -> bool {
        self.extraction_status == ExtractionStatus::Complete
    }
}

fn truncate_on_char_boundary(mut body: String, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body;
    }
    let mut cut = max_bytes;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    body.truncate(cut);
    body
}

/// Whether an action item is already done or still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Completed,
    Pending,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "completed" => Some(Self::Completed),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }
}

/// Whether an item's source attribution could be verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Verified,
    Unverified,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Unverified => "unverified",
        }
    }
}

/// Traceability status of a persisted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Normal,
    Anomaly,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Anomaly => "anomaly",
        }
    }
}

/// A candidate action item as returned by the generative step, after
/// validation has filled in every field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateItem {
    pub content: String,
    pub item_type: ItemType,
    /// Indices into the de-duplicated batch that was sent to the adapter.
    pub source_indices: Vec<usize>,
    pub evidence: String,
    /// Adapter-reported confidence, clamped to [0, 1].
    pub confidence: f64,
    pub source_status: SourceStatus,
}

/// Final, scored action item produced by a batch.
#[derive(Debug, Clone, Serialize)]
pub struct ActionItem {
    pub id: String,
    pub content: String,
    pub item_type: ItemType,
    pub confidence: f64,
    pub source_status: SourceStatus,
    pub index_status: IndexStatus,
    /// Fingerprints of the messages this item was attributed to.
    pub source_fingerprints: Vec<String>,
    pub evidence: String,
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
}

/// Item ↔ message linkage handed to the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceLink {
    pub item_id: String,
    pub fingerprint: String,
    pub evidence: String,
    /// Confidence scaled to 0–100.
    pub confidence: i64,
}

/// Kind of traceability failure recorded for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    MissingMessageId,
    MalformedMessageId,
    DuplicateDetectionFailure,
    MissingSourceLink,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingMessageId => "missing_message_id",
            Self::MalformedMessageId => "malformed_message_id",
            Self::DuplicateDetectionFailure => "duplicate_detection_failure",
            Self::MissingSourceLink => "missing_source_link",
        }
    }
}

/// A recorded traceability failure.
#[derive(Debug, Clone, Serialize)]
pub struct IndexAnomaly {
    pub id: String,
    pub anomaly_type: AnomalyType,
    /// Message fingerprint or item id, depending on the anomaly type.
    pub subject_ref: String,
    pub message_id_value: Option<String>,
    pub details: String,
    pub detected_at: DateTime<Utc>,
}

impl IndexAnomaly {
    pub fn new(
        anomaly_type: AnomalyType,
        subject_ref: impl Into<String>,
        message_id_value: Option<String>,
        details: impl Into<String>,
    ) -> Self {
        // A missing id must not carry a value.
        let message_id_value = match anomaly_type {
            AnomalyType::MissingMessageId => None,
            _ => message_id_value,
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            anomaly_type,
            subject_ref: subject_ref.into(),
            message_id_value,
            details: details.into(),
            detected_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: Option<&str>) -> MessageRecord {
        MessageRecord {
            message_id: id.map(String::from),
            sender: Some(" alice@example.com ".into()),
            subject: Some("Quarterly report".into()),
            sent_at: Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap()),
            body: "Please send the report.".into(),
            attachments: vec![],
        }
    }

    #[test]
    fn test_from_record_valid_id() {
        let msg = Message::from_record(record(Some("abc@example.com")), 1024);
        assert_eq!(msg.message_id.as_deref(), Some("<abc@example.com>"));
        assert_eq!(msg.extraction_status, ExtractionStatus::Complete);
        assert_eq!(msg.sender.as_deref(), Some("alice@example.com"));
        assert_eq!(msg.fingerprint.len(), 64);
    }

    #[test]
    fn test_from_record_missing_and_malformed() {
        let missing = Message::from_record(record(None), 1024);
        assert_eq!(missing.extraction_status, ExtractionStatus::MissingMessageId);
        assert!(missing.message_id.is_none());

        let malformed = Message::from_record(record(Some("no-at-sign")), 1024);
        assert_eq!(
            malformed.extraction_status,
            ExtractionStatus::MalformedMessageId
        );
        assert_eq!(malformed.message_id.as_deref(), Some("no-at-sign"));
        assert_ne!(missing.fingerprint, malformed.fingerprint);
    }

    #[test]
    fn test_body_truncated_on_char_boundary() {
        let mut r = record(Some("a@b.com"));
        r.body = "ééééé".into(); // 10 bytes
        let msg = Message::from_record(r, 5);
        assert_eq!(msg.body, "éé");
    }

    #[test]
    fn test_item_type_parse() {
        assert_eq!(ItemType::parse("Pending"), Some(ItemType::Pending));
        assert_eq!(ItemType::parse(" completed "), Some(ItemType::Completed));
        assert_eq!(ItemType::parse("todo"), None);
    }

    #[test]
    fn test_missing_id_anomaly_drops_value() {
        let a = IndexAnomaly::new(
            AnomalyType::MissingMessageId,
            "fp",
            Some("x".into()),
            "absent",
        );
        assert!(a.message_id_value.is_none());
    }
}
