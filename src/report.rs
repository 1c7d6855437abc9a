//! Human-readable traceability lines.
//!
//! Every reported item is followed by one source line per linked message:
//!
//! ```text
//! [pending] 0.72  Send the Q3 report to finance
//!     From: Alice <alice@example.com> | 2024-03-01 09:30 | Quarterly report
//! ```
//!
//! Items whose index status is `anomaly` carry the [`anomaly_marker`].

use crate::models::{ActionItem, IndexStatus, Message};

pub const SUBJECT_MAX_CHARS: usize = 50;

pub fn anomaly_marker() -> &'static str {
    "[index anomaly]"
}

/// Truncate to `max_chars` characters, ending in `...` when cut.
pub fn truncate_subject(subject: &str, max_chars: usize) -> String {
    if subject.chars().count() <= max_chars {
        return subject.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = subject.chars().take(keep).collect();
    out.push_str("...");
    out
}

pub fn format_source_line(message: &Message) -> String {
    let sender = message.sender.as_deref().unwrap_or("unknown sender");
    let date = message
        .sent_at
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "unknown date".to_string());
    let subject = message
        .subject
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("(no subject)");
    format!(
        "From: {} | {} | {}",
        sender,
        date,
        truncate_subject(subject, SUBJECT_MAX_CHARS)
    )
}

/// Render an item with its source lines. `messages` is searched by
/// fingerprint; unknown fingerprints are shown by prefix.
pub fn format_item(item: &ActionItem, messages: &[Message]) -> String {
    let mut out = format!(
        "[{}] {:.2}  {}",
        item.item_type.as_str(),
        item.confidence,
        item.content
    );
    if item.index_status == IndexStatus::Anomaly {
        out.push(' ');
        out.push_str(anomaly_marker());
    }
    if item.source_fingerprints.is_empty() {
        out.push_str("\n    (no source linked)");
    }
    for fp in &item.source_fingerprints {
        out.push_str("\n    ");
        match messages.iter().find(|m| &m.fingerprint == fp) {
            Some(m) => out.push_str(&format_source_line(m)),
            None => out.push_str(&format!("fingerprint {}", &fp[..fp.len().min(12)])),
        }
    }
    out
}
