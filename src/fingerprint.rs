//! Content-addressed message fingerprints and Message-ID normalization.
//!
//! A fingerprint is the lowercase hex SHA-256 of
//! `"{message_id}|{date}|{sender}"`, with fixed placeholders standing in
//! for missing fields so that degraded messages still hash deterministically.

use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Placeholder hashed in place of an absent Message-ID.
pub const NO_MESSAGE_ID: &str = "<no-message-id>";
/// Placeholder hashed in place of an absent date.
pub const NO_DATE: &str = "<no-date>";
/// Placeholder hashed in place of an absent sender.
pub const NO_SENDER: &str = "<no-sender>";

/// Length of a fingerprint in hex characters.
pub const FINGERPRINT_LEN: usize = 64;

/// Derive the stable fingerprint for a message.
pub fn fingerprint(
    message_id: Option<&str>,
    sent_at: Option<DateTime<Utc>>,
    sender: Option<&str>,
) -> String {
    let id = message_id
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(NO_MESSAGE_ID);
    let date = sent_at
        .map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| NO_DATE.to_string());
    let from = sender
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(NO_SENDER);

    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(b"|");
    hasher.update(date.as_bytes());
    hasher.update(b"|");
    hasher.update(from.as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalize a Message-ID to `<local@domain>`.
pub fn normalize_message_id(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("Message-ID is empty");
    }
    let inner = trimmed.strip_prefix('<').unwrap_or(trimmed);
    let inner = inner.strip_suffix('>').unwrap_or(inner);
    if !inner.contains('@') {
        bail!("Invalid Message-ID format: {}", raw);
    }
    Ok(format!("<{}>", inner))
}

/// Outcome of checking a Message-ID header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageIdCheck {
    /// Normalized, RFC 5322-shaped id.
    Valid(String),
    Missing,
    /// Present but unusable; carries a human-readable reason.
    Malformed(String),
}

fn message_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^<[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}>$")
            .expect("static Message-ID pattern compiles")
    })
}

/// Classify a Message-ID header value.
pub fn validate_message_id(raw: Option<&str>) -> MessageIdCheck {
    let raw = match raw {
        Some(r) if !r.trim().is_empty() => r,
        _ => return MessageIdCheck::Missing,
    };

    let normalized = match normalize_message_id(raw) {
        Ok(n) => n,
        Err(e) => return MessageIdCheck::Malformed(e.to_string()),
    };

    if !message_id_pattern().is_match(&normalized) {
        return MessageIdCheck::Malformed(format!(
            "Message-ID does not match RFC 5322 format: {}",
            raw
        ));
    }

    MessageIdCheck::Valid(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = fingerprint(Some("<a@x.com>"), Some(ts()), Some("bob@x.com"));
        let b = fingerprint(Some("<a@x.com>"), Some(ts()), Some("bob@x.com"));
        assert_eq!(a, b);
        assert_eq!(a.len(), FINGERPRINT_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_fingerprint_each_field_matters() {
        let base = fingerprint(Some("<a@x.com>"), Some(ts()), Some("bob@x.com"));
        assert_ne!(
            base,
            fingerprint(Some("<b@x.com>"), Some(ts()), Some("bob@x.com"))
        );
        assert_ne!(
            base,
            fingerprint(
                Some("<a@x.com>"),
                Some(ts() + chrono::Duration::seconds(1)),
                Some("bob@x.com")
            )
        );
        assert_ne!(
            base,
            fingerprint(Some("<a@x.com>"), Some(ts()), Some("carol@x.com"))
        );
    }

    #[test]
    fn test_fingerprint_placeholders() {
        let missing = fingerprint(None, None, None);
        assert_eq!(missing, fingerprint(Some("  "), None, Some("")));
        assert_eq!(missing.len(), FINGERPRINT_LEN);
    }

    #[test]
    fn test_normalize_message_id() {
        assert_eq!(
            normalize_message_id("abc@domain.com").unwrap(),
            "<abc@domain.com>"
        );
        assert_eq!(
            normalize_message_id(" <abc@domain.com> ").unwrap(),
            "<abc@domain.com>"
        );
        assert!(normalize_message_id("").is_err());
        assert!(normalize_message_id("no-at").is_err());
    }

    #[test]
    fn test_validate_message_id() {
        assert_eq!(
            validate_message_id(Some("abc.123@mail.example.com")),
            MessageIdCheck::Valid("<abc.123@mail.example.com>".into())
        );
        assert_eq!(validate_message_id(None), MessageIdCheck::Missing);
        assert_eq!(validate_message_id(Some("   ")), MessageIdCheck::Missing);
        assert!(matches!(
            validate_message_id(Some("plain")),
            MessageIdCheck::Malformed(_)
        ));
        assert!(matches!(
            validate_message_id(Some("a@localhost")),
            MessageIdCheck::Malformed(_)
        ));
    }
}
