//! Structural validation of generative output.
//!
//! A response is valid when it is an object with an `items` array and every
//! element carries a string `content`, a known `type`, an in-range
//! `source_email_indices` array and a `confidence` in `[0, 1]`. On the
//! first failure the request is re-issued once with a corrective
//! instruction. If that still fails, the validator synthesizes items from
//! whatever partial data exists and marks every one of them
//! [`ValidatedItem::Degraded`]. Nothing the adapter returned is dropped: a
//! response with no item array at all still yields one degraded item.

use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{info, warn};

use crate::generator::{ExtractionAdapter, GenerationRequest, REINFORCEMENT_INSTRUCTION};
use crate::models::{CandidateItem, ItemType, SourceStatus};

pub const MAX_VALIDATION_RETRIES: u32 = 1;

/// Adapter confidence substituted when none is usable.
pub const NEUTRAL_CONFIDENCE: f64 = 0.5;

/// Content substituted for an element with nothing readable in it.
pub const UNREADABLE_ITEM: &str = "[unreadable item]";

/// A candidate item tagged with how it was obtained.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "item", rename_all = "snake_case")]
pub enum ValidatedItem {
    /// Passed the schema as returned.
    Valid(CandidateItem),
    /// Rebuilt with safe defaults after validation failed.
    Degraded(CandidateItem),
}

impl ValidatedItem {
    pub fn item(&self) -> &CandidateItem {
        match self {
            Self::Valid(item) | Self::Degraded(item) => item,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub items: Vec<ValidatedItem>,
    pub is_valid: bool,
    pub is_degraded: bool,
    pub retry_count: u32,
    pub violations: Vec<String>,
    pub batch_info: Option<Value>,
}

pub struct OutputValidator {
    retry_timeout: Duration,
}

impl OutputValidator {
    /// `retry_timeout` bounds the corrective re-generation call.
    pub fn new(retry_timeout: Duration) -> Self {
        Self { retry_timeout }
    }

    /// Validate `raw`, retrying once through `adapter` on failure.
    pub async fn validate(
        &self,
        raw: Value,
        adapter: &dyn ExtractionAdapter,
        request: &GenerationRequest,
    ) -> ValidationOutcome {
        let batch_len = request.len();

        let first_violations = match check_schema(&raw, batch_len) {
            Ok(items) => return valid_outcome(items, &raw, 0),
            Err(v) => v,
        };
        warn!(
            stage = "validate_output",
            violations = first_violations.len(),
            first = %first_violations[0],
            "generative output failed schema, retrying with reinforcement"
        );

        let retry_request = request.with_reinforcement(REINFORCEMENT_INSTRUCTION);
        let retried = match tokio::time::timeout(self.retry_timeout, adapter.generate(&retry_request))
            .await
        {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(stage = "validate_output", error = %e, "retry generation failed, degrading");
                None
            }
            Err(_) => {
                warn!(stage = "validate_output", timeout = ?self.retry_timeout, "retry generation timed out, degrading");
                None
            }
        };

        let mut violations = first_violations;
        if let Some(second) = &retried {
            match check_schema(second, batch_len) {
                Ok(items) => {
                    info!(stage = "validate_output", "retry produced valid output");
                    return valid_outcome(items, second, MAX_VALIDATION_RETRIES);
                }
                Err(v) => violations.extend(v),
            }
        }

        // Prefer the retry when it at least carries an item array.
        let source = match &retried {
            Some(second) if item_array(second).is_some() => second,
            _ => &raw,
        };
        let items: Vec<ValidatedItem> = match item_array(source) {
            Some(elements) => elements
                .iter()
                .map(|e| ValidatedItem::Degraded(synthesize(e, batch_len)))
                .collect(),
            None => {
                // No array anywhere: the whole response becomes one item.
                let whole = match &retried {
                    Some(second) if has_content(second) => second,
                    _ => &raw,
                };
                vec![ValidatedItem::Degraded(synthesize(whole, batch_len))]
            }
        };

        warn!(
            stage = "validate_output",
            items = items.len(),
            violations = violations.len(),
            "validation failed after retry, output degraded"
        );

        ValidationOutcome {
            items,
            is_valid: false,
            is_degraded: true,
            retry_count: MAX_VALIDATION_RETRIES,
            violations,
            batch_info: source.get("batch_info").cloned(),
        }
    }
}

fn valid_outcome(items: Vec<CandidateItem>, raw: &Value, retry_count: u32) -> ValidationOutcome {
    ValidationOutcome {
        items: items.into_iter().map(ValidatedItem::Valid).collect(),
        is_valid: true,
        is_degraded: false,
        retry_count,
        violations: Vec::new(),
        batch_info: raw.get("batch_info").cloned(),
    }
}

/// The element array of a response: `{"items": [...]}` or a bare array.
fn item_array(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Object(obj) => obj.get("items").and_then(|i| i.as_array()),
        Value::Array(arr) => Some(arr),
        _ => None,
    }
}

fn has_content(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Object(obj) => !obj.is_empty(),
        Value::Array(arr) => !arr.is_empty(),
        _ => true,
    }
}

/// Check a response against the schema, collecting every violation.
pub fn check_schema(raw: &Value, batch_len: usize) -> Result<Vec<CandidateItem>, Vec<String>> {
    let elements = match raw.get("items") {
        Some(Value::Array(arr)) => arr,
        Some(_) => return Err(vec!["items: not an array".to_string()]),
        None => return Err(vec!["items: missing".to_string()]),
    };

    let mut violations = Vec::new();
    let mut items = Vec::with_capacity(elements.len());

    for (i, element) in elements.iter().enumerate() {
        let Some(obj) = element.as_object() else {
            violations.push(format!("items[{i}]: not an object"));
            continue;
        };
        match check_item(obj, batch_len) {
            Ok(item) => items.push(item),
            Err(errs) => violations.extend(errs.into_iter().map(|e| format!("items[{i}].{e}"))),
        }
    }

    if violations.is_empty() {
        Ok(items)
    } else {
        Err(violations)
    }
}

fn check_item(obj: &Map<String, Value>, batch_len: usize) -> Result<CandidateItem, Vec<String>> {
    let mut errs = Vec::new();

    let content = match obj.get("content") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::String(_)) => {
            errs.push("content: empty".to_string());
            None
        }
        Some(_) => {
            errs.push("content: not a string".to_string());
            None
        }
        None => {
            errs.push("content: missing".to_string());
            None
        }
    };

    let item_type = match obj.get("type") {
        Some(Value::String(s)) => {
            let parsed = ItemType::parse(s);
            if parsed.is_none() {
                errs.push(format!("type: unknown value '{s}'"));
            }
            parsed
        }
        Some(_) => {
            errs.push("type: not a string".to_string());
            None
        }
        None => {
            errs.push("type: missing".to_string());
            None
        }
    };

    let source_indices = match obj.get("source_email_indices") {
        Some(Value::Array(arr)) => {
            let mut indices = Vec::with_capacity(arr.len());
            for v in arr {
                match v.as_u64().map(|n| n as usize) {
                    Some(n) if n < batch_len => indices.push(n),
                    _ => errs.push(format!("source_email_indices: {v} out of range 0..{batch_len}")),
                }
            }
            Some(indices)
        }
        Some(_) => {
            errs.push("source_email_indices: not an array".to_string());
            None
        }
        None => {
            errs.push("source_email_indices: missing".to_string());
            None
        }
    };

    let confidence = match obj.get("confidence").and_then(|c| c.as_f64()) {
        Some(c) if c.is_finite() && (0.0..=1.0).contains(&c) => Some(c),
        Some(c) => {
            errs.push(format!("confidence: {c} outside [0, 1]"));
            None
        }
        None if obj.contains_key("confidence") => {
            errs.push("confidence: not a number".to_string());
            None
        }
        None => {
            errs.push("confidence: missing".to_string());
            None
        }
    };

    match (content, item_type, source_indices, confidence) {
        (Some(content), Some(item_type), Some(source_indices), Some(confidence))
            if errs.is_empty() =>
        {
            let source_status = if source_indices.is_empty() {
                SourceStatus::Unverified
            } else {
                SourceStatus::Verified
            };
            Ok(CandidateItem {
                content,
                item_type,
                source_indices,
                evidence: evidence_of(obj),
                confidence,
                source_status,
            })
        }
        _ => Err(errs),
    }
}

fn evidence_of(obj: &Map<String, Value>) -> String {
    obj.get("evidence")
        .and_then(|e| e.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Rebuild one element with safe defaults. Always unverified.
fn synthesize(element: &Value, batch_len: usize) -> CandidateItem {
    let fallback = |content: String| CandidateItem {
        content,
        item_type: ItemType::Pending,
        source_indices: Vec::new(),
        evidence: String::new(),
        confidence: NEUTRAL_CONFIDENCE,
        source_status: SourceStatus::Unverified,
    };

    let obj = match element {
        Value::Object(obj) => obj,
        Value::String(s) if !s.trim().is_empty() => return fallback(s.trim().to_string()),
        _ => return fallback(UNREADABLE_ITEM.to_string()),
    };

    let content = obj
        .get("content")
        .and_then(|c| c.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(|| UNREADABLE_ITEM.to_string());

    let item_type = obj
        .get("type")
        .and_then(|t| t.as_str())
        .and_then(ItemType::parse)
        .unwrap_or(ItemType::Pending);

    let mut source_indices: Vec<usize> = obj
        .get("source_email_indices")
        .and_then(|s| s.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64())
                .map(|n| n as usize)
                .filter(|n| *n < batch_len)
                .collect()
        })
        .unwrap_or_default();
    source_indices.dedup();

    let confidence = obj
        .get("confidence")
        .and_then(|c| c.as_f64())
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(NEUTRAL_CONFIDENCE);

    CandidateItem {
        content,
        item_type,
        source_indices,
        evidence: evidence_of(obj),
        confidence,
        source_status: SourceStatus::Unverified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a fixed answer to every retry and counts calls.
    struct FixedAdapter {
        answer: Option<Value>,
        calls: AtomicUsize,
    }

    impl FixedAdapter {
        fn answering(answer: Value) -> Self {
            Self {
                answer: Some(answer),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                answer: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ExtractionAdapter for FixedAdapter {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn backend(&self) -> &str {
            "test"
        }
        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
        async fn generate(&self, request: &GenerationRequest) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(request.reinforcement.is_some());
            match &self.answer {
                Some(v) => Ok(v.clone()),
                None => bail!("backend down"),
            }
        }
    }

    fn request(n: usize) -> GenerationRequest {
        GenerationRequest {
            messages: (0..n)
                .map(|index| crate::generator::MessageDigest {
                    index,
                    sender: None,
                    subject: None,
                    sent_at: None,
                    body: String::new(),
                    attachments: vec![],
                })
                .collect(),
            reinforcement: None,
        }
    }

    fn validator() -> OutputValidator {
        OutputValidator::new(Duration::from_secs(5))
    }

    fn good_item() -> Value {
        json!({"content": "Send report", "type": "pending",
               "source_email_indices": [0], "evidence": "by Friday", "confidence": 0.9})
    }

    #[tokio::test]
    async fn test_valid_output_needs_no_retry() {
        let adapter = FixedAdapter::failing();
        let out = validator()
            .validate(json!({"items": [good_item()], "batch_info": {"total_emails": 1}}), &adapter, &request(1))
            .await;
        assert!(out.is_valid && !out.is_degraded);
        assert_eq!(out.retry_count, 0);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
        let item = out.items[0].item();
        assert_eq!(item.source_status, SourceStatus::Verified);
        assert_eq!(item.evidence, "by Friday");
        assert!(out.batch_info.is_some());
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let adapter = FixedAdapter::answering(json!({"items": [good_item()]}));
        let out = validator()
            .validate(json!("I think you should send the report"), &adapter, &request(1))
            .await;
        assert!(out.is_valid);
        assert_eq!(out.retry_count, 1);
        assert!(matches!(out.items[0], ValidatedItem::Valid(_)));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_indices_degrades_but_keeps_item() {
        let bad = json!({"items": [{"content": "Call Bob", "type": "pending", "confidence": 0.95}]});
        let adapter = FixedAdapter::answering(bad.clone());
        let out = validator().validate(bad, &adapter, &request(2)).await;
        assert!(out.is_degraded && !out.is_valid);
        assert_eq!(out.retry_count, 1);
        assert_eq!(out.items.len(), 1);
        let item = out.items[0].item();
        assert!(out.items[0].is_degraded());
        assert_eq!(item.content, "Call Bob");
        assert!(item.source_indices.is_empty());
        assert_eq!(item.source_status, SourceStatus::Unverified);
        assert!((item.confidence - 0.95).abs() < 1e-9);
        assert!(out.violations.iter().any(|v| v.contains("source_email_indices: missing")));
    }

    #[tokio::test]
    async fn test_retry_failure_degrades_from_first_response() {
        let first = json!({"items": ["Pay invoice", 42, {"type": "done", "source_email_indices": [0, 7]}]});
        let adapter = FixedAdapter::failing();
        let out = validator().validate(first, &adapter, &request(1)).await;
        assert!(out.is_degraded);
        assert_eq!(out.items.len(), 3);
        assert_eq!(out.items[0].item().content, "Pay invoice");
        assert_eq!(out.items[1].item().content, UNREADABLE_ITEM);
        let third = out.items[2].item();
        assert_eq!(third.content, UNREADABLE_ITEM);
        assert_eq!(third.item_type, ItemType::Pending);
        assert_eq!(third.source_indices, vec![0]);
        assert_eq!(third.confidence, NEUTRAL_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_retry_items_preferred_for_synthesis() {
        let adapter = FixedAdapter::answering(json!({"items": [{"content": "From retry"}]}));
        let out = validator()
            .validate(json!({"items": [{"content": "From first"}]}), &adapter, &request(1))
            .await;
        assert!(out.is_degraded);
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.items[0].item().content, "From retry");
    }

    #[tokio::test]
    async fn test_prose_response_yields_one_degraded_item() {
        let prose = "You should send Bob the Q3 numbers before Friday.";
        let adapter = FixedAdapter::answering(json!(prose));
        let out = validator().validate(json!(prose), &adapter, &request(2)).await;
        assert!(out.is_degraded && !out.is_valid);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.items.len(), 1);
        assert!(out.items[0].is_degraded());
        let item = out.items[0].item();
        assert_eq!(item.content, prose);
        assert_eq!(item.item_type, ItemType::Pending);
        assert!(item.source_indices.is_empty());
        assert_eq!(item.confidence, NEUTRAL_CONFIDENCE);
        assert_eq!(item.source_status, SourceStatus::Unverified);
    }

    #[tokio::test]
    async fn test_empty_retry_falls_back_to_first_response_text() {
        let adapter = FixedAdapter::answering(Value::Null);
        let out = validator()
            .validate(json!("Remind Ann about the invoice"), &adapter, &request(1))
            .await;
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.items[0].item().content, "Remind Ann about the invoice");

        let adapter = FixedAdapter::failing();
        let out = validator().validate(Value::Null, &adapter, &request(1)).await;
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.items[0].item().content, UNREADABLE_ITEM);
        assert!(out.items[0].is_degraded());
    }

    #[test]
    fn test_schema_violations_enumerated() {
        let raw = json!({"items": [
            {"content": 5, "type": "todo", "source_email_indices": [0, -1, 3], "confidence": 1.5}
        ]});
        let errs = check_schema(&raw, 2).unwrap_err();
        assert!(errs.iter().any(|e| e == "items[0].content: not a string"));
        assert!(errs.iter().any(|e| e.contains("type: unknown value 'todo'")));
        assert_eq!(errs.iter().filter(|e| e.contains("out of range")).count(), 2);
        assert!(errs.iter().any(|e| e.contains("outside [0, 1]")));

        assert_eq!(check_schema(&json!({}), 1).unwrap_err(), vec!["items: missing"]);
        assert!(check_schema(&json!({"items": null}), 1).is_err());
    }

    #[test]
    fn test_empty_indices_valid_but_unverified() {
        let raw = json!({"items": [{"content": "Note", "type": "completed",
                                    "source_email_indices": [], "confidence": 0.4}]});
        let items = check_schema(&raw, 1).unwrap();
        assert_eq!(items[0].source_status, SourceStatus::Unverified);
        assert_eq!(items[0].evidence, "");
    }
}
