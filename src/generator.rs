//! Generative extraction backends.
//!
//! The generative step is an opaque capability behind [`ExtractionAdapter`]:
//! it receives a digest of the de-duplicated batch and returns the model's
//! JSON answer, unvalidated. Checking that answer is the job of
//! [`crate::validator`].
//!
//! # Backends
//!
//! - **[`OllamaAdapter`]** (`mode = "local"`): `POST {url}/api/chat` on a
//!   local Ollama instance (default `http://localhost:11434`).
//! - **[`OpenAiAdapter`]** (`mode = "remote"`): `POST {url}/chat/completions`
//!   on an OpenAI-compatible API (default `https://api.openai.com/v1`).
//!   The key is read from `MAILTRACE_API_KEY`, then `OPENAI_API_KEY`.
//!
//! # Retry Strategy
//!
//! Both backends use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (other) → fail immediately
//! - Network errors → retry
//!
//! Backoff delays: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5).

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::config::GeneratorConfig;
use crate::models::{AttachmentMeta, Message};

/// Largest batch a backend will accept in one call.
pub const MAX_GENERATION_BATCH: usize = 50;

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

/// What the model sees of one message. Indices are positions in the
/// de-duplicated batch and are what `source_email_indices` refers to.
#[derive(Debug, Clone, Serialize)]
pub struct MessageDigest {
    pub index: usize,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub body: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

/// One generation call.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub messages: Vec<MessageDigest>,
    /// Corrective instruction appended on the validator's retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reinforcement: Option<String>,
}

impl GenerationRequest {
    /// Build a request for a de-duplicated batch. Fails above
    /// [`MAX_GENERATION_BATCH`], before any backend is contacted.
    pub fn from_messages(messages: &[Message]) -> Result<Self> {
        if messages.len() > MAX_GENERATION_BATCH {
            bail!(
                "generation batch of {} messages exceeds the cap of {}",
                messages.len(),
                MAX_GENERATION_BATCH
            );
        }
        Ok(Self {
            messages: messages
                .iter()
                .enumerate()
                .map(|(index, m)| MessageDigest {
                    index,
                    sender: m.sender.clone(),
                    subject: m.subject.clone(),
                    sent_at: m.sent_at,
                    body: m.body.clone(),
                    attachments: m.attachments.iter().map(attachment_label).collect(),
                })
                .collect(),
            reinforcement: None,
        })
    }

    pub fn with_reinforcement(&self, instruction: impl Into<String>) -> Self {
        Self {
            messages: self.messages.clone(),
            reinforcement: Some(instruction.into()),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

fn attachment_label(a: &AttachmentMeta) -> String {
    match &a.content_type {
        Some(ct) => format!("{} ({})", a.filename, ct),
        None => a.filename.clone(),
    }
}

/// A generative extraction backend.
///
/// Local and remote implementations are interchangeable; the pipeline only
/// talks to this trait.
#[async_trait]
pub trait ExtractionAdapter: Send + Sync {
    /// Model identifier reported in outcomes and logs.
    fn model_name(&self) -> &str;

    /// `"local"` or `"remote"` for the built-in backends.
    fn backend(&self) -> &str;

    /// Cheap probe that the backend is reachable.
    async fn health_check(&self) -> Result<()>;

    /// Run one extraction. `Err` means the backend itself failed (transport,
    /// HTTP error after retries); a well-delivered but malformed answer is
    /// returned as whatever JSON (or JSON string) could be recovered.
    async fn generate(&self, request: &GenerationRequest) -> Result<Value>;
}

/// Create the backend selected by `config.mode`.
pub fn create_adapter(config: &GeneratorConfig) -> Result<Box<dyn ExtractionAdapter>> {
    match config.mode.as_str() {
        "local" => Ok(Box::new(OllamaAdapter::new(config)?)),
        "remote" => Ok(Box::new(OpenAiAdapter::new(config)?)),
        other => bail!("Unknown generator mode: {}", other),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Prompt
// ═══════════════════════════════════════════════════════════════════════

const SYSTEM_PROMPT: &str = r#"You extract action items from e-mail.
Answer with a single JSON object and nothing else:
{"items": [{"content": string,
            "type": "completed" | "pending",
            "source_email_indices": [integer, ...],
            "evidence": string,
            "confidence": number between 0 and 1}],
 "batch_info": {"total_emails": integer}}
source_email_indices are the "index" values of the e-mails that justify the item.
Return {"items": []} when there is nothing to do."#;

/// Reinforcement sent with the single corrective retry.
pub const REINFORCEMENT_INSTRUCTION: &str = "Your previous answer did not match the required \
JSON schema. Reply again with ONLY the JSON object. Every item needs a string \"content\", \
\"type\" of \"completed\" or \"pending\", a \"source_email_indices\" array of valid indices, \
and a numeric \"confidence\" between 0 and 1.";

fn user_prompt(request: &GenerationRequest) -> Result<String> {
    Ok(format!(
        "E-mails:\n{}",
        serde_json::to_string_pretty(&request.messages)?
    ))
}

fn chat_messages(request: &GenerationRequest) -> Result<Vec<Value>> {
    let mut messages = vec![
        serde_json::json!({ "role": "system", "content": SYSTEM_PROMPT }),
        serde_json::json!({ "role": "user", "content": user_prompt(request)? }),
    ];
    if let Some(reinforcement) = &request.reinforcement {
        messages.push(serde_json::json!({ "role": "user", "content": reinforcement }));
    }
    Ok(messages)
}

/// Recover JSON from a model's text answer.
///
/// Strips a markdown code fence, then falls back to the outermost `{...}`
/// span. Text with no JSON in it is returned as a JSON string so the
/// validator reports it as a schema violation.
pub fn parse_model_json(text: &str) -> Value {
    let trimmed = text.trim();
    let unfenced = if trimmed.starts_with("```") {
        let lines: Vec<&str> = trimmed.lines().collect();
        if lines.len() >= 2 {
            let end = if lines[lines.len() - 1].trim_start().starts_with("```") {
                lines.len() - 1
            } else {
                lines.len()
            };
            lines[1..end].join("\n")
        } else {
            String::new()
        }
    } else {
        trimmed.to_string()
    };

    if let Ok(v) = serde_json::from_str::<Value>(&unfenced) {
        return v;
    }
    if let (Some(start), Some(end)) = (unfenced.find('{'), unfenced.rfind('}')) {
        if start < end {
            if let Ok(v) = serde_json::from_str::<Value>(&unfenced[start..=end]) {
                return v;
            }
        }
    }
    Value::String(trimmed.to_string())
}

// ═══════════════════════════════════════════════════════════════════════
// Transport
// ═══════════════════════════════════════════════════════════════════════

/// POST `body` to `url` with retry/backoff and return the JSON response.
async fn post_json_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &Value,
    max_retries: u32,
    label: &str,
) -> Result<Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(backend = label, attempt, ?delay, "retrying generation call");
            tokio::time::sleep(delay).await;
        }

        let mut req = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = bearer {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: Value = response.json().await?;
                    return Ok(json);
                }

                // Rate limited or server error, retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!(
                        "{} API error {}: {}",
                        label,
                        status,
                        body_text
                    ));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!("{} connection error ({}): {}", label, url, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} generation failed after retries", label)))
}

fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

// ============ Ollama Adapter ============

/// Local backend on an Ollama instance.
pub struct OllamaAdapter {
    model: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaAdapter {
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        Ok(Self {
            model: config.model.clone(),
            url: url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl ExtractionAdapter for OllamaAdapter {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn backend(&self) -> &str {
        "local"
    }

    async fn health_check(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.url);
        let response = self.client.get(&url).send().await.map_err(|e| {
            anyhow::anyhow!("Ollama connection error (is Ollama running at {}?): {}", self.url, e)
        })?;
        if !response.status().is_success() {
            bail!("Ollama health probe returned {}", response.status());
        }
        let tags: Value = response.json().await?;
        let available = tags
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .any(|n| n == self.model || n.starts_with(&format!("{}:", self.model)))
            })
            .unwrap_or(false);
        if !available {
            bail!("model '{}' is not pulled on {}", self.model, self.url);
        }
        Ok(())
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Value> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": chat_messages(request)?,
            "stream": false,
            "format": "json",
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/api/chat", self.url),
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;

        let content = json
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing message.content"))?;
        Ok(parse_model_json(content))
    }
}

// ============ OpenAI-compatible Adapter ============

/// Remote backend on an OpenAI-compatible chat completions API.
pub struct OpenAiAdapter {
    model: String,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiAdapter {
    /// # Errors
    ///
    /// Returns an error if neither `MAILTRACE_API_KEY` nor `OPENAI_API_KEY`
    /// is set.
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        let api_key = std::env::var("MAILTRACE_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                anyhow::anyhow!("MAILTRACE_API_KEY (or OPENAI_API_KEY) environment variable not set")
            })?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());
        Ok(Self {
            model: config.model.clone(),
            url: url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl ExtractionAdapter for OpenAiAdapter {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn backend(&self) -> &str {
        "remote"
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/models", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("remote health probe returned {}", response.status());
        }
        Ok(())
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Value> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": chat_messages(request)?,
            "response_format": { "type": "json_object" },
            "temperature": 0,
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/chat/completions", self.url),
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;

        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                anyhow::anyhow!("Invalid OpenAI response: missing choices[0].message.content")
            })?;
        Ok(parse_model_json(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRecord;

    fn messages(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                Message::from_record(
                    MessageRecord {
                        message_id: Some(format!("{i}@example.com")),
                        body: format!("body {i}"),
                        ..Default::default()
                    },
                    1024,
                )
            })
            .collect()
    }

    #[test]
    fn test_request_cap_enforced_before_call() {
        assert_eq!(GenerationRequest::from_messages(&messages(50)).unwrap().len(), 50);
        assert!(GenerationRequest::from_messages(&messages(51)).is_err());
    }

    #[test]
    fn test_reinforcement_appended_as_last_turn() {
        let req = GenerationRequest::from_messages(&messages(2)).unwrap();
        assert_eq!(chat_messages(&req).unwrap().len(), 2);
        let retry = req.with_reinforcement(REINFORCEMENT_INSTRUCTION);
        let turns = chat_messages(&retry).unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[2]["content"], REINFORCEMENT_INSTRUCTION);
        assert_eq!(retry.messages[1].index, 1);
    }

    #[test]
    fn test_parse_model_json_fenced_and_embedded() {
        let fenced = "```json\n{\"items\": []}\n```";
        assert_eq!(parse_model_json(fenced), serde_json::json!({"items": []}));

        let chatty = "Sure! Here you go: {\"items\": [1]} Hope that helps.";
        assert_eq!(parse_model_json(chatty), serde_json::json!({"items": [1]}));

        assert_eq!(
            parse_model_json("no json here"),
            Value::String("no json here".into())
        );
    }

    #[test]
    fn test_create_adapter_local() {
        let adapter = create_adapter(&GeneratorConfig::default()).unwrap();
        assert_eq!(adapter.backend(), "local");
        assert_eq!(adapter.model_name(), "qwen2.5:7b");
    }
}
