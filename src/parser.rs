//! Message parser seam.
//!
//! Format-specific parsing (RFC 822, Outlook, ...) lives outside this crate.
//! The pipeline only sees [`RawEmail`] envelopes and asks a
//! [`MessageParser`] to turn each one into a [`MessageRecord`]. The bundled
//! [`JsonRecordParser`] accepts records that an upstream tool already
//! flattened to JSON.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::models::MessageRecord;

/// One unparsed message handed to the pipeline.
#[derive(Debug, Clone)]
pub struct RawEmail {
    /// Where the content came from (path, queue id, ...). Used in logs.
    pub source: String,
    pub content: String,
}

impl RawEmail {
    pub fn new(source: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            content: content.into(),
        }
    }
}

/// Turns a raw envelope into a message record.
///
/// A parse error excludes only that message; the batch continues.
pub trait MessageParser: Send + Sync {
    fn name(&self) -> &str;

    fn parse(&self, raw: &RawEmail) -> Result<MessageRecord>;
}

/// Parser for pre-extracted JSON message records.
#[derive(Debug, Default, Clone)]
pub struct JsonRecordParser;

impl MessageParser for JsonRecordParser {
    fn name(&self) -> &str {
        "json"
    }

    fn parse(&self, raw: &RawEmail) -> Result<MessageRecord> {
        if raw.content.trim().is_empty() {
            bail!("empty message content");
        }
        serde_json::from_str(&raw.content)
            .with_context(|| format!("invalid message record in {}", raw.source))
    }
}

/// Collect raw envelopes from files and directories.
///
/// Directories are walked for `*.json`. A file holding a JSON array yields
/// one envelope per element, in order; any other file is one envelope.
pub fn load_raw_emails(paths: &[PathBuf]) -> Result<Vec<RawEmail>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("json"))
                .collect();
            found.sort();
            files.extend(found);
        } else {
            files.push(path.clone());
        }
    }

    let mut raws = Vec::new();
    for file in files {
        raws.extend(read_envelopes(&file)?);
    }
    Ok(raws)
}

fn read_envelopes(path: &Path) -> Result<Vec<RawEmail>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read message file: {}", path.display()))?;
    let source = path.display().to_string();

    // Arrays are split so each element is parsed (and can fail) on its own.
    if content.trim_start().starts_with('[') {
        if let Ok(serde_json::Value::Array(elements)) =
            serde_json::from_str::<serde_json::Value>(&content)
        {
            return Ok(elements
                .iter()
                .enumerate()
                .map(|(i, v)| RawEmail::new(format!("{source}#{i}"), v.to_string()))
                .collect());
        }
    }
    Ok(vec![RawEmail::new(source, content)])
}
