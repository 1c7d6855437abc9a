//! JSON-lines audit trail of traceability events.
//!
//! One JSON object per line, each with `timestamp` and `event_type`:
//! `batch_completed`, `batch_failed`, `index_anomaly`, `item_extracted`.
//! [`AuditLog::export`] gathers the valid lines into one JSON array.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::models::{ActionItem, IndexAnomaly};

pub struct AuditLog {
    path: PathBuf,
    // Serializes appends from concurrent batches.
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Open (and create the parent directory of) the log at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create audit log directory: {}", parent.display())
                })?;
            }
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_index_anomaly(&self, anomaly: &IndexAnomaly) -> Result<()> {
        self.write_event(
            "index_anomaly",
            json!({
                "anomaly_id": anomaly.id,
                "anomaly_type": anomaly.anomaly_type,
                "subject_ref": anomaly.subject_ref,
                "message_id_value": anomaly.message_id_value,
                "details": anomaly.details,
            }),
        )
    }

    pub fn log_item_extracted(&self, item: &ActionItem) -> Result<()> {
        self.write_event(
            "item_extracted",
            json!({
                "item_id": item.id,
                "item_type": item.item_type,
                "confidence": item.confidence,
                "source_status": item.source_status,
                "index_status": item.index_status,
                "source_fingerprints": item.source_fingerprints,
                "degraded": item.degraded,
            }),
        )
    }

    pub fn log_batch_completed<S: Serialize>(&self, stats: &S) -> Result<()> {
        self.write_event("batch_completed", serde_json::to_value(stats)?)
    }

    pub fn log_batch_failed(&self, stage: &str, error: &str) -> Result<()> {
        self.write_event("batch_failed", json!({ "stage": stage, "error": error }))
    }

    fn write_event(&self, event_type: &str, fields: Value) -> Result<()> {
        let mut event = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event_type": event_type,
        });
        if let (Some(obj), Value::Object(extra)) = (event.as_object_mut(), fields) {
            for (k, v) in extra {
                obj.entry(k).or_insert(v);
            }
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self.write_lock.lock().unwrap();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open audit log: {}", self.path.display()))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// All parseable events, in write order. Invalid lines are skipped.
    pub fn events(&self) -> Result<Vec<Value>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read audit log: {}", self.path.display()))?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// Write every valid event to `output` as a pretty JSON array.
    /// Returns the number of events exported.
    pub fn export(&self, output: &Path) -> Result<usize> {
        let events = self.events()?;
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(output, serde_json::to_string_pretty(&events)?)
            .with_context(|| format!("Failed to write export: {}", output.display()))?;
        Ok(events.len())
    }
}
