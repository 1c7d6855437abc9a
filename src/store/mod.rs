//! Storage abstraction for mailtrace.
//!
//! The [`Store`] trait is the persistence collaborator of the pipeline: it
//! owns the duplicate history (the only state shared between concurrent
//! batches) and accepts the records a successful batch produces.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use crate::models::{ActionItem, IndexAnomaly, Message, SourceLink};

/// Persisted duplicate-history row for one fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub fingerprint: String,
    /// Unix seconds; written once, never updated.
    pub first_seen: i64,
    /// Unix seconds; bumped on every cross-batch hit.
    pub last_seen: i64,
    pub seen_count: i64,
}

/// Everything a successful batch commits, in one unit.
#[derive(Debug, Clone, Default)]
pub struct PersistBatch {
    /// Unique messages that went through extraction.
    pub messages: Vec<Message>,
    pub items: Vec<ActionItem>,
    pub links: Vec<SourceLink>,
    pub anomalies: Vec<IndexAnomaly>,
    /// Unix seconds used as first/last-seen for new history rows.
    pub seen_at: i64,
}

/// Persisted totals for `mailtrace stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreTotals {
    pub messages: i64,
    pub items: i64,
    pub links: i64,
    pub unverified_items: i64,
    pub anomalies: i64,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`touch_if_seen`](Store::touch_if_seen) | Atomic cross-batch duplicate lookup + last-seen bump |
/// | [`history_entry`](Store::history_entry) | Read a history row |
/// | [`persist_batch`](Store::persist_batch) | All-or-nothing commit of a batch |
/// | [`totals`](Store::totals) | Row counts |
#[async_trait]
pub trait Store: Send + Sync {
    /// If `fingerprint` is already in the history, set its `last_seen` to
    /// `now` and return the updated row; otherwise return `None` and write
    /// nothing. Must be a single atomic read-then-conditionally-write.
    async fn touch_if_seen(&self, fingerprint: &str, now: i64) -> Result<Option<HistoryEntry>>;

    /// Read a history row without touching it.
    async fn history_entry(&self, fingerprint: &str) -> Result<Option<HistoryEntry>>;

    /// Commit messages (as history rows), items, links and anomalies
    /// atomically. Existing history rows keep their `first_seen` and count
    /// one more sighting.
    async fn persist_batch(&self, batch: &PersistBatch) -> Result<()>;

    async fn totals(&self) -> Result<StoreTotals>;
}

pub(crate) fn unix_now() -> i64 {
    Utc::now().timestamp()
}
