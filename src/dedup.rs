//! Same-batch and cross-batch duplicate suppression.
//!
//! The in-batch set is consulted first and never touches the store. Only on
//! a miss does the detector ask the [`Store`] for the fingerprint, using
//! the atomic [`Store::touch_if_seen`] so concurrent batches cannot
//! double-count a cross-batch hit. A failed lookup resolves to
//! [`DuplicateVerdict::Unique`]: double-processing beats silent loss.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::models::{AnomalyType, IndexAnomaly, Message};
use crate::store::{unix_now, Store};

/// Per-batch duplicate counters. Created fresh for every batch.
#[derive(Debug, Default)]
pub struct DuplicateStats {
    pub same_batch: usize,
    pub cross_batch: usize,
    seen: HashSet<String>,
    /// Lookup failures recorded while resolving to unique.
    pub failures: Vec<IndexAnomaly>,
}

impl DuplicateStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unique_count(&self) -> usize {
        self.seen.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateVerdict {
    Unique,
    SameBatch,
    CrossBatch,
}

impl DuplicateVerdict {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, Self::Unique)
    }
}

pub struct DuplicateDetector {
    store: Arc<dyn Store>,
}

impl DuplicateDetector {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn check_duplicate(
        &self,
        message: &Message,
        stats: &mut DuplicateStats,
    ) -> DuplicateVerdict {
        if stats.seen.contains(&message.fingerprint) {
            stats.same_batch += 1;
            debug!(fp_prefix = message.fp_prefix(), stage = "deduplicate", "same-batch duplicate");
            return DuplicateVerdict::SameBatch;
        }

        match self
            .store
            .touch_if_seen(&message.fingerprint, unix_now())
            .await
        {
            Ok(Some(entry)) => {
                stats.cross_batch += 1;
                debug!(
                    fp_prefix = message.fp_prefix(),
                    stage = "deduplicate",
                    first_seen = entry.first_seen,
                    seen_count = entry.seen_count,
                    "cross-batch duplicate"
                );
                DuplicateVerdict::CrossBatch
            }
            Ok(None) => {
                stats.seen.insert(message.fingerprint.clone());
                DuplicateVerdict::Unique
            }
            Err(e) => {
                warn!(
                    fp_prefix = message.fp_prefix(),
                    stage = "deduplicate",
                    error = %e,
                    "history lookup failed, treating as unique"
                );
                stats.failures.push(IndexAnomaly::new(
                    AnomalyType::DuplicateDetectionFailure,
                    message.fingerprint.clone(),
                    message.message_id.clone(),
                    format!("history lookup failed: {e}"),
                ));
                stats.seen.insert(message.fingerprint.clone());
                DuplicateVerdict::Unique
            }
        }
    }

    pub fn log_summary(&self, stats: &DuplicateStats) {
        info!(
            stage = "deduplicate",
            unique = stats.unique_count(),
            same_batch_duplicates = stats.same_batch,
            cross_batch_duplicates = stats.cross_batch,
            lookup_failures = stats.failures.len(),
            "duplicate detection summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRecord;
    use crate::store::memory::InMemoryStore;
    use crate::store::{HistoryEntry, PersistBatch, StoreTotals};
    use anyhow::{bail, Result};
    use async_trait::async_trait;

    fn message(id: &str) -> Message {
        Message::from_record(
            MessageRecord {
                message_id: Some(id.into()),
                sender: Some("a@b.com".into()),
                body: "hi".into(),
                ..Default::default()
            },
            1024,
        )
    }

    #[tokio::test]
    async fn test_same_batch_skips_store() {
        let store = Arc::new(InMemoryStore::new());
        let detector = DuplicateDetector::new(store.clone());
        let mut stats = DuplicateStats::new();

        let m = message("1@x.com");
        assert_eq!(
            detector.check_duplicate(&m, &mut stats).await,
            DuplicateVerdict::Unique
        );
        assert_eq!(store.history_lookups(), 1);
        assert_eq!(
            detector.check_duplicate(&m.clone(), &mut stats).await,
            DuplicateVerdict::SameBatch
        );
        assert_eq!(store.history_lookups(), 1);
        assert_eq!(stats.same_batch, 1);
        assert_eq!(stats.unique_count(), 1);
    }

    #[tokio::test]
    async fn test_cross_batch_bumps_last_seen_only() {
        let store = Arc::new(InMemoryStore::new());
        let m = message("2@x.com");
        store.seed_history(&m.fingerprint, 100);
        let detector = DuplicateDetector::new(store.clone());
        let mut stats = DuplicateStats::new();

        assert_eq!(
            detector.check_duplicate(&m, &mut stats).await,
            DuplicateVerdict::CrossBatch
        );
        assert_eq!(stats.cross_batch, 1);
        assert_eq!(stats.unique_count(), 0);

        let entry = store.history_entry(&m.fingerprint).await.unwrap().unwrap();
        assert_eq!(entry.first_seen, 100);
        assert!(entry.last_seen > 100);
    }

    struct FailingStore;

    #[async_trait]
    impl Store for FailingStore {
        async fn touch_if_seen(&self, _: &str, _: i64) -> Result<Option<HistoryEntry>> {
            bail!("database is locked")
        }
        async fn history_entry(&self, _: &str) -> Result<Option<HistoryEntry>> {
            Ok(None)
        }
        async fn persist_batch(&self, _: &PersistBatch) -> Result<()> {
            Ok(())
        }
        async fn totals(&self) -> Result<StoreTotals> {
            Ok(StoreTotals::default())
        }
    }

    #[tokio::test]
    async fn test_lookup_failure_resolves_to_unique() {
        let detector = DuplicateDetector::new(Arc::new(FailingStore));
        let mut stats = DuplicateStats::new();
        let m = message("3@x.com");

        assert_eq!(
            detector.check_duplicate(&m, &mut stats).await,
            DuplicateVerdict::Unique
        );
        assert_eq!(stats.failures.len(), 1);
        assert_eq!(
            stats.failures[0].anomaly_type,
            AnomalyType::DuplicateDetectionFailure
        );
        // Still suppresses a later same-batch copy.
        assert_eq!(
            detector.check_duplicate(&m, &mut stats).await,
            DuplicateVerdict::SameBatch
        );
    }
}
