//! In-memory [`Store`] implementation for tests and dry runs.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. The history
//! lookup-and-touch happens under one write lock, which gives the same
//! atomicity as the single SQL statement of the SQLite store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ActionItem, IndexAnomaly, SourceLink, SourceStatus};

use super::{HistoryEntry, PersistBatch, Store, StoreTotals};

/// In-memory store.
pub struct InMemoryStore {
    history: RwLock<HashMap<String, HistoryEntry>>,
    items: RwLock<Vec<ActionItem>>,
    links: RwLock<Vec<SourceLink>>,
    anomalies: RwLock<Vec<IndexAnomaly>>,
    lookups: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            history: RwLock::new(HashMap::new()),
            items: RwLock::new(Vec::new()),
            links: RwLock::new(Vec::new()),
            anomalies: RwLock::new(Vec::new()),
            lookups: AtomicUsize::new(0),
        }
    }

    /// Seed a history row, as if a previous batch had committed it.
    pub fn seed_history(&self, fingerprint: &str, first_seen: i64) {
        self.history.write().unwrap().insert(
            fingerprint.to_string(),
            HistoryEntry {
                fingerprint: fingerprint.to_string(),
                first_seen,
                last_seen: first_seen,
                seen_count: 1,
            },
        );
    }

    /// Number of [`Store::touch_if_seen`] calls so far.
    pub fn history_lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn items(&self) -> Vec<ActionItem> {
        self.items.read().unwrap().clone()
    }

    pub fn links(&self) -> Vec<SourceLink> {
        self.links.read().unwrap().clone()
    }

    pub fn anomalies(&self) -> Vec<IndexAnomaly> {
        self.anomalies.read().unwrap().clone()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn touch_if_seen(&self, fingerprint: &str, now: i64) -> Result<Option<HistoryEntry>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let mut history = self.history.write().unwrap();
        Ok(history.get_mut(fingerprint).map(|entry| {
            entry.last_seen = now;
            entry.seen_count += 1;
            entry.clone()
        }))
    }

    async fn history_entry(&self, fingerprint: &str) -> Result<Option<HistoryEntry>> {
        Ok(self.history.read().unwrap().get(fingerprint).cloned())
    }

    async fn persist_batch(&self, batch: &PersistBatch) -> Result<()> {
        {
            let mut history = self.history.write().unwrap();
            for m in &batch.messages {
                history
                    .entry(m.fingerprint.clone())
                    .and_modify(|e| {
                        e.last_seen = batch.seen_at;
                        e.seen_count += 1;
                    })
                    .or_insert_with(|| HistoryEntry {
                        fingerprint: m.fingerprint.clone(),
                        first_seen: batch.seen_at,
                        last_seen: batch.seen_at,
                        seen_count: 1,
                    });
            }
        }
        self.items
            .write()
            .unwrap()
            .extend(batch.items.iter().cloned());
        self.links
            .write()
            .unwrap()
            .extend(batch.links.iter().cloned());
        self.anomalies
            .write()
            .unwrap()
            .extend(batch.anomalies.iter().cloned());
        Ok(())
    }

    async fn totals(&self) -> Result<StoreTotals> {
        let items = self.items.read().unwrap();
        Ok(StoreTotals {
            messages: self.history.read().unwrap().len() as i64,
            items: items.len() as i64,
            links: self.links.read().unwrap().len() as i64,
            unverified_items: items
                .iter()
                .filter(|i| i.source_status == SourceStatus::Unverified)
                .count() as i64,
            anomalies: self.anomalies.read().unwrap().len() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_touch_only_existing_rows() {
        let store = InMemoryStore::new();
        assert!(store.touch_if_seen("abc", 10).await.unwrap().is_none());
        assert!(store.history_entry("abc").await.unwrap().is_none());

        store.seed_history("abc", 5);
        let hit = store.touch_if_seen("abc", 20).await.unwrap().unwrap();
        assert_eq!(hit.first_seen, 5);
        assert_eq!(hit.last_seen, 20);
        assert_eq!(hit.seen_count, 2);
        assert_eq!(store.history_lookups(), 2);
    }

    #[tokio::test]
    async fn test_persist_keeps_first_seen() {
        let store = InMemoryStore::new();
        store.seed_history("old", 1);
        let msg = crate::models::Message::from_record(Default::default(), 100);
        let fp = msg.fingerprint.clone();
        store
            .persist_batch(&PersistBatch {
                messages: vec![msg],
                seen_at: 99,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(store.history_entry("old").await.unwrap().unwrap().first_seen, 1);
        assert_eq!(store.history_entry(&fp).await.unwrap().unwrap().first_seen, 99);
        assert_eq!(store.totals().await.unwrap().messages, 2);

        // A second commit of the same message counts as another sighting.
        let again = crate::models::Message::from_record(Default::default(), 100);
        store
            .persist_batch(&PersistBatch {
                messages: vec![again],
                seen_at: 150,
                ..Default::default()
            })
            .await
            .unwrap();
        let entry = store.history_entry(&fp).await.unwrap().unwrap();
        assert_eq!(entry.first_seen, 99);
        assert_eq!(entry.last_seen, 150);
        assert_eq!(entry.seen_count, 2);
    }
}
