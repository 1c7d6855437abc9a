//! SQLite-backed [`Store`] implementation.
//!
//! The cross-batch duplicate check is a single `UPDATE ... RETURNING`
//! statement, so two pipelines racing on the same fingerprint each bump
//! `last_seen` exactly once and neither can observe a half-written row.
//! [`persist_batch`](Store::persist_batch) runs inside one transaction.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::models::Message;

use super::{HistoryEntry, PersistBatch, Store, StoreTotals};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn status_str(message: &Message) -> &'static str {
    use crate::models::ExtractionStatus::*;
    match message.extraction_status {
        Complete => "complete",
        MissingMessageId => "missing_message_id",
        MalformedMessageId => "malformed_message_id",
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn touch_if_seen(&self, fingerprint: &str, now: i64) -> Result<Option<HistoryEntry>> {
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            r#"
            UPDATE email_history
            SET last_seen = ?, seen_count = seen_count + 1
            WHERE fingerprint = ?
            RETURNING first_seen, last_seen, seen_count
            "#,
        )
        .bind(now)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .context("history lookup failed")?;

        Ok(row.map(|(first_seen, last_seen, seen_count)| HistoryEntry {
            fingerprint: fingerprint.to_string(),
            first_seen,
            last_seen,
            seen_count,
        }))
    }

    async fn history_entry(&self, fingerprint: &str) -> Result<Option<HistoryEntry>> {
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            "SELECT first_seen, last_seen, seen_count FROM email_history WHERE fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(first_seen, last_seen, seen_count)| HistoryEntry {
            fingerprint: fingerprint.to_string(),
            first_seen,
            last_seen,
            seen_count,
        }))
    }

    async fn persist_batch(&self, batch: &PersistBatch) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for m in &batch.messages {
            sqlx::query(
                r#"
                INSERT INTO email_history (fingerprint, message_id, sender, subject, sent_at,
                                           extraction_status, first_seen, last_seen, seen_count)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1)
                ON CONFLICT(fingerprint) DO UPDATE SET last_seen = excluded.last_seen,
                                              seen_count = seen_count + 1
                "#,
            )
            .bind(&m.fingerprint)
            .bind(&m.message_id)
            .bind(&m.sender)
            .bind(&m.subject)
            .bind(m.sent_at.map(|d| d.timestamp()))
            .bind(status_str(m))
            .bind(batch.seen_at)
            .bind(batch.seen_at)
            .execute(&mut *tx)
            .await?;
        }

        for item in &batch.items {
            sqlx::query(
                r#"
                INSERT INTO action_items (id, content, item_type, confidence, source_status,
                                          index_status, degraded, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&item.id)
            .bind(&item.content)
            .bind(item.item_type.as_str())
            .bind(item.confidence)
            .bind(item.source_status.as_str())
            .bind(item.index_status.as_str())
            .bind(item.degraded)
            .bind(item.created_at.timestamp())
            .execute(&mut *tx)
            .await?;
        }

        for link in &batch.links {
            sqlx::query(
                r#"
                INSERT INTO item_sources (item_id, fingerprint, evidence, confidence)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(item_id, fingerprint) DO NOTHING
                "#,
            )
            .bind(&link.item_id)
            .bind(&link.fingerprint)
            .bind(&link.evidence)
            .bind(link.confidence)
            .execute(&mut *tx)
            .await?;
        }

        for anomaly in &batch.anomalies {
            sqlx::query(
                r#"
                INSERT INTO index_anomalies (id, anomaly_type, subject_ref, message_id_value,
                                             details, detected_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&anomaly.id)
            .bind(anomaly.anomaly_type.as_str())
            .bind(&anomaly.subject_ref)
            .bind(&anomaly.message_id_value)
            .bind(&anomaly.details)
            .bind(anomaly.detected_at.timestamp())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn totals(&self) -> Result<StoreTotals> {
        let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM email_history")
            .fetch_one(&self.pool)
            .await?;
        let items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM action_items")
            .fetch_one(&self.pool)
            .await?;
        let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM item_sources")
            .fetch_one(&self.pool)
            .await?;
        let unverified_items: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM action_items WHERE source_status = 'unverified'",
        )
        .fetch_one(&self.pool)
        .await?;
        let anomalies: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM index_anomalies WHERE resolved = 0")
                .fetch_one(&self.pool)
                .await?;

        Ok(StoreTotals {
            messages,
            items,
            links,
            unverified_items,
            anomalies,
        })
    }
}
