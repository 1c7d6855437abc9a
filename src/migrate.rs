use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Duplicate history / message-source records
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS email_history (
            fingerprint TEXT PRIMARY KEY,
            message_id TEXT,
            sender TEXT,
            subject TEXT,
            sent_at INTEGER,
            extraction_status TEXT NOT NULL,
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            seen_count INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Action items
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS action_items (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            item_type TEXT NOT NULL,
            confidence REAL NOT NULL,
            source_status TEXT NOT NULL,
            index_status TEXT NOT NULL,
            degraded INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Item <-> message linkage
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS item_sources (
            item_id TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            evidence TEXT NOT NULL DEFAULT '',
            confidence INTEGER NOT NULL,
            PRIMARY KEY (item_id, fingerprint),
            FOREIGN KEY (item_id) REFERENCES action_items(id) ON DELETE CASCADE,
            FOREIGN KEY (fingerprint) REFERENCES email_history(fingerprint)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Traceability anomalies
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_anomalies (
            id TEXT PRIMARY KEY,
            anomaly_type TEXT NOT NULL,
            subject_ref TEXT NOT NULL,
            message_id_value TEXT,
            details TEXT NOT NULL,
            detected_at INTEGER NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_last_seen ON email_history(last_seen)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_item_sources_fp ON item_sources(fingerprint)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_created ON action_items(created_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_anomalies_ref ON index_anomalies(subject_ref)")
        .execute(pool)
        .await?;

    Ok(())
}
