//! Persisted totals and traceability health.
//!
//! Used by `mailtrace stats` to show how many messages, items and linkage
//! records are stored, how many items are unverified, and which index
//! anomalies are still open.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::store::sqlite::SqliteStore;
use crate::store::Store;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    let store = SqliteStore::new(pool.clone());
    let totals = store.totals().await?;

    let last_seen: Option<i64> = sqlx::query_scalar("SELECT MAX(last_seen) FROM email_history")
        .fetch_one(&pool)
        .await?;

    println!("mailtrace stats");
    println!("  Database:    {}", config.db.path.display());
    println!();
    println!("  Messages:    {}", totals.messages);
    println!("  Items:       {}", totals.items);
    println!("  Links:       {}", totals.links);
    println!(
        "  Unverified:  {} of {} item(s)",
        totals.unverified_items, totals.items
    );
    println!(
        "  Last seen:   {}",
        last_seen
            .map(format_last_seen)
            .unwrap_or_else(|| "never".to_string())
    );

    let anomaly_rows = sqlx::query(
        r#"
        SELECT anomaly_type, COUNT(*) AS n
        FROM index_anomalies
        WHERE resolved = 0
        GROUP BY anomaly_type
        ORDER BY n DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if !anomaly_rows.is_empty() {
        println!();
        println!("  Open anomalies:");
        println!("  {:<32} {:>6}", "TYPE", "COUNT");
        println!("  {}", "-".repeat(40));
        for row in &anomaly_rows {
            let kind: String = row.get("anomaly_type");
            let n: i64 = row.get("n");
            println!("  {:<32} {:>6}", kind, n);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn format_last_seen(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_last_seen() {
        assert_eq!(format_last_seen(0), "1970-01-01 00:00 UTC");
        assert_eq!(format_last_seen(1_709_285_400), "2024-03-01 09:30 UTC");
    }
}
