//! Database and index statistics.
//!
//! A quick health overview: row counts, vector coverage against the
//! watermark, per-dataset breakdowns, and the tail of the completion
//! ledger. Used by `leads stats` to confirm ingestion and vectorization
//! are keeping up.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::progress::format_number;
use crate::store::Store;

struct DatasetStats {
    dataset: String,
    row_count: i64,
    file_count: i64,
    error_count: i64,
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = Store::new(pool.clone());

    let total_rows = store.count_rows(None).await?;
    let watermark = store.vector_watermark().await?;
    let unvectorized = store.count_rows_above(watermark).await?;
    let vectorized = total_rows - unvectorized;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("LeadSearch — Store Stats");
    println!("========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Rows:        {}", format_number(total_rows as u64));
    println!(
        "  Vectorized:  {} / {} ({}%)",
        format_number(vectorized.max(0) as u64),
        format_number(total_rows as u64),
        if total_rows > 0 {
            (vectorized.max(0) * 100) / total_rows
        } else {
            0
        }
    );
    if let Some(model) = store.meta_get(crate::store::META_EMBEDDING_MODEL).await? {
        println!("  Model:       {}", model);
    }
    if unvectorized > 0 {
        println!(
            "  Backlog:     {} rows (run `leads vectors pending`)",
            format_number(unvectorized as u64)
        );
    }

    // Per-dataset breakdown
    let dataset_rows = sqlx::query(
        r#"
        SELECT
            l.dataset,
            COUNT(*) AS row_count,
            (SELECT COUNT(*) FROM processed_files p WHERE p.dataset = l.dataset) AS file_count,
            (SELECT COALESCE(SUM(error_count), 0) FROM processed_files p WHERE p.dataset = l.dataset) AS error_count
        FROM leads l
        GROUP BY l.dataset
        ORDER BY row_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let datasets: Vec<DatasetStats> = dataset_rows
        .iter()
        .map(|r| DatasetStats {
            dataset: r.get("dataset"),
            row_count: r.get("row_count"),
            file_count: r.get("file_count"),
            error_count: r.get("error_count"),
        })
        .collect();

    if !datasets.is_empty() {
        println!();
        println!("  By dataset:");
        println!(
            "  {:<24} {:>12} {:>6} {:>10}",
            "DATASET", "ROWS", "FILES", "ROW ERRORS"
        );
        println!("  {}", "-".repeat(58));
        for d in &datasets {
            println!(
                "  {:<24} {:>12} {:>6} {:>10}",
                d.dataset,
                format_number(d.row_count as u64),
                d.file_count,
                d.error_count
            );
        }
    }

    // Ledger tail
    let files = store.processed_files().await?;
    if !files.is_empty() {
        println!();
        println!("  Recent files:");
        for f in files.iter().take(8) {
            println!(
                "  {:<40} {:>10} rows   {}",
                f.file_name,
                format_number(f.row_count as u64),
                format_ts_relative(f.completed_at)
            );
        }
    }

    println!();

    store.close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
