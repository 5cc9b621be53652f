use anyhow::Result;

use crate::config::Config;
use crate::db;

/// Current schema version, recorded in `meta` on first init.
pub const SCHEMA_VERSION: &str = "1";

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // Canonical row table. Ids are rowids: monotonic, assigned in insertion
    // order, never reused while the table exists.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS leads (
            id INTEGER PRIMARY KEY,
            dataset TEXT NOT NULL,
            source_file TEXT NOT NULL,
            name TEXT,
            username TEXT,
            bio TEXT,
            category TEXT,
            website TEXT,
            email TEXT,
            phone TEXT,
            title TEXT,
            city TEXT,
            company TEXT,
            domain TEXT,
            follower_count INTEGER,
            following_count INTEGER,
            text_concat TEXT NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Per-file completion ledger: presence means the file is skipped on
    // restart (the unit of idempotence is the whole file).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_files (
            dataset TEXT NOT NULL,
            file_name TEXT NOT NULL,
            row_count INTEGER NOT NULL,
            error_count INTEGER NOT NULL DEFAULT 0,
            completed_at INTEGER NOT NULL,
            PRIMARY KEY (dataset, file_name)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Contentless FTS5 index over the indexed text; rowids are lead ids.
    // FTS5 CREATE is not idempotent natively, so we check first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='leads_fts'",
    )
    .fetch_one(&pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE leads_fts USING fts5(
                text_concat,
                content=''
            )
            "#,
        )
        .execute(&pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_leads_dataset ON leads(dataset)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_leads_category ON leads(category)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_leads_follower_count ON leads(follower_count)")
        .execute(&pool)
        .await?;

    sqlx::query("INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?)")
        .bind(SCHEMA_VERSION)
        .execute(&pool)
        .await?;

    pool.close().await;
    Ok(())
}
