//! SQLite-backed store: canonical rows, contentless lexical index, the
//! per-file completion ledger, and the `meta` key-value table.
//!
//! All batch mutation goes through [`Store::insert_batch`], which commits
//! rows and their FTS entries in one transaction — a crash never leaves a
//! half-written batch visible. Ids are SQLite rowids: assigned in insertion
//! order, monotonic, never reused.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::models::{LeadRow, ProcessedFile};

pub const META_EMBEDDING_MODEL: &str = "embedding_model";
pub const META_EMBEDDING_DIMS: &str = "embedding_dims";
pub const META_VECTOR_WATERMARK: &str = "vector_watermark";

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[allow(dead_code)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert a batch of rows and their lexical-index entries in one
    /// transaction. Returns the assigned ids in insertion order. On any
    /// failure the transaction rolls back and nothing is visible.
    pub async fn insert_batch(&self, rows: &[LeadRow]) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(rows.len());

        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO leads (dataset, source_file, name, username, bio, category,
                                   website, email, phone, title, city, company, domain,
                                   follower_count, following_count, text_concat)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.dataset)
            .bind(&row.source_file)
            .bind(&row.name)
            .bind(&row.username)
            .bind(&row.bio)
            .bind(&row.category)
            .bind(&row.website)
            .bind(&row.email)
            .bind(&row.phone)
            .bind(&row.title)
            .bind(&row.city)
            .bind(&row.company)
            .bind(&row.domain)
            .bind(row.follower_count)
            .bind(row.following_count)
            .bind(&row.text_concat)
            .execute(&mut *tx)
            .await?;

            let id = result.last_insert_rowid();

            sqlx::query("INSERT INTO leads_fts (rowid, text_concat) VALUES (?, ?)")
                .bind(id)
                .bind(&row.text_concat)
                .execute(&mut *tx)
                .await?;

            ids.push(id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    pub async fn is_file_complete(&self, dataset: &str, file_name: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM processed_files WHERE dataset = ? AND file_name = ?",
        )
        .bind(dataset)
        .bind(file_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    /// Record file completion. Called only after every batch of the file
    /// has committed.
    pub async fn mark_file_complete(
        &self,
        dataset: &str,
        file_name: &str,
        row_count: i64,
        error_count: i64,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO processed_files (dataset, file_name, row_count, error_count, completed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(dataset, file_name) DO UPDATE SET
                row_count = excluded.row_count,
                error_count = excluded.error_count,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(dataset)
        .bind(file_name)
        .bind(row_count)
        .bind(error_count)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn processed_files(&self) -> Result<Vec<ProcessedFile>> {
        let rows = sqlx::query(
            "SELECT dataset, file_name, row_count, error_count, completed_at
             FROM processed_files ORDER BY completed_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| ProcessedFile {
                dataset: r.get("dataset"),
                file_name: r.get("file_name"),
                row_count: r.get("row_count"),
                error_count: r.get("error_count"),
                completed_at: r.get("completed_at"),
            })
            .collect())
    }

    /// Ranked lexical search. The query is sanitized into an OR-joined FTS5
    /// MATCH expression; the returned score is the negated BM25 rank, so
    /// higher is better.
    pub async fn lexical_search(
        &self,
        query: &str,
        datasets: &[String],
        limit: i64,
    ) -> Result<Vec<(i64, f64)>> {
        let Some(match_expr) = build_match_query(query) else {
            return Ok(Vec::new());
        };

        let mut sql = String::from(
            "SELECT leads_fts.rowid AS id, leads_fts.rank AS rank
             FROM leads_fts",
        );
        if !datasets.is_empty() {
            sql.push_str(" JOIN leads l ON l.id = leads_fts.rowid");
        }
        sql.push_str(" WHERE leads_fts MATCH ?");
        if !datasets.is_empty() {
            sql.push_str(&format!(
                " AND l.dataset IN ({})",
                vec!["?"; datasets.len()].join(",")
            ));
        }
        sql.push_str(" ORDER BY rank LIMIT ?");

        let mut q = sqlx::query(&sql).bind(&match_expr);
        for dataset in datasets {
            q = q.bind(dataset);
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|r| {
                let rank: f64 = r.get("rank");
                (r.get::<i64, _>("id"), -rank)
            })
            .collect())
    }

    /// Hydrate rows by id, preserving the caller's id order (fusion order),
    /// not storage order. Ids that no longer exist are silently dropped.
    pub async fn fetch_rows(&self, ids: &[i64]) -> Result<Vec<LeadRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT * FROM leads WHERE id IN ({})",
            vec!["?"; ids.len()].join(",")
        );
        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut by_id: HashMap<i64, LeadRow> = rows
            .iter()
            .map(|r| {
                let row = row_from_sqlite(r);
                (row.id, row)
            })
            .collect();

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    pub async fn count_rows(&self, dataset: Option<&str>) -> Result<i64> {
        let count: i64 = match dataset {
            Some(ds) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM leads WHERE dataset = ?")
                    .bind(ds)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM leads")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    pub async fn count_rows_above(&self, id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leads WHERE id > ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn max_row_id(&self) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM leads")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.unwrap_or(0))
    }

    // ============ meta ============

    pub async fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Highest row id whose vector is durably persisted. Rows above it are
    /// the deferred-vectorization backlog.
    pub async fn vector_watermark(&self) -> Result<i64> {
        Ok(self
            .meta_get(META_VECTOR_WATERMARK)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub async fn set_vector_watermark(&self, id: i64) -> Result<()> {
        self.meta_set(META_VECTOR_WATERMARK, &id.to_string()).await
    }

    /// `(id, text_concat)` for stored-but-unvectorized rows, ascending.
    pub async fn unvectorized(&self, after: i64, limit: i64) -> Result<Vec<(i64, String)>> {
        let rows = sqlx::query(
            "SELECT id, text_concat FROM leads WHERE id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<i64, _>("id"), r.get::<String, _>("text_concat")))
            .collect())
    }

    /// Read-only identity check for query time: never records, only fails
    /// on mismatch with what ingestion recorded.
    pub async fn verify_embedding_identity(&self, model: &str) -> Result<()> {
        if let Some(recorded) = self.meta_get(META_EMBEDDING_MODEL).await? {
            if recorded != model {
                bail!(
                    "Vectors were built with embedding model '{}' but config says '{}'. \
                     Fix embedding.model or rebuild the index.",
                    recorded,
                    model
                );
            }
        }
        Ok(())
    }

    /// Record the embedding identity on first vectorizing use, or fail fast
    /// if a different model/dimension was recorded earlier — vectors from
    /// different models are not comparable.
    pub async fn check_embedding_identity(&self, model: &str, dims: usize) -> Result<()> {
        match self.meta_get(META_EMBEDDING_MODEL).await? {
            None => {
                self.meta_set(META_EMBEDDING_MODEL, model).await?;
                self.meta_set(META_EMBEDDING_DIMS, &dims.to_string()).await?;
            }
            Some(recorded) if recorded == model => {
                let recorded_dims: Option<usize> = self
                    .meta_get(META_EMBEDDING_DIMS)
                    .await?
                    .and_then(|v| v.parse().ok());
                if recorded_dims != Some(dims) {
                    bail!(
                        "Store was vectorized with {} dims but config says {}. \
                         Rebuild the index or fix embedding.dims.",
                        recorded_dims.map(|d| d.to_string()).unwrap_or_default(),
                        dims
                    );
                }
            }
            Some(recorded) => {
                bail!(
                    "Store was vectorized with embedding model '{}' but config says '{}'. \
                     Vectors from different models are not comparable; rebuild the index.",
                    recorded,
                    model
                );
            }
        }
        Ok(())
    }
}

fn row_from_sqlite(r: &sqlx::sqlite::SqliteRow) -> LeadRow {
    LeadRow {
        id: r.get("id"),
        dataset: r.get("dataset"),
        source_file: r.get("source_file"),
        name: r.get("name"),
        username: r.get("username"),
        bio: r.get("bio"),
        category: r.get("category"),
        website: r.get("website"),
        email: r.get("email"),
        phone: r.get("phone"),
        title: r.get("title"),
        city: r.get("city"),
        company: r.get("company"),
        domain: r.get("domain"),
        follower_count: r.get("follower_count"),
        following_count: r.get("following_count"),
        text_concat: r.get("text_concat"),
    }
}

/// Build a safe FTS5 MATCH expression from free text: lowercase
/// alphanumeric terms, each quoted, OR-joined. Raw user input never
/// reaches the FTS5 expression parser, so punctuation cannot inject
/// operators. Returns `None` when no terms survive.
pub fn build_match_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DbConfig, IndexConfig};
    use crate::models::LeadRow;

    async fn test_store() -> (tempfile::TempDir, Store) {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            db: DbConfig {
                path: tmp.path().join("leads.db"),
            },
            index: IndexConfig {
                dir: tmp.path().join("index"),
            },
            ingest: Default::default(),
            embedding: Default::default(),
            retrieval: Default::default(),
            status: Default::default(),
            aliases: Default::default(),
        };
        crate::migrate::run_migrations(&config).await.unwrap();
        let pool = crate::db::connect(&config).await.unwrap();
        (tmp, Store::new(pool))
    }

    fn row(name: &str, text: &str) -> LeadRow {
        LeadRow {
            dataset: "ds".to_string(),
            source_file: "a.csv".to_string(),
            name: Some(name.to_string()),
            text_concat: text.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_then_fetch_returns_equal_row() {
        let (_tmp, store) = test_store().await;

        let mut input = row("Ada Lovelace", "Ada Lovelace ada@example.com");
        input.email = Some("ada@example.com".to_string());
        input.follower_count = Some(42);

        let ids = store.insert_batch(std::slice::from_ref(&input)).await.unwrap();
        assert_eq!(ids.len(), 1);

        let fetched = store.fetch_rows(&ids).await.unwrap();
        let mut expected = input.clone();
        expected.id = ids[0];
        assert_eq!(fetched, vec![expected]);
    }

    #[tokio::test]
    async fn ids_are_assigned_in_insertion_order() {
        let (_tmp, store) = test_store().await;
        let ids = store
            .insert_batch(&[row("a", "alpha"), row("b", "beta"), row("c", "gamma")])
            .await
            .unwrap();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn fetch_rows_preserves_caller_order() {
        let (_tmp, store) = test_store().await;
        let ids = store
            .insert_batch(&[row("a", "alpha"), row("b", "beta"), row("c", "gamma")])
            .await
            .unwrap();

        let reversed: Vec<i64> = ids.iter().rev().copied().collect();
        let fetched = store.fetch_rows(&reversed).await.unwrap();
        let fetched_ids: Vec<i64> = fetched.iter().map(|r| r.id).collect();
        assert_eq!(fetched_ids, reversed);
    }

    #[tokio::test]
    async fn lexical_search_hits_exist_in_store() {
        let (_tmp, store) = test_store().await;
        store
            .insert_batch(&[
                row("a", "munich software architect"),
                row("b", "paris pastry chef"),
            ])
            .await
            .unwrap();

        let hits = store.lexical_search("munich software", &[], 10).await.unwrap();
        assert!(!hits.is_empty());
        for (id, _) in &hits {
            assert_eq!(store.fetch_rows(&[*id]).await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn ledger_round_trip() {
        let (_tmp, store) = test_store().await;
        assert!(!store.is_file_complete("ds", "a.csv").await.unwrap());
        store.mark_file_complete("ds", "a.csv", 10, 1).await.unwrap();
        assert!(store.is_file_complete("ds", "a.csv").await.unwrap());
        assert!(!store.is_file_complete("other", "a.csv").await.unwrap());
    }

    #[tokio::test]
    async fn embedding_identity_is_sticky() {
        let (_tmp, store) = test_store().await;
        store.check_embedding_identity("model-a", 384).await.unwrap();
        store.check_embedding_identity("model-a", 384).await.unwrap();
        assert!(store.check_embedding_identity("model-b", 384).await.is_err());
        assert!(store.check_embedding_identity("model-a", 768).await.is_err());
        // Query-time verification is read-only and matches.
        store.verify_embedding_identity("model-a").await.unwrap();
        assert!(store.verify_embedding_identity("model-b").await.is_err());
    }

    #[tokio::test]
    async fn watermark_defaults_to_zero_and_persists() {
        let (_tmp, store) = test_store().await;
        assert_eq!(store.vector_watermark().await.unwrap(), 0);
        store.set_vector_watermark(17).await.unwrap();
        assert_eq!(store.vector_watermark().await.unwrap(), 17);

        let ids = store
            .insert_batch(&[row("a", "alpha"), row("b", "beta")])
            .await
            .unwrap();
        let pending = store.unvectorized(0, 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].0, ids[0]);
        let none = store.unvectorized(ids[1], 10).await.unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn match_query_quotes_and_joins_terms() {
        assert_eq!(
            build_match_query("munich software engineer").as_deref(),
            Some("\"munich\" OR \"software\" OR \"engineer\"")
        );
    }

    #[test]
    fn match_query_neutralizes_fts_operators() {
        assert_eq!(
            build_match_query("e-mail AND (NOT phone)").as_deref(),
            Some("\"e\" OR \"mail\" OR \"and\" OR \"not\" OR \"phone\"")
        );
    }

    #[test]
    fn match_query_empty_for_punctuation_only() {
        assert_eq!(build_match_query("?! --"), None);
        assert_eq!(build_match_query(""), None);
    }
}
