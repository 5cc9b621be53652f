//! Core data models used throughout LeadSearch.
//!
//! These types represent the raw spreadsheet records, canonical rows, and
//! search results that flow through the ingestion and retrieval pipeline.

/// A raw spreadsheet record: column name → cell value, in column order.
///
/// Column order matters because alias matching is first-match-wins, so the
/// mapping is kept as an ordered list rather than a hash map.
#[derive(Debug, Clone, Default)]
pub struct RawRecord {
    pub columns: Vec<(String, String)>,
}

impl RawRecord {
    pub fn new(columns: Vec<(String, String)>) -> Self {
        Self { columns }
    }
}

/// A normalized lead row in canonical schema.
///
/// `id` is assigned by the store on insert (monotonic, never reused) and is
/// the only key correlating the row table, the lexical index, and the
/// vector index. Rows built by the normalizer carry `id = 0` until stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeadRow {
    pub id: i64,
    pub dataset: String,
    pub source_file: String,
    pub name: Option<String>,
    pub username: Option<String>,
    pub bio: Option<String>,
    pub category: Option<String>,
    pub website: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub title: Option<String>,
    pub city: Option<String>,
    pub company: Option<String>,
    pub domain: Option<String>,
    pub follower_count: Option<i64>,
    pub following_count: Option<i64>,
    /// Non-empty text fields joined by a single space, in canonical field
    /// order (name, username, bio, category, website, email, phone, title,
    /// city, company, domain). Indexed by FTS and fed to the embedder.
    pub text_concat: String,
}

/// Ledger entry recording that a source file was fully processed.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct ProcessedFile {
    pub dataset: String,
    pub file_name: String,
    pub row_count: i64,
    pub error_count: i64,
    pub completed_at: i64,
}

/// One ranked result from the hybrid retrieval engine.
///
/// A path score is `None` when that retrieval path did not surface the row
/// (or the path was degraded away entirely, e.g. an empty vector index).
#[derive(Debug, Clone)]
pub struct LeadHit {
    pub row: LeadRow,
    pub fused_score: f64,
    pub lexical_score: Option<f64>,
    pub vector_score: Option<f64>,
}
