//! Typed errors the pipeline and retrieval engine match on.
//!
//! Row-level and index-level failures need structure (callers branch on
//! them); everything else flows through `anyhow` with context.

use thiserror::Error;

/// A raw record could not be mapped to the canonical row schema.
///
/// Schema errors are recovered locally: the row is skipped and counted in
/// the file's error tally. They never abort a batch or a file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// A field listed in `ingest.required_fields` had no matching column.
    #[error("required field '{0}' has no matching column")]
    MissingRequired(String),

    /// No text-bearing field mapped to a non-empty value; there is nothing
    /// to index or embed for this row.
    #[error("row has no text content after normalization")]
    EmptyRow,
}

/// Failures raised by the vector index adapter.
///
/// Model and dimension mismatches are fatal at startup (vectors from
/// different models are not comparable); the rest are append/persist
/// failures handled by the pipeline's retry-then-defer policy.
#[derive(Debug, Error)]
pub enum VectorIndexError {
    #[error("vector index was built with model '{stored}' but config says '{configured}'")]
    ModelMismatch { stored: String, configured: String },

    #[error("vector index dimension is {stored} but config says {configured}")]
    DimensionMismatch { stored: usize, configured: usize },

    #[error("vector for row id {0} is already present (index is append-only)")]
    DuplicateId(i64),

    #[error("vector batch has {vectors} vectors for {ids} ids")]
    LengthMismatch { ids: usize, vectors: usize },

    #[error("index persistence failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("index metadata is unreadable: {0}")]
    Meta(#[from] serde_json::Error),
}
