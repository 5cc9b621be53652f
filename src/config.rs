use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub status: StatusConfig,
    /// Per-dataset extra column synonyms: canonical field → synonym list,
    /// merged on top of the built-in alias table.
    #[serde(default)]
    pub aliases: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Directory holding the persisted vector index
    /// (vectors.bin, ids.bin, meta.json).
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Rows accumulated before a transactional batch commit.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Vector index flush cadence, in batches. A crash loses at most this
    /// many batches of vectors (rows are already durable).
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
    /// Glob selecting archive members to ingest.
    #[serde(default = "default_member_pattern")]
    pub member_pattern: String,
    /// Committed batches allowed to queue for the vectorizer before the
    /// parser blocks. Bounds in-flight memory.
    #[serde(default = "default_max_inflight_batches")]
    pub max_inflight_batches: usize,
    /// Attempts per batch commit before the file is marked failed.
    #[serde(default = "default_max_batch_retries")]
    pub max_batch_retries: u32,
    /// Canonical fields that must map to a column; rows missing one are
    /// skipped with a schema error.
    #[serde(default)]
    pub required_fields: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_every: default_flush_every(),
            member_pattern: default_member_pattern(),
            max_inflight_batches: default_max_inflight_batches(),
            max_batch_retries: default_max_batch_retries(),
            required_fields: Vec::new(),
        }
    }
}

fn default_batch_size() -> usize {
    5000
}
fn default_flush_every() -> usize {
    4
}
fn default_member_pattern() -> String {
    "*.{csv,xlsx}".to_string()
}
fn default_max_inflight_batches() -> usize {
    2
}
fn default_max_batch_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embed_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Weight of the vector path in weighted-sum fusion; the lexical path
    /// gets `1 - alpha`.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Fusion strategy: `weighted` or `rrf`.
    #[serde(default = "default_fusion")]
    pub fusion: String,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_lexical: i64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_vector: i64,
    #[serde(default = "default_final_k")]
    pub final_k: i64,
    /// Per-path budget; a path that exceeds it is treated as empty rather
    /// than failing the query.
    #[serde(default = "default_path_timeout_ms")]
    pub path_timeout_ms: u64,
    /// How many times candidate pools may double when post-fusion filters
    /// leave fewer than `k` results.
    #[serde(default = "default_max_overfetch_doublings")]
    pub max_overfetch_doublings: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            fusion: default_fusion(),
            candidate_k_lexical: default_candidate_k(),
            candidate_k_vector: default_candidate_k(),
            final_k: default_final_k(),
            path_timeout_ms: default_path_timeout_ms(),
            max_overfetch_doublings: default_max_overfetch_doublings(),
        }
    }
}

fn default_alpha() -> f64 {
    0.6
}
fn default_fusion() -> String {
    "weighted".to_string()
}
fn default_candidate_k() -> i64 {
    200
}
fn default_final_k() -> i64 {
    20
}
fn default_path_timeout_ms() -> u64 {
    2000
}
fn default_max_overfetch_doublings() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatusConfig {
    /// Status record, overwritten atomically during ingest.
    #[serde(default = "default_status_path")]
    pub path: PathBuf,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            path: default_status_path(),
        }
    }
}

fn default_status_path() -> PathBuf {
    PathBuf::from("data/status.json")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.ingest.batch_size == 0 {
        anyhow::bail!("ingest.batch_size must be > 0");
    }
    if config.ingest.flush_every == 0 {
        anyhow::bail!("ingest.flush_every must be > 0");
    }
    if config.ingest.max_inflight_batches == 0 {
        anyhow::bail!("ingest.max_inflight_batches must be > 0");
    }

    if config.retrieval.final_k < 1 {
        anyhow::bail!("retrieval.final_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.alpha) {
        anyhow::bail!("retrieval.alpha must be in [0.0, 1.0]");
    }
    match config.retrieval.fusion.as_str() {
        "weighted" | "rrf" => {}
        other => anyhow::bail!(
            "Unknown fusion strategy: '{}'. Must be weighted or rrf.",
            other
        ),
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let f = write_config(
            r#"
[db]
path = "data/leads.db"

[index]
dir = "data/index"
"#,
        );
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.ingest.batch_size, 5000);
        assert_eq!(cfg.retrieval.candidate_k_lexical, 200);
        assert_eq!(cfg.retrieval.fusion, "weighted");
        assert!(!cfg.embedding.is_enabled());
    }

    #[test]
    fn bad_alpha_rejected() {
        let f = write_config(
            r#"
[db]
path = "data/leads.db"

[index]
dir = "data/index"

[retrieval]
alpha = 1.5
"#,
        );
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn enabled_provider_requires_model_and_dims() {
        let f = write_config(
            r#"
[db]
path = "data/leads.db"

[index]
dir = "data/index"

[embedding]
provider = "openai"
"#,
        );
        assert!(load_config(f.path()).is_err());
    }
}
