//! Hybrid retrieval: lexical and vector candidates, score fusion, ranking.
//!
//! The two retrieval paths run concurrently and independently, each under
//! its own timeout; a slow or failed path degrades to an empty candidate
//! set rather than failing the query (the same policy as an empty vector
//! index). Raw scores are min-max normalized per result set — BM25 ranks
//! and cosine distances are not naturally comparable — then fused by the
//! configured strategy. Post-fusion filters are applied after hydration
//! and before truncation, with doubling over-fetch so filtering can never
//! hide matches that exist beyond the initial candidate pools.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::models::{LeadHit, LeadRow};
use crate::store::Store;
use crate::vector_index::VectorIndex;

/// Post-fusion filters. All are conjunctive; rows failing any are dropped
/// before truncation to `k`.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub datasets: Vec<String>,
    pub category: Option<String>,
    pub min_followers: Option<i64>,
}

impl SearchFilters {
    fn matches(&self, row: &LeadRow) -> bool {
        if !self.datasets.is_empty() && !self.datasets.contains(&row.dataset) {
            return false;
        }
        if let Some(category) = &self.category {
            match &row.category {
                Some(c) if c.eq_ignore_ascii_case(category) => {}
                _ => return false,
            }
        }
        if let Some(min) = self.min_followers {
            if row.follower_count.unwrap_or(0) < min {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Hybrid,
    Lexical,
    Vector,
}

impl SearchMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "hybrid" => Ok(SearchMode::Hybrid),
            "lexical" => Ok(SearchMode::Lexical),
            "vector" => Ok(SearchMode::Vector),
            other => bail!(
                "Unknown search mode: {}. Use hybrid, lexical, or vector.",
                other
            ),
        }
    }
}

/// Fusion strategy, selected by `retrieval.fusion` (or `--fusion`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FusionStrategy {
    /// `alpha · vector + (1 − alpha) · lexical` over normalized scores.
    /// Falls back to reciprocal-rank when either path returned nothing —
    /// min-max scales are meaningless against an empty set.
    Weighted { alpha: f64 },
    /// Rank-only fusion: `Σ 1/(60 + rank)` per path. Immune to score-scale
    /// pathologies on tiny result sets.
    ReciprocalRank,
}

impl FusionStrategy {
    pub fn from_config(config: &Config) -> Self {
        match config.retrieval.fusion.as_str() {
            "rrf" => FusionStrategy::ReciprocalRank,
            _ => FusionStrategy::Weighted {
                alpha: config.retrieval.alpha,
            },
        }
    }
}

/// The hybrid retrieval engine. Holds borrowed collaborators: the store,
/// a read-only vector index, and an optional embedding provider handle.
pub struct HybridEngine<'a> {
    store: &'a Store,
    index: &'a VectorIndex,
    provider: Option<&'a dyn EmbeddingProvider>,
    config: &'a Config,
}

impl<'a> HybridEngine<'a> {
    pub fn new(
        store: &'a Store,
        index: &'a VectorIndex,
        provider: Option<&'a dyn EmbeddingProvider>,
        config: &'a Config,
    ) -> Self {
        Self {
            store,
            index,
            provider,
            config,
        }
    }

    /// Ranked hybrid search: top `k` rows with fused and per-path scores.
    ///
    /// Fails fast on malformed input (empty query, `k <= 0`); everything
    /// downstream degrades instead of failing.
    pub async fn search(
        &self,
        query: &str,
        k: i64,
        mode: SearchMode,
        fusion: FusionStrategy,
        filters: &SearchFilters,
    ) -> Result<Vec<LeadHit>> {
        if query.trim().is_empty() {
            bail!("Query must not be empty");
        }
        if k <= 0 {
            bail!("k must be >= 1");
        }

        let use_lexical = mode != SearchMode::Vector;
        let use_vector = mode != SearchMode::Lexical;

        // Embed the query once, up front; pool growth below reuses it. A
        // failed or slow embedding degrades the vector path, but a model
        // mismatch with what ingestion recorded is fatal — silently fusing
        // incomparable vectors would corrupt relevance.
        let query_vec = if use_vector && !self.index.is_empty() {
            let provider = self
                .provider
                .ok_or_else(|| anyhow::anyhow!("no embedding provider configured"))?;
            self.store
                .verify_embedding_identity(provider.model_name())
                .await?;
            match self.embed_query(provider, query).await {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("vector path degraded (query embedding failed): {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let timeout = Duration::from_millis(self.config.retrieval.path_timeout_ms);
        let mut k_lex = self.config.retrieval.candidate_k_lexical.max(k);
        let mut k_vec = self.config.retrieval.candidate_k_vector.max(k);

        let mut doublings_left = self.config.retrieval.max_overfetch_doublings;
        loop {
            let lexical_fut = async {
                if !use_lexical {
                    return Vec::new();
                }
                match tokio::time::timeout(
                    timeout,
                    self.store.lexical_search(query, &filters.datasets, k_lex),
                )
                .await
                {
                    Ok(Ok(candidates)) => candidates,
                    Ok(Err(e)) => {
                        warn!("lexical path degraded: {:#}", e);
                        Vec::new()
                    }
                    Err(_) => {
                        warn!("lexical path timed out after {:?}", timeout);
                        Vec::new()
                    }
                }
            };

            let vector_fut = async {
                let Some(qvec) = &query_vec else {
                    return Vec::new();
                };
                // Distance → similarity so both paths rank higher-is-better.
                self.index
                    .search(qvec, k_vec as usize)
                    .into_iter()
                    .map(|(id, distance)| (id, 1.0 - distance as f64))
                    .collect::<Vec<_>>()
            };

            // Independent paths, no ordering dependency; wait on both.
            let (lexical, vector) = tokio::join!(lexical_fut, vector_fut);

            let lexical_saturated = lexical.len() as i64 >= k_lex;
            let vector_saturated = vector.len() as i64 >= k_vec;

            let fused = fuse(&lexical, &vector, fusion);

            // Hydrate and filter the entire fused set before truncating, so
            // filters can never shrink the result below `k` while matches
            // exist in the candidate pool.
            let ids: Vec<i64> = fused.iter().map(|f| f.id).collect();
            let rows = self.store.fetch_rows(&ids).await?;
            let by_id: HashMap<i64, LeadRow> =
                rows.into_iter().map(|r| (r.id, r)).collect();

            let mut hits: Vec<LeadHit> = fused
                .iter()
                .filter_map(|f| {
                    let row = by_id.get(&f.id)?.clone();
                    filters.matches(&row).then_some(LeadHit {
                        row,
                        fused_score: f.fused,
                        lexical_score: f.lexical,
                        vector_score: f.vector,
                    })
                })
                .collect();

            if hits.len() as i64 >= k
                || doublings_left == 0
                || (!lexical_saturated && !vector_saturated)
            {
                hits.truncate(k as usize);
                return Ok(hits);
            }

            // Filters ate into a saturated pool: there may be matches just
            // past the cutoff. Re-query with doubled pools.
            k_lex *= 2;
            k_vec *= 2;
            doublings_left -= 1;
        }
    }

    async fn embed_query(
        &self,
        provider: &dyn EmbeddingProvider,
        query: &str,
    ) -> Result<Vec<f32>> {
        let timeout = Duration::from_millis(self.config.retrieval.path_timeout_ms);
        match tokio::time::timeout(
            timeout,
            embedding::embed_query(provider, &self.config.embedding, query),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => bail!("query embedding timed out after {:?}", timeout),
        }
    }
}

// ============ Fusion ============

/// One fused candidate: per-path normalized scores (None when the path did
/// not surface the id) and the combined score.
#[derive(Debug, Clone, PartialEq)]
struct Fused {
    id: i64,
    fused: f64,
    lexical: Option<f64>,
    vector: Option<f64>,
}

/// Fuse two ranked candidate lists into one deterministic ranking:
/// fused score descending, ties broken by ascending id.
fn fuse(lexical: &[(i64, f64)], vector: &[(i64, f64)], strategy: FusionStrategy) -> Vec<Fused> {
    let effective = match strategy {
        // Weighted fusion against an empty path collapses to scale noise;
        // rank-based fusion is well-defined there.
        FusionStrategy::Weighted { .. } if lexical.is_empty() || vector.is_empty() => {
            FusionStrategy::ReciprocalRank
        }
        s => s,
    };

    let norm_lexical = normalize_scores(lexical);
    let norm_vector = normalize_scores(vector);

    let lex_rank: HashMap<i64, usize> = lexical
        .iter()
        .enumerate()
        .map(|(rank, (id, _))| (*id, rank))
        .collect();
    let vec_rank: HashMap<i64, usize> = vector
        .iter()
        .enumerate()
        .map(|(rank, (id, _))| (*id, rank))
        .collect();

    let mut ids: Vec<i64> = lexical
        .iter()
        .chain(vector.iter())
        .map(|(id, _)| *id)
        .collect();
    ids.sort_unstable();
    ids.dedup();

    let mut fused: Vec<Fused> = ids
        .into_iter()
        .map(|id| {
            let l = norm_lexical.get(&id).copied();
            let v = norm_vector.get(&id).copied();
            let score = match effective {
                FusionStrategy::Weighted { alpha } => {
                    alpha * v.unwrap_or(0.0) + (1.0 - alpha) * l.unwrap_or(0.0)
                }
                FusionStrategy::ReciprocalRank => {
                    let l_rrf = lex_rank.get(&id).map(|r| rrf_weight(*r)).unwrap_or(0.0);
                    let v_rrf = vec_rank.get(&id).map(|r| rrf_weight(*r)).unwrap_or(0.0);
                    l_rrf + v_rrf
                }
            };
            Fused {
                id,
                fused: score,
                lexical: l,
                vector: v,
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    fused
}

/// Standard reciprocal-rank weight with the conventional 60 offset.
fn rrf_weight(rank: usize) -> f64 {
    1.0 / (60.0 + rank as f64 + 1.0)
}

/// Min-max normalize a candidate list to [0, 1]. A single-score set maps
/// to 1.0 (its best candidate is its best candidate).
fn normalize_scores(candidates: &[(i64, f64)]) -> HashMap<i64, f64> {
    if candidates.is_empty() {
        return HashMap::new();
    }

    let s_min = candidates
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|(id, s)| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            };
            (*id, norm)
        })
        .collect()
}

// ============ CLI ============

#[allow(clippy::too_many_arguments)]
pub async fn run_search(
    config: &Config,
    query: &str,
    mode: &str,
    k: Option<i64>,
    fusion_override: Option<String>,
    datasets: Vec<String>,
    category: Option<String>,
    min_followers: Option<i64>,
) -> Result<()> {
    let mode = SearchMode::parse(mode)?;

    if mode == SearchMode::Vector && !config.embedding.is_enabled() {
        bail!("Mode 'vector' requires embeddings. Set [embedding] provider in config.");
    }

    let pool = db::connect(config).await?;
    let store = Store::new(pool);

    // A missing index directory is an empty index: hybrid degrades to
    // lexical-only rather than erroring.
    let (index, provider) = if config.embedding.is_enabled() {
        let provider = embedding::create_provider(&config.embedding)?;
        let index =
            VectorIndex::load(&config.index.dir, provider.model_name(), provider.dims())?;
        (index, Some(provider))
    } else {
        (VectorIndex::new(0, "disabled"), None)
    };

    let fusion = match fusion_override.as_deref() {
        Some("rrf") => FusionStrategy::ReciprocalRank,
        Some("weighted") | None => FusionStrategy::from_config(config),
        Some(other) => bail!("Unknown fusion strategy: {}. Use weighted or rrf.", other),
    };

    let filters = SearchFilters {
        datasets,
        category,
        min_followers,
    };

    let engine = HybridEngine::new(
        &store,
        &index,
        provider.as_deref(),
        config,
    );
    let k = k.unwrap_or(config.retrieval.final_k);
    let hits = engine.search(query, k, mode, fusion, &filters).await?;

    if hits.is_empty() {
        println!("No results.");
        store.close().await;
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let row = &hit.row;
        let display_name = row
            .name
            .as_deref()
            .or(row.username.as_deref())
            .or(row.company.as_deref())
            .unwrap_or("(unnamed)");

        println!("{}. [{:.3}] {}", i + 1, hit.fused_score, display_name);
        if let (Some(title), Some(company)) = (&row.title, &row.company) {
            println!("    {} at {}", title, company);
        } else if let Some(title) = &row.title {
            println!("    {}", title);
        }
        if let Some(city) = &row.city {
            println!("    city: {}", city);
        }
        if let Some(email) = &row.email {
            println!("    email: {}", email);
        }
        if let Some(category) = &row.category {
            println!("    category: {}", category);
        }
        if let Some(followers) = row.follower_count {
            println!("    followers: {}", followers);
        }
        println!(
            "    scores: lexical={} vector={}",
            hit.lexical_score
                .map(|s| format!("{:.3}", s))
                .unwrap_or_else(|| "null".to_string()),
            hit.vector_score
                .map(|s| format!("{:.3}", s))
                .unwrap_or_else(|| "null".to_string()),
        );
        println!("    id: {} dataset: {}", row.id, row.dataset);
        println!();
    }

    store.close().await;
    Ok(())
}

// ============ Fusion tests ============
