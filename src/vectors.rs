//! Deferred vectorization passes.
//!
//! `leads vectors pending` embeds the stored-but-unvectorized backlog
//! (rows above the watermark) without re-parsing any source file;
//! `leads vectors rebuild` deletes the persisted index and re-embeds
//! everything. Rebuild is the supported correction path — the index is
//! append-only and has no deletion or in-place update.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::progress::format_number;
use crate::store::Store;
use crate::vector_index::VectorIndex;

pub async fn run_vectors_pending(
    config: &Config,
    limit: Option<u64>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let pool = db::connect(config).await?;
    let store = Store::new(pool);
    store
        .check_embedding_identity(provider.model_name(), provider.dims())
        .await?;

    let mut index =
        VectorIndex::load(&config.index.dir, provider.model_name(), provider.dims())?;

    // The persisted index is the source of truth for what is vectorized;
    // the meta watermark is re-aligned to it at the next flush.
    let start = index.max_id();
    let backlog = store.count_rows_above(start).await?;

    if dry_run {
        println!("vectors pending (dry-run)");
        println!("  rows needing vectors: {}", format_number(backlog as u64));
        store.close().await;
        return Ok(());
    }

    if backlog == 0 {
        println!("vectors pending");
        println!("  all rows vectorized");
        store.close().await;
        return Ok(());
    }

    let appended = vectorize_backlog(config, &store, &mut index, provider.as_ref(), limit).await?;

    println!("vectors pending");
    println!("  rows vectorized: {}", format_number(appended));
    println!("  index size: {}", format_number(index.len() as u64));

    store.close().await;
    Ok(())
}

pub async fn run_vectors_rebuild(config: &Config) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let pool = db::connect(config).await?;
    let store = Store::new(pool);

    // A rebuild is the one moment the recorded identity may change: the
    // old vectors are discarded wholesale, so the new model wins.
    VectorIndex::clear_dir(&config.index.dir)?;
    store.set_vector_watermark(0).await?;
    store
        .meta_set(crate::store::META_EMBEDDING_MODEL, provider.model_name())
        .await?;
    store
        .meta_set(
            crate::store::META_EMBEDDING_DIMS,
            &provider.dims().to_string(),
        )
        .await?;

    println!("vectors rebuild — cleared existing index");

    let mut index = VectorIndex::new(provider.dims(), provider.model_name());
    let appended = vectorize_backlog(config, &store, &mut index, provider.as_ref(), None).await?;

    println!("vectors rebuild");
    println!("  rows vectorized: {}", format_number(appended));

    store.close().await;
    Ok(())
}

/// Embed and append rows above the index's high-water mark, flushing every
/// `ingest.flush_every` batches. A mid-run failure keeps what was flushed;
/// re-running continues from there.
async fn vectorize_backlog(
    config: &Config,
    store: &Store,
    index: &mut VectorIndex,
    provider: &dyn embedding::EmbeddingProvider,
    limit: Option<u64>,
) -> Result<u64> {
    let batch_size = config.embedding.batch_size as i64;
    let mut appended = 0u64;
    let mut batches_since_flush = 0usize;

    loop {
        if let Some(l) = limit {
            if appended >= l {
                break;
            }
        }

        let pending = store.unvectorized(index.max_id(), batch_size).await?;
        if pending.is_empty() {
            break;
        }

        let ids: Vec<i64> = pending.iter().map(|(id, _)| *id).collect();
        let texts: Vec<String> = pending.into_iter().map(|(_, text)| text).collect();

        let vectors = embedding::embed_texts(provider, &config.embedding, &texts).await?;
        index.add(&ids, &vectors)?;
        appended += ids.len() as u64;

        batches_since_flush += 1;
        if batches_since_flush >= config.ingest.flush_every {
            index.flush(&config.index.dir)?;
            store.set_vector_watermark(index.max_id()).await?;
            batches_since_flush = 0;
        }
    }

    index.flush(&config.index.dir)?;
    store.set_vector_watermark(index.max_id()).await?;
    Ok(appended)
}
