//! Ingestion pipeline orchestration.
//!
//! Drives the full flow per archive member: stream-parse → normalize →
//! batch → transactional store commit → embed → vector-index append →
//! progress heartbeat, with the completion ledger making each file
//! idempotent. Rows are always committed before their vectors are
//! requested, so a crash in the vector stage resumes from the watermark
//! without re-parsing source files.
//!
//! Per-file state machine: Pending → Streaming → BatchCommitting →
//! (repeat) → VectorAppending → Completed, with Failed reachable on
//! unrecoverable I/O or store errors. One bad file never aborts the run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::archive;
use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::models::LeadRow;
use crate::normalize::{AliasTable, Normalizer};
use crate::progress::{IngestEvent, ProgressMode, StatusRecord, StatusWriter};
use crate::store::Store;
use crate::vector_index::VectorIndex;

pub struct IngestOptions {
    pub zip_path: PathBuf,
    pub dataset: String,
    pub pattern: Option<String>,
    pub limit: Option<u64>,
    pub no_vectors: bool,
    pub progress: ProgressMode,
}

/// A committed batch handed to the vectorizer: ids are already durable in
/// the store before any embedding is requested.
struct VectorBatch {
    ids: Vec<i64>,
    texts: Vec<String>,
}

/// The vector stage, moved into the vectorizer task per file and back out
/// when its channel drains.
struct VectorStage {
    index: VectorIndex,
    provider: Box<dyn EmbeddingProvider>,
}

pub async fn run_ingest(config: &Config, opts: IngestOptions) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = Store::new(pool.clone());

    let vectors_enabled = !opts.no_vectors && config.embedding.is_enabled();

    // Fail fast on embedding identity problems before touching the archive:
    // proceeding with mismatched vectors would silently corrupt relevance.
    let mut vector_stage: Option<VectorStage> = if vectors_enabled {
        let provider = embedding::create_provider(&config.embedding)?;
        store
            .check_embedding_identity(provider.model_name(), provider.dims())
            .await?;
        let index = VectorIndex::load(&config.index.dir, provider.model_name(), provider.dims())?;
        Some(VectorStage { index, provider })
    } else {
        None
    };

    let mut zip = archive::open_archive(&opts.zip_path)?;
    let pattern = opts
        .pattern
        .as_deref()
        .unwrap_or(&config.ingest.member_pattern);
    let members = archive::select_members(&zip, pattern)?;

    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let cancelled = cancelled.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancelled.store(true, Ordering::SeqCst);
            }
        });
    }

    let normalizer = Normalizer::new(
        AliasTable::with_extras(&config.aliases),
        config.ingest.required_fields.clone(),
    );
    let reporter = opts.progress.reporter();
    let mut status = StatusWriter::new(config.status.path.clone());

    let mut files_completed = 0usize;
    let mut files_failed = 0usize;
    let mut files_skipped = 0usize;
    let mut rows_inserted = 0u64;
    let mut rows_errored = 0u64;

    for member in &members {
        if cancelled.load(Ordering::SeqCst) {
            info!("cancelled; resuming later via the ledger");
            break;
        }

        if store.is_file_complete(&opts.dataset, member).await? {
            files_skipped += 1;
            continue;
        }

        reporter.report(&IngestEvent::FileStarted {
            file: member.clone(),
        });

        let outcome = process_file(
            config,
            &store,
            &pool,
            &mut zip,
            member,
            &opts,
            &normalizer,
            &mut vector_stage,
            reporter.as_ref(),
            &mut status,
            files_completed,
            members.len(),
            &cancelled,
        )
        .await;

        match outcome {
            Ok(file) if file.completed => {
                rows_inserted += file.rows;
                rows_errored += file.schema_errors;
                files_completed += 1;
                reporter.report(&IngestEvent::FileCompleted {
                    file: member.clone(),
                    rows: file.rows,
                });
            }
            Ok(file) => {
                // Cancelled mid-file: rows up to the last batch are stored,
                // the ledger entry is withheld.
                rows_inserted += file.rows;
                rows_errored += file.schema_errors;
            }
            Err(e) => {
                files_failed += 1;
                warn!(file = %member, "file failed: {:#}", e);
                reporter.report(&IngestEvent::FileFailed {
                    file: member.clone(),
                    reason: format!("{:#}", e),
                });
            }
        }
    }

    // Final flush so a clean exit (or ctrl-c) loses nothing.
    if let Some(stage) = &vector_stage {
        if !stage.index.is_empty() {
            stage.index.flush(&config.index.dir)?;
            store.set_vector_watermark(stage.index.max_id()).await?;
        }
    }

    status.update(
        &StatusRecord {
            dataset: opts.dataset.clone(),
            current_file: None,
            rows_processed: rows_inserted,
            files_completed,
            files_total: members.len(),
            elapsed_secs: status.elapsed_secs(),
            estimated_remaining_secs: None,
        },
        true,
    );

    println!("ingest {}", opts.dataset);
    println!("  files completed: {}", files_completed);
    println!("  files skipped (already ingested): {}", files_skipped);
    println!("  files failed: {}", files_failed);
    println!("  rows inserted: {}", rows_inserted);
    println!("  rows skipped (schema errors): {}", rows_errored);
    if vectors_enabled {
        let backlog = store.count_rows_above(store.vector_watermark().await?).await?;
        if backlog > 0 {
            println!(
                "  unvectorized backlog: {} rows (run `leads vectors pending`)",
                backlog
            );
        }
    }
    println!("ok");

    store.close().await;
    Ok(())
}

struct FileOutcome {
    rows: u64,
    schema_errors: u64,
    /// False when cancellation stopped the file mid-stream; the ledger
    /// entry is withheld so the next run re-streams it from the start.
    completed: bool,
}

#[allow(clippy::too_many_arguments)]
async fn process_file(
    config: &Config,
    store: &Store,
    pool: &sqlx::SqlitePool,
    zip: &mut archive::Archive,
    member: &str,
    opts: &IngestOptions,
    normalizer: &Normalizer,
    vector_stage: &mut Option<VectorStage>,
    reporter: &dyn crate::progress::IngestReporter,
    status: &mut StatusWriter,
    files_completed: usize,
    files_total: usize,
    cancelled: &AtomicBool,
) -> Result<FileOutcome> {
    // Spawn the vectorizer for this file. Committed batches flow through a
    // bounded channel, so embedding overlaps the next batch's parse/commit
    // while memory stays bounded.
    let mut vec_tx: Option<mpsc::Sender<VectorBatch>> = None;
    let mut vec_task = None;
    if let Some(stage) = vector_stage.take() {
        let (tx, rx) = mpsc::channel::<VectorBatch>(config.ingest.max_inflight_batches);
        vec_tx = Some(tx);
        vec_task = Some(tokio::spawn(vectorize_batches(
            rx,
            stage,
            config.embedding.clone(),
            Store::new(pool.clone()),
            config.index.dir.clone(),
            config.ingest.flush_every,
        )));
    }

    let result = stream_batches(
        config, store, zip, member, opts, normalizer, &vec_tx, reporter, status,
        files_completed, files_total, cancelled,
    )
    .await;

    // Always hand the stage back, even when parsing failed.
    drop(vec_tx);
    let mut vector_failed = false;
    if let Some(task) = vec_task {
        let (stage, vec_result) = task.await.context("vectorizer task panicked")?;
        if let Err(e) = vec_result {
            vector_failed = true;
            warn!(
                file = %member,
                "vector stage incomplete ({:#}); rows are stored, run `leads vectors pending`",
                e
            );
        }
        *vector_stage = Some(stage);
    }

    let outcome = result?;

    // Rows are durable; the ledger protects them from a re-parse. The
    // vector backlog (if any) sits above the watermark. A cancelled file
    // stays out of the ledger so the next run finishes it.
    if outcome.completed {
        store
            .mark_file_complete(
                &opts.dataset,
                member,
                outcome.rows as i64,
                outcome.schema_errors as i64,
            )
            .await?;

        if vector_failed {
            debug!(file = %member, "marked complete with vector backlog");
        }
    }

    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
async fn stream_batches(
    config: &Config,
    store: &Store,
    zip: &mut archive::Archive,
    member: &str,
    opts: &IngestOptions,
    normalizer: &Normalizer,
    vec_tx: &Option<mpsc::Sender<VectorBatch>>,
    reporter: &dyn crate::progress::IngestReporter,
    status: &mut StatusWriter,
    files_completed: usize,
    files_total: usize,
    cancelled: &AtomicBool,
) -> Result<FileOutcome> {
    let mut rows_buffer: Vec<LeadRow> = Vec::with_capacity(config.ingest.batch_size);
    let mut total_rows = 0u64;
    let mut schema_errors = 0u64;

    let mut records = archive::member_rows(zip, member)?;

    loop {
        let mut input_done = false;
        match records.next() {
            Some(Ok(raw)) => match normalizer.normalize(&opts.dataset, member, &raw) {
                Ok(row) => rows_buffer.push(row),
                Err(e) => {
                    schema_errors += 1;
                    if schema_errors <= 5 {
                        debug!(file = %member, "row skipped: {}", e);
                    }
                }
            },
            Some(Err(e)) => return Err(e).context("row parse failed"),
            None => input_done = true,
        }

        if rows_buffer.len() >= config.ingest.batch_size
            || (input_done && !rows_buffer.is_empty())
        {
            let batch = std::mem::take(&mut rows_buffer);
            total_rows += batch.len() as u64;

            let ids = commit_batch_with_retry(store, &batch, config.ingest.max_batch_retries)
                .await
                .context("batch commit failed")?;

            if let Some(tx) = vec_tx {
                let texts = batch.iter().map(|r| r.text_concat.clone()).collect();
                // Backpressure: blocks when max_inflight_batches are queued.
                if tx.send(VectorBatch { ids, texts }).await.is_err() {
                    debug!("vectorizer gone; continuing lexical-only");
                }
            }

            reporter.report(&IngestEvent::BatchCommitted {
                file: member.to_string(),
                rows: total_rows,
            });
            status.update(
                &StatusRecord {
                    dataset: opts.dataset.clone(),
                    current_file: Some(member.to_string()),
                    rows_processed: total_rows,
                    files_completed,
                    files_total,
                    elapsed_secs: status.elapsed_secs(),
                    estimated_remaining_secs: status
                        .estimate_remaining(files_completed, files_total),
                },
                false,
            );

            // Limit and cancellation are honored at batch boundaries only,
            // never mid-transaction.
            if opts.limit.map(|l| total_rows >= l).unwrap_or(false) {
                info!(file = %member, "row limit reached");
                break;
            }
            if cancelled.load(Ordering::SeqCst) {
                return Ok(FileOutcome {
                    rows: total_rows,
                    schema_errors,
                    completed: false,
                });
            }
        }

        if input_done {
            break;
        }
    }

    Ok(FileOutcome {
        rows: total_rows,
        schema_errors,
        completed: true,
    })
}

/// Commit one batch, retrying transient store failures from the same input
/// offset. The transaction makes each attempt all-or-nothing.
async fn commit_batch_with_retry(
    store: &Store,
    batch: &[LeadRow],
    max_retries: u32,
) -> Result<Vec<i64>> {
    let mut last_err = None;
    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
            warn!("retrying batch commit (attempt {})", attempt + 1);
        }
        match store.insert_batch(batch).await {
            Ok(ids) => return Ok(ids),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("batch commit failed")))
}

/// Consume committed batches, embed them, and append to the index.
///
/// On failure the remaining batches of the file are drained without work
/// (the parser must not block) and vectorization stops: the watermark is
/// only meaningful if everything below it is vectorized, so a failed
/// append leaves a contiguous backlog for `leads vectors pending`.
async fn vectorize_batches(
    mut rx: mpsc::Receiver<VectorBatch>,
    mut stage: VectorStage,
    embedding_cfg: crate::config::EmbeddingConfig,
    store: Store,
    index_dir: PathBuf,
    flush_every: usize,
) -> (VectorStage, Result<()>) {
    let mut batches_since_flush = 0usize;
    let mut failure: Option<anyhow::Error> = None;

    while let Some(batch) = rx.recv().await {
        if failure.is_some() {
            continue;
        }

        let result = async {
            let vectors =
                embedding::embed_texts(stage.provider.as_ref(), &embedding_cfg, &batch.texts)
                    .await?;
            stage.index.add(&batch.ids, &vectors)?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                batches_since_flush += 1;
                if batches_since_flush >= flush_every {
                    if let Err(e) = persist(&stage.index, &store, &index_dir).await {
                        failure = Some(e);
                        continue;
                    }
                    batches_since_flush = 0;
                }
            }
            Err(e) => failure = Some(e),
        }
    }

    // End-of-file flush: persist whatever succeeded.
    if batches_since_flush > 0 || failure.is_some() {
        if let Err(e) = persist(&stage.index, &store, &index_dir).await {
            failure.get_or_insert(e);
        }
    }

    let result = match failure {
        None => Ok(()),
        Some(e) => Err(e),
    };
    (stage, result)
}

/// Flush the index, then advance the watermark. Order matters: the
/// watermark must never claim vectors the persisted index does not have.
async fn persist(index: &VectorIndex, store: &Store, dir: &Path) -> Result<()> {
    index.flush(dir)?;
    store.set_vector_watermark(index.max_id()).await?;
    Ok(())
}
