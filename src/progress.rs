//! Ingest progress reporting and the status-file surface.
//!
//! Two outputs, both write-only from the pipeline's perspective:
//! - stderr progress lines (human or JSON), so stdout stays parseable
//! - a periodically overwritten JSON status record any external UI can
//!   poll (written to a temp file and renamed, so readers never see a
//!   partial write)

use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

/// A single progress event emitted by the ingestion pipeline.
#[derive(Clone, Debug)]
pub enum IngestEvent {
    FileStarted {
        file: String,
    },
    /// A batch committed: running row total for the current file.
    BatchCommitted {
        file: String,
        rows: u64,
    },
    FileCompleted {
        file: String,
        rows: u64,
    },
    FileFailed {
        file: String,
        reason: String,
    },
}

/// Reports ingest progress. Implementations write to stderr.
pub trait IngestReporter: Send + Sync {
    fn report(&self, event: &IngestEvent);
}

/// Human-friendly lines: "ingest leads_eu.csv  12,000 rows".
pub struct StderrReporter;

impl IngestReporter for StderrReporter {
    fn report(&self, event: &IngestEvent) {
        let line = match event {
            IngestEvent::FileStarted { file } => format!("ingest {}  starting...\n", file),
            IngestEvent::BatchCommitted { file, rows } => {
                format!("ingest {}  {} rows\n", file, format_number(*rows))
            }
            IngestEvent::FileCompleted { file, rows } => {
                format!("ingest {}  done ({} rows)\n", file, format_number(*rows))
            }
            IngestEvent::FileFailed { file, reason } => {
                format!("ingest {}  FAILED: {}\n", file, reason)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }
}

/// Machine-readable: one JSON object per line on stderr.
pub struct JsonReporter;

impl IngestReporter for JsonReporter {
    fn report(&self, event: &IngestEvent) {
        let obj = match event {
            IngestEvent::FileStarted { file } => serde_json::json!({
                "event": "file_started", "file": file
            }),
            IngestEvent::BatchCommitted { file, rows } => serde_json::json!({
                "event": "batch", "file": file, "rows": rows
            }),
            IngestEvent::FileCompleted { file, rows } => serde_json::json!({
                "event": "file_completed", "file": file, "rows": rows
            }),
            IngestEvent::FileFailed { file, reason } => serde_json::json!({
                "event": "file_failed", "file": file, "reason": reason
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoReporter;

impl IngestReporter for NoReporter {
    fn report(&self, _event: &IngestEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IngestReporter> {
        match self {
            ProgressMode::Off => Box::new(NoReporter),
            ProgressMode::Human => Box::new(StderrReporter),
            ProgressMode::Json => Box::new(JsonReporter),
        }
    }
}

/// The status record overwritten during a run.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRecord {
    pub dataset: String,
    pub current_file: Option<String>,
    pub rows_processed: u64,
    pub files_completed: usize,
    pub files_total: usize,
    pub elapsed_secs: u64,
    /// File-count-based estimate; absent until the first file completes.
    pub estimated_remaining_secs: Option<u64>,
}

/// Throttled, atomically replaced JSON status file.
pub struct StatusWriter {
    path: PathBuf,
    started: Instant,
    last_write: Option<Instant>,
}

const WRITE_INTERVAL_MS: u128 = 500;

impl StatusWriter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            started: Instant::now(),
            last_write: None,
        }
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Estimate remaining time from per-file throughput. Row counts are
    /// unknowable while streaming, so the estimate is file-based.
    pub fn estimate_remaining(&self, files_completed: usize, files_total: usize) -> Option<u64> {
        if files_completed == 0 || files_total <= files_completed {
            return None;
        }
        let per_file = self.started.elapsed().as_secs_f64() / files_completed as f64;
        Some((per_file * (files_total - files_completed) as f64) as u64)
    }

    /// Write the record, throttled unless `force`. Failures are logged and
    /// otherwise ignored: a broken status file must never fail ingestion.
    pub fn update(&mut self, record: &StatusRecord, force: bool) {
        if !force {
            if let Some(last) = self.last_write {
                if last.elapsed().as_millis() < WRITE_INTERVAL_MS {
                    return;
                }
            }
        }
        if let Err(e) = self.write(record) {
            tracing::warn!(path = %self.path.display(), "status write failed: {}", e);
        }
        self.last_write = Some(Instant::now());
    }

    fn write(&self, record: &StatusRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        std::fs::rename(&tmp, &self.path)
    }
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn status_file_is_written_and_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let mut writer = StatusWriter::new(path.clone());
        writer.update(
            &StatusRecord {
                dataset: "ds".into(),
                current_file: Some("a.csv".into()),
                rows_processed: 5000,
                files_completed: 0,
                files_total: 2,
                elapsed_secs: 1,
                estimated_remaining_secs: None,
            },
            true,
        );
        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["rows_processed"], 5000);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn no_estimate_before_first_file_completes() {
        let writer = StatusWriter::new(PathBuf::from("unused.json"));
        assert_eq!(writer.estimate_remaining(0, 4), None);
        assert!(writer.estimate_remaining(1, 4).is_some());
        assert_eq!(writer.estimate_remaining(4, 4), None);
    }
}
