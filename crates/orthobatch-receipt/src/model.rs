use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const RECEIPT_SCHEMA_VERSION: &str = "1";
pub const RECEIPT_FILE_NAME: &str = "receipt.json";

/// How a job was processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Chunk groups discovered under `photos/`
    Batch,
    /// Chunks of an existing project merged into one
    Merge,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Batch => write!(f, "batch"),
            Self::Merge => write!(f, "merge"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkOutcome {
    /// Reached the terminal stage
    Completed,
    /// Stopped by a stage or checkpoint error
    Failed,
    /// Never instantiated in the engine
    Skipped,
}

/// Outcome of one chunk group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub label: String,
    pub image_count: usize,
    pub outcome: ChunkOutcome,
    /// Last stage that finished, `None` if nothing ran
    pub last_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub transform_solved: bool,
    pub raster_written: bool,
    pub report_written: bool,
    pub duration_ms: u64,
}

/// Receipt for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReceipt {
    pub schema_version: String,
    pub orthobatch_version: String,
    pub job: String,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub gpu_mask: Option<u32>,
    pub cpu_enabled: Option<bool>,
    pub chunks: Vec<ChunkReceipt>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl JobReceipt {
    #[must_use]
    pub fn count(&self, outcome: ChunkOutcome) -> usize {
        self.chunks.iter().filter(|c| c.outcome == outcome).count()
    }

    /// True when every chunk group completed
    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.chunks
            .iter()
            .all(|c| c.outcome == ChunkOutcome::Completed)
    }
}

/// Creates, writes and reads receipts in one export directory
pub struct ReceiptManager {
    pub(super) export_dir: PathBuf,
}

impl ReceiptManager {
    #[must_use]
    pub fn new(export_dir: &Path) -> Self {
        Self {
            export_dir: export_dir.to_path_buf(),
        }
    }

    #[must_use]
    pub fn receipt_path(&self) -> PathBuf {
        self.export_dir.join(RECEIPT_FILE_NAME)
    }
}
