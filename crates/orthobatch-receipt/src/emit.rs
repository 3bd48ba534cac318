use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use orthobatch_engine_api::DeviceConfig;

use super::model::{ChunkReceipt, JobReceipt, RECEIPT_SCHEMA_VERSION, RunMode};
use super::ReceiptManager;

impl ReceiptManager {
    /// Pretty JSON with a trailing newline
    pub(super) fn emit_receipt_json(receipt: &JobReceipt) -> Result<String> {
        let mut json =
            serde_json::to_string_pretty(receipt).context("Failed to serialize receipt")?;
        json.push('\n');
        Ok(json)
    }

    /// Build a receipt finished now. Chunks keep processing order.
    #[must_use]
    pub fn create_receipt(
        &self,
        job: &str,
        mode: RunMode,
        started_at: DateTime<Utc>,
        devices: Option<&DeviceConfig>,
        chunks: Vec<ChunkReceipt>,
        warnings: Vec<String>,
    ) -> JobReceipt {
        JobReceipt {
            schema_version: RECEIPT_SCHEMA_VERSION.to_string(),
            orthobatch_version: env!("CARGO_PKG_VERSION").to_string(),
            job: job.to_string(),
            mode,
            started_at,
            finished_at: Utc::now(),
            gpu_mask: devices.map(|d| d.gpu_mask),
            cpu_enabled: devices.map(|d| d.cpu_enabled),
            chunks,
            warnings,
        }
    }
}
