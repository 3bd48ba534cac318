//! Per-job receipts
//!
//! A receipt records what happened to every chunk group of one job: how far
//! it got, whether it produced a raster and report, and why it stopped. It is
//! written to `export/receipt.json` inside the work area before relocation,
//! so it lands next to the products in the job directory.

mod emit;
mod model;
mod writer;

pub use model::{
    ChunkOutcome, ChunkReceipt, JobReceipt, RECEIPT_FILE_NAME, RECEIPT_SCHEMA_VERSION,
    ReceiptManager, RunMode,
};
pub use writer::add_rename_retry_warning;
