use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::PathBuf;

use orthobatch_utils::atomic_write::write_file_atomic;

use super::ReceiptManager;
use super::model::JobReceipt;

impl ReceiptManager {
    /// Write the receipt atomically, replacing any earlier one
    pub fn write_receipt(&self, receipt: &mut JobReceipt) -> Result<PathBuf> {
        let path = self.receipt_path();
        let json = Self::emit_receipt_json(receipt)?;
        let outcome = write_file_atomic(&path, json.as_bytes())
            .with_context(|| format!("Failed to write receipt: {}", path.display()))?;
        if outcome.rename_retry_count > 0 {
            // Record the retries in the file itself
            add_rename_retry_warning(&mut receipt.warnings, Some(outcome.rename_retry_count));
            let json = Self::emit_receipt_json(receipt)?;
            write_file_atomic(&path, json.as_bytes())
                .with_context(|| format!("Failed to write receipt: {}", path.display()))?;
        }
        Ok(path)
    }

    /// Read the receipt, `None` if none was written
    pub fn read_receipt(&self) -> Result<Option<JobReceipt>> {
        let path = self.receipt_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read receipt: {}", path.display()));
            }
        };
        let receipt = serde_json::from_str(&content)
            .with_context(|| format!("Failed to deserialize receipt: {}", path.display()))?;
        Ok(Some(receipt))
    }
}

/// Append `rename_retry_count` to receipt warnings.
///
/// ```
/// let mut warnings = vec![];
/// orthobatch_receipt::add_rename_retry_warning(&mut warnings, Some(3));
/// assert_eq!(warnings, vec!["rename_retry_count: 3".to_string()]);
///
/// let mut warnings2 = vec![];
/// orthobatch_receipt::add_rename_retry_warning(&mut warnings2, None);
/// assert!(warnings2.is_empty());
/// ```
pub fn add_rename_retry_warning(warnings: &mut Vec<String>, retry_count: Option<u32>) {
    if let Some(count) = retry_count {
        warnings.push(format!("rename_retry_count: {count}"));
    }
}
