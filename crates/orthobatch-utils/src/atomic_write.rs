//! Atomic file writes
//!
//! Content goes to a temporary file in the target directory, is fsynced and
//! then renamed over the target. Readers see either the old file or the new
//! one, never a torn write. Windows renames are retried briefly because
//! scanners and indexers hold transient locks on fresh files.

use anyhow::{Context, Result};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

#[cfg(target_os = "windows")]
use std::{thread, time::Duration};

/// Result of an atomic write operation
#[derive(Debug, Clone, Default)]
pub struct AtomicWriteResult {
    /// Number of rename retries that occurred (Windows only)
    pub rename_retry_count: u32,
    /// Whether the copy fallback for cross-device renames was used
    pub used_cross_filesystem_fallback: bool,
}

/// Atomically write `content` to `path`, creating parent directories.
pub fn write_file_atomic(path: &Path, content: &[u8]) -> Result<AtomicWriteResult> {
    let mut result = AtomicWriteResult::default();

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create parent directory: {}", parent.display()))?;

    let mut temp_file = NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temporary file in: {}", parent.display()))?;
    temp_file
        .write_all(content)
        .context("Failed to write content to temporary file")?;
    temp_file
        .as_file()
        .sync_all()
        .context("Failed to fsync temporary file")?;

    let temp_path = temp_file.path().to_path_buf();
    match atomic_rename(temp_file, path) {
        Ok(retry_count) => result.rename_retry_count = retry_count,
        Err(e) if is_cross_device(&e) => {
            result.used_cross_filesystem_fallback = true;
            fs::copy(&temp_path, path)
                .with_context(|| format!("Failed to copy into place: {}", path.display()))?;
            let _ = fs::remove_file(&temp_path);
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to atomically write file: {}", path.display()));
        }
    }

    Ok(result)
}

#[cfg(target_os = "windows")]
fn atomic_rename(mut temp_file: NamedTempFile, target: &Path) -> io::Result<u32> {
    const MAX_RETRIES: u32 = 5;
    const INITIAL_DELAY_MS: u64 = 10;

    let mut retry_count = 0;
    loop {
        match temp_file.persist(target) {
            Ok(_) => return Ok(retry_count),
            Err(persist_error) => {
                let retryable = matches!(
                    persist_error.error.kind(),
                    io::ErrorKind::PermissionDenied | io::ErrorKind::Other
                );
                if retry_count >= MAX_RETRIES || !retryable {
                    return Err(persist_error.error);
                }
                thread::sleep(Duration::from_millis(INITIAL_DELAY_MS * 2_u64.pow(retry_count)));
                retry_count += 1;
                temp_file = persist_error.file;
            }
        }
    }
}

#[cfg(not(target_os = "windows"))]
fn atomic_rename(temp_file: NamedTempFile, target: &Path) -> io::Result<u32> {
    temp_file.persist(target).map(|_| 0).map_err(|e| e.error)
}

/// True when `err` is the OS refusing a rename across filesystems
#[must_use]
pub fn is_cross_device(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::CrossesDevices {
        return true;
    }

    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EXDEV)
    }

    #[cfg(windows)]
    {
        // ERROR_NOT_SAME_DEVICE
        err.raw_os_error() == Some(17)
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_creates_parent_and_content() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("export").join("receipt.json");

        let result = write_file_atomic(&target, b"{\"ok\":true}").unwrap();
        assert_eq!(result.rename_retry_count, 0);
        assert!(!result.used_cross_filesystem_fallback);
        assert_eq!(fs::read_to_string(&target).unwrap(), "{\"ok\":true}");
    }

    #[test]
    fn test_write_replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("receipt.json");
        fs::write(&target, "old").unwrap();

        write_file_atomic(&target, b"new").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "new");

        // No temp files left behind
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_cross_device_detection() {
        assert!(!is_cross_device(&io::Error::other("nope")));
        assert!(is_cross_device(&io::Error::from(io::ErrorKind::CrossesDevices)));
        #[cfg(unix)]
        assert!(is_cross_device(&io::Error::from_raw_os_error(libc::EXDEV)));
    }
}
