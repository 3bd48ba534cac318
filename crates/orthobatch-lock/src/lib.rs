//! Lock handling for orthobatch work areas and engine projects
//!
//! Two kinds of locks live here:
//!
//! - The engine's project lock artifact (`project.files/lock` next to
//!   `project.psx`). The engine leaves it behind after saving and refuses to
//!   reopen a locked project, so the orchestrator deletes it around every save.
//! - [`WorkAreaLock`], an advisory lock file next to a job's staging directory
//!   that stops a second orthobatch process from reusing the same work area.
//!   The locking is advisory and is not a security boundary.

use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

/// Age after which a lock held by a live PID is treated as a reused PID (in seconds)
const DEFAULT_STALE_THRESHOLD_SECS: u64 = 48 * 3600;

/// Suffix of the engine's project document
pub const PROJECT_SUFFIX: &str = ".psx";

/// Suffix that replaces [`PROJECT_SUFFIX`] to form the lock artifact path
pub const PROJECT_LOCK_SUFFIX: &str = ".files/lock";

/// Derive the engine's lock artifact path from a project path.
///
/// `work/project.psx` becomes `work/project.files/lock`. Paths without the
/// `.psx` suffix get `.files/lock` appended.
#[must_use]
pub fn project_lock_path(project: &Path) -> PathBuf {
    let raw = project.to_string_lossy();
    match raw.strip_suffix(PROJECT_SUFFIX) {
        Some(stem) => PathBuf::from(format!("{stem}{PROJECT_LOCK_SUFFIX}")),
        None => PathBuf::from(format!("{raw}{PROJECT_LOCK_SUFFIX}")),
    }
}

/// Delete the project's lock artifact.
///
/// Returns `Ok(true)` when a file was removed and `Ok(false)` when none
/// existed. Callers decide whether other failures matter.
pub fn remove_project_lock(project: &Path) -> io::Result<bool> {
    let lock_path = project_lock_path(project);
    match fs::remove_file(&lock_path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Path of the advisory lock guarding `staging_root/{job_name}`
#[must_use]
pub fn work_area_lock_path(staging_root: &Path, job_name: &str) -> PathBuf {
    staging_root.join(format!("{job_name}.lock"))
}

/// Lock information stored in the work-area lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID that created the lock
    pub pid: u32,
    /// Timestamp when the lock was created (seconds since UNIX epoch)
    pub created_at: u64,
    /// Work area (job name) being locked
    pub resource: String,
    /// orthobatch version that created the lock
    pub orthobatch_version: String,
}

impl LockInfo {
    fn for_current_process(resource: &str) -> Self {
        Self {
            pid: process::id(),
            created_at: unix_now(),
            resource: resource.to_string(),
            orthobatch_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Creation time as a UTC timestamp, when representable
    #[must_use]
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.created_at)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

/// Lock errors for file locking operations
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error(
        "Concurrent execution detected for work area '{resource}' (PID {pid}, created {created_ago} ago)"
    )]
    ConcurrentExecution {
        resource: String,
        pid: u32,
        created_ago: String,
    },

    #[error(
        "Stale lock detected for work area '{resource}' (PID {pid}, age {age_secs}s). Use --force to override"
    )]
    StaleLock {
        resource: String,
        pid: u32,
        age_secs: u64,
    },

    #[error("Lock file is corrupted or invalid: {reason}")]
    CorruptedLock { reason: String },

    #[error("Failed to acquire lock: {reason}")]
    AcquisitionFailed { reason: String },

    #[error("Failed to release lock: {reason}")]
    ReleaseFailed { reason: String },

    #[error("IO error during lock operation: {0}")]
    Io(#[from] io::Error),
}

/// Exclusive advisory lock on one job's work area
pub struct WorkAreaLock {
    /// Path to the lock file
    lock_path: PathBuf,
    /// File descriptor lock (held while active)
    _fd_lock: Option<Box<RwLock<fs::File>>>,
    /// Lock information
    lock_info: LockInfo,
}

impl WorkAreaLock {
    /// Attempt to acquire the lock file at `lock_path` for `resource`.
    ///
    /// Uses `create_new` so two processes can never both create the file. An
    /// existing lock is reclaimed when its owner is no longer running. A lock
    /// owned by a live process is only overridden with `force`.
    ///
    /// # Arguments
    /// * `lock_path` - Lock file location, see [`work_area_lock_path`]
    /// * `resource` - Name recorded in the lock (the job name)
    /// * `force` - Whether to override locks held by live processes
    /// * `ttl_seconds` - Age after which a live owner is assumed to be a reused PID
    pub fn acquire(
        lock_path: &Path,
        resource: &str,
        force: bool,
        ttl_seconds: Option<u64>,
    ) -> Result<Self, LockError> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| LockError::AcquisitionFailed {
                reason: format!("Failed to create lock directory: {e}"),
            })?;
        }

        let ttl = ttl_seconds.unwrap_or(DEFAULT_STALE_THRESHOLD_SECS);
        Self::acquire_with_retry(lock_path, resource, force, ttl, 3)
    }

    fn acquire_with_retry(
        lock_path: &Path,
        resource: &str,
        force: bool,
        ttl_seconds: u64,
        max_retries: u32,
    ) -> Result<Self, LockError> {
        for attempt in 0..max_retries {
            match Self::create_exclusive(lock_path) {
                Ok(file) => {
                    return Self::finalize_lock(
                        lock_path.to_path_buf(),
                        file,
                        LockInfo::for_current_process(resource),
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    Self::check_existing_lock(lock_path, resource, force, ttl_seconds)?;
                    Self::try_remove_stale_lock(lock_path, resource)?;

                    if attempt + 1 < max_retries {
                        // Deterministic jitter based on PID to avoid lockstep retries
                        let base_delay_ms = 10u64.saturating_mul(2u64.saturating_pow(attempt));
                        let jitter_ms = (u64::from(attempt)
                            .wrapping_mul(3)
                            .wrapping_add(u64::from(process::id()) % 7))
                            % 7;
                        std::thread::sleep(std::time::Duration::from_millis(
                            base_delay_ms.saturating_add(jitter_ms).min(100),
                        ));
                    }
                }
                Err(e) => {
                    return Err(LockError::AcquisitionFailed {
                        reason: format!(
                            "Failed to create lock file for '{resource}' at '{}': {e}",
                            lock_path.display()
                        ),
                    });
                }
            }
        }

        Err(LockError::AcquisitionFailed {
            reason: format!(
                "Max retries ({max_retries}) exceeded for lock acquisition on '{resource}'"
            ),
        })
    }

    fn create_exclusive(lock_path: &Path) -> io::Result<fs::File> {
        fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(lock_path)
    }

    /// Write lock info and take the fd lock
    fn finalize_lock(
        lock_path: PathBuf,
        lock_file: fs::File,
        lock_info: LockInfo,
    ) -> Result<Self, LockError> {
        let lock_json =
            serde_json::to_string_pretty(&lock_info).map_err(|e| LockError::AcquisitionFailed {
                reason: format!(
                    "Failed to serialize lock info for '{}': {e}",
                    lock_info.resource
                ),
            })?;

        let mut rw_lock = Box::new(RwLock::new(lock_file));
        {
            let fd_lock = rw_lock
                .try_write()
                .map_err(|_e| LockError::ConcurrentExecution {
                    resource: lock_info.resource.clone(),
                    pid: 0,
                    created_ago: "unknown".to_string(),
                })?;

            let mut file_ref = &*fd_lock;
            file_ref
                .write_all(lock_json.as_bytes())
                .and_then(|()| file_ref.flush())
                .and_then(|()| file_ref.sync_all())
                .map_err(|e| LockError::AcquisitionFailed {
                    reason: format!(
                        "Failed to write lock info for '{}': {e}",
                        lock_info.resource
                    ),
                })?;
        }

        Ok(Self {
            lock_path,
            _fd_lock: Some(rw_lock),
            lock_info,
        })
    }

    /// Rename-to-stale then delete. `NotFound` counts as success.
    fn try_remove_stale_lock(lock_path: &Path, resource: &str) -> Result<(), LockError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let stale_path = lock_path.with_extension(format!("stale.{timestamp}.{}", process::id()));

        match fs::rename(lock_path, &stale_path) {
            Ok(()) => {
                let _ = fs::remove_file(&stale_path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::AcquisitionFailed {
                reason: format!("Failed to remove stale lock for '{resource}': {e}"),
            }),
        }
    }

    /// Read the lock information stored at `lock_path`, if any
    pub fn read_info(lock_path: &Path) -> Result<Option<LockInfo>, LockError> {
        let content = match fs::read_to_string(lock_path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LockError::CorruptedLock {
                    reason: format!("Failed to read lock file: {e}"),
                });
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| LockError::CorruptedLock {
                reason: format!("Failed to parse lock file: {e}"),
            })
    }

    /// Release the lock (called automatically on drop)
    pub fn release(mut self) -> Result<(), LockError> {
        self._fd_lock.take();

        match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::ReleaseFailed {
                reason: format!("Failed to remove lock file: {e}"),
            }),
        }
    }

    /// Work area name recorded in this lock
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.lock_info.resource
    }

    #[must_use]
    pub const fn lock_info(&self) -> &LockInfo {
        &self.lock_info
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Decide whether an existing lock may be replaced.
    ///
    /// Retries briefly on empty or half-written files, since another process
    /// may have created the file without writing it yet.
    fn check_existing_lock(
        lock_path: &Path,
        resource: &str,
        force: bool,
        ttl_seconds: u64,
    ) -> Result<(), LockError> {
        const MAX_READ_RETRIES: u32 = 3;
        const READ_RETRY_DELAY_MS: u64 = 10;

        let mut last_reason = String::new();
        for attempt in 0..MAX_READ_RETRIES {
            let content = match fs::read_to_string(lock_path) {
                Ok(content) => content,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    last_reason = format!("Failed to read existing lock for '{resource}': {e}");
                    std::thread::sleep(std::time::Duration::from_millis(READ_RETRY_DELAY_MS));
                    continue;
                }
            };

            match serde_json::from_str::<LockInfo>(&content) {
                Ok(existing) => {
                    return Self::validate_existing_lock(&existing, resource, force, ttl_seconds);
                }
                Err(e) => {
                    let is_likely_incomplete = e.is_eof() || content.trim().is_empty();
                    last_reason = format!("Failed to parse existing lock for '{resource}': {e}");
                    if is_likely_incomplete && attempt + 1 < MAX_READ_RETRIES {
                        std::thread::sleep(std::time::Duration::from_millis(READ_RETRY_DELAY_MS));
                        continue;
                    }
                    break;
                }
            }
        }

        Err(LockError::CorruptedLock {
            reason: last_reason,
        })
    }

    fn validate_existing_lock(
        existing: &LockInfo,
        resource: &str,
        force: bool,
        ttl_seconds: u64,
    ) -> Result<(), LockError> {
        // A dead owner means a crashed run; its work area is ours to reclaim.
        if !is_process_running(existing.pid) || force {
            return Ok(());
        }

        // Clock skew can put created_at in the future.
        let lock_age = unix_now().saturating_sub(existing.created_at);
        if lock_age > ttl_seconds {
            return Err(LockError::StaleLock {
                resource: resource.to_string(),
                pid: existing.pid,
                age_secs: lock_age,
            });
        }

        Err(LockError::ConcurrentExecution {
            resource: resource.to_string(),
            pid: existing.pid,
            created_ago: format_duration_since(existing.created_at),
        })
    }
}

impl std::fmt::Debug for WorkAreaLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkAreaLock")
            .field("lock_path", &self.lock_path)
            .field("lock_info", &self.lock_info)
            .field("_fd_lock", &"<RwLock>")
            .finish()
    }
}

impl Drop for WorkAreaLock {
    fn drop(&mut self) {
        self._fd_lock.take();
        let _ = fs::remove_file(&self.lock_path);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        let Ok(raw_pid) = i32::try_from(pid) else {
            return false;
        };
        // kill(pid, 0): 0 means alive, EPERM means alive but not ours
        let rc = unsafe { libc::kill(raw_pid, 0) };
        if rc == 0 {
            true
        } else {
            matches!(
                io::Error::last_os_error().raw_os_error(),
                Some(code) if code == libc::EPERM
            )
        }
    }

    #[cfg(windows)]
    {
        use winapi::um::handleapi::CloseHandle;
        use winapi::um::minwinbase::STILL_ACTIVE;
        use winapi::um::processthreadsapi::{GetExitCodeProcess, OpenProcess};
        use winapi::um::winnt::PROCESS_QUERY_LIMITED_INFORMATION;

        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle.is_null() {
                return false;
            }

            let mut exit_code: u32 = 0;
            let result = GetExitCodeProcess(handle, &mut exit_code);
            CloseHandle(handle);

            result != 0 && exit_code == STILL_ACTIVE
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        true
    }
}

/// Format a duration since a timestamp in a human-readable way
fn format_duration_since(timestamp: u64) -> String {
    let duration = unix_now().saturating_sub(timestamp);

    if duration < 60 {
        format!("{duration}s")
    } else if duration < 3600 {
        format!("{}m", duration / 60)
    } else if duration < 86400 {
        format!("{}h", duration / 3600)
    } else {
        format!("{}d", duration / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_lock(path: &Path, info: &LockInfo) {
        fs::write(path, serde_json::to_string_pretty(info).unwrap()).unwrap();
    }

    #[test]
    fn test_project_lock_path_substitutes_suffix() {
        assert_eq!(
            project_lock_path(Path::new("/tmp/siteA_unprocessed/project.psx")),
            PathBuf::from("/tmp/siteA_unprocessed/project.files/lock")
        );
        assert_eq!(
            project_lock_path(Path::new("work/merged")),
            PathBuf::from("work/merged.files/lock")
        );
    }

    #[test]
    fn test_remove_project_lock_absent_is_ok() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("project.psx");
        assert!(!remove_project_lock(&project).unwrap());
    }

    #[test]
    fn test_remove_project_lock_deletes_artifact() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("project.psx");
        fs::create_dir_all(dir.path().join("project.files")).unwrap();
        fs::write(dir.path().join("project.files/lock"), "").unwrap();

        assert!(remove_project_lock(&project).unwrap());
        assert!(!project_lock_path(&project).exists());
        assert!(dir.path().join("project.files").is_dir());
    }

    #[test]
    fn test_lock_acquisition_and_release() {
        let dir = TempDir::new().unwrap();
        let lock_path = work_area_lock_path(dir.path(), "siteA_unprocessed");

        let lock = WorkAreaLock::acquire(&lock_path, "siteA_unprocessed", false, None).unwrap();
        assert_eq!(lock.resource(), "siteA_unprocessed");
        assert!(lock_path.exists());

        let second = WorkAreaLock::acquire(&lock_path, "siteA_unprocessed", false, None);
        assert!(matches!(
            second.unwrap_err(),
            LockError::ConcurrentExecution { .. }
        ));

        lock.release().unwrap();
        assert!(!lock_path.exists());

        let _again = WorkAreaLock::acquire(&lock_path, "siteA_unprocessed", false, None).unwrap();
    }

    #[test]
    fn test_lock_info_records_current_process() {
        let dir = TempDir::new().unwrap();
        let lock_path = work_area_lock_path(dir.path(), "job");
        let _lock = WorkAreaLock::acquire(&lock_path, "job", false, None).unwrap();

        let info = WorkAreaLock::read_info(&lock_path).unwrap().unwrap();
        assert_eq!(info.pid, process::id());
        assert_eq!(info.resource, "job");
        assert!(!info.orthobatch_version.is_empty());
        assert!(info.created_at_utc().is_some());
    }

    #[test]
    fn test_automatic_cleanup_on_drop() {
        let dir = TempDir::new().unwrap();
        let lock_path = work_area_lock_path(dir.path(), "job");
        {
            let _lock = WorkAreaLock::acquire(&lock_path, "job", false, None).unwrap();
            assert!(lock_path.exists());
        }
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_dead_owner_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock_path = work_area_lock_path(dir.path(), "job");
        write_lock(
            &lock_path,
            &LockInfo {
                pid: 0,
                created_at: unix_now() - 60,
                resource: "job".to_string(),
                orthobatch_version: "0.1.0".to_string(),
            },
        );

        let lock = WorkAreaLock::acquire(&lock_path, "job", false, None).unwrap();
        assert_eq!(lock.lock_info().pid, process::id());
    }

    #[test]
    fn test_old_lock_from_live_pid_is_stale() {
        let dir = TempDir::new().unwrap();
        let lock_path = work_area_lock_path(dir.path(), "job");
        write_lock(
            &lock_path,
            &LockInfo {
                pid: process::id(),
                created_at: 0,
                resource: "job".to_string(),
                orthobatch_version: "0.1.0".to_string(),
            },
        );

        let result = WorkAreaLock::acquire(&lock_path, "job", false, Some(3600));
        assert!(matches!(result.unwrap_err(), LockError::StaleLock { .. }));

        let lock = WorkAreaLock::acquire(&lock_path, "job", true, Some(3600)).unwrap();
        assert_eq!(lock.resource(), "job");
    }

    #[test]
    fn test_force_overrides_live_lock() {
        let dir = TempDir::new().unwrap();
        let lock_path = work_area_lock_path(dir.path(), "job");
        let _first = WorkAreaLock::acquire(&lock_path, "job", false, None).unwrap();

        let forced = WorkAreaLock::acquire(&lock_path, "job", true, None);
        assert!(forced.is_ok());
    }

    #[test]
    fn test_corrupted_lock_is_reported() {
        let dir = TempDir::new().unwrap();
        let lock_path = work_area_lock_path(dir.path(), "job");
        fs::write(&lock_path, "{ invalid json content }").unwrap();

        let result = WorkAreaLock::acquire(&lock_path, "job", false, None);
        assert!(matches!(
            result.unwrap_err(),
            LockError::CorruptedLock { .. }
        ));
    }

    #[test]
    fn test_future_timestamp_is_not_stale() {
        let dir = TempDir::new().unwrap();
        let lock_path = work_area_lock_path(dir.path(), "job");
        write_lock(
            &lock_path,
            &LockInfo {
                pid: process::id(),
                created_at: unix_now() + 3600,
                resource: "job".to_string(),
                orthobatch_version: "0.1.0".to_string(),
            },
        );

        let result = WorkAreaLock::acquire(&lock_path, "job", false, Some(60));
        assert!(matches!(
            result.unwrap_err(),
            LockError::ConcurrentExecution { .. }
        ));
    }

    #[test]
    fn test_duration_formatting() {
        let now = unix_now();
        assert_eq!(format_duration_since(now), "0s");
        assert_eq!(format_duration_since(now - 120), "2m");
        assert_eq!(format_duration_since(now - 7200), "2h");
        assert_eq!(format_duration_since(now - 172_800), "2d");
    }
}
