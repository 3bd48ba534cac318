//! Free-space preflight for the staging volume

use crate::error::OrthoError;
use std::io;
use std::path::{Path, PathBuf};
use sysinfo::Disks;

const BYTES_PER_GB: u64 = 1 << 30;

/// Available bytes on the filesystem holding `path`.
///
/// `path` does not need to exist yet; its nearest existing ancestor is used.
pub fn available_bytes(path: &Path) -> io::Result<u64> {
    let resolved = nearest_existing(path)?.canonicalize()?;

    let disks = Disks::new_with_refreshed_list();
    let mounts: Vec<(PathBuf, u64)> = disks
        .list()
        .iter()
        .map(|d| (d.mount_point().to_path_buf(), d.available_space()))
        .collect();

    select_mount(&resolved, &mounts).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no mounted filesystem contains {}", resolved.display()),
        )
    })
}

/// Fail with [`OrthoError::InsufficientSpace`] when fewer than `required_gb`
/// gigabytes are free at `path`. Returns the free space in whole gigabytes.
///
/// A requirement of zero disables the check.
pub fn check_free_space(path: &Path, required_gb: u64) -> Result<u64, OrthoError> {
    if required_gb == 0 {
        return Ok(0);
    }

    let available_gb = available_bytes(path)? / BYTES_PER_GB;
    if available_gb < required_gb {
        return Err(OrthoError::InsufficientSpace {
            path: path.to_path_buf(),
            available_gb,
            required_gb,
        });
    }

    tracing::info!(
        path = %path.display(),
        available_gb,
        required_gb,
        "Free space check passed"
    );
    Ok(available_gb)
}

fn nearest_existing(path: &Path) -> io::Result<&Path> {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no existing ancestor of {}", path.display()),
            )
        })
}

/// Available space of the deepest mount point containing `path`
fn select_mount(path: &Path, mounts: &[(PathBuf, u64)]) -> Option<u64> {
    mounts
        .iter()
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .map(|(_, available)| *available)
}
