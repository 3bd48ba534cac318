//! Filesystem gateway: discovery, relocation, completion rename and lock cleanup

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use orthobatch_config::ChannelMode;
use orthobatch_utils::atomic_write::is_cross_device;
use orthobatch_utils::error::{DiscoveryError, RelocationError, RenameError};
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelRules};
use crate::types::{ChunkGroup, EXPORT_DIR, Job, JobState, UNPROCESSED_MARKER, WorkArea};

/// Pure I/O capability used by the orchestrator
#[derive(Debug, Clone)]
pub struct FileSystemGateway {
    rules: ChannelRules,
    mode: ChannelMode,
}

fn list_failed(path: &Path, source: io::Error) -> DiscoveryError {
    DiscoveryError::ListFailed {
        path: path.to_path_buf(),
        source,
    }
}

/// Sorted (name, path) pairs of the immediate children of `dir` matching
/// `keep`. Symlinks are followed.
fn sorted_entries(
    dir: &Path,
    keep: impl Fn(&Path) -> bool,
) -> Result<Vec<(String, PathBuf)>, DiscoveryError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| list_failed(dir, e))? {
        let entry = entry.map_err(|e| list_failed(dir, e))?;
        let path = entry.path();
        if keep(&path) {
            entries.push((entry.file_name().to_string_lossy().into_owned(), path));
        }
    }
    entries.sort();
    Ok(entries)
}

impl FileSystemGateway {
    #[must_use]
    pub fn new(rules: ChannelRules, mode: ChannelMode) -> Self {
        Self { rules, mode }
    }

    #[must_use]
    pub const fn channel_mode(&self) -> ChannelMode {
        self.mode
    }

    /// Immediate subdirectories of `root` whose name carries the unprocessed
    /// marker, in lexical order
    pub fn discover_jobs(&self, root: &Path) -> Result<Vec<Job>, DiscoveryError> {
        let metadata = fs::metadata(root).map_err(|source| DiscoveryError::RootInaccessible {
            path: root.to_path_buf(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(DiscoveryError::NotADirectory {
                path: root.to_path_buf(),
            });
        }

        let jobs: Vec<Job> = sorted_entries(root, Path::is_dir)?
            .into_iter()
            .filter(|(name, _)| name.contains(UNPROCESSED_MARKER))
            .map(|(_, path)| Job::new(path))
            .collect();
        debug!(root = %root.display(), count = jobs.len(), "Discovered jobs");
        Ok(jobs)
    }

    /// Names of the photo subfolders of `job`, in lexical order. A job without
    /// a `photos/` directory has none.
    pub fn photo_subfolders(&self, job: &Job) -> Result<Vec<String>, DiscoveryError> {
        let photos = job.photos_dir();
        if !photos.is_dir() {
            return Ok(Vec::new());
        }
        Ok(sorted_entries(&photos, Path::is_dir)?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    /// Chunk groups of `job`, in subfolder order then channel rule order.
    ///
    /// Single-channel mode reconstructs only the RGB bucket and names the
    /// group after the subfolder. Multi-channel mode produces one group per
    /// non-empty bucket named `{subfolder}_{channel}`.
    pub fn discover_chunk_groups(&self, job: &Job) -> Result<Vec<ChunkGroup>, DiscoveryError> {
        let photos = job.photos_dir();
        if !photos.is_dir() {
            warn!(job = %job.name, "No photos directory; nothing to reconstruct");
            return Ok(Vec::new());
        }

        let mut groups = Vec::new();
        for (subfolder, path) in sorted_entries(&photos, Path::is_dir)? {
            let files = sorted_entries(&path, Path::is_file)?
                .into_iter()
                .map(|(_, file)| file);
            let classification = self.rules.partition(files);
            if !classification.unmatched.is_empty() {
                debug!(
                    subfolder = %subfolder,
                    count = classification.unmatched.len(),
                    "Ignoring files without a channel rule"
                );
            }

            match self.mode {
                ChannelMode::Single => match classification.bucket(&Channel::Rgb) {
                    Some(images) => groups.push(ChunkGroup {
                        label: subfolder.clone(),
                        subfolder: subfolder.clone(),
                        channel: Channel::Rgb,
                        images: images.to_vec(),
                    }),
                    None => info!(subfolder = %subfolder, "No qualifying images; skipping"),
                },
                ChannelMode::Multi => {
                    if classification.buckets.is_empty() {
                        info!(subfolder = %subfolder, "No qualifying images; skipping");
                    }
                    for (channel, images) in classification.buckets {
                        groups.push(ChunkGroup {
                            label: format!("{subfolder}_{channel}"),
                            subfolder: subfolder.clone(),
                            channel,
                            images,
                        });
                    }
                }
            }
        }
        Ok(groups)
    }

    /// Move one file, creating the destination's parent. An existing
    /// destination file is replaced.
    pub fn move_file(src: &Path, dst: &Path) -> Result<(), RelocationError> {
        if !src.exists() {
            return Err(RelocationError::MissingSource {
                path: src.to_path_buf(),
            });
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| RelocationError::from_io(parent, e))?;
        }
        match fs::rename(src, dst) {
            Ok(()) => Ok(()),
            Err(e) if is_cross_device(&e) => {
                fs::copy(src, dst).map_err(|e| RelocationError::from_io(src, e))?;
                fs::remove_file(src).map_err(|e| RelocationError::from_io(src, e))
            }
            Err(e) => Err(RelocationError::from_io(src, e)),
        }
    }

    /// Copy one file, creating the destination's parent
    pub fn copy_file(src: &Path, dst: &Path) -> Result<(), RelocationError> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| RelocationError::from_io(parent, e))?;
        }
        fs::copy(src, dst)
            .map(drop)
            .map_err(|e| RelocationError::from_io(src, e))
    }

    /// Move every child of `src` into `dst`, merging into existing
    /// directories and replacing existing files.
    ///
    /// Items are moved in lexical order. The first failure is logged and
    /// halts the move; items already moved stay moved. Returns the number of
    /// files relocated.
    pub fn move_tree(src: &Path, dst: &Path) -> Result<usize, RelocationError> {
        if !src.is_dir() {
            return Err(RelocationError::MissingSource {
                path: src.to_path_buf(),
            });
        }
        Self::move_children(src, dst).inspect_err(|e| {
            error!(path = %e.path().display(), error = %e, "Relocation halted");
        })
    }

    fn move_children(src: &Path, dst: &Path) -> Result<usize, RelocationError> {
        fs::create_dir_all(dst).map_err(|e| RelocationError::from_io(dst, e))?;

        let mut entries: Vec<fs::DirEntry> = fs::read_dir(src)
            .map_err(|e| RelocationError::from_io(src, e))?
            .collect::<Result<_, _>>()
            .map_err(|e| RelocationError::from_io(src, e))?;
        entries.sort_by_key(fs::DirEntry::file_name);

        let mut moved = 0;
        for entry in entries {
            let from = entry.path();
            let to = dst.join(entry.file_name());
            let file_type = entry
                .file_type()
                .map_err(|e| RelocationError::from_io(&from, e))?;

            if file_type.is_dir() {
                if to.is_dir() {
                    moved += Self::move_children(&from, &to)?;
                    fs::remove_dir(&from).map_err(|e| RelocationError::from_io(&from, e))?;
                } else {
                    match fs::rename(&from, &to) {
                        Ok(()) => moved += count_files(&to),
                        Err(e) if is_cross_device(&e) => {
                            moved += Self::move_children(&from, &to)?;
                            fs::remove_dir(&from)
                                .map_err(|e| RelocationError::from_io(&from, e))?;
                        }
                        Err(e) => return Err(RelocationError::from_io(&from, e)),
                    }
                }
            } else {
                Self::move_file(&from, &to)?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Rename the job folder from its unprocessed to its processed name
    pub fn mark_complete(job: &Job) -> Result<Job, RenameError> {
        let processed_name = job.processed_name().ok_or_else(|| RenameError::MarkerMissing {
            path: job.path.clone(),
        })?;
        let target = job.path.with_file_name(&processed_name);
        if target.exists() {
            return Err(RenameError::TargetExists { path: target });
        }
        fs::rename(&job.path, &target).map_err(|source| RenameError::Failed {
            from: job.path.clone(),
            to: target.clone(),
            source,
        })?;
        info!(job = %job.name, renamed_to = %target.display(), "Renamed folder");
        Ok(Job {
            name: processed_name,
            path: target,
            state: JobState::Processed,
        })
    }

    /// Best-effort removal of the project's lock artifact
    pub fn remove_lock(project_path: &Path) {
        match orthobatch_lock::remove_project_lock(project_path) {
            Ok(true) => debug!(project = %project_path.display(), "Removed project lock"),
            Ok(false) => {}
            Err(e) => warn!(
                project = %project_path.display(),
                error = %e,
                "Could not remove project lock"
            ),
        }
    }

    /// Create a fresh `staging_root/{job_name}` with an `export/` directory.
    /// Leftovers from an interrupted run are removed first.
    pub fn stage_work_area(staging_root: &Path, job_name: &str) -> Result<WorkArea, RelocationError> {
        let root = staging_root.join(job_name);
        if root.exists() {
            warn!(path = %root.display(), "Clearing leftover work area");
            fs::remove_dir_all(&root).map_err(|e| RelocationError::from_io(&root, e))?;
        }
        let export = root.join(EXPORT_DIR);
        fs::create_dir_all(&export).map_err(|e| RelocationError::from_io(&export, e))?;
        debug!(path = %root.display(), "Staged work area");
        Ok(WorkArea::new(root))
    }

    /// Remove an emptied work area, logging instead of failing
    pub fn discard_work_area(area: &WorkArea) {
        if let Err(e) = fs::remove_dir_all(area.path()) {
            warn!(path = %area.path().display(), error = %e, "Could not remove work area");
        }
    }
}

fn count_files(path: &Path) -> usize {
    if path.is_file() {
        return 1;
    }
    fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| count_files(&e.path()))
                .sum()
        })
        .unwrap_or(0)
}
