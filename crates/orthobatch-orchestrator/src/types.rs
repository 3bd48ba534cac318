//! Core data model: jobs, chunk groups and work areas

use std::fmt;
use std::path::{Path, PathBuf};

use crate::channel::Channel;

/// Substring that marks a job folder as waiting for processing
pub const UNPROCESSED_MARKER: &str = "_unprocessed";
/// Replacement for [`UNPROCESSED_MARKER`] once a job has been processed
pub const PROCESSED_MARKER: &str = "_processed";

pub const PHOTOS_DIR: &str = "photos";
pub const EXPORT_DIR: &str = "export";
pub const PROJECT_FILE: &str = "project.psx";
/// Companion directory the engine keeps next to [`PROJECT_FILE`]
pub const PROJECT_DATA_DIR: &str = "project.files";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Unprocessed,
    InProgress,
    Processed,
    /// Job-fatal error; the folder keeps its unprocessed name
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unprocessed => "unprocessed",
            Self::InProgress => "in_progress",
            Self::Processed => "processed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A job folder found under the input root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub path: PathBuf,
    pub state: JobState,
}

impl Job {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            path,
            state: JobState::Unprocessed,
        }
    }

    #[must_use]
    pub fn photos_dir(&self) -> PathBuf {
        self.path.join(PHOTOS_DIR)
    }

    /// Folder name after completion, `None` when the marker is absent
    #[must_use]
    pub fn processed_name(&self) -> Option<String> {
        self.name
            .contains(UNPROCESSED_MARKER)
            .then(|| self.name.replace(UNPROCESSED_MARKER, PROCESSED_MARKER))
    }
}

/// One reconstructable image set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGroup {
    /// `{subfolder}` or `{subfolder}_{channel}`
    pub label: String,
    pub subfolder: String,
    pub channel: Channel,
    /// Sorted lexically
    pub images: Vec<PathBuf>,
}

/// Staging directory a job is processed in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkArea {
    pub root: PathBuf,
}

impl WorkArea {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn project_path(&self) -> PathBuf {
        self.root.join(PROJECT_FILE)
    }

    #[must_use]
    pub fn project_data_dir(&self) -> PathBuf {
        self.root.join(PROJECT_DATA_DIR)
    }

    #[must_use]
    pub fn export_dir(&self) -> PathBuf {
        self.root.join(EXPORT_DIR)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }
}

/// Raster product path for a chunk label
#[must_use]
pub fn raster_path(export_dir: &Path, label: &str) -> PathBuf {
    export_dir.join(format!("{label}_orthomosaic.tif"))
}

/// Report path for a chunk label
#[must_use]
pub fn report_path(export_dir: &Path, label: &str) -> PathBuf {
    export_dir.join(format!("{label}_report.pdf"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_name_and_processed_name() {
        let job = Job::new(PathBuf::from("/data/input/siteA_unprocessed"));
        assert_eq!(job.name, "siteA_unprocessed");
        assert_eq!(job.state, JobState::Unprocessed);
        assert_eq!(job.processed_name().as_deref(), Some("siteA_processed"));
        assert_eq!(
            job.photos_dir(),
            PathBuf::from("/data/input/siteA_unprocessed/photos")
        );
    }

    #[test]
    fn test_processed_name_requires_marker() {
        let job = Job::new(PathBuf::from("/data/input/siteA"));
        assert_eq!(job.processed_name(), None);
    }

    #[test]
    fn test_work_area_layout() {
        let area = WorkArea::new(PathBuf::from("/tmp/orthos/siteA_unprocessed"));
        assert_eq!(
            area.project_path(),
            PathBuf::from("/tmp/orthos/siteA_unprocessed/project.psx")
        );
        assert_eq!(
            area.project_data_dir(),
            PathBuf::from("/tmp/orthos/siteA_unprocessed/project.files")
        );
        assert_eq!(
            raster_path(&area.export_dir(), "flightA"),
            PathBuf::from("/tmp/orthos/siteA_unprocessed/export/flightA_orthomosaic.tif")
        );
        assert_eq!(
            report_path(&area.export_dir(), "flightA"),
            PathBuf::from("/tmp/orthos/siteA_unprocessed/export/flightA_report.pdf")
        );
    }
}
