//! Filesystem fixtures for tests: input trees with jobs, photo subfolders and images.

use std::fs;
use std::path::{Path, PathBuf};

/// Image names `{prefix}_{0001..}{suffix}`, e.g. `DJI_0001.JPG`
#[must_use]
pub fn numbered_images(prefix: &str, count: usize, suffix: &str) -> Vec<String> {
    (1..=count)
        .map(|i| format!("{prefix}_{i:04}{suffix}"))
        .collect()
}

/// Image names for one multispectral capture set per index
#[must_use]
pub fn multispectral_set(count: usize) -> Vec<String> {
    let mut names = Vec::with_capacity(count * 5);
    for i in 1..=count {
        names.push(format!("DJI_{i:04}.JPG"));
        for band in ["MS_G", "MS_R", "MS_RE", "MS_NIR"] {
            names.push(format!("DJI_{i:04}_{band}.TIF"));
        }
    }
    names
}

/// Create `root/{name}/photos` and return the job directory
pub fn create_job(root: &Path, name: &str) -> PathBuf {
    let job = root.join(name);
    fs::create_dir_all(job.join("photos")).expect("create job photos dir");
    job
}

/// Create `job/photos/{subfolder}` holding empty files named `files`
pub fn add_images<S: AsRef<str>>(job: &Path, subfolder: &str, files: &[S]) -> PathBuf {
    let dir = job.join("photos").join(subfolder);
    fs::create_dir_all(&dir).expect("create photo subfolder");
    for name in files {
        fs::write(dir.join(name.as_ref()), b"img").expect("write image fixture");
    }
    dir
}

/// Names of the immediate children of `dir`, sorted
#[must_use]
pub fn list_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_numbered_images() {
        assert_eq!(
            numbered_images("DJI", 2, ".jpg"),
            vec!["DJI_0001.jpg".to_string(), "DJI_0002.jpg".to_string()]
        );
    }

    #[test]
    fn test_multispectral_set_has_five_bands_per_capture() {
        let names = multispectral_set(2);
        assert_eq!(names.len(), 10);
        assert!(names.contains(&"DJI_0002_MS_NIR.TIF".to_string()));
    }

    #[test]
    fn test_job_fixture_layout() {
        let root = TempDir::new().unwrap();
        let job = create_job(root.path(), "siteA_unprocessed");
        add_images(&job, "flightA", &numbered_images("DJI", 3, ".jpg"));

        assert_eq!(list_names(root.path()), vec!["siteA_unprocessed"]);
        assert_eq!(list_names(&job.join("photos/flightA")).len(), 3);
    }
}
