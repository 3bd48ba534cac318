use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub use orthobatch_engine_api::EngineError;
pub use orthobatch_lock::LockError;

/// Library-level error type with rich context and user-friendly reporting.
///
/// `OrthoError` is the umbrella returned by orthobatch library operations. The
/// variants follow the failure taxonomy of the batch runner:
///
/// | Category | Scope | Recovery |
/// |----------|-------|----------|
/// | `Config` | pre-run, fatal | fix the configuration file or flags |
/// | `Discovery` | pre-run, fatal | make the input root readable |
/// | `Stage` | one chunk group | logged, batch continues |
/// | `Checkpoint` | one chunk group | logged, batch continues |
/// | `Relocation` | one job | job stays unprocessed, retried next run |
/// | `Rename` | one job | job stays unprocessed, retried next run |
/// | `Lock` | one job | another process owns the work area |
///
/// # Exit Code Mapping
///
/// Use [`to_exit_code()`](Self::to_exit_code) to map errors to CLI exit codes.
///
/// # Example
///
/// ```rust
/// use orthobatch_utils::error::{ConfigError, OrthoError};
/// use orthobatch_utils::exit_codes::ExitCode;
///
/// let err = OrthoError::Config(ConfigError::InvalidValue {
///     key: "gpu_option".to_string(),
///     value: "2".to_string(),
/// });
/// assert_eq!(err.to_exit_code(), ExitCode::CONFIG);
/// assert!(err.display_for_user().contains("Suggestions:"));
/// ```
#[derive(Error, Debug)]
pub enum OrthoError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Relocation error: {0}")]
    Relocation(#[from] RelocationError),

    #[error("Rename error: {0}")]
    Rename(#[from] RenameError),

    #[error("File lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error(
        "Insufficient disk space on {path}: {available_gb} GB free, {required_gb} GB required"
    )]
    InsufficientSpace {
        path: PathBuf,
        available_gb: u64,
        required_gb: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Trait for providing user-friendly error reporting with context and suggestions
pub trait UserFriendlyError {
    /// Get a user-friendly error message
    fn user_message(&self) -> String;

    /// Get contextual information about the error
    fn context(&self) -> Option<String>;

    /// Get suggested actions to resolve the error
    fn suggestions(&self) -> Vec<String>;

    /// Get the error category for grouping similar errors
    fn category(&self) -> ErrorCategory;
}

/// Categories of errors for better organization and handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Discovery,
    StageExecution,
    FileSystem,
    Concurrency,
    ResourceLimits,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "Configuration"),
            Self::Discovery => write!(f, "Discovery"),
            Self::StageExecution => write!(f, "Stage Execution"),
            Self::FileSystem => write!(f, "File System"),
            Self::Concurrency => write!(f, "Concurrency"),
            Self::ResourceLimits => write!(f, "Resource Limits"),
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration file: {0}")]
    InvalidFile(String),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Configuration file not found at {path}")]
    NotFound { path: String },

    #[error("Configuration validation failed: {error_count} errors")]
    ValidationFailed {
        errors: Vec<String>,
        error_count: usize,
    },
}

impl UserFriendlyError for ConfigError {
    fn user_message(&self) -> String {
        match self {
            Self::InvalidFile(reason) => {
                format!("Configuration file has invalid format: {reason}")
            }
            Self::MissingRequired(key) => {
                format!("Required configuration '{key}' is missing")
            }
            Self::InvalidValue { key, value } => {
                format!("Configuration '{key}' has invalid value: {value}")
            }
            Self::NotFound { path } => {
                format!("Configuration file not found: {path}")
            }
            Self::ValidationFailed { errors, .. } => {
                format!(
                    "Configuration validation failed with {} errors: {}",
                    errors.len(),
                    errors.join(", ")
                )
            }
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::InvalidFile(_) => Some(
                "Configuration files are YAML documents with input_folder, gpu_option, cpu_enabled, log_dir and tmp_folder keys."
                    .to_string(),
            ),
            Self::MissingRequired(_) => Some(
                "The batch runner refuses to start until every required key is present."
                    .to_string(),
            ),
            Self::InvalidValue { key, .. } if key == "gpu_option" => Some(
                "gpu_option selects which GPUs the reconstruction engine may use.".to_string(),
            ),
            Self::InvalidValue { key, .. } => Some(format!(
                "The '{key}' configuration option has specific format requirements."
            )),
            Self::NotFound { .. } => None,
            Self::ValidationFailed { .. } => Some(
                "All configuration values are checked before the first job is touched."
                    .to_string(),
            ),
        }
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            Self::InvalidFile(_) => vec![
                "Check the YAML syntax (indentation, quoting of \"0\"/\"1\" values)".to_string(),
                "Generate a fresh template with: orthobatch generate-config".to_string(),
            ],
            Self::MissingRequired(key) => vec![
                format!("Add '{key}' to the configuration file"),
                "Generate a fresh template with: orthobatch generate-config".to_string(),
            ],
            Self::InvalidValue { key, .. } if key == "gpu_option" => vec![
                "Use one of \"0\", \"1\" or \"both\"".to_string(),
                "Quote the value in YAML so it is read as a string".to_string(),
            ],
            Self::InvalidValue { key, .. } => {
                vec![format!("Check the documented format for '{key}'")]
            }
            Self::NotFound { path } => vec![
                format!("Create the configuration file at {path}"),
                "Pass an explicit path with --config".to_string(),
            ],
            Self::ValidationFailed { .. } => {
                vec!["Fix each listed value and re-run: orthobatch validate".to_string()]
            }
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}

/// Errors raised while enumerating the input tree before any job runs
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Input root {path} is not accessible: {source}")]
    RootInaccessible {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Input root {path} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("Failed to list {path}: {source}")]
    ListFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl UserFriendlyError for DiscoveryError {
    fn user_message(&self) -> String {
        match self {
            Self::RootInaccessible { path, source } => {
                format!("Cannot read the input folder {}: {source}", path.display())
            }
            Self::NotADirectory { path } => {
                format!("The input folder {} is not a directory", path.display())
            }
            Self::ListFailed { path, source } => {
                format!("Cannot list {}: {source}", path.display())
            }
        }
    }

    fn context(&self) -> Option<String> {
        Some(
            "Jobs are the immediate subfolders of input_folder whose name contains '_unprocessed'."
                .to_string(),
        )
    }

    fn suggestions(&self) -> Vec<String> {
        vec![
            "Check that input_folder points at a mounted, readable directory".to_string(),
            "Verify permissions on network shares".to_string(),
        ]
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Discovery
    }
}

/// Save failure inside a checkpoint. Lock removal failures never produce this.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Saving project {path} failed: {source}")]
    SaveFailed {
        path: PathBuf,
        #[source]
        source: EngineError,
    },
}

/// Failure inside one chunk group's stage sequence
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Chunk '{chunk}' could not be created: {source}")]
    Setup {
        chunk: String,
        #[source]
        source: EngineError,
    },

    #[error("Stage '{stage}' failed for chunk '{chunk}': {source}")]
    Engine {
        chunk: String,
        stage: String,
        #[source]
        source: EngineError,
    },

    #[error("Checkpoint after stage '{stage}' failed for chunk '{chunk}': {source}")]
    Checkpoint {
        chunk: String,
        stage: String,
        #[source]
        source: CheckpointError,
    },
}

impl StageError {
    /// Label of the chunk group the failure belongs to
    #[must_use]
    pub fn chunk(&self) -> &str {
        match self {
            Self::Setup { chunk, .. } | Self::Engine { chunk, .. } | Self::Checkpoint { chunk, .. } => {
                chunk
            }
        }
    }

    /// Stage that was running, if the failure happened past chunk setup
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Setup { .. } => None,
            Self::Engine { stage, .. } | Self::Checkpoint { stage, .. } => Some(stage),
        }
    }
}

/// Failure moving work-area contents or the run log back to a job's home
#[derive(Error, Debug)]
pub enum RelocationError {
    #[error("Source {path} does not exist")]
    MissingSource { path: PathBuf },

    #[error("Permission denied while relocating {path}")]
    PermissionDenied { path: PathBuf },

    #[error("Relocating {path} failed: {source}")]
    Failed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RelocationError {
    /// Classify an I/O failure on `path` into the matching variant
    #[must_use]
    pub fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => Self::MissingSource { path },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Failed { path, source },
        }
    }

    /// Path of the item that could not be relocated
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::MissingSource { path } | Self::PermissionDenied { path } | Self::Failed { path, .. } => {
                path
            }
        }
    }
}

/// Failure renaming a job directory to its processed name
#[derive(Error, Debug)]
pub enum RenameError {
    #[error("Job directory {path} does not carry the unprocessed marker")]
    MarkerMissing { path: PathBuf },

    #[error("Cannot rename to {path}: target already exists")]
    TargetExists { path: PathBuf },

    #[error("Renaming {from} to {to} failed: {source}")]
    Failed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl UserFriendlyError for LockError {
    fn user_message(&self) -> String {
        match self {
            Self::ConcurrentExecution {
                resource,
                pid,
                created_ago,
            } => format!(
                "Another orthobatch process is working on '{resource}' (PID {pid}, started {created_ago} ago)"
            ),
            Self::StaleLock {
                resource,
                pid,
                age_secs,
            } => format!("Stale lock detected for '{resource}' (PID {pid}, age {age_secs}s)"),
            Self::CorruptedLock { reason } => format!("Lock file is corrupted or invalid: {reason}"),
            Self::AcquisitionFailed { reason } => {
                format!("Failed to acquire exclusive lock: {reason}")
            }
            Self::ReleaseFailed { reason } => format!("Failed to release lock: {reason}"),
            Self::Io(e) => format!("File system error during lock operation: {e}"),
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::ConcurrentExecution { .. } | Self::StaleLock { .. } => Some(
                "Each job's work area is guarded by an advisory lock so two batch runs never share it."
                    .to_string(),
            ),
            _ => None,
        }
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            Self::ConcurrentExecution { pid, .. } => vec![
                format!("Wait for the other process (PID {pid}) to complete"),
                "If the process is stuck, terminate it and re-run".to_string(),
            ],
            Self::StaleLock { .. } => vec![
                "Re-run with --force to break the stale lock".to_string(),
                "Check system logs for a crashed batch run".to_string(),
            ],
            _ => vec!["Check permissions on tmp_folder".to_string()],
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::ConcurrentExecution { .. } | Self::StaleLock { .. } => ErrorCategory::Concurrency,
            _ => ErrorCategory::FileSystem,
        }
    }
}

impl UserFriendlyError for OrthoError {
    fn user_message(&self) -> String {
        match self {
            Self::Config(e) => e.user_message(),
            Self::Discovery(e) => e.user_message(),
            Self::Lock(e) => e.user_message(),
            Self::InsufficientSpace {
                path,
                available_gb,
                required_gb,
            } => format!(
                "Only {available_gb} GB free on {}, at least {required_gb} GB are required",
                path.display()
            ),
            other => other.to_string(),
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::Config(e) => e.context(),
            Self::Discovery(e) => e.context(),
            Self::Lock(e) => e.context(),
            Self::Stage(_) | Self::Checkpoint(_) => Some(
                "Stage failures are isolated to their chunk group; the remaining groups still run."
                    .to_string(),
            ),
            Self::Relocation(_) | Self::Rename(_) => Some(
                "The job keeps its '_unprocessed' name and is picked up again by the next run."
                    .to_string(),
            ),
            Self::InsufficientSpace { .. } => Some(
                "Reconstruction projects grow to many times the size of their source imagery."
                    .to_string(),
            ),
            Self::Engine(_) | Self::Io(_) => None,
        }
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            Self::Config(e) => e.suggestions(),
            Self::Discovery(e) => e.suggestions(),
            Self::Lock(e) => e.suggestions(),
            Self::Relocation(_) => vec![
                "Check free space and permissions on the job's home directory".to_string(),
                "Finished products remain in tmp_folder until the next successful run".to_string(),
            ],
            Self::Rename(_) => vec![
                "Check for an existing '_processed' folder with the same name".to_string(),
            ],
            Self::InsufficientSpace { .. } => vec![
                "Free space on the staging volume or point tmp_folder elsewhere".to_string(),
                "Lower min_free_gb if the jobs are small".to_string(),
            ],
            Self::Engine(_) | Self::Stage(_) | Self::Checkpoint(_) => vec![
                "Inspect the run log in log-files/ for the engine's output".to_string(),
            ],
            Self::Io(_) => Vec::new(),
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Discovery(_) => ErrorCategory::Discovery,
            Self::Stage(_) | Self::Checkpoint(_) | Self::Engine(_) => {
                ErrorCategory::StageExecution
            }
            Self::Relocation(_) | Self::Rename(_) | Self::Io(_) => ErrorCategory::FileSystem,
            Self::Lock(e) => e.category(),
            Self::InsufficientSpace { .. } => ErrorCategory::ResourceLimits,
        }
    }
}

impl OrthoError {
    /// Get a user-friendly error message with context and actionable suggestions.
    ///
    /// ```text
    /// Error: <user message>
    ///
    /// Context: <context if available>
    ///
    /// Suggestions:
    ///   • <suggestion 1>
    /// ```
    #[must_use]
    pub fn display_for_user(&self) -> String {
        let mut output = String::new();

        output.push_str(&format!("Error: {}\n", self.user_message()));

        if let Some(ctx) = self.context() {
            output.push_str(&format!("\nContext: {ctx}\n"));
        }

        let suggestions = self.suggestions();
        if !suggestions.is_empty() {
            output.push_str("\nSuggestions:\n");
            for suggestion in suggestions {
                output.push_str(&format!("  • {suggestion}\n"));
            }
        }

        output
    }

    /// Map this error to the appropriate CLI exit code.
    ///
    /// | Exit Code | Name | Description |
    /// |-----------|------|-------------|
    /// | 1 | INTERNAL | General failure |
    /// | 2 | CONFIG | Invalid configuration or arguments |
    /// | 3 | DISCOVERY | Input root unreadable |
    /// | 4 | INSUFFICIENT_SPACE | Disk-space preflight failed |
    /// | 9 | LOCK_HELD | Work area owned by another process |
    #[must_use]
    pub fn to_exit_code(&self) -> crate::exit_codes::ExitCode {
        use crate::exit_codes::ExitCode;

        match self {
            Self::Config(_) => ExitCode::CONFIG,
            Self::Discovery(_) => ExitCode::DISCOVERY,
            Self::InsufficientSpace { .. } => ExitCode::INSUFFICIENT_SPACE,
            Self::Lock(_) => ExitCode::LOCK_HELD,
            _ => ExitCode::INTERNAL,
        }
    }
}
