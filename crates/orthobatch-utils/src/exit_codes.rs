//! Exit code constants for orthobatch.
//!
//! # Exit Code Table
//!
//! | Code | Constant | Description |
//! |------|----------|-------------|
//! | 0 | `SUCCESS` | Every job completed |
//! | 1 | `INTERNAL` | General/internal failure |
//! | 2 | `CONFIG` | Invalid configuration or CLI arguments |
//! | 3 | `DISCOVERY` | Input folder unreadable |
//! | 4 | `INSUFFICIENT_SPACE` | Disk-space preflight failed |
//! | 5 | `JOBS_FAILED` | Batch finished but some jobs stayed unprocessed |
//! | 6 | `ABORTED` | Operator declined the confirmation prompt |
//! | 9 | `LOCK_HELD` | Another process holds a work-area lock |

/// Exit codes matching the documented exit code table.
///
/// ```rust
/// use orthobatch_utils::exit_codes::ExitCode;
///
/// assert_eq!(ExitCode::SUCCESS.as_i32(), 0);
/// assert_eq!(ExitCode::JOBS_FAILED, ExitCode::from_i32(5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(i32);

impl ExitCode {
    /// Every job completed
    pub const SUCCESS: ExitCode = ExitCode(0);

    /// General failure
    pub const INTERNAL: ExitCode = ExitCode(1);

    /// Invalid configuration file or command-line arguments
    pub const CONFIG: ExitCode = ExitCode(2);

    /// Alias of [`CONFIG`](Self::CONFIG) for argument parsing failures
    pub const CLI_ARGS: ExitCode = ExitCode(2);

    /// Input folder missing or unreadable
    pub const DISCOVERY: ExitCode = ExitCode(3);

    /// Not enough free space to start
    pub const INSUFFICIENT_SPACE: ExitCode = ExitCode(4);

    /// At least one job was left unprocessed
    pub const JOBS_FAILED: ExitCode = ExitCode(5);

    /// Operator answered "no"
    pub const ABORTED: ExitCode = ExitCode(6);

    /// Another process owns a work area
    pub const LOCK_HELD: ExitCode = ExitCode(9);

    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn from_i32(code: i32) -> Self {
        ExitCode(code)
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl From<i32> for ExitCode {
    fn from(code: i32) -> Self {
        ExitCode(code)
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, DiscoveryError, OrthoError};
    use std::path::PathBuf;

    #[test]
    fn test_exit_code_values_are_stable() {
        assert_eq!(ExitCode::SUCCESS.as_i32(), 0);
        assert_eq!(ExitCode::INTERNAL.as_i32(), 1);
        assert_eq!(ExitCode::CONFIG.as_i32(), 2);
        assert_eq!(ExitCode::CLI_ARGS, ExitCode::CONFIG);
        assert_eq!(ExitCode::DISCOVERY.as_i32(), 3);
        assert_eq!(ExitCode::INSUFFICIENT_SPACE.as_i32(), 4);
        assert_eq!(ExitCode::JOBS_FAILED.as_i32(), 5);
        assert_eq!(ExitCode::ABORTED.as_i32(), 6);
        assert_eq!(ExitCode::LOCK_HELD.as_i32(), 9);
    }

    #[test]
    fn test_conversions() {
        let code: ExitCode = 5.into();
        assert_eq!(code, ExitCode::JOBS_FAILED);
        let raw: i32 = ExitCode::LOCK_HELD.into();
        assert_eq!(raw, 9);
        assert!(ExitCode::SUCCESS.is_success());
        assert!(!ExitCode::INTERNAL.is_success());
    }

    #[test]
    fn test_error_mapping() {
        let config = OrthoError::Config(ConfigError::InvalidFile("bad".to_string()));
        assert_eq!(config.to_exit_code(), ExitCode::CONFIG);

        let discovery = OrthoError::Discovery(DiscoveryError::NotADirectory {
            path: PathBuf::from("/nope"),
        });
        assert_eq!(discovery.to_exit_code(), ExitCode::DISCOVERY);

        let io = OrthoError::Io(std::io::Error::other("boom"));
        assert_eq!(io.to_exit_code(), ExitCode::INTERNAL);
    }
}
