use crate::error::RunnerError;
use std::time::Duration;

use super::CommandSpec;

/// Output from a finished process
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    #[must_use]
    pub fn new(stdout: Vec<u8>, stderr: Vec<u8>, exit_code: Option<i32>) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
        }
    }

    #[must_use]
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    #[must_use]
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last `n` non-empty stderr lines, for error messages
    #[must_use]
    pub fn stderr_tail(&self, n: usize) -> String {
        let stderr = self.stderr_string();
        let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
        lines[lines.len().saturating_sub(n)..].join("\n")
    }
}

/// Trait for process execution.
///
/// Implementations MUST use argv-style APIs only (no `sh -c`, no `cmd /C`).
/// The interface is synchronous; implementations may drive an async runtime
/// internally for timeouts.
pub trait ProcessRunner {
    /// Run `cmd` to completion.
    ///
    /// * `timeout` - `None` waits indefinitely. On expiry the process is
    ///   killed and [`RunnerError::Timeout`] returned.
    ///
    /// A non-zero exit is not an error here; check [`ProcessOutput::success`].
    fn run(&self, cmd: &CommandSpec, timeout: Option<Duration>)
    -> Result<ProcessOutput, RunnerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_output_success() {
        assert!(ProcessOutput::new(Vec::new(), Vec::new(), Some(0)).success());
        assert!(!ProcessOutput::new(Vec::new(), Vec::new(), Some(1)).success());
        assert!(!ProcessOutput::new(Vec::new(), Vec::new(), None).success());
    }

    #[test]
    fn test_stderr_tail_skips_blank_lines() {
        let output = ProcessOutput::new(
            Vec::new(),
            b"loading\n\nstep 1\nstep 2\n\nout of memory\n".to_vec(),
            Some(1),
        );
        assert_eq!(output.stderr_tail(2), "step 2\nout of memory");
        assert_eq!(output.stderr_tail(10).lines().count(), 4);
    }

    #[test]
    fn test_lossy_utf8() {
        let invalid = vec![0xff, 0xfe, 0x00, 0x01];
        let output = ProcessOutput::new(invalid.clone(), invalid, Some(0));
        assert!(!output.stdout_string().is_empty());
        assert!(!output.stderr_string().is_empty());
    }

    struct TimeoutRunner;

    impl ProcessRunner for TimeoutRunner {
        fn run(
            &self,
            _cmd: &CommandSpec,
            timeout: Option<Duration>,
        ) -> Result<ProcessOutput, RunnerError> {
            Err(RunnerError::Timeout {
                timeout_seconds: timeout.map_or(0, |t| t.as_secs()),
            })
        }
    }

    #[test]
    fn test_runner_trait_reports_timeout() {
        let result = TimeoutRunner.run(&CommandSpec::new("engine"), Some(Duration::from_secs(60)));
        assert!(matches!(
            result,
            Err(RunnerError::Timeout {
                timeout_seconds: 60
            })
        ));
    }
}
