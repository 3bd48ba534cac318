use std::io;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::RunnerError;
use crate::{CommandSpec, ProcessOutput, ProcessRunner};

/// Runs commands directly on the host.
///
/// A single-threaded Tokio runtime is built per call to bound the wait with a
/// timeout; the child is killed if the timeout fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeRunner;

impl NativeRunner {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ProcessRunner for NativeRunner {
    fn run(
        &self,
        cmd: &CommandSpec,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutput, RunnerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| RunnerError::Runtime {
                reason: e.to_string(),
            })?;

        runtime.block_on(async {
            let mut child = cmd
                .to_tokio_command()
                .spawn()
                .map_err(|e| RunnerError::SpawnFailed {
                    program: cmd.program.to_string_lossy().into_owned(),
                    reason: e.to_string(),
                })?;

            // Fed from a separate task so a child that writes before it
            // reads cannot deadlock against a full pipe
            if let Some(input) = cmd.stdin.clone()
                && let Some(mut pipe) = child.stdin.take()
            {
                tokio::spawn(async move {
                    if let Err(e) = pipe.write_all(&input).await
                        && e.kind() != io::ErrorKind::BrokenPipe
                    {
                        debug!(error = %e, "Writing child stdin failed");
                    }
                });
            }

            let output = match timeout {
                Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                    .await
                    // Dropping the future drops the child, and kill_on_drop ends it
                    .map_err(|_| RunnerError::Timeout {
                        timeout_seconds: limit.as_secs(),
                    })?,
                None => child.wait_with_output().await,
            }
            .map_err(|e| RunnerError::ExecutionFailed {
                reason: e.to_string(),
            })?;

            Ok(ProcessOutput::new(
                output.stdout,
                output.stderr,
                output.status.code(),
            ))
        })
    }
}
