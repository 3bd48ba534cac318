use std::thread;
use std::time::Duration;

use orthobatch_engine_api::ProjectSession;
use orthobatch_utils::error::CheckpointError;
use tracing::debug;

use crate::fs::FileSystemGateway;

/// Saves a session without leaving the engine's lock artifact behind.
///
/// The engine writes `project.files/lock` on save and may still be flushing
/// when `save` returns, so the lock is removed before the save and again
/// after a settling delay.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    settle: Duration,
}

impl CheckpointManager {
    #[must_use]
    pub const fn new(settle: Duration) -> Self {
        Self { settle }
    }

    #[must_use]
    pub const fn settle(&self) -> Duration {
        self.settle
    }

    /// Lock removal, save, settle, lock removal. Save is not retried.
    pub fn checkpoint<S: ProjectSession + ?Sized>(
        &self,
        session: &mut S,
    ) -> Result<(), CheckpointError> {
        let project = session.path().to_path_buf();
        FileSystemGateway::remove_lock(&project);

        session
            .save()
            .map_err(|source| CheckpointError::SaveFailed {
                path: project.clone(),
                source,
            })?;

        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }
        FileSystemGateway::remove_lock(&project);
        debug!(project = %project.display(), "Checkpoint saved");
        Ok(())
    }
}
