//! Orchestration for photogrammetry batch jobs
//!
//! Wires the filesystem gateway, channel classification, checkpointing and
//! the per-chunk reconstruction state machine into [`JobOrchestrator`].
//!
//! # Module Organization
//!
//! - `types.rs`: jobs, chunk groups, work areas and layout constants
//! - `channel.rs`: spectral channels and suffix rules
//! - `fs.rs`: discovery, relocation, completion rename, lock cleanup
//! - `checkpoint.rs`: lock-safe project saves
//! - `pipeline.rs`: the per-chunk state machine
//! - `resources.rs`: compute device selection
//! - `orchestrator.rs`: batch and merge drivers
//!
//! ## Example
//!
//! ```rust,no_run
//! use orthobatch_config::{CliArgs, Config};
//! use orthobatch_engine_api::Engine;
//! use orthobatch_orchestrator::JobOrchestrator;
//!
//! fn run_batch<E: Engine>(engine: E) -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::discover(&CliArgs::default())?;
//!     let mut orchestrator = JobOrchestrator::new(engine, &config, None)?;
//!     let summary = orchestrator.run(&config.input_folder)?;
//!     println!("{} processed, {} failed", summary.processed(), summary.failed());
//!     Ok(())
//! }
//! ```

mod channel;
mod checkpoint;
mod fs;
mod orchestrator;
mod pipeline;
mod resources;
mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use self::channel::{Channel, ChannelRule, ChannelRules, Classification};
pub use self::checkpoint::CheckpointManager;
pub use self::fs::FileSystemGateway;
pub use self::orchestrator::{
    BatchSummary, JobOrchestrator, JobOutcome, MERGED_CHUNK_LABEL, OrchestratorSettings,
    PlannedJob, plan_jobs,
};
pub use self::pipeline::{
    ChunkPipeline, PipelineFailure, PipelineRun, PipelineSettings, PipelineStage,
};
pub use self::resources::ResourceConfigurator;
pub use self::types::{
    ChunkGroup, EXPORT_DIR, Job, JobState, PHOTOS_DIR, PROCESSED_MARKER, PROJECT_DATA_DIR,
    PROJECT_FILE, UNPROCESSED_MARKER, WorkArea, raster_path, report_path,
};
