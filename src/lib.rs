//! orthobatch - batch orchestration for photogrammetry reconstruction
//!
//! orthobatch scans an input folder for job folders named `*_unprocessed*`,
//! stages each job in a work area, reconstructs every photo subfolder as a
//! chunk through a checkpointed stage sequence, exports an orthomosaic and a
//! report, moves the results home and renames the folder to `*_processed*`.
//!
//! # Quick Start (CLI)
//!
//! ```bash
//! # Write a configuration template and edit it
//! orthobatch generate-config
//!
//! # See what would be processed
//! orthobatch plan
//!
//! # Process everything
//! orthobatch run --yes
//! ```
//!
//! # Library use
//!
//! The engine is abstracted behind [`Engine`]; [`CommandEngine`] drives an
//! external bridge executable, and tests use the scripted engine behind the
//! `test-utils` feature.
//!
//! ```rust,no_run
//! use orthobatch::{CliArgs, CommandEngine, Config, JobOrchestrator};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::discover(&CliArgs::default())?;
//! let engine = CommandEngine::new("orthobatch-engine");
//! let mut orchestrator = JobOrchestrator::new(engine, &config, None)?;
//! let summary = orchestrator.run(&config.input_folder)?;
//! assert!(summary.all_processed());
//! # Ok(())
//! # }
//! ```

pub mod cli;

pub use orthobatch_config::{ChannelMode, CliArgs, Config};
pub use orthobatch_engine_api::{Engine, EngineError, ProjectSession, StageExecutor};
pub use orthobatch_orchestrator::{
    BatchSummary, JobOrchestrator, JobOutcome, JobState, OrchestratorSettings,
};
pub use orthobatch_runner::CommandEngine;
pub use orthobatch_utils::error::OrthoError;
pub use orthobatch_utils::exit_codes::ExitCode;
