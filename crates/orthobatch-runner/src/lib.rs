//! Process execution and the command-line engine adapter
//!
//! # Security Model
//!
//! All process execution goes through [`CommandSpec`] so arguments cross the
//! process boundary as discrete argv elements rather than shell strings. Chunk
//! labels and project paths come from folder names on disk and must never be
//! interpreted by a shell.

pub mod command_spec;
pub mod engine;
pub mod error;
pub mod native;
pub mod process;

pub use command_spec::CommandSpec;
pub use engine::{CPU_ENABLED_ENV, CommandEngine, CommandSession, GPU_MASK_ENV};
pub use error::RunnerError;
pub use native::NativeRunner;
pub use process::{ProcessOutput, ProcessRunner};
