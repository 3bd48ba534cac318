//! Configuration management for orthobatch
//!
//! Configuration is resolved with precedence CLI > file > defaults. The file
//! is YAML, either passed explicitly or discovered in the working directory.

mod cli_args;
mod discovery;
mod model;
mod sources;
mod validation;

pub use cli_args::CliArgs;
pub use discovery::CONFIG_FILE_NAMES;
pub use model::*;
