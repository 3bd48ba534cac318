//! CLI entry point and dispatch logic
//!
//! This module owns the `run()` function which:
//! - Parses CLI arguments
//! - Discovers Config for the commands that need it
//! - Dispatches to command handlers
//! - Handles all error output

use anyhow::Result;
use clap::Parser;
use orthobatch_utils::error::OrthoError;
use orthobatch_utils::exit_codes::ExitCode;
use orthobatch_utils::logging::init_tracing;

use super::args::{Cli, Commands};
use super::commands;

/// Main CLI execution function.
///
/// Prints everything, including errors, and returns the exit code for
/// `main` to pass to the process.
pub fn run() -> Result<(), ExitCode> {
    let cli = Cli::parse();
    let operation = cli.command.name();

    let result = dispatch(&cli);
    match result {
        Ok(code) if code.is_success() => Ok(()),
        Ok(code) => Err(code),
        Err(error) => Err(report_error(&error, operation)),
    }
}

fn dispatch(cli: &Cli) -> Result<ExitCode> {
    // generate-config must work before any configuration exists
    if let Commands::GenerateConfig { output, force } = &cli.command {
        return commands::execute_generate_config_command(output, *force);
    }

    let config = commands::load_config(&cli.config_args())?;

    match &cli.command {
        Commands::Run { yes, force } => {
            commands::execute_run_command(&config, cli.verbose, *yes, *force)
        }
        Commands::Merge {
            job_dir,
            yes,
            force,
        } => commands::execute_merge_command(&config, job_dir, cli.verbose, *yes, *force),
        Commands::Plan => {
            console_logging(cli.verbose);
            commands::execute_plan_command(&config)
        }
        Commands::Validate => commands::execute_validate_command(&config),
        Commands::GenerateConfig { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn console_logging(verbose: bool) {
    if let Err(e) = init_tracing(verbose, None) {
        eprintln!("Warning: failed to initialize logging: {e}");
    }
}

/// Print the error and pick the exit code
fn report_error(error: &anyhow::Error, operation: &str) -> ExitCode {
    if let Some(ortho_error) = error.downcast_ref::<OrthoError>() {
        tracing::error!(operation, error = %ortho_error, "Command failed");
        eprintln!("{}", ortho_error.display_for_user());
        return ortho_error.to_exit_code();
    }

    tracing::error!(operation, error = %error, "Command failed");
    eprintln!("✗ {operation} failed: {error:#}");
    eprintln!("\n  General troubleshooting:");
    eprintln!("    - Run with --verbose for more detailed output");
    eprintln!("    - Check the configuration with `orthobatch validate`");
    ExitCode::INTERNAL
}
