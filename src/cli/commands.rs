//! Command implementations and helpers

use std::fmt::Write as _;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use orthobatch_config::{CliArgs, Config};
use orthobatch_orchestrator::{
    BatchSummary, ChannelRules, FileSystemGateway, JobOrchestrator, JobOutcome, JobState,
    PlannedJob, plan_jobs,
};
use orthobatch_receipt::ChunkOutcome;
use orthobatch_runner::CommandEngine;
use orthobatch_utils::disk::check_free_space;
use orthobatch_utils::error::{ConfigError, OrthoError};
use orthobatch_utils::exit_codes::ExitCode;
use orthobatch_utils::logging::{create_log_file, init_tracing};
use tracing::info;

/// Discover and validate the configuration
pub fn load_config(cli_args: &CliArgs) -> Result<Config, OrthoError> {
    Ok(Config::discover(cli_args)?)
}

/// Engine bridge described by the configuration
pub fn build_engine(config: &Config) -> Result<CommandEngine, OrthoError> {
    let program = config
        .engine
        .program
        .as_deref()
        .ok_or_else(|| ConfigError::MissingRequired("engine.program".to_string()))?;
    Ok(CommandEngine::new(program)
        .with_args(config.engine.args.iter())
        .with_timeout(config.stage_timeout_secs.map(Duration::from_secs)))
}

/// Create the per-run log file and route tracing to it
fn start_logging(config: &Config, verbose: bool) -> Result<PathBuf> {
    let log_file = create_log_file(&config.log_dir, Local::now()).with_context(|| {
        format!(
            "Failed to create log file under {}",
            config.log_dir.display()
        )
    })?;
    init_tracing(verbose, Some(log_file.as_path()))
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;
    info!(log_file = %log_file.display(), "Logging to file");
    Ok(log_file)
}

/// Read one answer from `input`. Only `yes` or `y` (any case) accepts.
pub fn confirm(prompt: &str, input: &mut impl BufRead, output: &mut impl Write) -> io::Result<bool> {
    write!(output, "{prompt} [yes/no]: ")?;
    output.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "yes" | "y"
    ))
}

/// Effective configuration as aligned `key = value (source)` lines
#[must_use]
pub fn render_config(config: &Config) -> String {
    let rows = config.effective_config();
    let width = rows.iter().map(|(k, _, _)| k.len()).max().unwrap_or(0);
    let mut out = String::new();
    for (key, value, source) in rows {
        let _ = writeln!(out, "  {key:<width$} = {value} ({source})");
    }
    out
}

/// Planned jobs with their photo subfolders and chunk groups
#[must_use]
pub fn render_plan(plan: &[PlannedJob]) -> String {
    if plan.is_empty() {
        return "No unprocessed jobs found.\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(out, "{} unprocessed job(s):", plan.len());
    for planned in plan {
        let _ = writeln!(out, "  {}", planned.job.name);
        if let Some(error) = &planned.error {
            let _ = writeln!(out, "    cannot list photos: {error}");
        }
        for subfolder in &planned.subfolders {
            let groups: Vec<String> = planned
                .groups
                .iter()
                .filter(|g| &g.subfolder == subfolder)
                .map(|g| format!("{} ({} images)", g.label, g.images.len()))
                .collect();
            if groups.is_empty() {
                let _ = writeln!(out, "    {subfolder}/: no qualifying images");
            } else {
                let _ = writeln!(out, "    {subfolder}/: {}", groups.join(", "));
            }
        }
    }
    out
}

fn render_outcome(out: &mut String, outcome: &JobOutcome) {
    let _ = writeln!(
        out,
        "  {} [{}] completed={} failed={} skipped={}",
        outcome.job.name,
        outcome.job.state,
        outcome.count(ChunkOutcome::Completed),
        outcome.count(ChunkOutcome::Failed),
        outcome.count(ChunkOutcome::Skipped),
    );
    if let Some(error) = &outcome.error {
        let _ = writeln!(out, "    error: {error}");
    }
    for chunk in outcome
        .chunks
        .iter()
        .filter(|c| c.outcome != ChunkOutcome::Completed)
    {
        let _ = writeln!(
            out,
            "    {}: {}",
            chunk.label,
            chunk.error.as_deref().unwrap_or("did not complete")
        );
    }
}

#[must_use]
pub fn render_summary(summary: &BatchSummary) -> String {
    let mut out = format!(
        "Batch finished: {} processed, {} failed\n",
        summary.processed(),
        summary.failed()
    );
    for outcome in &summary.jobs {
        render_outcome(&mut out, outcome);
    }
    out
}

/// Free-space preflight on the staging volume
fn preflight(config: &Config) -> Result<(), OrthoError> {
    check_free_space(config.space_check_path(), config.min_free_gb).map(drop)
}

fn ask(yes: bool, prompt: &str) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    let stdin = io::stdin();
    confirm(prompt, &mut stdin.lock(), &mut io::stdout()).context("Failed to read confirmation")
}

/// Execute the run command
pub fn execute_run_command(config: &Config, verbose: bool, yes: bool, force: bool) -> Result<ExitCode> {
    let orchestrator = JobOrchestrator::new(build_engine(config)?, config, None)?.with_force(force);

    let plan = orchestrator
        .plan(&config.input_folder)
        .map_err(OrthoError::from)?;
    println!("Configuration:\n{}", render_config(config));
    print!("{}", render_plan(&plan));
    if plan.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }
    if !ask(yes, "Process these jobs?")? {
        println!("Aborted.");
        return Ok(ExitCode::ABORTED);
    }

    preflight(config)?;
    let log_file = start_logging(config, verbose)?;
    let mut orchestrator = orchestrator.with_log_file(log_file);
    let summary = orchestrator.run(&config.input_folder)?;

    print!("{}", render_summary(&summary));
    Ok(if summary.all_processed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::JOBS_FAILED
    })
}

/// Execute the plan command. Planning never talks to the engine.
pub fn execute_plan_command(config: &Config) -> Result<ExitCode> {
    let gateway = FileSystemGateway::new(
        ChannelRules::from_config(&config.channels),
        config.channel_mode,
    );
    let plan = plan_jobs(&gateway, &config.input_folder).map_err(OrthoError::from)?;
    print!("{}", render_plan(&plan));
    Ok(ExitCode::SUCCESS)
}

/// Execute the merge command
pub fn execute_merge_command(
    config: &Config,
    job_dir: &Path,
    verbose: bool,
    yes: bool,
    force: bool,
) -> Result<ExitCode> {
    let orchestrator = JobOrchestrator::new(build_engine(config)?, config, None)?.with_force(force);
    println!("Configuration:\n{}", render_config(config));
    println!("Merge all chunks of {}", job_dir.display());
    if !ask(yes, "Merge this project?")? {
        println!("Aborted.");
        return Ok(ExitCode::ABORTED);
    }

    preflight(config)?;
    let log_file = start_logging(config, verbose)?;
    let mut orchestrator = orchestrator.with_log_file(log_file);
    let outcome = orchestrator.merge_project(job_dir)?;

    let mut out = String::new();
    render_outcome(&mut out, &outcome);
    print!("{out}");
    Ok(merge_exit_code(&outcome))
}

/// A merge succeeds only when the merged chunk itself completed
fn merge_exit_code(outcome: &JobOutcome) -> ExitCode {
    let merged_completed = !outcome.chunks.is_empty()
        && outcome.count(ChunkOutcome::Completed) == outcome.chunks.len();
    if outcome.job.state == JobState::Processed && merged_completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::JOBS_FAILED
    }
}

/// Execute the validate command
pub fn execute_validate_command(config: &Config) -> Result<ExitCode> {
    println!("Configuration is valid");
    if let Some(path) = &config.config_path {
        println!("Loaded from {}", path.display());
    }
    print!("{}", render_config(config));
    Ok(ExitCode::SUCCESS)
}

/// Execute the generate-config command
pub fn execute_generate_config_command(output: &Path, force: bool) -> Result<ExitCode> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists; use --force to overwrite it",
            output.display()
        );
    }
    fs::write(output, Config::template_yaml())
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Configuration written to {}", output.display());
    Ok(ExitCode::SUCCESS)
}
