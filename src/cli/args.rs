//! CLI argument definitions and parsing structures
//!
//! Global flags override the configuration file; see `orthobatch
//! generate-config` for the file format.

use clap::{ArgAction, Parser, Subcommand};
use orthobatch_config::{ChannelMode, CliArgs};
use std::path::PathBuf;

/// orthobatch - batch photogrammetry orchestration
#[derive(Parser, Debug)]
#[command(name = "orthobatch")]
#[command(about = "Drive photogrammetry job folders through a checkpointed reconstruction pipeline")]
#[command(long_about = r#"
orthobatch finds every "_unprocessed" folder under the input folder, reconstructs
each photo subfolder as a chunk (align, depth maps, model, point cloud, smoothing,
orthomosaic), exports the raster and report, and renames the folder to "_processed".

EXAMPLES:
  # Show what would be processed
  orthobatch plan

  # Process every job without the confirmation prompt
  orthobatch run --yes

  # Merge the chunks of an existing project and rebuild its products
  orthobatch merge /mnt/data/input/siteA_processed

  # Write a configuration template
  orthobatch generate-config --output orthobatch.yaml

CONFIGURATION:
  Configuration is loaded with precedence: CLI flags > config file > defaults
  The config file is orthobatch.yaml (or .yml) in the working directory
  Use --config to specify an explicit config file path
"#)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Folder whose `_unprocessed` subfolders are processed
    #[arg(long, global = true)]
    pub input_folder: Option<PathBuf>,

    /// GPUs to use: 0, 1 or both
    #[arg(long, global = true)]
    pub gpu_option: Option<String>,

    /// Let the engine use the CPU as well
    #[arg(long, global = true, action = ArgAction::Set)]
    pub cpu_enabled: Option<bool>,

    /// Directory that receives `log-files/`
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Staging root for work areas
    #[arg(long, global = true)]
    pub tmp_folder: Option<PathBuf>,

    /// single or multi
    #[arg(long, global = true)]
    pub channel_mode: Option<ChannelMode>,

    /// Seconds to wait after a save before clearing the project lock
    #[arg(long, global = true)]
    pub settle_secs: Option<u64>,

    /// Upper bound in seconds for one engine operation
    #[arg(long, global = true)]
    pub stage_timeout_secs: Option<u64>,

    /// Engine bridge executable
    #[arg(long, global = true)]
    pub engine: Option<String>,

    /// Minimum free space (GB) required before a run starts; 0 disables the check
    #[arg(long, global = true)]
    pub min_free_gb: Option<u64>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Overrides handed to configuration discovery
    #[must_use]
    pub fn config_args(&self) -> CliArgs {
        CliArgs {
            config_path: self.config.clone(),
            input_folder: self.input_folder.clone(),
            gpu_option: self.gpu_option.clone(),
            cpu_enabled: self.cpu_enabled,
            log_dir: self.log_dir.clone(),
            tmp_folder: self.tmp_folder.clone(),
            channel_mode: self.channel_mode,
            settle_secs: self.settle_secs,
            stage_timeout_secs: self.stage_timeout_secs,
            engine_program: self.engine.clone(),
            min_free_gb: self.min_free_gb,
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process every unprocessed job under the input folder
    ///
    /// Prints the configuration and the planned jobs, asks for confirmation
    /// and then processes the jobs one after another.
    ///
    /// EXAMPLES:
    ///   orthobatch run
    ///   orthobatch run --yes --gpu-option both
    Run {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        /// Override work-area locks held by live processes
        #[arg(long)]
        force: bool,
    },

    /// List the jobs and chunk groups a run would process
    Plan,

    /// Merge all chunks of an existing project into one and rebuild products
    ///
    /// The folder must contain `project.psx` and `project.files/`. It is not
    /// renamed afterwards.
    Merge {
        /// Job folder holding the project
        job_dir: PathBuf,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        /// Override work-area locks held by live processes
        #[arg(long)]
        force: bool,
    },

    /// Validate configuration and print the effective values
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "orthobatch.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl Commands {
    /// Name used in error reports
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Run { .. } => "run",
            Self::Plan => "plan",
            Self::Merge { .. } => "merge",
            Self::Validate => "validate",
            Self::GenerateConfig { .. } => "generate-config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_overrides_after_subcommand() {
        let cli = Cli::try_parse_from([
            "orthobatch",
            "run",
            "--yes",
            "--gpu-option",
            "both",
            "--cpu-enabled",
            "false",
            "--channel-mode",
            "multi",
        ])
        .unwrap();

        let args = cli.config_args();
        assert_eq!(args.gpu_option.as_deref(), Some("both"));
        assert_eq!(args.cpu_enabled, Some(false));
        assert_eq!(args.channel_mode, Some(ChannelMode::Multi));
        assert!(matches!(cli.command, Commands::Run { yes: true, force: false }));
    }

    #[test]
    fn test_merge_requires_job_dir() {
        assert!(Cli::try_parse_from(["orthobatch", "merge"]).is_err());
    }
}
