use std::path::PathBuf;

use crate::model::ChannelMode;

/// Command-line overrides. `None` leaves the file or default value in place.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config_path: Option<PathBuf>,
    pub input_folder: Option<PathBuf>,
    pub gpu_option: Option<String>,
    pub cpu_enabled: Option<bool>,
    pub log_dir: Option<PathBuf>,
    pub tmp_folder: Option<PathBuf>,
    pub channel_mode: Option<ChannelMode>,
    pub settle_secs: Option<u64>,
    pub stage_timeout_secs: Option<u64>,
    pub engine_program: Option<String>,
    pub min_free_gb: Option<u64>,
}
