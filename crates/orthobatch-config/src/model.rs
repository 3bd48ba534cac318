use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use orthobatch_utils::error::ConfigError;

/// Seconds to wait after a save before deleting the lock artifact again
pub const DEFAULT_SETTLE_SECS: u64 = 5;

/// Free space required on the staging volume before a run starts
pub const DEFAULT_MIN_FREE_GB: u64 = 100;

/// Where a configuration value came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Value provided via CLI argument (highest precedence).
    Cli,
    /// Value loaded from the configuration file.
    ConfigFile(PathBuf),
    /// Built-in default value (lowest precedence).
    Defaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => write!(f, "cli"),
            Self::ConfigFile(_) => write!(f, "config"),
            Self::Defaults => write!(f, "default"),
        }
    }
}

/// GPU selection accepted by `gpu_option`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuOption {
    First,
    Second,
    Both,
}

impl GpuOption {
    /// Engine bitmask: bit N enables GPU N
    #[must_use]
    pub const fn mask(self) -> u32 {
        match self {
            Self::First => 0b01,
            Self::Second => 0b10,
            Self::Both => 0b11,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::First => "0",
            Self::Second => "1",
            Self::Both => "both",
        }
    }
}

impl FromStr for GpuOption {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0" => Ok(Self::First),
            "1" => Ok(Self::Second),
            "both" => Ok(Self::Both),
            other => Err(ConfigError::InvalidValue {
                key: "gpu_option".to_string(),
                value: format!("'{other}' is not valid. Must be \"0\", \"1\" or \"both\""),
            }),
        }
    }
}

impl fmt::Display for GpuOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How images of one photo subfolder are split into chunk groups
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    /// Only the RGB bucket is reconstructed, named after the subfolder
    #[default]
    Single,
    /// Every non-empty bucket is reconstructed as `{subfolder}_{channel}`
    Multi,
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Multi => write!(f, "multi"),
        }
    }
}

impl FromStr for ChannelMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "multi" => Ok(Self::Multi),
            other => Err(ConfigError::InvalidValue {
                key: "channel_mode".to_string(),
                value: format!("'{other}' is not valid. Must be 'single' or 'multi'"),
            }),
        }
    }
}

/// One ordered filename suffix rule. The first matching rule wins.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChannelRuleConfig {
    pub suffix: String,
    pub channel: String,
}

impl ChannelRuleConfig {
    pub fn new(suffix: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            channel: channel.into(),
        }
    }
}

/// Built-in rules for RGB plus the four multispectral bands
#[must_use]
pub fn default_channel_rules() -> Vec<ChannelRuleConfig> {
    vec![
        ChannelRuleConfig::new(".jpg", "RGB"),
        ChannelRuleConfig::new(".JPG", "RGB"),
        ChannelRuleConfig::new("MS_NIR.TIF", "NIR"),
        ChannelRuleConfig::new("MS_RE.TIF", "RE"),
        ChannelRuleConfig::new("MS_R.TIF", "R"),
        ChannelRuleConfig::new("MS_G.TIF", "G"),
    ]
}

/// External engine executable driven by the command adapter
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineConfig {
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// `gpu_option` as written in YAML. Unquoted `0`/`1` parse as integers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum GpuOptionValue {
    Text(String),
    Number(u64),
}

impl GpuOptionValue {
    #[must_use]
    pub fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

/// Configuration file contents before defaults are applied
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub input_folder: Option<PathBuf>,
    pub gpu_option: Option<GpuOptionValue>,
    pub cpu_enabled: Option<bool>,
    pub log_dir: Option<PathBuf>,
    pub tmp_folder: Option<PathBuf>,
    pub channel_mode: Option<ChannelMode>,
    pub channels: Option<Vec<ChannelRuleConfig>>,
    pub settle_secs: Option<u64>,
    pub stage_timeout_secs: Option<u64>,
    pub engine: Option<EngineConfig>,
    pub min_free_gb: Option<u64>,
    pub free_space_path: Option<PathBuf>,
}

/// Effective configuration after CLI > file > defaults resolution
#[derive(Debug, Clone)]
pub struct Config {
    pub input_folder: PathBuf,
    /// Kept as written; parsed into a [`GpuOption`] when devices are configured
    pub gpu_option: String,
    pub cpu_enabled: bool,
    pub log_dir: PathBuf,
    pub tmp_folder: PathBuf,
    pub channel_mode: ChannelMode,
    pub channels: Vec<ChannelRuleConfig>,
    pub settle_secs: u64,
    pub stage_timeout_secs: Option<u64>,
    pub engine: EngineConfig,
    pub min_free_gb: u64,
    pub free_space_path: Option<PathBuf>,
    /// Path of the file the configuration was loaded from, if any
    pub config_path: Option<PathBuf>,
    pub source_attribution: BTreeMap<String, ConfigSource>,
}

impl Config {
    /// Volume checked by the free-space preflight
    #[must_use]
    pub fn space_check_path(&self) -> &std::path::Path {
        self.free_space_path.as_deref().unwrap_or(&self.tmp_folder)
    }

    /// Parsed GPU selection
    pub fn gpu(&self) -> Result<GpuOption, ConfigError> {
        self.gpu_option.parse()
    }

    /// Annotated YAML template written by `generate-config`
    #[must_use]
    pub const fn template_yaml() -> &'static str {
        r#"# orthobatch configuration

# Folder whose "_unprocessed" subfolders are processed
input_folder: /mnt/data/input

# GPUs used by the engine: "0", "1" or "both"
gpu_option: "both"

# Let the engine use the CPU alongside the GPUs
cpu_enabled: false

# Per-run logs are written to <log_dir>/log-files/
log_dir: /mnt/data/logs

# Work areas are staged here, one subfolder per job
tmp_folder: /mnt/data/tmp

# "single": one RGB chunk per photo subfolder
# "multi": one chunk per channel, named <subfolder>_<channel>
channel_mode: single

# Ordered filename suffix rules, first match wins (case-sensitive)
channels:
  - { suffix: ".jpg", channel: RGB }
  - { suffix: ".JPG", channel: RGB }
  - { suffix: "MS_NIR.TIF", channel: NIR }
  - { suffix: "MS_RE.TIF", channel: RE }
  - { suffix: "MS_R.TIF", channel: R }
  - { suffix: "MS_G.TIF", channel: G }

# Seconds to wait after each save before clearing the project lock
settle_secs: 5

# Optional upper bound for a single engine operation
# stage_timeout_secs: 86400

# Engine bridge executable, called as: <program> <args...> <operation> ...
engine:
  program: orthobatch-engine
  args: []

# Refuse to start with less free space (GB) on free_space_path (default tmp_folder)
min_free_gb: 100
# free_space_path: /mnt/data
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_option_masks() {
        assert_eq!("0".parse::<GpuOption>().unwrap().mask(), 0b01);
        assert_eq!("1".parse::<GpuOption>().unwrap().mask(), 0b10);
        assert_eq!("both".parse::<GpuOption>().unwrap().mask(), 0b11);
    }

    #[test]
    fn test_gpu_option_rejects_unknown() {
        for bad in ["2", "all", "BOTH", ""] {
            let err = bad.parse::<GpuOption>().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "gpu_option"));
        }
    }

    #[test]
    fn test_gpu_option_value_accepts_integers() {
        let file: FileConfig = serde_yaml::from_str("gpu_option: 1\n").unwrap();
        assert_eq!(file.gpu_option.unwrap().into_string(), "1");

        let file: FileConfig = serde_yaml::from_str("gpu_option: \"both\"\n").unwrap();
        assert_eq!(file.gpu_option.unwrap().into_string(), "both");
    }

    #[test]
    fn test_default_channel_rules_order() {
        let rules = default_channel_rules();
        let suffixes: Vec<&str> = rules.iter().map(|r| r.suffix.as_str()).collect();
        assert_eq!(
            suffixes,
            vec![".jpg", ".JPG", "MS_NIR.TIF", "MS_RE.TIF", "MS_R.TIF", "MS_G.TIF"]
        );
    }

    #[test]
    fn test_template_parses() {
        let file: FileConfig = serde_yaml::from_str(Config::template_yaml()).unwrap();
        assert_eq!(file.channel_mode, Some(ChannelMode::Single));
        assert_eq!(file.channels.unwrap(), default_channel_rules());
        assert_eq!(file.settle_secs, Some(DEFAULT_SETTLE_SECS));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result: Result<FileConfig, _> = serde_yaml::from_str("gpu_opton: \"0\"\n");
        assert!(result.is_err());
    }
}
