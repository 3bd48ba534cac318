use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use orthobatch_utils::error::ConfigError;

use crate::cli_args::CliArgs;
use crate::model::{
    Config, ConfigSource, DEFAULT_MIN_FREE_GB, DEFAULT_SETTLE_SECS, FileConfig, GpuOptionValue,
    default_channel_rules,
};

/// File names searched in the working directory, in order
pub const CONFIG_FILE_NAMES: &[&str] = &["orthobatch.yaml", "orthobatch.yml", "config.yaml"];

impl Config {
    /// Load configuration with precedence CLI > file > defaults, then validate.
    ///
    /// Uses the current directory for file discovery when no explicit path is
    /// given in `cli_args`.
    pub fn discover(cli_args: &CliArgs) -> Result<Self, ConfigError> {
        let start_dir = std::env::current_dir()
            .map_err(|e| ConfigError::InvalidFile(format!("cannot read current directory: {e}")))?;
        Self::discover_from(&start_dir, cli_args)
    }

    /// Path-driven variant of [`discover`](Self::discover) used by tests
    pub fn discover_from(start_dir: &Path, cli_args: &CliArgs) -> Result<Self, ConfigError> {
        let config_path = match &cli_args.config_path {
            Some(explicit) => Some(explicit.clone()),
            None => Self::discover_config_file_from(start_dir),
        };

        let file = match &config_path {
            Some(path) => Self::load_config_file(path)?,
            None => FileConfig::default(),
        };

        let config = Self::resolve(file, config_path, cli_args)?;
        config.validate()?;
        Ok(config)
    }

    /// First existing file from [`CONFIG_FILE_NAMES`] in `dir`
    #[must_use]
    pub fn discover_config_file_from(dir: &Path) -> Option<PathBuf> {
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    /// Parse a YAML configuration file without applying defaults
    pub fn load_config_file(path: &Path) -> Result<FileConfig, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ConfigError::NotFound {
                path: path.display().to_string(),
            },
            _ => ConfigError::InvalidFile(format!("{}: {e}", path.display())),
        })?;

        if content.trim().is_empty() {
            return Ok(FileConfig::default());
        }

        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::InvalidFile(format!("{}: {e}", path.display())))
    }

    /// Merge file values and CLI overrides over the defaults
    pub(crate) fn resolve(
        file: FileConfig,
        config_path: Option<PathBuf>,
        cli: &CliArgs,
    ) -> Result<Self, ConfigError> {
        let mut attribution = BTreeMap::new();
        let file_source = config_path
            .clone()
            .map(ConfigSource::ConfigFile)
            .unwrap_or(ConfigSource::Defaults);
        let mut sources = Sources {
            attribution: &mut attribution,
            file_source: &file_source,
        };

        let input_folder = sources.pick("input_folder", cli.input_folder.clone(), file.input_folder);
        let gpu_option = sources.pick(
            "gpu_option",
            cli.gpu_option.clone(),
            file.gpu_option.map(GpuOptionValue::into_string),
        );
        let cpu_enabled = sources.pick("cpu_enabled", cli.cpu_enabled, file.cpu_enabled);
        let log_dir = sources.pick("log_dir", cli.log_dir.clone(), file.log_dir);
        let tmp_folder = sources.pick("tmp_folder", cli.tmp_folder.clone(), file.tmp_folder);

        let mut missing = Vec::new();
        if input_folder.is_none() {
            missing.push("input_folder");
        }
        if gpu_option.is_none() {
            missing.push("gpu_option");
        }
        if cpu_enabled.is_none() {
            missing.push("cpu_enabled");
        }
        if log_dir.is_none() {
            missing.push("log_dir");
        }
        if tmp_folder.is_none() {
            missing.push("tmp_folder");
        }
        let (
            Some(input_folder),
            Some(gpu_option),
            Some(cpu_enabled),
            Some(log_dir),
            Some(tmp_folder),
        ) = (input_folder, gpu_option, cpu_enabled, log_dir, tmp_folder)
        else {
            return Err(ConfigError::MissingRequired(missing.join(", ")));
        };

        let channel_mode = sources
            .pick("channel_mode", cli.channel_mode, file.channel_mode)
            .unwrap_or_default();
        let channels = sources
            .pick("channels", None, file.channels)
            .unwrap_or_else(default_channel_rules);
        let settle_secs = sources
            .pick("settle_secs", cli.settle_secs, file.settle_secs)
            .unwrap_or(DEFAULT_SETTLE_SECS);
        let stage_timeout_secs = sources.pick(
            "stage_timeout_secs",
            cli.stage_timeout_secs,
            file.stage_timeout_secs,
        );
        let min_free_gb = sources
            .pick("min_free_gb", cli.min_free_gb, file.min_free_gb)
            .unwrap_or(DEFAULT_MIN_FREE_GB);
        let free_space_path = sources.pick("free_space_path", None, file.free_space_path);

        let mut engine = file.engine.unwrap_or_default();
        let program = sources.pick("engine.program", cli.engine_program.clone(), engine.program);
        engine.program = program;

        Ok(Self {
            input_folder,
            gpu_option,
            cpu_enabled,
            log_dir,
            tmp_folder,
            channel_mode,
            channels,
            settle_secs,
            stage_timeout_secs,
            engine,
            min_free_gb,
            free_space_path,
            config_path,
            source_attribution: attribution,
        })
    }
}

/// Records which layer supplied each resolved key
struct Sources<'a> {
    attribution: &'a mut BTreeMap<String, ConfigSource>,
    file_source: &'a ConfigSource,
}

impl Sources<'_> {
    fn pick<T>(&mut self, key: &str, cli_value: Option<T>, file_value: Option<T>) -> Option<T> {
        let (value, source) = match (cli_value, file_value) {
            (Some(v), _) => (Some(v), ConfigSource::Cli),
            (None, Some(v)) => (Some(v), self.file_source.clone()),
            (None, None) => (None, ConfigSource::Defaults),
        };
        self.attribution.insert(key.to_string(), source);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChannelMode;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
input_folder: /data/in
gpu_option: "0"
cpu_enabled: true
log_dir: /data/logs
tmp_folder: /data/tmp
"#;

    fn write_config(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_minimal_file_gets_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(dir.path(), "orthobatch.yaml", MINIMAL);

        let config = Config::discover_from(dir.path(), &CliArgs::default()).unwrap();
        assert_eq!(config.config_path.as_deref(), Some(path.as_path()));
        assert_eq!(config.input_folder, PathBuf::from("/data/in"));
        assert_eq!(config.gpu_option, "0");
        assert!(config.cpu_enabled);
        assert_eq!(config.channel_mode, ChannelMode::Single);
        assert_eq!(config.settle_secs, DEFAULT_SETTLE_SECS);
        assert_eq!(config.min_free_gb, DEFAULT_MIN_FREE_GB);
        assert_eq!(config.channels, default_channel_rules());
        assert_eq!(config.space_check_path(), Path::new("/data/tmp"));
        assert_eq!(
            config.source_attribution.get("settle_secs"),
            Some(&ConfigSource::Defaults)
        );
        assert!(matches!(
            config.source_attribution.get("input_folder"),
            Some(ConfigSource::ConfigFile(_))
        ));
    }

    #[test]
    fn test_cli_overrides_file() {
        let dir = TempDir::new().unwrap();
        write_config(dir.path(), "config.yaml", MINIMAL);

        let cli = CliArgs {
            gpu_option: Some("both".to_string()),
            cpu_enabled: Some(false),
            channel_mode: Some(ChannelMode::Multi),
            settle_secs: Some(0),
            ..CliArgs::default()
        };
        let config = Config::discover_from(dir.path(), &cli).unwrap();
        assert_eq!(config.gpu_option, "both");
        assert!(!config.cpu_enabled);
        assert_eq!(config.channel_mode, ChannelMode::Multi);
        assert_eq!(config.settle_secs, 0);
        assert_eq!(
            config.source_attribution.get("gpu_option"),
            Some(&ConfigSource::Cli)
        );
    }

    #[test]
    fn test_missing_required_keys_listed() {
        let dir = TempDir::new().unwrap();
        write_config(dir.path(), "orthobatch.yaml", "input_folder: /data/in\n");

        let err = Config::discover_from(dir.path(), &CliArgs::default()).unwrap_err();
        match err {
            ConfigError::MissingRequired(keys) => {
                assert!(keys.contains("gpu_option"));
                assert!(keys.contains("tmp_folder"));
                assert!(!keys.contains("input_folder"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_explicit_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let cli = CliArgs {
            config_path: Some(dir.path().join("absent.yaml")),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::discover_from(dir.path(), &cli).unwrap_err(),
            ConfigError::NotFound { .. }
        ));
    }

    #[test]
    fn test_invalid_yaml_reported() {
        let dir = TempDir::new().unwrap();
        write_config(dir.path(), "orthobatch.yaml", "input_folder: [unclosed\n");
        assert!(matches!(
            Config::discover_from(dir.path(), &CliArgs::default()).unwrap_err(),
            ConfigError::InvalidFile(_)
        ));
    }

    #[test]
    fn test_cli_only_configuration() {
        let dir = TempDir::new().unwrap();
        let cli = CliArgs {
            input_folder: Some(PathBuf::from("/in")),
            gpu_option: Some("1".to_string()),
            cpu_enabled: Some(false),
            log_dir: Some(PathBuf::from("/logs")),
            tmp_folder: Some(PathBuf::from("/tmp/ortho")),
            engine_program: Some("bridge".to_string()),
            ..CliArgs::default()
        };
        let config = Config::discover_from(dir.path(), &cli).unwrap();
        assert!(config.config_path.is_none());
        assert_eq!(config.engine.program.as_deref(), Some("bridge"));
    }

    #[test]
    fn test_discovery_order() {
        let dir = TempDir::new().unwrap();
        write_config(dir.path(), "config.yaml", MINIMAL);
        let preferred = write_config(dir.path(), "orthobatch.yml", MINIMAL);
        assert_eq!(Config::discover_config_file_from(dir.path()), Some(preferred));
    }
}
