use std::path::Path;

use crate::model::{Config, ConfigSource};

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

impl Config {
    /// Effective configuration as `(key, value, source)` rows in display order
    #[must_use]
    pub fn effective_config(&self) -> Vec<(String, String, String)> {
        let source = |key: &str| {
            self.source_attribution
                .get(key)
                .unwrap_or(&ConfigSource::Defaults)
                .to_string()
        };

        let mut rows = vec![
            ("input_folder", display_path(&self.input_folder)),
            ("gpu_option", self.gpu_option.clone()),
            ("cpu_enabled", self.cpu_enabled.to_string()),
            ("log_dir", display_path(&self.log_dir)),
            ("tmp_folder", display_path(&self.tmp_folder)),
            ("channel_mode", self.channel_mode.to_string()),
            (
                "channels",
                self.channels
                    .iter()
                    .map(|r| format!("{}={}", r.suffix, r.channel))
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            ("settle_secs", self.settle_secs.to_string()),
            ("min_free_gb", self.min_free_gb.to_string()),
        ];
        if let Some(timeout) = self.stage_timeout_secs {
            rows.push(("stage_timeout_secs", timeout.to_string()));
        }
        if let Some(path) = &self.free_space_path {
            rows.push(("free_space_path", display_path(path)));
        }
        if let Some(program) = &self.engine.program {
            rows.push(("engine.program", program.clone()));
        }

        rows.into_iter()
            .map(|(key, value)| (key.to_string(), value, source(key)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::cli_args::CliArgs;
    use crate::model::{Config, FileConfig};
    use std::path::PathBuf;

    #[test]
    fn test_effective_config_rows_carry_sources() {
        let cli = CliArgs {
            input_folder: Some(PathBuf::from("/in")),
            gpu_option: Some("0".to_string()),
            cpu_enabled: Some(false),
            log_dir: Some(PathBuf::from("/logs")),
            tmp_folder: Some(PathBuf::from("/tmp/ortho")),
            ..CliArgs::default()
        };
        let config = Config::resolve(FileConfig::default(), None, &cli).unwrap();
        let rows = config.effective_config();

        let gpu = rows.iter().find(|(k, _, _)| k == "gpu_option").unwrap();
        assert_eq!(gpu.1, "0");
        assert_eq!(gpu.2, "cli");

        let settle = rows.iter().find(|(k, _, _)| k == "settle_secs").unwrap();
        assert_eq!(settle.2, "default");
        assert!(!rows.iter().any(|(k, _, _)| k == "stage_timeout_secs"));
    }
}
