use std::collections::HashSet;

use orthobatch_utils::error::ConfigError;

use crate::model::{Config, GpuOption};

/// Longest accepted settling delay
const MAX_SETTLE_SECS: u64 = 600;

impl Config {
    /// Validate configuration values, reporting every problem at once.
    ///
    /// Returns the single error unchanged when only one check fails and
    /// [`ConfigError::ValidationFailed`] otherwise.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<ConfigError> = Vec::new();

        if let Err(e) = self.gpu_option.parse::<GpuOption>() {
            errors.push(e);
        }

        for (key, path) in [
            ("input_folder", &self.input_folder),
            ("log_dir", &self.log_dir),
            ("tmp_folder", &self.tmp_folder),
        ] {
            if path.as_os_str().is_empty() {
                errors.push(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: "must not be empty".to_string(),
                });
            }
        }

        // Staged work areas keep the job name, so they would be rediscovered as jobs.
        if !self.tmp_folder.as_os_str().is_empty() && self.tmp_folder == self.input_folder {
            errors.push(ConfigError::InvalidValue {
                key: "tmp_folder".to_string(),
                value: "must differ from input_folder".to_string(),
            });
        }

        if self.settle_secs > MAX_SETTLE_SECS {
            errors.push(ConfigError::InvalidValue {
                key: "settle_secs".to_string(),
                value: format!("exceeds maximum limit of {MAX_SETTLE_SECS} seconds"),
            });
        }

        if self.stage_timeout_secs == Some(0) {
            errors.push(ConfigError::InvalidValue {
                key: "stage_timeout_secs".to_string(),
                value: "must be greater than 0".to_string(),
            });
        }

        if self.channels.is_empty() {
            errors.push(ConfigError::InvalidValue {
                key: "channels".to_string(),
                value: "at least one rule is required".to_string(),
            });
        }
        let mut seen = HashSet::new();
        for rule in &self.channels {
            if rule.suffix.is_empty() || rule.channel.trim().is_empty() {
                errors.push(ConfigError::InvalidValue {
                    key: "channels".to_string(),
                    value: format!(
                        "rule '{}' -> '{}' needs a non-empty suffix and channel",
                        rule.suffix, rule.channel
                    ),
                });
            } else if !seen.insert(rule.suffix.as_str()) {
                errors.push(ConfigError::InvalidValue {
                    key: "channels".to_string(),
                    value: format!("suffix '{}' is listed twice", rule.suffix),
                });
            }
        }

        if let Some(program) = &self.engine.program
            && program.trim().is_empty()
        {
            errors.push(ConfigError::InvalidValue {
                key: "engine.program".to_string(),
                value: "must not be empty".to_string(),
            });
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            error_count => Err(ConfigError::ValidationFailed {
                errors: errors.iter().map(ToString::to_string).collect(),
                error_count,
            }),
        }
    }
}
