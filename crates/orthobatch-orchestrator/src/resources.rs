use orthobatch_config::GpuOption;
use orthobatch_engine_api::{DeviceConfig, Engine, EngineError};
use orthobatch_utils::error::ConfigError;
use tracing::info;

/// Turns the declarative device option into the engine's process-wide
/// device configuration and applies it once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceConfigurator {
    devices: DeviceConfig,
    applied: bool,
}

impl ResourceConfigurator {
    /// `option` is one of `"0"`, `"1"` or `"both"`
    pub fn configure(option: &str, cpu_enabled: bool) -> Result<Self, ConfigError> {
        let gpu: GpuOption = option.parse()?;
        Ok(Self {
            devices: DeviceConfig {
                gpu_mask: gpu.mask(),
                cpu_enabled,
            },
            applied: false,
        })
    }

    #[must_use]
    pub const fn devices(&self) -> DeviceConfig {
        self.devices
    }

    #[must_use]
    pub const fn is_applied(&self) -> bool {
        self.applied
    }

    /// Hand the configuration to `engine`. Later calls do nothing.
    pub fn apply<E: Engine>(&mut self, engine: &mut E) -> Result<(), EngineError> {
        if self.applied {
            return Ok(());
        }
        engine.apply_devices(&self.devices)?;
        self.applied = true;
        info!(
            gpu_mask = self.devices.gpu_mask,
            cpu_enabled = self.devices.cpu_enabled,
            "Compute devices configured"
        );
        Ok(())
    }
}
