//! Display power (DPMS) and mode control
//!
//! What the hardware can express depends on its API version, so the strategy
//! is picked once when the backend starts: 1.4+ devices get the unified power
//! mode call and active-config switching, older ones only blank/unblank and
//! run whatever configuration they booted with.

use std::fmt;

use tracing::{info, warn};

use crate::device::{
    CompletionMode, ComposerDevice, DeviceInfo, HwPowerMode, HWC_DEVICE_API_VERSION_1_4,
};
use crate::error::DeviceError;
use crate::output::Output;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PowerState {
    On,
    Standby,
    Suspend,
    #[default]
    Off,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerState::On => "on",
            PowerState::Standby => "standby",
            PowerState::Suspend => "suspend",
            PowerState::Off => "off",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PowerControl {
    /// `set_power_mode`, API 1.4+
    Unified,
    /// `blank` only: standby and suspend light the panel like `On`
    Blank,
}

impl PowerControl {
    fn apply(
        self,
        device: &mut dyn ComposerDevice,
        display: usize,
        state: PowerState,
    ) -> std::result::Result<(), DeviceError> {
        match self {
            PowerControl::Unified => {
                let mode = match state {
                    PowerState::On => HwPowerMode::Normal,
                    PowerState::Standby => HwPowerMode::Doze,
                    PowerState::Suspend => HwPowerMode::DozeSuspend,
                    PowerState::Off => HwPowerMode::Off,
                };
                device.set_power_mode(display, mode)
            }
            PowerControl::Blank => device.blank(display, state == PowerState::Off),
        }
    }

    /// Issue the power call and record the new state only if it succeeded.
    ///
    /// Leaving `Off` turns vsync delivery back on; entering it turns vsync off
    /// and drops vblank waits that can no longer be satisfied.
    pub(crate) fn transition(
        self,
        device: &mut dyn ComposerDevice,
        output: &mut Output,
        state: PowerState,
        manage_vsync: bool,
    ) -> Result<()> {
        let display = output.id().index();
        let previous = output.power;

        if let Err(e) = self.apply(device, display, state) {
            warn!(
                output = ?output.id(),
                %previous,
                requested = %state,
                "power change failed: {}", e
            );
            return Err(e.into());
        }
        output.power = state;
        info!(output = ?output.id(), %previous, %state, "power state changed");

        if state == PowerState::Off {
            if !output.vblank_waits.is_empty() {
                warn!(
                    output = ?output.id(),
                    dropped = output.vblank_waits.len(),
                    "output powered down with vblank waits pending"
                );
                output.vblank_waits.clear();
            }
            if manage_vsync && previous != PowerState::Off {
                if let Err(e) = device.set_vsync_enabled(display, false) {
                    warn!(output = ?output.id(), "failed to turn vsync off: {}", e);
                }
            }
        } else if manage_vsync && previous == PowerState::Off {
            if let Err(e) = device.set_vsync_enabled(display, true) {
                warn!(output = ?output.id(), "failed to turn vsync on: {}", e);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ModeControl {
    /// `set_active_config`, API 1.4+
    ActiveConfig,
    /// Only the configuration active at startup can be "selected"
    FixedConfig,
}

impl ModeControl {
    pub(crate) fn set_mode(
        self,
        device: &mut dyn ComposerDevice,
        output: &mut Output,
        mode_index: usize,
    ) -> Result<()> {
        let Some(mode) = output.modes().get(mode_index) else {
            return Err(Error::invalid(format!(
                "mode {} out of range, output {:?} has {}",
                mode_index,
                output.id(),
                output.modes().len()
            )));
        };
        let display = output.id().index();
        let config = mode.config;
        let name = mode.name.clone();

        match self {
            ModeControl::ActiveConfig => device.set_active_config(display, config)?,
            ModeControl::FixedConfig => {
                let active = device.active_config(display)?;
                if active != config {
                    return Err(Error::failed(format!(
                        "device cannot switch configurations (active {}, requested {})",
                        active, config
                    )));
                }
            }
        }

        output.current_mode = Some(mode_index);
        info!(output = ?output.id(), mode = %name, "mode set");
        Ok(())
    }
}

/// Hardware capability descriptor, resolved once per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Capabilities {
    pub(crate) api_version: u32,
    pub(crate) power: PowerControl,
    pub(crate) mode: ModeControl,
    pub(crate) completion: CompletionMode,
}

impl Capabilities {
    pub(crate) fn resolve(info: &DeviceInfo) -> Self {
        let version = info.api_version & 0xffff_0000;
        let modern = version >= HWC_DEVICE_API_VERSION_1_4;
        Self {
            api_version: version,
            power: if modern {
                PowerControl::Unified
            } else {
                PowerControl::Blank
            },
            mode: if modern {
                ModeControl::ActiveConfig
            } else {
                ModeControl::FixedConfig
            },
            completion: info.completion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HWC_DEVICE_API_VERSION_1_3, HWC_DEVICE_API_VERSION_2_0};

    fn info(api_version: u32) -> DeviceInfo {
        DeviceInfo {
            name: "test".into(),
            api_version,
            completion: CompletionMode::RetireFence,
        }
    }

    #[test]
    fn test_capabilities_by_version() {
        let old = Capabilities::resolve(&info(HWC_DEVICE_API_VERSION_1_3 | 1));
        assert_eq!(old.power, PowerControl::Blank);
        assert_eq!(old.mode, ModeControl::FixedConfig);

        let new = Capabilities::resolve(&info(HWC_DEVICE_API_VERSION_1_4 | 1));
        assert_eq!(new.power, PowerControl::Unified);
        assert_eq!(new.api_version, HWC_DEVICE_API_VERSION_1_4);

        let hwc2 = Capabilities::resolve(&info(HWC_DEVICE_API_VERSION_2_0));
        assert_eq!(hwc2.mode, ModeControl::ActiveConfig);
    }

    #[test]
    fn test_power_state_names() {
        assert_eq!(PowerState::default(), PowerState::Off);
        assert_eq!(PowerState::Standby.to_string(), "standby");
    }
}
