//! Composition device interface
//!
//! A [`ComposerDevice`] is the hardware side of the backend: it reports the
//! displays and their configurations, takes power and vsync control calls,
//! and composes one [`CompositionRequest`] per display in a single `submit`.
//!
//! Opening a device (module lookup, HAL open) happens outside the backend;
//! the backend receives an already-open device.

pub mod headless;
#[cfg(feature = "hwcomposer2")]
pub mod hwc2;

use serde::{Deserialize, Serialize};

use crate::buffer::BufferHandle;
use crate::dispatch::EventSink;
use crate::error::DeviceError;
use crate::fence::Fence;
use crate::layer::{BlendMode, Transform};
use crate::output::OutputId;

/// `HARDWARE_DEVICE_API_VERSION` values, header version masked off.
pub const HWC_DEVICE_API_VERSION_1_0: u32 = 0x0100_0000;
pub const HWC_DEVICE_API_VERSION_1_3: u32 = 0x0103_0000;
pub const HWC_DEVICE_API_VERSION_1_4: u32 = 0x0104_0000;
pub const HWC_DEVICE_API_VERSION_2_0: u32 = 0x0200_0000;

/// Hardware display configuration ID
pub type ConfigId = u32;

/// Attributes of one display configuration.
///
/// DPI values are in dots per thousand inches, as the HAL reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayAttributes {
    pub width: u32,
    pub height: u32,
    pub vsync_period_ns: u64,
    pub dpi_x: u32,
    pub dpi_y: u32,
    #[serde(default)]
    pub secure: bool,
}

impl DisplayAttributes {
    /// Refresh rate in Hz, rounded to nearest
    pub fn refresh_hz(&self) -> u32 {
        if self.vsync_period_ns == 0 {
            return 0;
        }
        ((1_000_000_000 + self.vsync_period_ns / 2) / self.vsync_period_ns) as u32
    }

    /// Physical size in millimetres derived from DPI and resolution
    pub fn physical_size_mm(&self) -> (u32, u32) {
        // Approximate for typical phone (assume ~400 DPI) when unreported
        let dpi = |v: u32| if v > 0 { v as f32 / 1000.0 } else { 400.0 };
        (
            (self.width as f32 * 25.4 / dpi(self.dpi_x)) as u32,
            (self.height as f32 * 25.4 / dpi(self.dpi_y)) as u32,
        )
    }
}

/// How the device tells us a submitted frame is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionMode {
    /// `submit` hands back a retire fence per display and release fences per layer
    RetireFence,
    /// Completion is only observable through vsync callbacks
    VsyncCallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub api_version: u32,
    pub completion: CompletionMode,
}

/// HAL power modes
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwPowerMode {
    Off = 0,
    Doze = 1,
    Normal = 2,
    DozeSuspend = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionType {
    /// Empty slot, nothing is scanned out
    Disabled,
    /// Buffer scanned out directly
    Overlay,
    /// Holds the software-composited image
    FramebufferTarget,
}

/// Destination rectangle in output coordinates, edges inclusive-exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayFrame {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// Source crop in buffer coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SourceCrop {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

/// One hardware layer slot of a [`CompositionRequest`].
#[derive(Debug)]
pub struct RequestLayer {
    pub composition: CompositionType,
    pub handle: Option<BufferHandle>,
    pub source_crop: SourceCrop,
    pub display_frame: DisplayFrame,
    pub blend: BlendMode,
    pub transform: Transform,
    pub plane_alpha: u8,
    /// Signaled when the buffer contents are ready; consumed by the device
    pub acquire_fence: Fence,
    /// Filled in by the device: signaled when it stops reading the buffer
    pub release_fence: Fence,
}

impl RequestLayer {
    pub fn disabled() -> Self {
        Self {
            composition: CompositionType::Disabled,
            handle: None,
            source_crop: SourceCrop::default(),
            display_frame: DisplayFrame::default(),
            blend: BlendMode::None,
            transform: Transform::Normal,
            plane_alpha: 0xff,
            acquire_fence: Fence::none(),
            release_fence: Fence::none(),
        }
    }
}

/// Everything one display composes in one frame.
///
/// `layers.len()` always equals the device's layer count for the display.
#[derive(Debug)]
pub struct CompositionRequest {
    pub output: OutputId,
    pub layers: Vec<RequestLayer>,
    pub geometry_changed: bool,
    /// Filled in by the device: signaled when this frame is replaced on screen
    pub retire_fence: Fence,
}

/// The hardware composer.
///
/// Display indices are dense from zero. Events (vsync, hotplug, refresh) may
/// be delivered through the registered [`EventSink`] from any thread.
pub trait ComposerDevice: Send {
    fn info(&self) -> DeviceInfo;

    fn display_count(&self) -> usize;

    /// Hardware layers per display, the framebuffer target included
    fn max_layers(&self, display: usize) -> usize;

    fn display_configs(&mut self, display: usize) -> Result<Vec<ConfigId>, DeviceError>;

    fn display_attributes(
        &mut self,
        display: usize,
        config: ConfigId,
    ) -> Result<DisplayAttributes, DeviceError>;

    fn active_config(&mut self, display: usize) -> Result<ConfigId, DeviceError>;

    /// Only meaningful on API 1.4 and later
    fn set_active_config(&mut self, display: usize, config: ConfigId) -> Result<(), DeviceError>;

    /// Only meaningful on API 1.4 and later
    fn set_power_mode(&mut self, display: usize, mode: HwPowerMode) -> Result<(), DeviceError>;

    /// Legacy on/off control
    fn blank(&mut self, display: usize, blank: bool) -> Result<(), DeviceError>;

    fn set_vsync_enabled(&mut self, display: usize, enabled: bool) -> Result<(), DeviceError>;

    fn register_events(&mut self, sink: EventSink);

    /// Compose every `Some` entry, indexed by display.
    ///
    /// The device takes the acquire fences it consumes and fills in release
    /// and retire fences according to its [`CompletionMode`].
    fn submit(&mut self, displays: &mut [Option<CompositionRequest>]) -> Result<(), DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_and_physical_size() {
        let attrs = DisplayAttributes {
            width: 1080,
            height: 2340,
            vsync_period_ns: 16_666_667,
            dpi_x: 403_000,
            dpi_y: 403_000,
            secure: false,
        };
        assert_eq!(attrs.refresh_hz(), 60);
        assert_eq!(attrs.physical_size_mm(), (68, 147));
    }

    #[test]
    fn test_missing_dpi_falls_back() {
        let attrs = DisplayAttributes {
            width: 400,
            height: 800,
            vsync_period_ns: 0,
            dpi_x: 0,
            dpi_y: 0,
            secure: false,
        };
        assert_eq!(attrs.refresh_hz(), 0);
        assert_eq!(attrs.physical_size_mm(), (25, 50));
    }
}
