//! hwcomposer2 device via libhybris
//!
//! Only the primary display is driven; the compatibility layer exposes one
//! configuration per display (the active one). Buffer handles passed in a
//! [`CompositionRequest`] must be `ANativeWindowBuffer` pointers.

use std::os::raw::c_int;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info, warn};

use super::{
    CompletionMode, ComposerDevice, CompositionRequest, CompositionType, ConfigId, DeviceInfo,
    DisplayAttributes, HwPowerMode, HWC_DEVICE_API_VERSION_2_0,
};
use crate::buffer::BufferHandle;
use crate::dispatch::{EventSink, HwEvent};
use crate::error::DeviceError;
use crate::ffi::*;
use crate::fence::Fence;
use crate::layer::BlendMode;
use crate::{Error, Result};

type HalResult<T> = std::result::Result<T, DeviceError>;

/// The HAL can be opened once per process.
static DEVICE_OPEN: AtomicBool = AtomicBool::new(false);

/// `HWC2EventListener` followed by our state; the HAL hands the listener
/// pointer back in every callback.
#[repr(C)]
struct Listener {
    base: HWC2EventListener,
    sink: Mutex<Option<EventSink>>,
}

impl Listener {
    /// # Safety
    /// `listener` must be the `base` of a live `Listener`.
    unsafe fn send(listener: *mut HWC2EventListener, event: HwEvent) {
        let this = &*(listener as *const Listener);
        let sink = this.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sink) = sink.as_ref() {
            sink.send(event);
        }
    }
}

extern "C" fn on_vsync(
    listener: *mut HWC2EventListener,
    _sequence_id: i32,
    display: Hwc2DisplayT,
    timestamp: i64,
) {
    unsafe {
        Listener::send(
            listener,
            HwEvent::Vsync {
                display: display as usize,
                timestamp_ns: timestamp.max(0) as u64,
            },
        )
    };
}

extern "C" fn on_hotplug(
    listener: *mut HWC2EventListener,
    _sequence_id: i32,
    display: Hwc2DisplayT,
    connected: bool,
    _primary_display: bool,
) {
    unsafe {
        Listener::send(
            listener,
            HwEvent::Hotplug {
                display: display as usize,
                connected,
            },
        )
    };
}

extern "C" fn on_refresh(
    listener: *mut HWC2EventListener,
    _sequence_id: i32,
    display: Hwc2DisplayT,
) {
    unsafe {
        Listener::send(
            listener,
            HwEvent::Refresh {
                display: display as usize,
            },
        )
    };
}

struct Display {
    raw: *mut Hwc2CompatDisplay,
    config: HWC2DisplayConfig,
    /// One HAL layer per overlay slot, created while the slot is in use
    overlays: Vec<*mut Hwc2CompatLayer>,
}

pub struct Hwc2Device {
    device: *mut Hwc2CompatDevice,
    displays: Vec<Display>,
    max_layers: usize,
    listener: Box<Listener>,
}

// The HAL handles are only used from the thread that owns the backend
unsafe impl Send for Hwc2Device {}

fn check(op: &'static str, code: Hwc2ErrorT) -> HalResult<()> {
    DeviceError::check(op, code)
}

fn blend_mode(blend: BlendMode) -> c_int {
    match blend {
        BlendMode::None => HWC2_BLEND_MODE_NONE,
        BlendMode::Premultiplied => HWC2_BLEND_MODE_PREMULTIPLIED,
        BlendMode::Coverage => HWC2_BLEND_MODE_COVERAGE,
    }
}

fn native_buffer(handle: Option<&BufferHandle>) -> *mut ANativeWindowBuffer {
    handle.map_or(ptr::null_mut(), |h| h.raw() as usize as *mut ANativeWindowBuffer)
}

impl Hwc2Device {
    /// Open the hwcomposer2 HAL with `max_layers` hardware layers per display
    /// (framebuffer target included).
    ///
    /// A second open while one device is alive is a `BadRequest`.
    pub fn open(max_layers: usize) -> Result<Self> {
        if max_layers == 0 {
            return Err(Error::invalid("at least the framebuffer target layer is needed"));
        }
        if DEVICE_OPEN
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::BadRequest("hwcomposer2 device already open".into()));
        }

        match Self::open_locked(max_layers) {
            Ok(device) => Ok(device),
            Err(e) => {
                DEVICE_OPEN.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn open_locked(max_layers: usize) -> Result<Self> {
        info!("Initializing hwcomposer2 via libhybris");
        hybris_initialize();

        let device = unsafe { hwc2_compat_device_new(false) };
        if device.is_null() {
            return Err(Error::NotFound("hwc2_compat_device_new returned null".into()));
        }

        let mut listener = Box::new(Listener {
            base: HWC2EventListener {
                on_vsync_received: Some(on_vsync),
                on_hotplug_received: Some(on_hotplug),
                on_refresh_received: Some(on_refresh),
            },
            sink: Mutex::new(None),
        });
        unsafe {
            hwc2_compat_device_register_callback(device, &mut listener.base, 0);
            hwc2_compat_device_on_hotplug(device, 0, true);
        }

        let raw = unsafe { hwc2_compat_device_get_display_by_id(device, 0) };
        if raw.is_null() {
            return Err(Error::NotFound("no primary display".into()));
        }
        let config_ptr = unsafe { hwc2_compat_display_get_active_config(raw) };
        if config_ptr.is_null() {
            unsafe { hwc2_compat_device_destroy_display(device, raw) };
            return Err(Error::failed("primary display has no active config"));
        }
        let config = unsafe { (*config_ptr).clone() };
        unsafe { libc::free(config_ptr as *mut libc::c_void) };

        info!(
            "Display config: {}x{} vsync {}ns dpi {}x{}",
            config.width, config.height, config.vsync_period, config.dpi_x, config.dpi_y
        );

        Ok(Self {
            device,
            displays: vec![Display {
                raw,
                config,
                overlays: vec![ptr::null_mut(); max_layers - 1],
            }],
            max_layers,
            listener,
        })
    }

    fn display(&self, index: usize, op: &'static str) -> HalResult<&Display> {
        self.displays
            .get(index)
            .ok_or(DeviceError::new(op, HWC2_ERROR_BAD_DISPLAY))
    }

    fn compose(&mut self, index: usize, request: &mut CompositionRequest) -> HalResult<()> {
        let display = self
            .displays
            .get_mut(index)
            .ok_or(DeviceError::new("present", HWC2_ERROR_BAD_DISPLAY))?;
        let target = request.layers.len().saturating_sub(1);

        for (slot, layer) in request.layers.iter_mut().enumerate() {
            if slot == target {
                if layer.handle.is_some() {
                    let acquire = layer.acquire_fence.take().into_raw();
                    check("set_client_target", unsafe {
                        hwc2_compat_display_set_client_target(
                            display.raw,
                            0,
                            native_buffer(layer.handle.as_ref()),
                            acquire,
                            0,
                        )
                    })?;
                }
                continue;
            }
            let Some(hw_layer) = display.overlays.get_mut(slot) else {
                continue;
            };

            if layer.composition == CompositionType::Disabled {
                if !hw_layer.is_null() {
                    unsafe { hwc2_compat_display_destroy_layer(display.raw, *hw_layer) };
                    *hw_layer = ptr::null_mut();
                }
                continue;
            }
            if hw_layer.is_null() {
                *hw_layer = unsafe { hwc2_compat_display_create_layer(display.raw) };
                if hw_layer.is_null() {
                    return Err(DeviceError::new("create_layer", HWC2_ERROR_UNSUPPORTED));
                }
            }

            let l = *hw_layer;
            let frame = layer.display_frame;
            let crop = layer.source_crop;
            unsafe {
                check(
                    "set_composition_type",
                    hwc2_compat_layer_set_composition_type(l, HWC2_COMPOSITION_DEVICE),
                )?;
                check(
                    "set_blend_mode",
                    hwc2_compat_layer_set_blend_mode(l, blend_mode(layer.blend)),
                )?;
                check(
                    "set_transform",
                    hwc2_compat_layer_set_transform(l, layer.transform.to_hal()),
                )?;
                check(
                    "set_plane_alpha",
                    hwc2_compat_layer_set_plane_alpha(l, layer.plane_alpha as f32 / 255.0),
                )?;
                check(
                    "set_display_frame",
                    hwc2_compat_layer_set_display_frame(
                        l,
                        frame.left,
                        frame.top,
                        frame.right,
                        frame.bottom,
                    ),
                )?;
                check(
                    "set_visible_region",
                    hwc2_compat_layer_set_visible_region(
                        l,
                        frame.left,
                        frame.top,
                        frame.right,
                        frame.bottom,
                    ),
                )?;
                check(
                    "set_source_crop",
                    hwc2_compat_layer_set_source_crop(
                        l,
                        crop.left,
                        crop.top,
                        crop.right,
                        crop.bottom,
                    ),
                )?;
                check(
                    "set_buffer",
                    hwc2_compat_layer_set_buffer(
                        l,
                        0,
                        native_buffer(layer.handle.as_ref()),
                        layer.acquire_fence.take().into_raw(),
                    ),
                )?;
            }
        }

        let mut num_types = 0u32;
        let mut num_requests = 0u32;
        let err = unsafe {
            hwc2_compat_display_validate(display.raw, &mut num_types, &mut num_requests)
        };
        if err == HWC2_ERROR_HAS_CHANGES {
            debug!(num_types, num_requests, "accepting composition changes");
            check("accept_changes", unsafe { hwc2_compat_display_accept_changes(display.raw) })?;
        } else {
            check("validate", err)?;
        }

        let mut present_fence = -1;
        check("present", unsafe { hwc2_compat_display_present(display.raw, &mut present_fence) })?;
        request.retire_fence = unsafe { Fence::from_raw(present_fence) };

        let mut out_fences = ptr::null_mut();
        let err = unsafe { hwc2_compat_display_get_release_fences(display.raw, &mut out_fences) };
        if err != HWC2_ERROR_NONE || out_fences.is_null() {
            warn!("no release fences from display {}: {}", index, err);
            return Ok(());
        }
        for (slot, hw_layer) in display.overlays.iter().enumerate() {
            if hw_layer.is_null() {
                continue;
            }
            if let Some(layer) = request.layers.get_mut(slot) {
                let fd = unsafe { hwc2_compat_out_fences_get_fence(out_fences, *hw_layer) };
                layer.release_fence = unsafe { Fence::from_raw(fd) };
            }
        }
        unsafe { hwc2_compat_out_fences_destroy(out_fences) };
        Ok(())
    }
}

impl Drop for Hwc2Device {
    fn drop(&mut self) {
        for display in self.displays.drain(..) {
            for layer in display.overlays.into_iter().filter(|l| !l.is_null()) {
                unsafe { hwc2_compat_display_destroy_layer(display.raw, layer) };
            }
            unsafe { hwc2_compat_device_destroy_display(self.device, display.raw) };
        }
        *self.listener.sink.lock().unwrap_or_else(PoisonError::into_inner) = None;
        DEVICE_OPEN.store(false, Ordering::Release);
        debug!("hwcomposer2 device closed");
    }
}

impl ComposerDevice for Hwc2Device {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "hwcomposer2".into(),
            api_version: HWC_DEVICE_API_VERSION_2_0,
            completion: CompletionMode::RetireFence,
        }
    }

    fn display_count(&self) -> usize {
        self.displays.len()
    }

    fn max_layers(&self, display: usize) -> usize {
        if display < self.displays.len() {
            self.max_layers
        } else {
            0
        }
    }

    fn display_configs(&mut self, display: usize) -> HalResult<Vec<ConfigId>> {
        Ok(vec![self.display(display, "get_display_configs")?.config.id])
    }

    fn display_attributes(
        &mut self,
        display: usize,
        config: ConfigId,
    ) -> HalResult<DisplayAttributes> {
        let c = &self.display(display, "get_display_attributes")?.config;
        if c.id != config {
            return Err(DeviceError::new("get_display_attributes", HWC2_ERROR_BAD_CONFIG));
        }
        Ok(DisplayAttributes {
            width: c.width.max(0) as u32,
            height: c.height.max(0) as u32,
            vsync_period_ns: c.vsync_period.max(0) as u64,
            // The compat layer reports dots per inch
            dpi_x: (c.dpi_x.max(0.0) * 1000.0) as u32,
            dpi_y: (c.dpi_y.max(0.0) * 1000.0) as u32,
            secure: false,
        })
    }

    fn active_config(&mut self, display: usize) -> HalResult<ConfigId> {
        Ok(self.display(display, "get_active_config")?.config.id)
    }

    fn set_active_config(&mut self, display: usize, config: ConfigId) -> HalResult<()> {
        if self.display(display, "set_active_config")?.config.id == config {
            Ok(())
        } else {
            Err(DeviceError::new("set_active_config", HWC2_ERROR_UNSUPPORTED))
        }
    }

    fn set_power_mode(&mut self, display: usize, mode: HwPowerMode) -> HalResult<()> {
        let raw = self.display(display, "set_power_mode")?.raw;
        check("set_power_mode", unsafe {
            hwc2_compat_display_set_power_mode(raw, mode as c_int)
        })
    }

    fn blank(&mut self, display: usize, blank: bool) -> HalResult<()> {
        let mode = if blank { HwPowerMode::Off } else { HwPowerMode::Normal };
        self.set_power_mode(display, mode)
    }

    fn set_vsync_enabled(&mut self, display: usize, enabled: bool) -> HalResult<()> {
        let raw = self.display(display, "set_vsync_enabled")?.raw;
        let value = if enabled { HWC2_VSYNC_ENABLE } else { HWC2_VSYNC_DISABLE };
        check("set_vsync_enabled", unsafe {
            hwc2_compat_display_set_vsync_enabled(raw, value)
        })
    }

    fn register_events(&mut self, sink: EventSink) {
        *self.listener.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    fn submit(&mut self, displays: &mut [Option<CompositionRequest>]) -> HalResult<()> {
        for (index, request) in displays.iter_mut().enumerate() {
            if let Some(request) = request.as_mut() {
                self.compose(index, request)?;
            }
        }
        Ok(())
    }
}
