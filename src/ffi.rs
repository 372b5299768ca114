//! libhybris hwcomposer2 compatibility layer
//!
//! Only the calls [`crate::device::hwc2`] makes are declared.

use std::os::raw::c_int;

pub type Hwc2DisplayT = u64;
pub type Hwc2ConfigT = u32;
pub type Hwc2ErrorT = i32;
pub type AndroidDataspaceT = i32;

pub const HWC2_ERROR_NONE: Hwc2ErrorT = 0;
pub const HWC2_ERROR_BAD_CONFIG: Hwc2ErrorT = 1;
pub const HWC2_ERROR_BAD_DISPLAY: Hwc2ErrorT = 2;
/// `validate` wants `accept_changes` before `present`
pub const HWC2_ERROR_HAS_CHANGES: Hwc2ErrorT = 5;
pub const HWC2_ERROR_UNSUPPORTED: Hwc2ErrorT = 8;

pub const HWC2_COMPOSITION_DEVICE: c_int = 2;

pub const HWC2_BLEND_MODE_NONE: c_int = 1;
pub const HWC2_BLEND_MODE_PREMULTIPLIED: c_int = 2;
pub const HWC2_BLEND_MODE_COVERAGE: c_int = 3;

pub const HWC2_VSYNC_DISABLE: c_int = 0;
pub const HWC2_VSYNC_ENABLE: c_int = 1;

/// `HWC2DisplayConfig`; DPI is in dots per inch here
#[repr(C)]
#[derive(Debug, Clone)]
pub struct HWC2DisplayConfig {
    pub id: Hwc2ConfigT,
    pub display: Hwc2DisplayT,
    pub width: i32,
    pub height: i32,
    pub vsync_period: i64,
    pub dpi_x: f32,
    pub dpi_y: f32,
}

pub type VsyncCallback = extern "C" fn(
    listener: *mut HWC2EventListener,
    sequence_id: i32,
    display: Hwc2DisplayT,
    timestamp: i64,
);
pub type HotplugCallback = extern "C" fn(
    listener: *mut HWC2EventListener,
    sequence_id: i32,
    display: Hwc2DisplayT,
    connected: bool,
    primary_display: bool,
);
pub type RefreshCallback =
    extern "C" fn(listener: *mut HWC2EventListener, sequence_id: i32, display: Hwc2DisplayT);

/// Callback table; the HAL passes this pointer back into each callback, on
/// a thread of its own.
#[repr(C)]
pub struct HWC2EventListener {
    pub on_vsync_received: Option<VsyncCallback>,
    pub on_hotplug_received: Option<HotplugCallback>,
    pub on_refresh_received: Option<RefreshCallback>,
}

macro_rules! opaque {
    ($($name:ident),* $(,)?) => {
        $(
            #[repr(C)]
            pub struct $name {
                _private: [u8; 0],
            }
        )*
    };
}

opaque!(
    Hwc2CompatDevice,
    Hwc2CompatDisplay,
    Hwc2CompatLayer,
    Hwc2CompatOutFences,
    ANativeWindowBuffer,
);

#[link(name = "gralloc")]
extern "C" {
    pub fn hybris_gralloc_initialize(framebuffer: c_int);
}

// Device
#[link(name = "hybris-hwcomposerwindow")]
#[link(name = "hwc2")]
extern "C" {
    /// Must run before `hwc2_compat_device_new`
    pub fn hybris_hwc2_initialize();

    pub fn hwc2_compat_device_new(use_vr_composer: bool) -> *mut Hwc2CompatDevice;
    pub fn hwc2_compat_device_register_callback(
        device: *mut Hwc2CompatDevice,
        listener: *mut HWC2EventListener,
        composer_sequence_id: c_int,
    );
    pub fn hwc2_compat_device_on_hotplug(
        device: *mut Hwc2CompatDevice,
        display_id: Hwc2DisplayT,
        connected: bool,
    );
    pub fn hwc2_compat_device_get_display_by_id(
        device: *mut Hwc2CompatDevice,
        id: Hwc2DisplayT,
    ) -> *mut Hwc2CompatDisplay;
    pub fn hwc2_compat_device_destroy_display(
        device: *mut Hwc2CompatDevice,
        display: *mut Hwc2CompatDisplay,
    );
}

// Display
#[link(name = "hwc2")]
extern "C" {
    /// The config is malloc'd; free it with `libc::free`
    pub fn hwc2_compat_display_get_active_config(
        display: *mut Hwc2CompatDisplay,
    ) -> *mut HWC2DisplayConfig;
    pub fn hwc2_compat_display_set_power_mode(
        display: *mut Hwc2CompatDisplay,
        mode: c_int,
    ) -> Hwc2ErrorT;
    pub fn hwc2_compat_display_set_vsync_enabled(
        display: *mut Hwc2CompatDisplay,
        enabled: c_int,
    ) -> Hwc2ErrorT;
    pub fn hwc2_compat_display_create_layer(
        display: *mut Hwc2CompatDisplay,
    ) -> *mut Hwc2CompatLayer;
    pub fn hwc2_compat_display_destroy_layer(
        display: *mut Hwc2CompatDisplay,
        layer: *mut Hwc2CompatLayer,
    );
    pub fn hwc2_compat_display_set_client_target(
        display: *mut Hwc2CompatDisplay,
        slot: u32,
        buffer: *mut ANativeWindowBuffer,
        acquire_fence_fd: i32,
        dataspace: AndroidDataspaceT,
    ) -> Hwc2ErrorT;
    pub fn hwc2_compat_display_validate(
        display: *mut Hwc2CompatDisplay,
        out_num_types: *mut u32,
        out_num_requests: *mut u32,
    ) -> Hwc2ErrorT;
    pub fn hwc2_compat_display_accept_changes(display: *mut Hwc2CompatDisplay) -> Hwc2ErrorT;
    pub fn hwc2_compat_display_present(
        display: *mut Hwc2CompatDisplay,
        out_present_fence: *mut i32,
    ) -> Hwc2ErrorT;
    pub fn hwc2_compat_display_get_release_fences(
        display: *mut Hwc2CompatDisplay,
        out_fences: *mut *mut Hwc2CompatOutFences,
    ) -> Hwc2ErrorT;
}

// Layer
#[link(name = "hwc2")]
extern "C" {
    pub fn hwc2_compat_layer_set_composition_type(
        layer: *mut Hwc2CompatLayer,
        comp_type: c_int,
    ) -> Hwc2ErrorT;
    pub fn hwc2_compat_layer_set_blend_mode(layer: *mut Hwc2CompatLayer, mode: c_int) -> Hwc2ErrorT;
    pub fn hwc2_compat_layer_set_transform(
        layer: *mut Hwc2CompatLayer,
        transform: c_int,
    ) -> Hwc2ErrorT;
    pub fn hwc2_compat_layer_set_plane_alpha(layer: *mut Hwc2CompatLayer, alpha: f32) -> Hwc2ErrorT;
    pub fn hwc2_compat_layer_set_display_frame(
        layer: *mut Hwc2CompatLayer,
        left: i32,
        top: i32,
        right: i32,
        bottom: i32,
    ) -> Hwc2ErrorT;
    pub fn hwc2_compat_layer_set_visible_region(
        layer: *mut Hwc2CompatLayer,
        left: i32,
        top: i32,
        right: i32,
        bottom: i32,
    ) -> Hwc2ErrorT;
    pub fn hwc2_compat_layer_set_source_crop(
        layer: *mut Hwc2CompatLayer,
        left: f32,
        top: f32,
        right: f32,
        bottom: f32,
    ) -> Hwc2ErrorT;
    pub fn hwc2_compat_layer_set_buffer(
        layer: *mut Hwc2CompatLayer,
        slot: u32,
        buffer: *mut ANativeWindowBuffer,
        acquire_fence_fd: i32,
    ) -> Hwc2ErrorT;
}

// Release fences of the last present
#[link(name = "hwc2")]
extern "C" {
    /// `-1` when the layer has no release fence; the caller owns the fd
    pub fn hwc2_compat_out_fences_get_fence(
        fences: *mut Hwc2CompatOutFences,
        layer: *mut Hwc2CompatLayer,
    ) -> i32;
    pub fn hwc2_compat_out_fences_destroy(fences: *mut Hwc2CompatOutFences);
}

/// Bring up gralloc, then the HWC2 service. Once per process, before
/// opening a device.
pub fn hybris_initialize() {
    unsafe {
        hybris_gralloc_initialize(0);
        hybris_hwc2_initialize();
    }
}
