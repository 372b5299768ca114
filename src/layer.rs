//! Per-output hardware layers
//!
//! Layer indices mirror the hardware: index 0 is the top-most overlay and the
//! last index is the framebuffer target, the layer that carries the image the
//! front end composited in software. Layers are created together on first
//! enumeration and live as long as their output; only their geometry and
//! buffer binding change afterwards.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use tracing::debug;

use crate::buffer::{fourcc, BufferHandle, GraphicsBuffer};
use crate::device::{DisplayFrame, SourceCrop};
use crate::fence::Fence;
use crate::output::OutputId;
use crate::{Error, Result};

/// Identifies a layer: the output it belongs to and its hardware index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LayerId {
    pub output: OutputId,
    pub index: u32,
}

impl fmt::Debug for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LayerId({}:{})", self.output.0, self.index)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LayerCapability: u32 {
        const CURSOR = 1 << 0;
        const PRIMARY = 1 << 1;
        const OVERLAY = 1 << 2;
        const GRAPHIC = 1 << 4;
        const VIDEO = 1 << 5;
        const SCALE = 1 << 8;
        const TRANSFORM = 1 << 9;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerRole {
    Overlay,
    /// Framebuffer target; fixed at creation
    PrimaryTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerCaps {
    pub role: LayerRole,
    pub capabilities: LayerCapability,
    pub formats: &'static [u32],
    /// Stacking position, higher is closer to the viewer
    pub zpos: i32,
}

const OVERLAY_FORMATS: &[u32] = &[
    fourcc::ARGB8888,
    fourcc::XRGB8888,
    fourcc::ABGR8888,
    fourcc::XBGR8888,
    fourcc::RGB565,
    fourcc::NV12,
];

const PRIMARY_FORMATS: &[u32] = &[
    fourcc::ARGB8888,
    fourcc::XRGB8888,
    fourcc::ABGR8888,
    fourcc::XBGR8888,
    fourcc::RGB565,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Transform {
    #[default]
    Normal,
    Rot90,
    Rot180,
    Rot270,
    Flipped,
    Flipped90,
    Flipped180,
    Flipped270,
}

impl Transform {
    /// HAL transform bits (FLIP_H = 1, FLIP_V = 2, ROT_90 = 4)
    pub fn to_hal(self) -> i32 {
        match self {
            Transform::Normal => 0,
            Transform::Rot90 => 4,
            Transform::Rot180 => 3,
            Transform::Rot270 => 7,
            Transform::Flipped => 1,
            Transform::Flipped90 => 5,
            Transform::Flipped180 => 2,
            Transform::Flipped270 => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlendMode {
    #[default]
    None,
    Premultiplied,
    Coverage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

/// Position and extent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// Both far edges fit in `i32`.
    pub fn is_representable(&self) -> bool {
        let edge = |origin: i32, extent: u32| {
            i32::try_from(extent)
                .ok()
                .and_then(|e| origin.checked_add(e))
                .is_some()
        };
        edge(self.x, self.w) && edge(self.y, self.h)
    }

    pub fn to_display_frame(&self) -> DisplayFrame {
        let extent = |v: u32| i32::try_from(v).unwrap_or(i32::MAX);
        DisplayFrame {
            left: self.x,
            top: self.y,
            right: self.x.saturating_add(extent(self.w)),
            bottom: self.y.saturating_add(extent(self.h)),
        }
    }

    pub fn to_source_crop(&self) -> SourceCrop {
        SourceCrop {
            left: self.x as f32,
            top: self.y as f32,
            right: self.x as f32 + self.w as f32,
            bottom: self.y as f32 + self.h as f32,
        }
    }

    fn fits_in(&self, size: Size) -> bool {
        self.x >= 0
            && self.y >= 0
            && self.x as u64 + self.w as u64 <= size.width as u64
            && self.y as u64 + self.h as u64 <= size.height as u64
    }
}

/// Geometry of a layer: what part of the buffer goes where on the output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerInfo {
    /// Size of the bound buffer; zero means "take it from the buffer"
    pub src_size: Size,
    pub src: Rect,
    pub dst: Rect,
    pub transform: Transform,
}

/// A buffer bound to a layer until it is replaced or unbound.
///
/// The reference keeps the front end's buffer alive while the device may
/// still scan out of it.
pub(crate) struct BufferBinding {
    pub(crate) buffer: Arc<dyn GraphicsBuffer>,
    pub(crate) handle: BufferHandle,
    pub(crate) acquire: Fence,
}

impl fmt::Debug for BufferBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferBinding")
            .field("handle", &self.handle)
            .field("acquire", &self.acquire.as_raw())
            .finish()
    }
}

#[derive(Debug)]
pub struct Layer {
    id: LayerId,
    role: LayerRole,
    pub(crate) info: LayerInfo,
    pub(crate) blend: BlendMode,
    pub(crate) plane_alpha: u8,
    pub(crate) binding: Option<BufferBinding>,
    zpos: i32,
}

impl Layer {
    fn new(id: LayerId, role: LayerRole, zpos: i32) -> Self {
        let blend = match role {
            LayerRole::PrimaryTarget => BlendMode::Premultiplied,
            LayerRole::Overlay => BlendMode::None,
        };
        Self {
            id,
            role,
            info: LayerInfo::default(),
            blend,
            plane_alpha: 0xff,
            binding: None,
            zpos,
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn role(&self) -> LayerRole {
        self.role
    }

    pub fn info(&self) -> &LayerInfo {
        &self.info
    }

    pub fn blend(&self) -> BlendMode {
        self.blend
    }

    pub fn plane_alpha(&self) -> u8 {
        self.plane_alpha
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn bound_handle(&self) -> Option<&BufferHandle> {
        self.binding.as_ref().map(|b| &b.handle)
    }

    pub fn capability(&self) -> LayerCaps {
        match self.role {
            LayerRole::PrimaryTarget => LayerCaps {
                role: self.role,
                capabilities: LayerCapability::PRIMARY | LayerCapability::GRAPHIC,
                formats: PRIMARY_FORMATS,
                zpos: self.zpos,
            },
            LayerRole::Overlay => LayerCaps {
                role: self.role,
                capabilities: LayerCapability::OVERLAY
                    | LayerCapability::GRAPHIC
                    | LayerCapability::SCALE
                    | LayerCapability::TRANSFORM,
                formats: OVERLAY_FORMATS,
                zpos: self.zpos,
            },
        }
    }
}

/// All hardware layers of one output.
#[derive(Debug)]
pub struct LayerRegistry {
    pub(crate) layers: Vec<Layer>,
    /// Set when geometry or the bound/unbound state changed since the last
    /// accepted submission
    pub(crate) geometry_changed: bool,
}

impl LayerRegistry {
    pub(crate) fn new(output: OutputId, count: usize) -> Result<Self> {
        if count < 1 {
            return Err(Error::failed(format!(
                "output {} reports no hardware layers",
                output.0
            )));
        }

        let mut layers = Vec::new();
        layers
            .try_reserve_exact(count)
            .map_err(Error::oom("layer list"))?;

        let primary = count - 1;
        for index in 0..count {
            let role = if index == primary {
                LayerRole::PrimaryTarget
            } else {
                LayerRole::Overlay
            };
            let id = LayerId {
                output,
                index: index as u32,
            };
            layers.push(Layer::new(id, role, (primary - index) as i32));
        }

        debug!(output = ?output, count, "created layer list");
        Ok(Self {
            layers,
            geometry_changed: true,
        })
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn primary_index(&self) -> usize {
        self.layers.len() - 1
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn get(&self, index: usize) -> Result<&Layer> {
        self.layers
            .get(index)
            .ok_or_else(|| Error::invalid(format!("no layer {}", index)))
    }

    fn get_mut(&mut self, index: usize) -> Result<&mut Layer> {
        self.layers
            .get_mut(index)
            .ok_or_else(|| Error::invalid(format!("no layer {}", index)))
    }

    pub fn set_info(&mut self, index: usize, info: LayerInfo) -> Result<()> {
        let layer = self.get_mut(index)?;

        if layer.role == LayerRole::PrimaryTarget && info.transform != Transform::Normal {
            return Err(Error::invalid("the framebuffer target cannot be transformed"));
        }
        for rect in [info.src, info.dst] {
            if !rect.is_representable() {
                return Err(Error::invalid(format!("rect {:?} out of range", rect)));
            }
        }
        let src_size = if info.src_size == Size::default() {
            layer.info.src_size
        } else {
            info.src_size
        };
        if src_size != Size::default() && !info.src.fits_in(src_size) {
            return Err(Error::invalid(format!(
                "source rect {:?} outside buffer {}x{}",
                info.src, src_size.width, src_size.height
            )));
        }

        if layer.info.src != info.src
            || layer.info.dst != info.dst
            || layer.info.transform != info.transform
        {
            self.geometry_changed = true;
        }
        let layer = self.get_mut(index)?;
        layer.info = LayerInfo { src_size, ..info };
        debug!(layer = ?layer.id, info = ?layer.info, "layer info set");
        Ok(())
    }

    pub fn set_geometry(&mut self, index: usize, src: Rect, dst: Rect) -> Result<()> {
        let current = self.get(index)?.info;
        self.set_info(
            index,
            LayerInfo {
                src,
                dst,
                ..current
            },
        )
    }

    /// Bind a buffer. Only in-memory state changes; the device sees it at the
    /// next commit.
    pub fn bind_buffer(
        &mut self,
        index: usize,
        buffer: Arc<dyn GraphicsBuffer>,
        acquire: Fence,
    ) -> Result<()> {
        let layer = self.get_mut(index)?;

        let format = buffer.format();
        if !layer.capability().formats.contains(&format) {
            return Err(Error::invalid(format!(
                "format 0x{:08x} not supported on layer {}",
                format, index
            )));
        }
        let handle = BufferHandle::import(buffer.as_ref())?;

        // The new buffer replaces the old one entirely, size included
        let size = Size {
            width: handle.width,
            height: handle.height,
        };
        let resized = layer.info.src_size != size;
        layer.info.src_size = size;
        let newly_bound = layer.binding.is_none();
        debug!(layer = ?layer.id, handle = handle.raw(), "buffer bound");
        layer.binding = Some(BufferBinding {
            buffer,
            handle,
            acquire,
        });

        if newly_bound || resized {
            self.geometry_changed = true;
        }
        Ok(())
    }

    /// Drop the binding and the geometry that went with it.
    pub fn unbind_buffer(&mut self, index: usize) -> Result<()> {
        let layer = self.get_mut(index)?;
        let was_bound = layer.binding.take().is_some();
        layer.info = LayerInfo::default();
        debug!(layer = ?layer.id, was_bound, "buffer unbound");
        if was_bound {
            self.geometry_changed = true;
        }
        Ok(())
    }
}
