//! Graphics buffer adaptation
//!
//! The front end hands us its own buffer objects. The composition device only
//! understands raw memory-region handles, so a bound buffer is translated into
//! a [`BufferHandle`] once, at bind time. The adapter never owns buffer memory.

use std::fmt;

use crate::{Error, Result};

/// DRM fourcc format codes
pub mod fourcc {
    pub const XRGB8888: u32 = 0x34325258; // 'XR24'
    pub const ARGB8888: u32 = 0x34325241; // 'AR24'
    pub const RGB565: u32 = 0x36314752; // 'RG16'
    pub const XBGR8888: u32 = 0x34324258; // 'XB24'
    pub const ABGR8888: u32 = 0x34324241; // 'AB24'
    pub const NV12: u32 = 0x3231564e; // 'NV12'

    /// Bytes per pixel of the first plane
    pub fn bytes_per_pixel(format: u32) -> Option<u32> {
        match format {
            XRGB8888 | ARGB8888 | XBGR8888 | ABGR8888 => Some(4),
            RGB565 => Some(2),
            NV12 => Some(1),
            _ => None,
        }
    }
}

/// Most planes a buffer may carry (Y/U/V/alpha).
pub const MAX_PLANES: usize = 4;

/// A buffer owned by the display front end.
///
/// Implementations expose the per-plane memory handles the device scans out
/// of. Handle value `0` is never valid.
pub trait GraphicsBuffer: Send + Sync + fmt::Debug {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn format(&self) -> u32;
    fn plane_count(&self) -> usize;
    fn plane_handle(&self, plane: usize) -> Option<u64>;
    fn plane_stride(&self, plane: usize) -> u32;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneHandle {
    pub handle: u64,
    pub stride: u32,
}

/// Device-facing view of a [`GraphicsBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferHandle {
    planes: [PlaneHandle; MAX_PLANES],
    plane_count: usize,
    pub width: u32,
    pub height: u32,
    pub format: u32,
}

impl BufferHandle {
    /// Translate a front-end buffer into device handles.
    pub fn import(buffer: &dyn GraphicsBuffer) -> Result<Self> {
        let plane_count = buffer.plane_count();
        if plane_count == 0 {
            return Err(Error::failed("buffer has no memory planes"));
        }
        if plane_count > MAX_PLANES {
            return Err(Error::invalid(format!(
                "buffer has {} planes, at most {} supported",
                plane_count, MAX_PLANES
            )));
        }

        let mut planes = [PlaneHandle::default(); MAX_PLANES];
        for (i, plane) in planes.iter_mut().enumerate().take(plane_count) {
            let handle = buffer
                .plane_handle(i)
                .filter(|h| *h != 0)
                .ok_or_else(|| Error::failed(format!("plane {} has no memory handle", i)))?;
            *plane = PlaneHandle {
                handle,
                stride: buffer.plane_stride(i),
            };
        }

        Ok(Self {
            planes,
            plane_count,
            width: buffer.width(),
            height: buffer.height(),
            format: buffer.format(),
        })
    }

    /// Handle the device composes from. Only the first memory region is
    /// passed down; multi-planar formats share one allocation on these HALs.
    pub fn raw(&self) -> u64 {
        self.planes[0].handle
    }

    pub fn planes(&self) -> &[PlaneHandle] {
        &self.planes[..self.plane_count]
    }
}

/// A plain buffer description, for buffers allocated outside the front end's
/// buffer manager (and for tests).
#[derive(Debug, Clone)]
pub struct ImportedBuffer {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub planes: Vec<PlaneHandle>,
}

impl ImportedBuffer {
    pub fn single_plane(handle: u64, width: u32, height: u32, format: u32) -> Self {
        let stride = width * fourcc::bytes_per_pixel(format).unwrap_or(4);
        Self {
            width,
            height,
            format,
            planes: vec![PlaneHandle { handle, stride }],
        }
    }
}

impl GraphicsBuffer for ImportedBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> u32 {
        self.format
    }

    fn plane_count(&self) -> usize {
        self.planes.len()
    }

    fn plane_handle(&self, plane: usize) -> Option<u64> {
        self.planes.get(plane).map(|p| p.handle)
    }

    fn plane_stride(&self, plane: usize) -> u32 {
        self.planes.get(plane).map_or(0, |p| p.stride)
    }
}
