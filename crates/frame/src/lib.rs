// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

/*!

## vidpresent frames

The `vidpresent_frame` crate describes the video frames handed to the
presentation pipeline: their pixel format and geometry, and where their
pixels live. Frames come in four flavours:

- system memory planes ([`MemFrame`]),
- DMA-buf buffers ([`DmaBuffer`]) which the GPU can import without copying,
- GL or GLES textures owned by the producer ([`TextureFrame`]),
- foreign hardware frames that can export themselves as DMA-buf
  ([`ExportDmaBuf`]).

DMA-buf buffers are allocated from the kernel DMA heaps (CMA first, then the
system heap) or, where no heap is accessible, from a `memfd`.
*/

use std::{fmt, sync::Arc};

pub use dma::{DmaBacking, DmaBuffer, DmaMap, DmaPlane, SyncAccess};
pub use drm_fourcc::DrmFourcc;
pub use error::{Error, Result};
pub use mem::{MemFrame, Plane};
pub use pixel::{PixelFormat, Shuffle, conversion_penalty};

mod dma;
#[cfg(target_os = "linux")]
mod dmabuf;
mod error;
mod mem;
mod pixel;

/// Graphics API a texture or context belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlApi {
    Gl,
    Gles,
}

/// Where the pixels of a frame are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryDomain {
    Mem,
    Dma,
    Gl,
    Gles,
    Foreign,
}

impl From<GlApi> for MemoryDomain {
    fn from(api: GlApi) -> Self {
        match api {
            GlApi::Gl => MemoryDomain::Gl,
            GlApi::Gles => MemoryDomain::Gles,
        }
    }
}

/// Image orientation, numbered like the EXIF orientation tag minus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Orientation {
    #[default]
    Normal = 0,
    Rot90Cw = 1,
    Rot180Cw = 2,
    Rot270Cw = 3,
    FlipH = 4,
    FlipHRot90Cw = 5,
    FlipHRot180Cw = 6,
    FlipHRot270Cw = 7,
}

impl Orientation {
    pub const ALL: [Orientation; 8] = [
        Orientation::Normal,
        Orientation::Rot90Cw,
        Orientation::Rot180Cw,
        Orientation::Rot270Cw,
        Orientation::FlipH,
        Orientation::FlipHRot90Cw,
        Orientation::FlipHRot180Cw,
        Orientation::FlipHRot270Cw,
    ];

    pub fn from_index(index: u8) -> Option<Orientation> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Width and height are exchanged on screen.
    pub fn is_transposed(self) -> bool {
        matches!(
            self,
            Orientation::Rot90Cw
                | Orientation::Rot270Cw
                | Orientation::FlipHRot90Cw
                | Orientation::FlipHRot270Cw
        )
    }

    /// Row-major 2x2 transform applied to positions with the y axis up.
    pub fn matrix(self) -> [[f64; 2]; 2] {
        match self {
            Orientation::Normal => [[1.0, 0.0], [0.0, 1.0]],
            Orientation::Rot90Cw => [[0.0, 1.0], [-1.0, 0.0]],
            Orientation::Rot180Cw => [[-1.0, 0.0], [0.0, -1.0]],
            Orientation::Rot270Cw => [[0.0, -1.0], [1.0, 0.0]],
            Orientation::FlipH => [[-1.0, 0.0], [0.0, 1.0]],
            Orientation::FlipHRot90Cw => [[0.0, 1.0], [1.0, 0.0]],
            Orientation::FlipHRot180Cw => [[1.0, 0.0], [0.0, -1.0]],
            Orientation::FlipHRot270Cw => [[0.0, -1.0], [-1.0, 0.0]],
        }
    }

    /// The orientation of applying `self` first and `next` afterwards.
    pub fn then(self, next: Orientation) -> Orientation {
        let a = self.matrix();
        let b = next.matrix();
        let mut m = [[0.0; 2]; 2];
        for (i, row) in m.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = b[i][0] * a[0][j] + b[i][1] * a[1][j];
            }
        }
        Self::ALL
            .into_iter()
            .find(|o| o.matrix() == m)
            .unwrap_or(Orientation::Normal)
    }
}

/// Format of a video stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoFormat {
    pub pixel_format: PixelFormat,
    pub width: usize,
    pub height: usize,
    /// Pixel aspect ratio numerator.
    pub pixel_width: usize,
    /// Pixel aspect ratio denominator.
    pub pixel_height: usize,
    pub orientation: Orientation,
    /// The stream carries a single still image.
    pub still: bool,
}

impl VideoFormat {
    pub fn new(pixel_format: PixelFormat, width: usize, height: usize) -> Self {
        Self {
            pixel_format,
            width,
            height,
            pixel_width: 1,
            pixel_height: 1,
            orientation: Orientation::Normal,
            still: false,
        }
    }

    pub fn with_pixel_aspect(mut self, pixel_width: usize, pixel_height: usize) -> Self {
        self.pixel_width = pixel_width;
        self.pixel_height = pixel_height;
        self
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_still(mut self, still: bool) -> Self {
        self.still = still;
        self
    }

    pub fn pixel_aspect(&self) -> f64 {
        if self.pixel_width == 0 || self.pixel_height == 0 {
            return 1.0;
        }
        self.pixel_width as f64 / self.pixel_height as f64
    }

    /// Bytes per row of `plane` without padding.
    pub fn row_bytes(&self, plane: usize) -> usize {
        let (w, _) = self
            .pixel_format
            .plane_size(plane, self.width, self.height);
        w * self.pixel_format.bytes_per_pixel(plane)
    }

    /// Rows of `plane`.
    pub fn rows(&self, plane: usize) -> usize {
        self.pixel_format
            .plane_size(plane, self.width, self.height)
            .1
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} par {}:{} {:?}{}",
            self.pixel_format,
            self.width,
            self.height,
            self.pixel_width,
            self.pixel_height,
            self.orientation,
            if self.still { " still" } else { "" }
        )
    }
}

/// Pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: usize,
    pub top: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub fn new(left: usize, top: usize, width: usize, height: usize) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Textures created by a GL or GLES producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureFrame {
    pub api: GlApi,
    /// GL texture target, `TEXTURE_2D` or `TEXTURE_EXTERNAL_OES`.
    pub target: u32,
    /// One texture per plane.
    pub textures: Vec<u32>,
}

/// A hardware frame from another API that can be shared as DMA-buf.
pub trait ExportDmaBuf: fmt::Debug + Send + Sync {
    fn export_dma_buf(&self) -> Result<DmaBuffer>;
}

#[derive(Debug)]
pub enum FrameStorage {
    Mem(MemFrame),
    Dma(DmaBuffer),
    Texture(TextureFrame),
    Foreign(Box<dyn ExportDmaBuf>),
}

impl FrameStorage {
    pub fn memory(&self) -> MemoryDomain {
        match self {
            FrameStorage::Mem(_) => MemoryDomain::Mem,
            FrameStorage::Dma(_) => MemoryDomain::Dma,
            FrameStorage::Texture(t) => t.api.into(),
            FrameStorage::Foreign(_) => MemoryDomain::Foreign,
        }
    }
}

/// A video frame pushed to a port.
#[derive(Debug)]
pub struct VideoFrame {
    pub storage: FrameStorage,
    /// Presentation timestamp.
    pub pts: i64,
    /// Overlay only: part of the frame to show, `None` for the whole frame.
    pub src_rect: Option<Rect>,
    /// Overlay only: position within the overlay format.
    pub dst_x: i64,
    pub dst_y: i64,
}

impl VideoFrame {
    pub fn new(storage: FrameStorage, pts: i64) -> Self {
        Self {
            storage,
            pts,
            src_rect: None,
            dst_x: 0,
            dst_y: 0,
        }
    }

    pub fn with_overlay_placement(mut self, src_rect: Rect, dst_x: i64, dst_y: i64) -> Self {
        self.src_rect = Some(src_rect);
        self.dst_x = dst_x;
        self.dst_y = dst_y;
        self
    }

    pub fn memory(&self) -> MemoryDomain {
        self.storage.memory()
    }

    pub fn into_shared(self) -> Arc<VideoFrame> {
        Arc::new(self)
    }
}
