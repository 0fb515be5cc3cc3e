// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use drm_fourcc::DrmFourcc;
use four_char_code::{FourCharCode, four_char_code};
use std::fmt::Display;

/// Pixel formats understood by the presentation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit luminance only.
    Gray8,
    /// Packed 8-bit RGB.
    Rgb24,
    /// Packed 8-bit RGBA.
    Rgba32,
    /// Packed 16-bit RGB.
    Rgb48,
    /// Packed 16-bit RGBA.
    Rgba64,
    /// Planar 4:2:0, limited (video) range.
    Yuv420P,
    /// Planar 4:2:2, limited range.
    Yuv422P,
    /// Planar 4:4:4, limited range.
    Yuv444P,
    /// Planar 4:2:0, full (JPEG) range.
    Yuvj420P,
    /// Planar 4:2:2, full range.
    Yuvj422P,
    /// Planar 4:4:4, full range.
    Yuvj444P,
    /// Semi-planar 4:2:0, interleaved chroma plane.
    Nv12,
    /// Packed 4:2:2, Y0 U Y1 V.
    Yuyv,
}

/// Byte reordering needed when a pixel format is stored in a DRM buffer
/// whose layout differs from the in-memory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Shuffle {
    #[default]
    None,
    /// 3 byte RGB expanded to 4 byte RGBX.
    RgbToRgbx,
    /// RGBA swapped to BGRA.
    RgbaToBgra,
}

impl Shuffle {
    pub fn is_some(self) -> bool {
        self != Shuffle::None
    }
}

/// DRM fourcc to pixel format table. The first row for a pixel format
/// without a shuffle is the preferred DRM representation.
const DRM_FORMATS: &[(DrmFourcc, PixelFormat, Shuffle)] = &[
    (DrmFourcc::R8, PixelFormat::Gray8, Shuffle::None),
    (DrmFourcc::Bgr888, PixelFormat::Rgb24, Shuffle::None),
    (DrmFourcc::Xbgr8888, PixelFormat::Rgb24, Shuffle::RgbToRgbx),
    (DrmFourcc::Abgr8888, PixelFormat::Rgba32, Shuffle::None),
    (DrmFourcc::Argb8888, PixelFormat::Rgba32, Shuffle::RgbaToBgra),
    (DrmFourcc::Yuv420, PixelFormat::Yuv420P, Shuffle::None),
    (DrmFourcc::Yuv422, PixelFormat::Yuv422P, Shuffle::None),
    (DrmFourcc::Yuv444, PixelFormat::Yuv444P, Shuffle::None),
    (DrmFourcc::Nv12, PixelFormat::Nv12, Shuffle::None),
    (DrmFourcc::Yuyv, PixelFormat::Yuyv, Shuffle::None),
];

impl PixelFormat {
    pub const ALL: [PixelFormat; 13] = [
        PixelFormat::Gray8,
        PixelFormat::Rgb24,
        PixelFormat::Rgba32,
        PixelFormat::Rgb48,
        PixelFormat::Rgba64,
        PixelFormat::Yuv420P,
        PixelFormat::Yuv422P,
        PixelFormat::Yuv444P,
        PixelFormat::Yuvj420P,
        PixelFormat::Yuvj422P,
        PixelFormat::Yuvj444P,
        PixelFormat::Nv12,
        PixelFormat::Yuyv,
    ];

    /// FourCC used when printing the format.
    pub fn fourcc(self) -> FourCharCode {
        match self {
            PixelFormat::Gray8 => four_char_code!("Y800"),
            PixelFormat::Rgb24 => four_char_code!("RGB "),
            PixelFormat::Rgba32 => four_char_code!("RGBA"),
            PixelFormat::Rgb48 => four_char_code!("RGB6"),
            PixelFormat::Rgba64 => four_char_code!("RGA6"),
            PixelFormat::Yuv420P => four_char_code!("I420"),
            PixelFormat::Yuv422P => four_char_code!("Y42B"),
            PixelFormat::Yuv444P => four_char_code!("Y444"),
            PixelFormat::Yuvj420P => four_char_code!("J420"),
            PixelFormat::Yuvj422P => four_char_code!("J422"),
            PixelFormat::Yuvj444P => four_char_code!("J444"),
            PixelFormat::Nv12 => four_char_code!("NV12"),
            PixelFormat::Yuyv => four_char_code!("YUYV"),
        }
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, PixelFormat::Rgba32 | PixelFormat::Rgba64)
    }

    pub fn is_yuv(self) -> bool {
        !matches!(
            self,
            PixelFormat::Gray8
                | PixelFormat::Rgb24
                | PixelFormat::Rgba32
                | PixelFormat::Rgb48
                | PixelFormat::Rgba64
        )
    }

    /// Full range (JPEG style) YUV.
    pub fn is_full_range(self) -> bool {
        matches!(
            self,
            PixelFormat::Yuvj420P | PixelFormat::Yuvj422P | PixelFormat::Yuvj444P
        )
    }

    /// The limited range variant of a full range format, or the format itself.
    pub fn limited_range(self) -> PixelFormat {
        match self {
            PixelFormat::Yuvj420P => PixelFormat::Yuv420P,
            PixelFormat::Yuvj422P => PixelFormat::Yuv422P,
            PixelFormat::Yuvj444P => PixelFormat::Yuv444P,
            f => f,
        }
    }

    /// The full range variant of a planar YUV format.
    pub fn full_range(self) -> Option<PixelFormat> {
        match self {
            PixelFormat::Yuv420P => Some(PixelFormat::Yuvj420P),
            PixelFormat::Yuv422P => Some(PixelFormat::Yuvj422P),
            PixelFormat::Yuv444P => Some(PixelFormat::Yuvj444P),
            _ => None,
        }
    }

    pub fn num_planes(self) -> usize {
        match self {
            PixelFormat::Yuv420P
            | PixelFormat::Yuv422P
            | PixelFormat::Yuv444P
            | PixelFormat::Yuvj420P
            | PixelFormat::Yuvj422P
            | PixelFormat::Yuvj444P => 3,
            PixelFormat::Nv12 => 2,
            _ => 1,
        }
    }

    pub fn is_planar(self) -> bool {
        self.num_planes() > 1
    }

    /// Horizontal and vertical chroma subsampling factors.
    pub fn chroma_subsampling(self) -> (usize, usize) {
        match self {
            PixelFormat::Yuv420P | PixelFormat::Yuvj420P | PixelFormat::Nv12 => (2, 2),
            PixelFormat::Yuv422P | PixelFormat::Yuvj422P | PixelFormat::Yuyv => (2, 1),
            _ => (1, 1),
        }
    }

    pub fn bits_per_channel(self) -> usize {
        match self {
            PixelFormat::Rgb48 | PixelFormat::Rgba64 => 16,
            _ => 8,
        }
    }

    /// Bytes per addressable element of `plane`. For packed 4:2:2 this is
    /// one luma sample plus half a chroma pair.
    pub fn bytes_per_pixel(self, plane: usize) -> usize {
        match (self, plane) {
            (PixelFormat::Gray8, _) => 1,
            (PixelFormat::Rgb24, _) => 3,
            (PixelFormat::Rgba32, _) => 4,
            (PixelFormat::Rgb48, _) => 6,
            (PixelFormat::Rgba64, _) => 8,
            (PixelFormat::Nv12, 1) => 2,
            (PixelFormat::Yuyv, _) => 2,
            _ => 1,
        }
    }

    /// Dimensions in elements of `plane` for a `width` x `height` image.
    pub fn plane_size(self, plane: usize, width: usize, height: usize) -> (usize, usize) {
        if plane == 0 {
            return (width, height);
        }
        let (sub_x, sub_y) = self.chroma_subsampling();
        (width.div_ceil(sub_x), height.div_ceil(sub_y))
    }

    /// Looks up the pixel format stored in a DRM buffer of `fourcc`.
    pub fn from_drm_fourcc(fourcc: DrmFourcc) -> Option<(PixelFormat, Shuffle)> {
        DRM_FORMATS
            .iter()
            .find(|(drm, _, _)| *drm == fourcc)
            .map(|(_, format, shuffle)| (*format, *shuffle))
    }

    /// Preferred DRM fourcc storing this format without reordering.
    pub fn drm_fourcc(self) -> Option<DrmFourcc> {
        let base = self.limited_range();
        DRM_FORMATS
            .iter()
            .find(|(_, format, shuffle)| *format == base && !shuffle.is_some())
            .map(|(drm, _, _)| *drm)
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fourcc().display())
    }
}

fn drops_alpha(src: PixelFormat, dst: PixelFormat) -> bool {
    src.has_alpha() && !dst.has_alpha()
}

fn loses_precision(src: PixelFormat, dst: PixelFormat) -> bool {
    dst.bits_per_channel() < src.bits_per_channel()
}

fn changes_colorspace(src: PixelFormat, dst: PixelFormat) -> bool {
    src.is_yuv() != dst.is_yuv()
}

fn reduces_chroma(src: PixelFormat, dst: PixelFormat) -> bool {
    let (sx, sy) = src.chroma_subsampling();
    let (dx, dy) = dst.chroma_subsampling();
    dx * dy > sx * sy
}

fn changes_range(src: PixelFormat, dst: PixelFormat) -> bool {
    src.is_yuv() && dst.is_yuv() && src.is_full_range() != dst.is_full_range()
}

/// Cost of each kind of quality loss a conversion can cause.
const CONVERSION_COSTS: &[(fn(PixelFormat, PixelFormat) -> bool, u32)] = &[
    (drops_alpha, 16),
    (loses_precision, 8),
    (changes_colorspace, 4),
    (reduces_chroma, 2),
    (changes_range, 1),
];

/// Ranks a conversion from `src` to `dst`. Zero for no conversion, higher
/// values for lossier conversions.
pub fn conversion_penalty(src: PixelFormat, dst: PixelFormat) -> u32 {
    if src == dst {
        return 0;
    }

    1 + CONVERSION_COSTS
        .iter()
        .filter(|(applies, _)| applies(src, dst))
        .map(|(_, cost)| cost)
        .sum::<u32>()
}
