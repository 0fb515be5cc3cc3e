// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use vidpresent_frame::PixelFormat;

/// Lower end of the brightness, saturation and contrast controls.
pub const ADJUSTMENT_MIN: f64 = -10.0;
/// Upper end of the brightness, saturation and contrast controls.
pub const ADJUSTMENT_MAX: f64 = 10.0;

const LUM_R: f64 = 0.299;
const LUM_G: f64 = 0.587;
const LUM_B: f64 = 0.114;

const IDENTITY_TOLERANCE: f64 = 1e-6;

/// Moves limited range black (16) to zero on all three channels.
const YUV_SHIFT: ColorMatrix = ColorMatrix([
    [1.0, 0.0, 0.0, 0.0, -16.0 / 255.0],
    [0.0, 1.0, 0.0, 0.0, -16.0 / 255.0],
    [0.0, 0.0, 1.0, 0.0, -16.0 / 255.0],
    [0.0, 0.0, 0.0, 1.0, 0.0],
]);

/// Expands limited range Y (219 steps) and UV (224 steps) to 0..1 and
/// centres UV on zero.
const YUV_UNSCALE: ColorMatrix = ColorMatrix([
    [255.0 / 219.0, 0.0, 0.0, 0.0, 0.0],
    [0.0, 255.0 / 224.0, 0.0, 0.0, -0.5],
    [0.0, 0.0, 255.0 / 224.0, 0.0, -0.5],
    [0.0, 0.0, 0.0, 1.0, 0.0],
]);

/// Full range input only needs UV centred.
const YUVJ_UNSCALE: ColorMatrix = ColorMatrix([
    [1.0, 0.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0, -0.5],
    [0.0, 0.0, 1.0, 0.0, -0.5],
    [0.0, 0.0, 0.0, 1.0, 0.0],
]);

/// ITU-R BT.601 YUV to RGB.
const YUV_RGB: ColorMatrix = ColorMatrix([
    [1.0, 0.0, 1.402, 0.0, 0.0],
    [1.0, -0.344136, -0.714136, 0.0, 0.0],
    [1.0, 1.772, 0.0, 0.0, 0.0],
    [0.0, 0.0, 0.0, 1.0, 0.0],
]);

/// Affine RGBA transform. Each row holds four channel weights followed by
/// an offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorMatrix(pub [[f64; 5]; 4]);

impl Default for ColorMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl ColorMatrix {
    pub const IDENTITY: ColorMatrix = ColorMatrix([
        [1.0, 0.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 0.0, 1.0, 0.0],
    ]);

    /// Matrix converting samples of `format` to RGB. RGB formats get the
    /// identity.
    pub fn for_pixel_format(format: PixelFormat) -> ColorMatrix {
        if !format.is_yuv() {
            return Self::IDENTITY;
        }

        if format.is_full_range() {
            YUV_RGB.compose(&YUVJ_UNSCALE)
        } else {
            YUV_RGB.compose(&YUV_UNSCALE).compose(&YUV_SHIFT)
        }
    }

    /// Brightness, saturation and contrast adjustment. Each control runs
    /// from [`ADJUSTMENT_MIN`] to [`ADJUSTMENT_MAX`] with zero as neutral.
    pub fn from_bsc(brightness: f64, saturation: f64, contrast: f64) -> ColorMatrix {
        let range = ADJUSTMENT_MAX - ADJUSTMENT_MIN;
        let b = (brightness - ADJUSTMENT_MIN) / range;
        let s = (saturation - ADJUSTMENT_MIN) / range;
        let c = (contrast - ADJUSTMENT_MIN) / range;

        // c: 0 .. 2, 1 is neutral
        let c = c * 2.0;
        let b = b * 2.0 - 0.5 * (1.0 + c);
        let s = s * 2.0;

        let sr = (1.0 - s) * LUM_R;
        let sg = (1.0 - s) * LUM_G;
        let sb = (1.0 - s) * LUM_B;
        let t = (1.0 - c) / 2.0;

        ColorMatrix([
            [c * (sr + s), c * sg, c * sb, 0.0, b + t],
            [c * sr, c * (sg + s), c * sb, 0.0, b + t],
            [c * sr, c * sg, c * (sb + s), 0.0, b + t],
            [0.0, 0.0, 0.0, 1.0, 0.0],
        ])
    }

    /// Returns `self * inner`: the transform applying `inner` first. The
    /// offset column of `inner` is carried through `self` and `self`'s own
    /// offset is added.
    pub fn compose(&self, inner: &ColorMatrix) -> ColorMatrix {
        let a = &self.0;
        let b = &inner.0;
        let mut out = [[0.0; 5]; 4];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = (0..4).map(|k| a[i][k] * b[k][j]).sum();
            }
            row[4] += a[i][4];
        }
        ColorMatrix(out)
    }

    pub fn is_identity(&self) -> bool {
        self.0.iter().enumerate().all(|(i, row)| {
            row.iter().enumerate().all(|(j, v)| {
                let expected = if i == j { 1.0 } else { 0.0 };
                (v - expected).abs() <= IDENTITY_TOLERANCE
            })
        })
    }

    pub fn apply(&self, rgba: [f64; 4]) -> [f64; 4] {
        let mut out = [0.0; 4];
        for (i, v) in out.iter_mut().enumerate() {
            let row = &self.0[i];
            *v = row[0] * rgba[0] + row[1] * rgba[1] + row[2] * rgba[2] + row[3] * rgba[3] + row[4];
        }
        out
    }

    /// Row-major 4x4 part and offset vector for uploading with
    /// `glUniformMatrix4fv(transpose = GL_TRUE)` and `glUniform4fv`.
    pub fn to_gl(&self) -> ([f32; 16], [f32; 4]) {
        let mut matrix = [0.0; 16];
        let mut offset = [0.0; 4];
        for (i, row) in self.0.iter().enumerate() {
            for j in 0..4 {
                matrix[i * 4 + j] = row[j] as f32;
            }
            offset[i] = row[4] as f32;
        }
        (matrix, offset)
    }
}
