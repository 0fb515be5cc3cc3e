// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use vidpresent_frame::{Orientation, Rect, VideoFormat};

/// Vertex order of the quad, drawn as a triangle strip.
pub const POS_LL: usize = 0;
pub const POS_UL: usize = 1;
pub const POS_LR: usize = 2;
pub const POS_UR: usize = 3;

/// Largest share of the image the crop fractions may remove per axis.
const MAX_CROP: f64 = 0.99;

const EDGE_TOLERANCE: f64 = 1e-6;

/// Vertex layout shared with the vertex shader: `pos` at attribute 0,
/// `tex` at attribute 1.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub tex: [f32; 2],
}

/// Floating point rectangle, y pointing down.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RectF {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl RectF {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    fn right(&self) -> f64 {
        self.x + self.w
    }

    fn bottom(&self) -> f64 {
        self.y + self.h
    }
}

impl From<Rect> for RectF {
    fn from(r: Rect) -> Self {
        RectF::new(r.left as f64, r.top as f64, r.width as f64, r.height as f64)
    }
}

/// Share of the source removed at each edge.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CropFractions {
    pub left: f64,
    pub right: f64,
    pub top: f64,
    pub bottom: f64,
}

/// User controlled geometry of the primary video.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryParams {
    pub crop: CropFractions,
    /// Uniform scale, 1.0 is 100%.
    pub zoom: f64,
    /// Display aspect is multiplied by `2^squeeze`.
    pub squeeze: f64,
    pub maintain_aspect: bool,
    /// Applied after the stream's own orientation.
    pub orientation: Orientation,
    pub window_width: usize,
    pub window_height: usize,
}

impl Default for GeometryParams {
    fn default() -> Self {
        Self {
            crop: CropFractions::default(),
            zoom: 1.0,
            squeeze: 0.0,
            maintain_aspect: true,
            orientation: Orientation::Normal,
            window_width: 0,
            window_height: 0,
        }
    }
}

/// Geometry of the primary video for one window state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Layout {
    /// Visible part of the source, in source pixels.
    pub src: RectF,
    /// Where `src` lands, in pixels of the window before orientation is
    /// applied (axes swapped for transposed orientations).
    pub dst: RectF,
    pub virtual_width: f64,
    pub virtual_height: f64,
    pub orientation: Orientation,
    pub vertices: [Vertex; 4],
}

fn window_dims(params: &GeometryParams) -> (f64, f64) {
    (
        params.window_width.max(1) as f64,
        params.window_height.max(1) as f64,
    )
}

fn crop_source(format: &VideoFormat, crop: &CropFractions) -> RectF {
    let w = format.width.max(1) as f64;
    let h = format.height.max(1) as f64;

    let clamp = |a: f64, b: f64| {
        let a = a.clamp(0.0, MAX_CROP);
        let b = b.clamp(0.0, MAX_CROP);
        let total = a + b;
        if total > MAX_CROP {
            (a * MAX_CROP / total, b * MAX_CROP / total)
        } else {
            (a, b)
        }
    };
    let (left, right) = clamp(crop.left, crop.right);
    let (top, bottom) = clamp(crop.top, crop.bottom);

    RectF::new(
        w * left,
        h * top,
        w * (1.0 - left - right),
        h * (1.0 - top - bottom),
    )
}

/// Clips `dst` to `bounds` and shrinks `src` by the same proportions.
fn clip(src: &mut RectF, dst: &mut RectF, bounds: &RectF) {
    if dst.w <= 0.0 || dst.h <= 0.0 {
        return;
    }
    let sx = src.w / dst.w;
    let sy = src.h / dst.h;

    let left = dst.x.max(bounds.x);
    let top = dst.y.max(bounds.y);
    let right = dst.right().min(bounds.right());
    let bottom = dst.bottom().min(bounds.bottom());

    src.x += (left - dst.x) * sx;
    src.y += (top - dst.y) * sy;
    src.w = (right - left).max(0.0) * sx;
    src.h = (bottom - top).max(0.0) * sy;

    *dst = RectF::new(left, top, (right - left).max(0.0), (bottom - top).max(0.0));
}

/// Builds the quad for `dst` (in a `vw` x `vh` window) sampling `src` of a
/// `tex_w` x `tex_h` texture. Row 0 of the texture is the top image row.
fn quad(src: &RectF, tex_w: f64, tex_h: f64, dst: &RectF, vw: f64, vh: f64) -> [Vertex; 4] {
    let left = (2.0 * dst.x / vw - 1.0) as f32;
    let right = (2.0 * dst.right() / vw - 1.0) as f32;
    let top = (1.0 - 2.0 * dst.y / vh) as f32;
    let bottom = (1.0 - 2.0 * dst.bottom() / vh) as f32;

    let s0 = (src.x / tex_w) as f32;
    let s1 = (src.right() / tex_w) as f32;
    let t_top = (src.y / tex_h) as f32;
    let t_bottom = (src.bottom() / tex_h) as f32;

    let mut vertices = [Vertex::default(); 4];
    vertices[POS_LL] = Vertex {
        pos: [left, bottom],
        tex: [s0, t_bottom],
    };
    vertices[POS_UL] = Vertex {
        pos: [left, top],
        tex: [s0, t_top],
    };
    vertices[POS_LR] = Vertex {
        pos: [right, bottom],
        tex: [s1, t_bottom],
    };
    vertices[POS_UR] = Vertex {
        pos: [right, top],
        tex: [s1, t_top],
    };
    vertices
}

/// Rotates or mirrors the positions of `vertices`, leaving texture
/// coordinates alone.
pub fn orient_vertices(vertices: &mut [Vertex; 4], orientation: Orientation) {
    let m = orientation.matrix();
    for v in vertices.iter_mut() {
        let x = v.pos[0] as f64;
        let y = v.pos[1] as f64;
        v.pos = [
            (m[0][0] * x + m[0][1] * y) as f32,
            (m[1][0] * x + m[1][1] * y) as f32,
        ];
    }
}

/// Computes the primary video layout.
pub fn primary_layout(format: &VideoFormat, params: &GeometryParams) -> Layout {
    let orientation = format.orientation.then(params.orientation);
    let (ww, wh) = window_dims(params);
    let (vw, vh) = if orientation.is_transposed() {
        (wh, ww)
    } else {
        (ww, wh)
    };
    let window = RectF::new(0.0, 0.0, vw, vh);

    let mut src = crop_source(format, &params.crop);
    let mut dst = if params.maintain_aspect && src.w > 0.0 && src.h > 0.0 {
        let aspect = src.w * format.pixel_aspect() / src.h * params.squeeze.exp2();
        let (mut w, mut h) = if vw / vh > aspect {
            (vh * aspect, vh)
        } else {
            (vw, vw / aspect)
        };
        w *= params.zoom;
        h *= params.zoom;
        RectF::new((vw - w) / 2.0, (vh - h) / 2.0, w, h)
    } else {
        window
    };
    clip(&mut src, &mut dst, &window);

    let mut vertices = quad(
        &src,
        format.width.max(1) as f64,
        format.height.max(1) as f64,
        &dst,
        vw,
        vh,
    );
    orient_vertices(&mut vertices, orientation);

    Layout {
        src,
        dst,
        virtual_width: vw,
        virtual_height: vh,
        orientation,
        vertices,
    }
}

impl Layout {
    /// Maps a window pixel to source video coordinates, `None` when the
    /// pixel is outside the video.
    pub fn window_to_video(
        &self,
        window_width: usize,
        window_height: usize,
        x: f64,
        y: f64,
    ) -> Option<(f64, f64)> {
        let nx = 2.0 * x / window_width.max(1) as f64 - 1.0;
        let ny = 1.0 - 2.0 * y / window_height.max(1) as f64;

        // orientation matrices are orthogonal, the transpose inverts them
        let m = self.orientation.matrix();
        let vx = m[0][0] * nx + m[1][0] * ny;
        let vy = m[0][1] * nx + m[1][1] * ny;

        let px = (vx + 1.0) / 2.0 * self.virtual_width;
        let py = (1.0 - vy) / 2.0 * self.virtual_height;
        if self.dst.w <= 0.0
            || self.dst.h <= 0.0
            || px < self.dst.x - EDGE_TOLERANCE
            || py < self.dst.y - EDGE_TOLERANCE
            || px > self.dst.right() + EDGE_TOLERANCE
            || py > self.dst.bottom() + EDGE_TOLERANCE
        {
            return None;
        }

        Some((
            self.src.x + (px - self.dst.x) * self.src.w / self.dst.w,
            self.src.y + (py - self.dst.y) * self.src.h / self.dst.h,
        ))
    }

    /// Maps a rectangle in source video coordinates into the window.
    fn video_to_window(&self, r: &RectF) -> RectF {
        let sx = self.dst.w / self.src.w;
        let sy = self.dst.h / self.src.h;
        RectF::new(
            self.dst.x + (r.x - self.src.x) * sx,
            self.dst.y + (r.y - self.src.y) * sy,
            r.w * sx,
            r.h * sy,
        )
    }
}

/// Computes the quad of an overlay showing `src_rect` of its frame at
/// (`dst_x`, `dst_y`). Overlay coordinates are pixels of the overlay format,
/// scaled onto the primary video. Returns `None` when nothing is visible.
pub fn overlay_vertices(
    primary: &Layout,
    primary_format: &VideoFormat,
    overlay_format: &VideoFormat,
    src_rect: Rect,
    dst_x: i64,
    dst_y: i64,
) -> Option<[Vertex; 4]> {
    if src_rect.is_empty()
        || primary.src.w <= 0.0
        || primary.src.h <= 0.0
        || primary.dst.w <= 0.0
        || primary.dst.h <= 0.0
    {
        return None;
    }

    let ow = overlay_format.width.max(1) as f64;
    let oh = overlay_format.height.max(1) as f64;
    let scale_x = primary_format.width as f64 / ow;
    let scale_y = primary_format.height as f64 / oh;

    let mut src = RectF::from(src_rect);
    let mut video = RectF::new(
        dst_x as f64 * scale_x,
        dst_y as f64 * scale_y,
        src.w * scale_x,
        src.h * scale_y,
    );
    // only the part of the source inside the overlay frame is shown
    clip(&mut video, &mut src, &RectF::new(0.0, 0.0, ow, oh));
    if src.w <= 0.0 || src.h <= 0.0 {
        return None;
    }
    let mut dst = primary.video_to_window(&video);
    clip(&mut src, &mut dst, &primary.dst);
    if dst.w <= 0.0 || dst.h <= 0.0 {
        return None;
    }

    Some(quad(
        &src,
        ow,
        oh,
        &dst,
        primary.virtual_width,
        primary.virtual_height,
    ))
}
