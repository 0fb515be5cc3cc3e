// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use crate::{
    Result,
    colormatrix::ColorMatrix,
    geometry::{GeometryParams, Layout, overlay_vertices, primary_layout},
    gpu::{CurrentContext, Gpu, Quad, SurfaceSlot},
    port::Port,
};
use log::trace;
use vidpresent_frame::GlApi;

/// Everything a redraw reads. Setters only store values and raise the
/// dirty flags; GPU state is updated at the start of [`Compositor::draw`].
#[derive(Debug, Default)]
pub(crate) struct Compositor {
    /// Index 0 is the video, the rest are overlays.
    pub(crate) ports: Vec<Option<Port>>,
    pub(crate) geometry: GeometryParams,
    pub(crate) layout: Option<Layout>,
    /// Brightness, saturation and contrast.
    pub(crate) adjustment: ColorMatrix,
    pub(crate) slot: SurfaceSlot,
    pub(crate) colormatrix_changed: bool,
    pub(crate) coords_changed: bool,
}

impl Compositor {
    pub(crate) fn primary(&self) -> Option<&Port> {
        self.ports.first().and_then(Option::as_ref)
    }

    pub(crate) fn port(&self, index: usize) -> Option<&Port> {
        self.ports.get(index).and_then(Option::as_ref)
    }

    pub(crate) fn port_mut(&mut self, index: usize) -> Option<&mut Port> {
        self.ports.get_mut(index).and_then(Option::as_mut)
    }

    /// Composites all ports in index order and swaps.
    pub(crate) fn draw(&mut self, gpu: &mut dyn Gpu, api: GlApi) -> Result<()> {
        let mut ctx = CurrentContext::acquire(gpu, api, Some(self.slot))?;
        ctx.begin_frame(
            self.geometry.window_width.max(1),
            self.geometry.window_height.max(1),
        );

        let mut uses_dma = false;
        let (primary, overlays) = match self.ports.split_first_mut() {
            Some((primary, overlays)) => (primary.as_mut(), overlays),
            None => (None, Default::default()),
        };

        let mut primary_format = None;
        if let Some(port) = primary {
            if self.colormatrix_changed {
                port.load_colormatrix(&mut *ctx, &self.adjustment);
            }
            if self.coords_changed || self.layout.is_none() {
                let layout = primary_layout(&port.format, &self.geometry);
                ctx.upload_vertices(&port.vertex_array, &layout.vertices);
                self.layout = Some(layout);
                for overlay in overlays.iter_mut().flatten() {
                    overlay.overlay_changed = true;
                }
            }
            primary_format = Some(port.format);

            if let Some(textures) = port.textures() {
                ctx.draw_quad(&Quad {
                    port: 0,
                    program: port.program(),
                    textures: &textures,
                    vertex_array: &port.vertex_array,
                });
                uses_dma |= port.mode().uses_dma();
            } else {
                trace!("no video frame to draw");
            }
        }

        let mut blending = false;
        for overlay in overlays.iter_mut().flatten() {
            if overlay.overlay_changed {
                overlay.overlay_changed = false;
                overlay.visible = false;
                if let (Some(layout), Some(format), Some(placement)) =
                    (&self.layout, &primary_format, overlay.placement)
                    && overlay.current.is_some()
                    && let Some(vertices) = overlay_vertices(
                        layout,
                        format,
                        &overlay.format,
                        placement.src,
                        placement.dst_x,
                        placement.dst_y,
                    )
                {
                    ctx.upload_vertices(&overlay.vertex_array, &vertices);
                    overlay.visible = true;
                }
            }
            if !overlay.visible {
                continue;
            }
            let Some(textures) = overlay.textures() else {
                continue;
            };

            if !blending {
                ctx.set_blending(true);
                blending = true;
            }
            ctx.draw_quad(&Quad {
                port: overlay.index,
                program: overlay.program(),
                textures: &textures,
                vertex_array: &overlay.vertex_array,
            });
            uses_dma |= overlay.mode().uses_dma();
        }
        if blending {
            ctx.set_blending(false);
        }

        if uses_dma {
            ctx.wait_idle();
        }
        ctx.swap_buffers()?;

        self.colormatrix_changed = false;
        self.coords_changed = false;
        Ok(())
    }
}
