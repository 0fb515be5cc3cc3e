// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

/*!

## vidpresent GL

The `vidpresent_gl` crate draws video frames and overlays into a window
through EGL with desktop OpenGL or OpenGL ES. It covers everything between a
decoded frame and the swapped buffer:

- picking the texture format and transfer path for a stream from the
  formats the GPU supports ([`FormatCatalog`]),
- getting frames onto the GPU by texture upload, by sampling producer
  textures or by importing DMA-buf buffers ([`TransferMode`]),
- colour conversion and brightness, saturation and contrast controls as one
  colour matrix per port ([`ColorMatrix`]),
- cropping, zoom, squeeze and orientation of the video ([`Layout`]),
- compositing overlays with alpha blending on top of the video.

[`VideoOutput`] is the entry point. It talks to the GPU through the [`Gpu`]
trait; [`EglGpu`] implements it with `libEGL` loaded at runtime.

## Environment Variables
- `VIDPRESENT_DISABLE_GL`: if set to `1`, no desktop OpenGL context is
  created.
- `VIDPRESENT_DISABLE_GLES`: if set to `1`, no OpenGL ES context is created.
  This disables DMA-buf import as well.
- `VIDPRESENT_DISABLE_DMA`: if set to `1`, frames are always uploaded into
  textures.
- `VIDPRESENT_PREFER_GLES`: if set to `1`, texture uploads use OpenGL ES
  when both APIs could take the format.
- `VIDPRESENT_GL_DEBUG`: if set to `1`, GL errors are checked after every
  risky call in release builds too.
- `VIDPRESENT_DMA_BACKING`: `memfd` allocates DMA buffers from `memfd`
  instead of the DMA heaps.
- `VIDPRESENT_EGL_LIBRARY`: name of the EGL library, `libEGL.so.1` by
  default.
*/

use compositor::Compositor;
use log::{debug, error, trace, warn};
use port::{Ingestion, Port};
use std::{rc::Rc, sync::Arc};
use vidpresent_frame::{
    DmaBuffer, GlApi, MemoryDomain, Orientation, PixelFormat, VideoFormat, VideoFrame,
};

pub use catalog::{AccessMode, FormatCatalog, FormatQuery, ImageFormat, Residency};
pub use colormatrix::{ADJUSTMENT_MAX, ADJUSTMENT_MIN, ColorMatrix};
pub use config::{DEFAULT_EGL_LIBRARY, OutputConfig};
pub use dma::DmaContext;
pub use error::{Error, Result};
pub use geometry::{CropFractions, GeometryParams, Layout, RectF, Vertex, primary_layout};
pub use gpu::{
    ApiMask, Capabilities, CurrentContext, Gpu, PlaneData, Quad, SurfaceSlot, VertexArray,
};
#[cfg(target_os = "linux")]
#[cfg(feature = "opengl")]
pub use opengl::{EglGpu, NativeWindows};
pub use port::TransferMode;
pub use shader::{
    DesktopGl, EmbeddedGl, Program, ProgramSource, ProgramSpec, ShaderDialect, UniformLocations,
};
pub use state::{OUTPUT_VIDEO_CTX, StateChange, StateValue};

mod catalog;
mod colormatrix;
mod compositor;
mod config;
mod dma;
mod error;
mod geometry;
mod gpu;
#[cfg(target_os = "linux")]
#[cfg(feature = "opengl")]
mod opengl;
mod port;
mod shader;
mod state;

/// Zoom range in percent.
const ZOOM_MIN: f64 = 20.0;
const ZOOM_MAX: f64 = 180.0;

const SQUEEZE_MIN: f64 = -1.0;
const SQUEEZE_MAX: f64 = 1.0;

/// A port of a [`VideoOutput`]. Handle 0 is the video port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortHandle(usize);

impl PortHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// What the producer of a stream can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceFlags {
    /// Frames are delivered in this hardware domain. `None` for system
    /// memory.
    pub hw_domain: Option<MemoryDomain>,
    /// The producer allocates its own frames.
    pub src_alloc: bool,
}

/// Composites one video stream and any number of overlays into a window.
///
/// Not thread safe: all calls must come from the thread owning the window.
/// Frames can be created anywhere and are passed as `Arc<VideoFrame>`.
pub struct VideoOutput {
    gpu: Box<dyn Gpu>,
    config: OutputConfig,
    caps: Option<Capabilities>,
    catalog: FormatCatalog,
    /// Shared by all ports importing producer buffers.
    dma: Option<Rc<DmaContext>>,
    /// API the window surfaces were created for.
    surfaces: Option<GlApi>,
    compositor: Compositor,
    /// Brightness, saturation and contrast.
    bsc: [f64; 3],
    still: bool,
    paused: bool,
}

impl std::fmt::Debug for VideoOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoOutput")
            .field("config", &self.config)
            .field("caps", &self.caps)
            .field("surfaces", &self.surfaces)
            .field("compositor", &self.compositor)
            .field("bsc", &self.bsc)
            .field("still", &self.still)
            .field("paused", &self.paused)
            .finish()
    }
}

impl VideoOutput {
    /// Creates an output drawing through `gpu`. Contexts are created when
    /// the first port opens.
    pub fn new(gpu: Box<dyn Gpu>, config: OutputConfig) -> Self {
        Self {
            gpu,
            config,
            caps: None,
            catalog: FormatCatalog::default(),
            dma: None,
            surfaces: None,
            compositor: Compositor::default(),
            bsc: [0.0; 3],
            still: false,
            paused: false,
        }
    }

    /// Creates an output for `windows` using the system EGL, configured from
    /// the environment.
    #[cfg(target_os = "linux")]
    #[cfg(feature = "opengl")]
    pub fn egl(windows: NativeWindows) -> Result<Self> {
        let config = OutputConfig::from_env();
        let gpu = EglGpu::new(&config, windows)?;
        Ok(Self::new(Box::new(gpu), config))
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// `None` until the first port opened.
    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.caps.as_ref()
    }

    pub fn catalog(&self) -> &FormatCatalog {
        &self.catalog
    }

    fn ensure_contexts(&mut self) -> Result<ApiMask> {
        if let Some(caps) = &self.caps {
            return Ok(caps.apis);
        }
        let mut caps = self
            .gpu
            .ensure_contexts(self.config.apis())
            .inspect_err(|e| error!("no GL context: {e}"))?;
        if self.config.disable_dma {
            debug!("DMA-buf import disabled");
            caps.dma_import_fourccs.clear();
        }
        self.catalog = FormatCatalog::new(&caps);
        self.dma = Some(Rc::new(DmaContext::new(
            self.config.dma_backing,
            caps.dma_import_fourccs.clone(),
        )));
        let apis = caps.apis;
        self.caps = Some(caps);
        Ok(apis)
    }

    /// API of the open ports. All ports draw into the same surface and
    /// share it.
    fn pinned_api(&self) -> Option<GlApi> {
        self.compositor.ports.iter().flatten().map(Port::api).next()
    }

    fn choose_api(
        &self,
        mode: TransferMode,
        entry: &ImageFormat,
        domains: ApiMask,
        source: Option<MemoryDomain>,
    ) -> GlApi {
        match mode {
            TransferMode::TextureDirect if source == Some(MemoryDomain::Gl) => GlApi::Gl,
            TransferMode::TextureDirect => GlApi::Gles,
            mode if mode.uses_dma() => GlApi::Gles,
            _ => {
                let apis = entry.apis() & domains;
                if apis.contains(GlApi::Gl)
                    && !(self.config.prefer_gles && apis.contains(GlApi::Gles))
                {
                    GlApi::Gl
                } else {
                    GlApi::Gles
                }
            }
        }
    }

    fn build_port(
        &mut self,
        index: usize,
        format: &VideoFormat,
        query: FormatQuery,
        source: Option<MemoryDomain>,
    ) -> Result<Port> {
        let selected = self.catalog.select_format(&query)?;
        let entry = *self
            .catalog
            .get(selected)
            .ok_or_else(|| Error::Internal(format!("no catalog entry {selected}")))?;

        // producer frames only fit an entry of their own pixel format
        let source = source.filter(|_| entry.pixel_format == format.pixel_format);
        let mode = TransferMode::for_entry(&entry, source);
        let api = self.choose_api(mode, &entry, query.domains, source);
        let format = VideoFormat {
            pixel_format: entry.pixel_format,
            ..*format
        };
        debug!(
            "port {index}: {} -> catalog entry {selected} ({}), {mode:?} with {api:?}",
            query.pixel_format, entry.pixel_format
        );

        let ingestion = Ingestion::new(mode, api, &entry, self.dma.as_ref())?;
        let mut ctx = CurrentContext::acquire(self.gpu.as_mut(), api, None)?;
        Port::open(&mut *ctx, index, format, api, entry, ingestion)
    }

    fn release_port(&mut self, port: Port) {
        let index = port.index();
        match CurrentContext::acquire(self.gpu.as_mut(), port.api(), None) {
            Ok(mut ctx) => port.close(&mut *ctx),
            Err(e) => warn!("port {index}: no context to release resources: {e}"),
        }
    }

    /// Opens the video port, replacing the previous one.
    ///
    /// When no path carries `format.pixel_format` the port shows a close
    /// substitute. Frames must then be converted to [`Self::port_format`]
    /// before they are pushed; frames in any other layout fail with
    /// [`Error::Transfer`].
    pub fn open_video_port(
        &mut self,
        format: &VideoFormat,
        flags: SourceFlags,
    ) -> Result<PortHandle> {
        if let Some(old) = self.compositor.ports.first_mut().and_then(Option::take) {
            debug!("reopening the video port");
            self.release_port(old);
        }

        let mut domains = self.ensure_contexts()?;
        if let Some(api) = self.pinned_api() {
            domains = domains & api.into();
        }
        match flags.hw_domain {
            Some(MemoryDomain::Gl) => domains = domains & ApiMask::GL,
            Some(MemoryDomain::Gles) => domains = domains & ApiMask::GLES,
            _ => {}
        }
        let allow_direct_import = match flags.hw_domain {
            Some(MemoryDomain::Gl | MemoryDomain::Gles) => false,
            Some(MemoryDomain::Dma | MemoryDomain::Foreign) => true,
            Some(MemoryDomain::Mem) | None => !flags.src_alloc,
        };
        let query = FormatQuery {
            pixel_format: format.pixel_format,
            width: format.width,
            height: format.height,
            domains,
            allow_direct_import,
            is_overlay: false,
        };
        let port = self
            .build_port(0, format, query, flags.hw_domain)
            .inspect_err(|e| error!("cannot open video port for {format}: {e}"))?;

        match self.compositor.ports.first_mut() {
            Some(slot) => *slot = Some(port),
            None => self.compositor.ports.push(Some(port)),
        }
        self.still = format.still;
        self.compositor.layout = None;
        self.compositor.coords_changed = true;
        self.compositor.colormatrix_changed = true;
        for overlay in self.compositor.ports.iter_mut().skip(1).flatten() {
            overlay.overlay_changed = true;
        }
        Ok(PortHandle(0))
    }

    /// Opens an overlay port. Overlays are always taken from system memory
    /// and need an alpha channel; formats without one are shown as RGBA. A
    /// zero size stands for the size of the video.
    pub fn open_overlay_port(
        &mut self,
        format: &VideoFormat,
        flags: SourceFlags,
    ) -> Result<PortHandle> {
        let mut format = *format;
        if format.width == 0 || format.height == 0 {
            let primary = self.compositor.primary().map(|p| *p.format()).ok_or_else(|| {
                Error::NotSupported("overlay without size needs a video port".to_owned())
            })?;
            format.width = primary.width;
            format.height = primary.height;
        }
        if !format.pixel_format.has_alpha() {
            debug!("overlay {} shown as RGBA", format.pixel_format);
            format.pixel_format = PixelFormat::Rgba32;
        }
        if let Some(domain) = flags.hw_domain {
            debug!("overlay frames in {domain:?} are taken from system memory");
        }

        let mut domains = self.ensure_contexts()?;
        if let Some(api) = self.pinned_api() {
            domains = domains & api.into();
        }
        let index = self
            .compositor
            .ports
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, p)| p.is_none())
            .map(|(i, _)| i)
            .unwrap_or(self.compositor.ports.len().max(1));
        let query = FormatQuery {
            pixel_format: format.pixel_format,
            width: format.width,
            height: format.height,
            domains,
            allow_direct_import: !flags.src_alloc,
            is_overlay: true,
        };
        let port = self
            .build_port(index, &format, query, None)
            .inspect_err(|e| error!("cannot open overlay port for {format}: {e}"))?;

        if self.compositor.ports.len() <= index {
            self.compositor.ports.resize_with(index + 1, || None);
        }
        self.compositor.ports[index] = Some(port);
        Ok(PortHandle(index))
    }

    /// Shows `frame` on the port, `None` clears it. Video frames are drawn
    /// right away unless the stream is a still image; overlay frames only
    /// when the video does not move.
    ///
    /// A frame that cannot be transferred is dropped with
    /// [`Error::Transfer`] and the port keeps showing the previous one.
    pub fn push_frame(
        &mut self,
        handle: PortHandle,
        frame: Option<Arc<VideoFrame>>,
    ) -> Result<()> {
        let index = handle.0;
        let port = self
            .compositor
            .port_mut(index)
            .ok_or(Error::InvalidPort(index))?;
        {
            let mut ctx = CurrentContext::acquire(self.gpu.as_mut(), port.api(), None)?;
            port.set_frame(&mut *ctx, frame.as_ref())?;
        }

        let redraw = if index == 0 {
            !self.still
        } else {
            self.still || self.paused
        };
        if redraw {
            self.redraw()?;
        }
        Ok(())
    }

    /// A DMA buffer for the producer to render the next frame of the port
    /// into, `None` unless the port renders into DMA buffers.
    pub fn get_frame(&mut self, handle: PortHandle) -> Option<DmaBuffer> {
        self.compositor.port_mut(handle.0)?.get_frame()
    }

    /// Composites all ports and swaps.
    pub fn redraw(&mut self) -> Result<()> {
        let Some(api) = self.pinned_api() else {
            trace!("no ports to draw");
            return Ok(());
        };
        if self.surfaces != Some(api) {
            if self.surfaces.take().is_some() {
                self.gpu.destroy_window_surfaces();
            }
            self.gpu.create_window_surfaces(api)?;
            self.surfaces = Some(api);
        }
        self.compositor.draw(self.gpu.as_mut(), api)
    }

    fn redraw_if_idle(&mut self) -> Result<()> {
        if self.still || self.paused {
            self.redraw()
        } else {
            Ok(())
        }
    }

    pub fn resize(&mut self, width: usize, height: usize) {
        trace!("window {width}x{height}");
        self.compositor.geometry.window_width = width;
        self.compositor.geometry.window_height = height;
        self.compositor.coords_changed = true;
    }

    /// Each control runs from [`ADJUSTMENT_MIN`] to [`ADJUSTMENT_MAX`], zero
    /// is neutral.
    pub fn set_color_adjustment(&mut self, brightness: f64, saturation: f64, contrast: f64) {
        let clamp = |v: f64| v.clamp(ADJUSTMENT_MIN, ADJUSTMENT_MAX);
        self.bsc = [clamp(brightness), clamp(saturation), clamp(contrast)];
        let [b, s, c] = self.bsc;
        self.compositor.adjustment = ColorMatrix::from_bsc(b, s, c);
        self.compositor.colormatrix_changed = true;
    }

    /// Brightness, saturation and contrast.
    pub fn color_adjustment(&self) -> (f64, f64, f64) {
        let [b, s, c] = self.bsc;
        (b, s, c)
    }

    pub fn set_zoom(&mut self, percent: f64) {
        self.compositor.geometry.zoom = percent.clamp(ZOOM_MIN, ZOOM_MAX) / 100.0;
        self.compositor.coords_changed = true;
    }

    /// Multiplies the display aspect by `2^squeeze`.
    pub fn set_squeeze(&mut self, squeeze: f64) {
        self.compositor.geometry.squeeze = squeeze.clamp(SQUEEZE_MIN, SQUEEZE_MAX);
        self.compositor.coords_changed = true;
    }

    /// Sets the orientation applied on top of the stream's own, numbered
    /// 0 to 7 like the EXIF orientation tag minus one.
    pub fn set_orientation(&mut self, index: u8) -> Result<()> {
        let orientation = Orientation::from_index(index)
            .ok_or_else(|| Error::NotSupported(format!("orientation {index}")))?;
        self.compositor.geometry.orientation = orientation;
        self.compositor.coords_changed = true;
        Ok(())
    }

    pub fn set_crop(&mut self, crop: CropFractions) {
        self.compositor.geometry.crop = crop;
        self.compositor.coords_changed = true;
    }

    pub fn set_maintain_aspect(&mut self, maintain_aspect: bool) {
        self.compositor.geometry.maintain_aspect = maintain_aspect;
        self.compositor.coords_changed = true;
    }

    /// Switches between the normal and the fullscreen window.
    pub fn set_display_mode(&mut self, slot: SurfaceSlot) {
        if self.compositor.slot != slot {
            debug!("display mode {slot:?}");
        }
        self.compositor.slot = slot;
        self.compositor.coords_changed = true;
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn geometry(&self) -> &GeometryParams {
        &self.compositor.geometry
    }

    /// Applies a state variable of the [`OUTPUT_VIDEO_CTX`] context and
    /// redraws when the video does not move. Returns whether the variable
    /// was handled.
    pub fn handle_state(&mut self, ctx: &str, var: &str, value: &StateValue) -> Result<bool> {
        let Some(change) = StateChange::parse(ctx, var, value) else {
            return Ok(false);
        };
        debug!("state {ctx}/{var}: {change:?}");

        let [b, s, c] = self.bsc;
        match change {
            StateChange::Contrast(v) => self.set_color_adjustment(b, s, v),
            StateChange::Saturation(v) => self.set_color_adjustment(b, v, c),
            StateChange::Brightness(v) => self.set_color_adjustment(v, s, c),
            StateChange::Zoom(v) => self.set_zoom(v),
            StateChange::Squeeze(v) => self.set_squeeze(v),
            StateChange::Orientation(o) => self.set_orientation(o.index())?,
            StateChange::Paused(p) => self.set_paused(p),
        }
        self.redraw_if_idle()?;
        Ok(true)
    }

    /// Geometry of the video for the current settings.
    pub fn layout(&self) -> Option<Layout> {
        let primary = self.compositor.primary()?;
        match self.compositor.layout {
            Some(layout) if !self.compositor.coords_changed => Some(layout),
            _ => Some(primary_layout(primary.format(), &self.compositor.geometry)),
        }
    }

    /// Maps a window pixel to video coordinates, `None` outside the video.
    pub fn window_to_video(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let geometry = &self.compositor.geometry;
        self.layout()?
            .window_to_video(geometry.window_width, geometry.window_height, x, y)
    }

    pub fn port_mode(&self, handle: PortHandle) -> Option<TransferMode> {
        self.compositor.port(handle.0).map(Port::mode)
    }

    /// Format frames of the port are shown in.
    pub fn port_format(&self, handle: PortHandle) -> Option<VideoFormat> {
        self.compositor.port(handle.0).map(|p| *p.format())
    }

    pub fn port_api(&self, handle: PortHandle) -> Option<GlApi> {
        self.compositor.port(handle.0).map(Port::api)
    }

    /// Storage domain of the frame the port shows.
    pub fn current_domain(&self, handle: PortHandle) -> Option<MemoryDomain> {
        self.compositor.port(handle.0)?.current_domain()
    }

    pub fn current_pts(&self, handle: PortHandle) -> Option<i64> {
        self.compositor.port(handle.0)?.current_pts()
    }

    pub fn close_port(&mut self, handle: PortHandle) -> Result<()> {
        let index = handle.0;
        let port = self
            .compositor
            .ports
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(Error::InvalidPort(index))?;
        debug!("closing port {index}");
        self.release_port(port);
        if index == 0 {
            self.still = false;
            self.compositor.layout = None;
        }
        while self.compositor.ports.len() > 1
            && self.compositor.ports.last().is_some_and(Option::is_none)
        {
            self.compositor.ports.pop();
        }
        Ok(())
    }

    /// Closes all ports and the window surfaces. The output can be reused
    /// afterwards.
    pub fn close(&mut self) {
        let ports: Vec<Port> = self.compositor.ports.drain(..).flatten().collect();
        for port in ports {
            self.release_port(port);
        }
        if self.surfaces.take().is_some() {
            self.gpu.destroy_window_surfaces();
        }
        if let Some(dma) = &self.dma {
            dma.clear();
        }
        self.compositor.layout = None;
        self.compositor.geometry.orientation = Orientation::Normal;
        self.compositor.coords_changed = true;
        self.still = false;
    }
}

impl Drop for VideoOutput {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod output_tests {
    use super::*;
    use crate::gpu::recording::{Call, GpuState, RecordingGpu, default_caps};
    use std::cell::RefCell;
    use vidpresent_frame::{FrameStorage, MemFrame, TextureFrame};

    #[ctor::ctor]
    fn init() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    fn output() -> (VideoOutput, Rc<RefCell<GpuState>>) {
        output_with(OutputConfig::default())
    }

    fn output_with(config: OutputConfig) -> (VideoOutput, Rc<RefCell<GpuState>>) {
        let gpu = RecordingGpu::new(default_caps());
        let state = gpu.state.clone();
        let mut output = VideoOutput::new(Box::new(gpu), config);
        output.resize(640, 480);
        (output, state)
    }

    fn mem_frame(format: &VideoFormat, pts: i64) -> Arc<VideoFrame> {
        VideoFrame::new(FrameStorage::Mem(MemFrame::new(format)), pts).into_shared()
    }

    const MEM: SourceFlags = SourceFlags {
        hw_domain: None,
        src_alloc: true,
    };

    fn position(state: &GpuState, pred: impl Fn(&Call) -> bool) -> usize {
        state.calls.iter().position(pred).unwrap()
    }

    fn swaps(state: &Rc<RefCell<GpuState>>) -> usize {
        state
            .borrow()
            .calls
            .iter()
            .filter(|c| **c == Call::Swap)
            .count()
    }

    #[test]
    fn test_yuv_video_uses_colormatrix() {
        let (mut output, state) = output();
        let format = VideoFormat::new(PixelFormat::Yuv420P, 640, 480);
        let port = output.open_video_port(&format, MEM).unwrap();
        assert_eq!(port.index(), 0);
        assert_eq!(output.port_mode(port), Some(TransferMode::TextureTransfer));
        assert_eq!(output.port_api(port), Some(GlApi::Gl));

        output.push_frame(port, Some(mem_frame(&format, 1))).unwrap();

        let layout = output.layout().unwrap();
        assert!(layout.dst.x.abs() < 1e-9);
        assert!(layout.dst.y.abs() < 1e-9);
        assert!((layout.dst.w - 640.0).abs() < 1e-9);
        assert!((layout.dst.h - 480.0).abs() < 1e-9);

        let state = state.borrow();
        let draws = state.draws();
        assert_eq!(draws.len(), 1);
        assert!(matches!(
            &draws[0],
            Call::Draw {
                port: 0,
                colormatrix: true,
                textures,
                ..
            } if textures.len() == 3
        ));
        assert!(
            state
                .calls
                .iter()
                .any(|c| matches!(c, Call::UploadColormatrix(..)))
        );
        assert_eq!(state.calls.last(), Some(&Call::ReleaseCurrent));
        assert!(state.calls.contains(&Call::CreateSurfaces(GlApi::Gl)));
    }

    #[test]
    fn test_gpu_textures_sampled_directly() {
        let (mut output, state) = output();
        let format = VideoFormat::new(PixelFormat::Rgba32, 320, 240);
        let port = output
            .open_video_port(
                &format,
                SourceFlags {
                    hw_domain: Some(MemoryDomain::Gles),
                    src_alloc: true,
                },
            )
            .unwrap();
        assert_eq!(output.port_mode(port), Some(TransferMode::TextureDirect));
        assert_eq!(output.port_api(port), Some(GlApi::Gles));

        let frame = VideoFrame::new(
            FrameStorage::Texture(TextureFrame {
                api: GlApi::Gles,
                target: 0x0DE1,
                textures: vec![100],
            }),
            1,
        )
        .into_shared();
        output.push_frame(port, Some(frame.clone())).unwrap();
        assert_eq!(output.current_domain(port), Some(MemoryDomain::Gles));

        {
            let state = state.borrow();
            let draws = state.draws();
            assert_eq!(draws.len(), 1);
            assert!(matches!(
                &draws[0],
                Call::Draw {
                    port: 0,
                    colormatrix: false,
                    textures,
                    ..
                } if *textures == vec![100]
            ));
            assert!(
                !state
                    .calls
                    .iter()
                    .any(|c| matches!(c, Call::UploadColormatrix(..) | Call::Upload(_)))
            );
        }

        // the producer owns the frame, once it is gone there is nothing to draw
        drop(frame);
        output.redraw().unwrap();
        assert_eq!(state.borrow().draws().len(), 1);
        assert_eq!(swaps(&state), 2);
    }

    #[test]
    fn test_overlays_drawn_after_video() {
        let (mut output, state) = output();
        let format = VideoFormat::new(PixelFormat::Rgb24, 640, 480);
        let video = output.open_video_port(&format, MEM).unwrap();
        let overlay = output
            .open_overlay_port(&VideoFormat::new(PixelFormat::Rgba32, 0, 0), MEM)
            .unwrap();
        assert_eq!(overlay.index(), 1);
        assert_eq!(
            output.port_format(overlay),
            Some(VideoFormat::new(PixelFormat::Rgba32, 640, 480))
        );

        let overlay_format = output.port_format(overlay).unwrap();
        for pts in 0..2 {
            let mut mem = MemFrame::new(&overlay_format);
            for px in mem.planes_mut()[0].data.chunks_exact_mut(4) {
                px.copy_from_slice(&[255, 0, 0, 128]);
            }
            let frame = VideoFrame::new(FrameStorage::Mem(mem), pts).into_shared();
            output.push_frame(overlay, Some(frame)).unwrap();
        }
        // a moving video draws overlays with its next frame
        assert!(state.borrow().draws().is_empty());

        output.push_frame(video, Some(mem_frame(&format, 5))).unwrap();

        let state = state.borrow();
        let draws: Vec<usize> = state
            .draws()
            .iter()
            .map(|c| match c {
                Call::Draw { port, .. } => *port,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(draws, vec![0, 1]);

        let video_draw = position(&state, |c| matches!(c, Call::Draw { port: 0, .. }));
        let blend_on = position(&state, |c| *c == Call::Blend(true));
        let overlay_draw = position(&state, |c| matches!(c, Call::Draw { port: 1, .. }));
        let blend_off = position(&state, |c| *c == Call::Blend(false));
        let swap = position(&state, |c| *c == Call::Swap);
        assert!(video_draw < blend_on);
        assert!(blend_on < overlay_draw);
        assert!(overlay_draw < blend_off);
        assert!(blend_off < swap);
    }

    #[test]
    fn test_failed_transfer_keeps_previous_frame() {
        let (mut output, state) = output();
        let format = VideoFormat::new(PixelFormat::Rgba32, 64, 64);
        let port = output.open_video_port(&format, MEM).unwrap();
        for pts in 1..=2 {
            output.push_frame(port, Some(mem_frame(&format, pts))).unwrap();
        }

        state.borrow_mut().fail_uploads = true;
        let result = output.push_frame(port, Some(mem_frame(&format, 3)));
        assert!(matches!(result, Err(Error::Transfer(_))));
        assert_eq!(output.current_pts(port), Some(2));
        assert_eq!(swaps(&state), 2);

        // later frames are shown again
        state.borrow_mut().fail_uploads = false;
        output.push_frame(port, Some(mem_frame(&format, 4))).unwrap();
        assert_eq!(output.current_pts(port), Some(4));
        assert_eq!(swaps(&state), 3);
    }

    #[test]
    fn test_domain_stable_for_port_lifetime() {
        let (mut output, _state) = output();
        let format = VideoFormat::new(PixelFormat::Rgba32, 64, 64);
        let port = output.open_video_port(&format, MEM).unwrap();
        assert_eq!(output.current_domain(port), None);

        output.push_frame(port, Some(mem_frame(&format, 1))).unwrap();
        let domain = output.current_domain(port);
        assert_eq!(domain, Some(MemoryDomain::Gl));

        let texture = VideoFrame::new(
            FrameStorage::Texture(TextureFrame {
                api: GlApi::Gl,
                target: 0x0DE1,
                textures: vec![9],
            }),
            2,
        )
        .into_shared();
        assert!(output.push_frame(port, Some(texture)).is_err());
        assert_eq!(output.current_domain(port), domain);
        assert_eq!(output.port_mode(port), Some(TransferMode::TextureTransfer));

        output.push_frame(port, Some(mem_frame(&format, 3))).unwrap();
        assert_eq!(output.current_domain(port), domain);
    }

    #[test]
    fn test_reopen_releases_old_port() {
        let (mut output, state) = output();
        let format = VideoFormat::new(PixelFormat::Yuv420P, 64, 64);
        let port = output.open_video_port(&format, MEM).unwrap();
        output.push_frame(port, Some(mem_frame(&format, 1))).unwrap();

        let format = VideoFormat::new(PixelFormat::Rgba32, 32, 32);
        let port = output.open_video_port(&format, MEM).unwrap();
        assert_eq!(port.index(), 0);
        assert_eq!(output.current_pts(port), None);

        let state = state.borrow();
        assert!(state.live_textures.is_empty());
        assert_eq!(state.live_programs.len(), 2);
    }

    #[test]
    fn test_context_failure() {
        let (mut output, _state) = output_with(OutputConfig {
            disable_gl: true,
            disable_gles: true,
            ..Default::default()
        });
        let format = VideoFormat::new(PixelFormat::Rgba32, 64, 64);
        assert!(matches!(
            output.open_video_port(&format, MEM),
            Err(Error::ContextCreation(_))
        ));
    }

    #[test]
    fn test_open_failures() {
        let (mut output, state) = output();
        let huge = VideoFormat::new(PixelFormat::Rgba32, 10000, 10000);
        assert!(matches!(
            output.open_video_port(&huge, MEM),
            Err(Error::FormatSelection(_))
        ));

        state.borrow_mut().fail_compile = true;
        let format = VideoFormat::new(PixelFormat::Rgba32, 64, 64);
        assert!(matches!(
            output.open_video_port(&format, MEM),
            Err(Error::ShaderCompile(_))
        ));
        assert_eq!(output.port_mode(PortHandle(0)), None);
        assert_eq!(state.borrow().current, None);

        assert!(matches!(
            output.open_overlay_port(&VideoFormat::new(PixelFormat::Rgba32, 0, 0), MEM),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            output.push_frame(PortHandle(3), None),
            Err(Error::InvalidPort(3))
        ));
    }

    #[test]
    fn test_overlay_follows_video_api() {
        let (mut output, _state) = output();
        let format = VideoFormat::new(PixelFormat::Rgba32, 320, 240);
        let video = output
            .open_video_port(
                &format,
                SourceFlags {
                    hw_domain: Some(MemoryDomain::Gles),
                    src_alloc: true,
                },
            )
            .unwrap();
        let overlay = output
            .open_overlay_port(
                &VideoFormat::new(PixelFormat::Rgb24, 100, 50),
                SourceFlags {
                    hw_domain: Some(MemoryDomain::Gl),
                    src_alloc: true,
                },
            )
            .unwrap();
        assert_eq!(output.port_api(video), Some(GlApi::Gles));
        assert_eq!(output.port_api(overlay), Some(GlApi::Gles));
        assert_eq!(output.port_mode(overlay), Some(TransferMode::TextureTransfer));
        assert_eq!(
            output.port_format(overlay).map(|f| f.pixel_format),
            Some(PixelFormat::Rgba32)
        );

        let second = output
            .open_overlay_port(&VideoFormat::new(PixelFormat::Rgba32, 10, 10), MEM)
            .unwrap();
        assert_eq!(second.index(), 2);
        output.close_port(overlay).unwrap();
        let third = output
            .open_overlay_port(&VideoFormat::new(PixelFormat::Rgba32, 10, 10), MEM)
            .unwrap();
        assert_eq!(third.index(), 1);
    }

    #[test]
    fn test_still_video_redraws_on_overlay() {
        let (mut output, state) = output();
        let format = VideoFormat::new(PixelFormat::Rgb24, 64, 64).with_still(true);
        let video = output.open_video_port(&format, MEM).unwrap();
        let overlay = output
            .open_overlay_port(&VideoFormat::new(PixelFormat::Rgba32, 64, 64), MEM)
            .unwrap();

        output.push_frame(video, Some(mem_frame(&format, 0))).unwrap();
        assert_eq!(swaps(&state), 0);

        let overlay_format = output.port_format(overlay).unwrap();
        output
            .push_frame(overlay, Some(mem_frame(&overlay_format, 1)))
            .unwrap();
        assert_eq!(swaps(&state), 1);
        assert_eq!(state.borrow().draws().len(), 2);

        output.push_frame(overlay, None).unwrap();
        assert_eq!(swaps(&state), 2);
        assert_eq!(state.borrow().draws().len(), 3);
    }

    #[test]
    fn test_state_changes() {
        let (mut output, state) = output();
        let format = VideoFormat::new(PixelFormat::Rgba32, 640, 480);
        let video = output.open_video_port(&format, MEM).unwrap();
        output.push_frame(video, Some(mem_frame(&format, 0))).unwrap();
        assert_eq!(swaps(&state), 1);

        assert!(
            !output
                .handle_state("ov", "title", &StateValue::Int(0))
                .unwrap()
        );
        assert!(
            !output
                .handle_state("player", "zoom", &StateValue::Float(150.0))
                .unwrap()
        );

        // playing video picks the change up with the next frame
        assert!(
            output
                .handle_state("ov", "zoom", &StateValue::Float(150.0))
                .unwrap()
        );
        assert_eq!(swaps(&state), 1);
        let layout = output.layout().unwrap();
        assert!((layout.src.w - 640.0 / 1.5).abs() < 1e-6);

        assert!(
            output
                .handle_state("ov", "paused", &StateValue::Bool(true))
                .unwrap()
        );
        assert_eq!(swaps(&state), 2);
        assert!(
            output
                .handle_state("ov", "brightness", &StateValue::Float(2.0))
                .unwrap()
        );
        assert_eq!(swaps(&state), 3);
        assert_eq!(output.color_adjustment(), (2.0, 0.0, 0.0));
        assert!(matches!(
            state.borrow().draws().last(),
            Some(Call::Draw {
                colormatrix: true,
                ..
            })
        ));

        assert!(
            output
                .handle_state("ov", "orientation", &StateValue::Int(2))
                .unwrap()
        );
        assert_eq!(output.geometry().orientation, Orientation::Rot180Cw);
    }

    #[test]
    fn test_colormatrix_toggles_program() {
        let (mut output, state) = output();
        let format = VideoFormat::new(PixelFormat::Rgba32, 64, 64);
        let video = output.open_video_port(&format, MEM).unwrap();
        output.push_frame(video, Some(mem_frame(&format, 0))).unwrap();

        output.set_color_adjustment(0.0, 20.0, 0.0);
        assert_eq!(output.color_adjustment(), (0.0, ADJUSTMENT_MAX, 0.0));
        output.redraw().unwrap();
        output.set_color_adjustment(0.0, 0.0, 0.0);
        output.redraw().unwrap();

        let flags: Vec<bool> = state
            .borrow()
            .draws()
            .iter()
            .map(|c| match c {
                Call::Draw { colormatrix, .. } => *colormatrix,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(flags, vec![false, true, false]);
    }

    #[test]
    fn test_dirty_flags_are_independent() {
        let (mut output, state) = output();
        let format = VideoFormat::new(PixelFormat::Yuv420P, 320, 240);
        let video = output.open_video_port(&format, MEM).unwrap();
        output.push_frame(video, Some(mem_frame(&format, 0))).unwrap();

        let uploads = |from: usize| {
            let state = state.borrow();
            let calls = &state.calls[from..];
            (
                calls
                    .iter()
                    .filter(|c| matches!(c, Call::UploadColormatrix(..)))
                    .count(),
                calls
                    .iter()
                    .filter(|c| matches!(c, Call::UploadVertices(..)))
                    .count(),
            )
        };

        let start = state.borrow().calls.len();
        output.set_color_adjustment(1.0, 0.0, 0.0);
        output.redraw().unwrap();
        assert_eq!(uploads(start), (1, 0));

        let start = state.borrow().calls.len();
        output.resize(800, 600);
        output.redraw().unwrap();
        assert_eq!(uploads(start), (0, 1));
    }

    #[test]
    fn test_substitute_format_expects_converted_frames() {
        let (mut output, state) = output_with(OutputConfig {
            disable_gles: true,
            ..Default::default()
        });
        let format = VideoFormat::new(PixelFormat::Nv12, 64, 48);
        let video = output.open_video_port(&format, MEM).unwrap();
        let shown = output.port_format(video).unwrap();
        assert_ne!(shown.pixel_format, PixelFormat::Nv12);
        assert_eq!((shown.width, shown.height), (64, 48));

        assert!(matches!(
            output.push_frame(video, Some(mem_frame(&format, 0))),
            Err(Error::Transfer(_))
        ));
        assert_eq!(output.current_pts(video), None);
        assert!(state.borrow().draws().is_empty());

        output.push_frame(video, Some(mem_frame(&shown, 1))).unwrap();
        assert_eq!(output.current_pts(video), Some(1));
    }

    #[test]
    fn test_redraw_is_repeatable() {
        let (mut output, state) = output();
        let format = VideoFormat::new(PixelFormat::Yuv422P, 320, 240);
        let video = output.open_video_port(&format, MEM).unwrap();
        output.push_frame(video, Some(mem_frame(&format, 0))).unwrap();

        let start = state.borrow().calls.len();
        output.redraw().unwrap();
        let first = state.borrow().calls[start..].to_vec();
        let start = state.borrow().calls.len();
        output.redraw().unwrap();
        let second = state.borrow().calls[start..].to_vec();
        assert_eq!(first, second);
        assert!(
            !first
                .iter()
                .any(|c| matches!(c, Call::UploadVertices(..) | Call::UploadColormatrix(..)))
        );
    }

    #[test]
    fn test_geometry_controls() {
        let (mut output, state) = output();
        assert_eq!(output.layout(), None);
        assert_eq!(output.window_to_video(10.0, 10.0), None);

        let format = VideoFormat::new(PixelFormat::Rgba32, 320, 240);
        let video = output.open_video_port(&format, MEM).unwrap();
        output.push_frame(video, Some(mem_frame(&format, 0))).unwrap();

        let (x, y) = output.window_to_video(320.0, 240.0).unwrap();
        assert!((x - 160.0).abs() < 1e-6);
        assert!((y - 120.0).abs() < 1e-6);

        output.set_zoom(1000.0);
        assert!((output.geometry().zoom - 1.8).abs() < 1e-9);
        output.set_squeeze(-3.0);
        assert_eq!(output.geometry().squeeze, -1.0);
        assert!(output.set_orientation(8).is_err());
        output.set_orientation(1).unwrap();
        output.set_crop(CropFractions {
            left: 0.25,
            ..Default::default()
        });
        output.set_maintain_aspect(false);
        let layout = output.layout().unwrap();
        assert!((layout.src.x - 80.0).abs() < 1e-6);
        assert_eq!(layout.orientation, Orientation::Rot90Cw);
        assert!((layout.dst.w - 480.0).abs() < 1e-9);

        output.set_display_mode(SurfaceSlot::Fullscreen);
        output.redraw().unwrap();
        assert!(
            state
                .borrow()
                .calls
                .contains(&Call::MakeCurrent(GlApi::Gl, Some(SurfaceSlot::Fullscreen)))
        );
    }

    #[test]
    fn test_close_releases_everything() {
        let (mut output, state) = output();
        let format = VideoFormat::new(PixelFormat::Yuv420P, 64, 64);
        let video = output.open_video_port(&format, MEM).unwrap();
        let overlay = output
            .open_overlay_port(&VideoFormat::new(PixelFormat::Rgba32, 16, 16), MEM)
            .unwrap();
        output.push_frame(video, Some(mem_frame(&format, 0))).unwrap();
        let overlay_format = output.port_format(overlay).unwrap();
        output
            .push_frame(overlay, Some(mem_frame(&overlay_format, 0)))
            .unwrap();
        output.set_orientation(3).unwrap();

        output.close();
        {
            let state = state.borrow();
            assert!(state.live_textures.is_empty());
            assert!(state.live_programs.is_empty());
            assert!(state.calls.contains(&Call::DestroySurfaces));
        }
        assert_eq!(output.geometry().orientation, Orientation::Normal);
        assert_eq!(output.port_mode(video), None);
        assert!(matches!(
            output.close_port(overlay),
            Err(Error::InvalidPort(1))
        ));

        // usable again
        let video = output.open_video_port(&format, MEM).unwrap();
        output.push_frame(video, Some(mem_frame(&format, 1))).unwrap();
        assert_eq!(output.current_pts(video), Some(1));
    }

    #[test]
    fn test_disable_dma() {
        let (mut output, _state) = output_with(OutputConfig {
            disable_dma: true,
            ..Default::default()
        });
        let format = VideoFormat::new(PixelFormat::Rgba32, 64, 64);
        let video = output
            .open_video_port(
                &format,
                SourceFlags {
                    hw_domain: Some(MemoryDomain::Dma),
                    src_alloc: true,
                },
            )
            .unwrap();
        assert_eq!(output.port_mode(video), Some(TransferMode::TextureTransfer));
        assert!(!output.catalog().entries().iter().any(|e| e.is_dma()));
    }

    #[cfg(target_os = "linux")]
    mod dma {
        use super::*;
        use vidpresent_frame::{DmaBacking, DrmFourcc};

        fn memfd_output() -> (VideoOutput, Rc<RefCell<GpuState>>) {
            output_with(OutputConfig {
                dma_backing: DmaBacking::Memfd,
                ..Default::default()
            })
        }

        #[test]
        fn test_dma_import_waits_for_gpu() {
            let (mut output, state) = memfd_output();
            let format = VideoFormat::new(PixelFormat::Rgba32, 64, 64);
            let video = output
                .open_video_port(
                    &format,
                    SourceFlags {
                        hw_domain: Some(MemoryDomain::Dma),
                        src_alloc: true,
                    },
                )
                .unwrap();
            assert_eq!(output.port_mode(video), Some(TransferMode::DmaImport));
            assert_eq!(output.port_api(video), Some(GlApi::Gles));

            let buffer = DmaBuffer::allocate(DmaBacking::Memfd, DrmFourcc::Abgr8888, 64, 64).unwrap();
            let frame = VideoFrame::new(FrameStorage::Dma(buffer), 1).into_shared();
            output.push_frame(video, Some(frame)).unwrap();
            assert_eq!(output.current_domain(video), Some(MemoryDomain::Dma));

            let state = state.borrow();
            assert!(state.calls.iter().any(|c| matches!(c, Call::ImportDma(_))));
            let wait = position(&state, |c| *c == Call::WaitIdle);
            let swap = position(&state, |c| *c == Call::Swap);
            assert!(wait < swap);
        }

        #[test]
        fn test_render_targets_for_producer() {
            let (mut output, state) = memfd_output();
            let format = VideoFormat::new(PixelFormat::Rgba32, 32, 32);
            let video = output
                .open_video_port(
                    &format,
                    SourceFlags {
                        hw_domain: None,
                        src_alloc: false,
                    },
                )
                .unwrap();
            assert_eq!(output.port_mode(video), Some(TransferMode::DmaGetFrame));

            let buffer = output.get_frame(video).unwrap();
            assert_eq!(buffer.fourcc, DrmFourcc::Abgr8888);
            let frame = VideoFrame::new(FrameStorage::Dma(buffer), 7).into_shared();
            output.push_frame(video, Some(frame)).unwrap();
            assert_eq!(output.current_pts(video), Some(7));

            output.close();
            assert!(state.borrow().live_textures.is_empty());
        }
    }
}
