// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use crate::{
    Error, Result,
    catalog::{AccessMode, ImageFormat, Residency},
    colormatrix::ColorMatrix,
    dma::DmaContext,
    gpu::{Gpu, PlaneData, VertexArray},
    shader::{self, Program, ProgramSource, ProgramSpec},
};
use enum_dispatch::enum_dispatch;
use log::{debug, trace, warn};
use std::{
    rc::Rc,
    sync::{Arc, Weak},
};
use vidpresent_frame::{
    DmaBuffer, DrmFourcc, FrameStorage, GlApi, MemFrame, MemoryDomain, PixelFormat, Rect,
    Shuffle, SyncAccess, TextureFrame, VideoFormat, VideoFrame,
};

/// How frames of a port become sampleable textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// Producer textures in the port's API are sampled as they are.
    TextureDirect,
    /// Frames are uploaded into textures owned by the port.
    TextureTransfer,
    /// Producer DMA buffers are imported as external textures.
    DmaImport,
    /// The producer renders into DMA buffers handed out by the port.
    DmaGetFrame,
    /// Frames are copied, reordering bytes, into DMA buffers of the port.
    DmaTransfer,
}

impl TransferMode {
    /// Mode for frames from `source` shown through `entry`.
    pub fn for_entry(entry: &ImageFormat, source: Option<MemoryDomain>) -> TransferMode {
        match (entry.residency, entry.mode) {
            (Residency::Texture(apis), _) => match source {
                Some(MemoryDomain::Gl) if apis.contains(GlApi::Gl) => TransferMode::TextureDirect,
                Some(MemoryDomain::Gles) if apis.contains(GlApi::Gles) => {
                    TransferMode::TextureDirect
                }
                _ => TransferMode::TextureTransfer,
            },
            (Residency::DmaBuf, AccessMode::Map) => match source {
                Some(MemoryDomain::Dma | MemoryDomain::Foreign) => TransferMode::DmaImport,
                _ => TransferMode::DmaGetFrame,
            },
            (Residency::DmaBuf, AccessMode::Transfer) => TransferMode::DmaTransfer,
        }
    }

    pub fn uses_dma(self) -> bool {
        matches!(
            self,
            TransferMode::DmaImport | TransferMode::DmaGetFrame | TransferMode::DmaTransfer
        )
    }

    /// Storage domain of the frames a port in this mode samples.
    pub fn domain(self, api: GlApi) -> MemoryDomain {
        if self.uses_dma() {
            MemoryDomain::Dma
        } else {
            api.into()
        }
    }
}

/// The frame a port shows.
#[derive(Debug, Clone)]
pub(crate) enum Current {
    /// A producer frame; the producer controls its lifetime.
    Borrowed { frame: Weak<VideoFrame>, pts: i64 },
    /// Textures owned by the port's ingestion state.
    Owned { textures: TextureFrame, pts: i64 },
}

impl Current {
    pub(crate) fn textures(&self) -> Option<TextureFrame> {
        match self {
            Current::Borrowed { frame, .. } => match &frame.upgrade()?.storage {
                FrameStorage::Texture(textures) => Some(textures.clone()),
                _ => None,
            },
            Current::Owned { textures, .. } => Some(textures.clone()),
        }
    }

    pub(crate) fn pts(&self) -> i64 {
        match self {
            Current::Borrowed { pts, .. } | Current::Owned { pts, .. } => *pts,
        }
    }
}

#[enum_dispatch]
pub(crate) trait Ingest {
    fn mode(&self) -> TransferMode;

    /// Makes `frame` sampleable. State visible to the compositor only
    /// changes through the returned value.
    fn ingest(
        &mut self,
        gpu: &mut dyn Gpu,
        format: &VideoFormat,
        frame: &Arc<VideoFrame>,
    ) -> Result<Current>;

    /// A buffer for the producer to render the next frame into.
    fn get_frame(&mut self, format: &VideoFormat) -> Option<DmaBuffer>;

    /// Frees everything the handler owns.
    fn release(&mut self, gpu: &mut dyn Gpu);
}

#[enum_dispatch(Ingest)]
#[derive(Debug)]
pub(crate) enum Ingestion {
    TextureDirect,
    TextureTransfer,
    DmaImport,
    DmaGetFrame,
    DmaTransfer,
}

impl Ingestion {
    pub(crate) fn new(
        mode: TransferMode,
        api: GlApi,
        entry: &ImageFormat,
        dma: Option<&Rc<DmaContext>>,
    ) -> Result<Ingestion> {
        let dma = || {
            dma.ok_or_else(|| Error::NotSupported(format!("{mode:?} without a DMA context")))
        };
        let fourcc = || {
            entry
                .dma_fourcc
                .ok_or_else(|| Error::Internal(format!("{mode:?} entry without fourcc")))
        };
        Ok(match mode {
            TransferMode::TextureDirect => TextureDirect { api }.into(),
            TransferMode::TextureTransfer => TextureTransfer::default().into(),
            TransferMode::DmaImport => DmaImport {
                dma: dma()?.clone(),
                imported: None,
            }
            .into(),
            TransferMode::DmaGetFrame => DmaGetFrame {
                targets: DmaTargets::new(dma()?.private(), fourcc()?),
            }
            .into(),
            TransferMode::DmaTransfer => DmaTransfer {
                targets: DmaTargets::new(dma()?.private(), fourcc()?),
            }
            .into(),
        })
    }
}

#[derive(Debug)]
pub(crate) struct TextureDirect {
    api: GlApi,
}

impl Ingest for TextureDirect {
    fn mode(&self) -> TransferMode {
        TransferMode::TextureDirect
    }

    fn ingest(
        &mut self,
        _gpu: &mut dyn Gpu,
        format: &VideoFormat,
        frame: &Arc<VideoFrame>,
    ) -> Result<Current> {
        let FrameStorage::Texture(textures) = &frame.storage else {
            return Err(Error::Transfer(format!(
                "expected a texture frame, got {:?}",
                frame.memory()
            )));
        };
        if textures.api != self.api {
            return Err(Error::Transfer(format!(
                "{:?} textures cannot be sampled by a {:?} port",
                textures.api, self.api
            )));
        }
        if textures.textures.len() != format.pixel_format.num_planes() {
            return Err(Error::Transfer(format!(
                "{} needs {} textures, frame has {}",
                format.pixel_format,
                format.pixel_format.num_planes(),
                textures.textures.len()
            )));
        }
        Ok(Current::Borrowed {
            frame: Arc::downgrade(frame),
            pts: frame.pts,
        })
    }

    fn get_frame(&mut self, _format: &VideoFormat) -> Option<DmaBuffer> {
        None
    }

    fn release(&mut self, _gpu: &mut dyn Gpu) {}
}

/// Two texture sets, the back one receives the next upload.
#[derive(Debug, Default)]
pub(crate) struct TextureTransfer {
    slots: [Option<TextureFrame>; 2],
    back: usize,
}

impl TextureTransfer {
    fn upload(
        &mut self,
        gpu: &mut dyn Gpu,
        format: &VideoFormat,
        planes: &[PlaneData<'_>],
        pts: i64,
    ) -> Result<Current> {
        if planes.len() != format.pixel_format.num_planes() {
            return Err(Error::Transfer(format!(
                "{} needs {} planes, frame has {}",
                format.pixel_format,
                format.pixel_format.num_planes(),
                planes.len()
            )));
        }
        let textures = match &self.slots[self.back] {
            Some(textures) => textures.clone(),
            None => {
                let textures = gpu.create_textures(format)?;
                self.slots[self.back] = Some(textures.clone());
                textures
            }
        };
        gpu.upload_planes(&textures, format, planes)?;
        self.back ^= 1;
        Ok(Current::Owned { textures, pts })
    }

    fn upload_mem(
        &mut self,
        gpu: &mut dyn Gpu,
        format: &VideoFormat,
        mem: &MemFrame,
        pts: i64,
    ) -> Result<Current> {
        mem.check(format)
            .map_err(|e| Error::Transfer(format!("frame does not hold {format}: {e}")))?;
        let planes: Vec<PlaneData<'_>> = mem
            .planes()
            .iter()
            .map(|p| PlaneData {
                data: &p.data,
                stride: p.stride,
            })
            .collect();
        self.upload(gpu, format, &planes, pts)
    }

    fn upload_dma(
        &mut self,
        gpu: &mut dyn Gpu,
        format: &VideoFormat,
        buffer: &DmaBuffer,
        pts: i64,
    ) -> Result<Current> {
        let stored = PixelFormat::from_drm_fourcc(buffer.fourcc);
        if stored != Some((format.pixel_format.limited_range(), Shuffle::None))
            || buffer.width != format.width
            || buffer.height != format.height
        {
            return Err(Error::Transfer(format!(
                "{:?} {}x{} buffer does not hold {format}",
                buffer.fourcc, buffer.width, buffer.height
            )));
        }
        let map = buffer.map(SyncAccess::Read)?;
        let mut planes = Vec::with_capacity(buffer.planes.len());
        for plane in &buffer.planes {
            let data = map
                .get(plane.offset..)
                .ok_or_else(|| Error::Transfer(format!("plane offset {}", plane.offset)))?;
            planes.push(PlaneData {
                data,
                stride: plane.pitch,
            });
        }
        self.upload(gpu, format, &planes, pts)
    }
}

impl Ingest for TextureTransfer {
    fn mode(&self) -> TransferMode {
        TransferMode::TextureTransfer
    }

    fn ingest(
        &mut self,
        gpu: &mut dyn Gpu,
        format: &VideoFormat,
        frame: &Arc<VideoFrame>,
    ) -> Result<Current> {
        match &frame.storage {
            FrameStorage::Mem(mem) => self.upload_mem(gpu, format, mem, frame.pts),
            FrameStorage::Dma(buffer) => self.upload_dma(gpu, format, buffer, frame.pts),
            FrameStorage::Foreign(foreign) => {
                let buffer = foreign.export_dma_buf()?;
                self.upload_dma(gpu, format, &buffer, frame.pts)
            }
            FrameStorage::Texture(textures) => Err(Error::Transfer(format!(
                "cannot transfer {:?} textures",
                textures.api
            ))),
        }
    }

    fn get_frame(&mut self, _format: &VideoFormat) -> Option<DmaBuffer> {
        None
    }

    fn release(&mut self, gpu: &mut dyn Gpu) {
        for textures in self.slots.iter_mut().filter_map(Option::take) {
            gpu.delete_textures(&textures);
        }
        self.back = 0;
    }
}

/// Imports producer buffers through the shared DMA context.
#[derive(Debug)]
pub(crate) struct DmaImport {
    dma: Rc<DmaContext>,
    imported: Option<(DmaBuffer, TextureFrame)>,
}

impl Ingest for DmaImport {
    fn mode(&self) -> TransferMode {
        TransferMode::DmaImport
    }

    fn ingest(
        &mut self,
        gpu: &mut dyn Gpu,
        format: &VideoFormat,
        frame: &Arc<VideoFrame>,
    ) -> Result<Current> {
        let buffer = match &frame.storage {
            FrameStorage::Dma(buffer) => buffer.clone(),
            FrameStorage::Foreign(foreign) => foreign.export_dma_buf()?,
            _ => {
                return Err(Error::Transfer(format!(
                    "cannot import {:?} frames",
                    frame.memory()
                )));
            }
        };
        if !self.dma.supports(buffer.fourcc) {
            return Err(Error::Transfer(format!(
                "{:?} is not importable",
                buffer.fourcc
            )));
        }

        if let Some((last, textures)) = &self.imported
            && last.is_same_buffer(&buffer)
        {
            return Ok(Current::Owned {
                textures: textures.clone(),
                pts: frame.pts,
            });
        }

        let textures = gpu.import_dma(&buffer, format)?;
        if let Some((_, superseded)) = self.imported.replace((buffer, textures.clone())) {
            gpu.delete_textures(&superseded);
        }
        Ok(Current::Owned {
            textures,
            pts: frame.pts,
        })
    }

    fn get_frame(&mut self, _format: &VideoFormat) -> Option<DmaBuffer> {
        None
    }

    fn release(&mut self, gpu: &mut dyn Gpu) {
        if let Some((_, textures)) = self.imported.take() {
            gpu.delete_textures(&textures);
        }
    }
}

#[derive(Debug)]
struct DmaTarget {
    buffer: DmaBuffer,
    textures: Option<TextureFrame>,
}

/// Two DMA buffers of a private context, each imported once.
#[derive(Debug)]
struct DmaTargets {
    dma: DmaContext,
    fourcc: DrmFourcc,
    targets: Vec<DmaTarget>,
    back: usize,
}

impl DmaTargets {
    fn new(dma: DmaContext, fourcc: DrmFourcc) -> Self {
        Self {
            dma,
            fourcc,
            targets: Vec::new(),
            back: 0,
        }
    }

    fn ensure(&mut self, format: &VideoFormat) -> Result<()> {
        if !self.targets.is_empty() {
            return Ok(());
        }
        let mut targets = Vec::with_capacity(2);
        for _ in 0..2 {
            targets.push(DmaTarget {
                buffer: self.dma.acquire(self.fourcc, format.width, format.height)?,
                textures: None,
            });
        }
        debug!(
            "allocated {} {:?} render targets for {format}",
            targets.len(),
            self.fourcc
        );
        self.targets = targets;
        self.back = 0;
        Ok(())
    }

    fn back_buffer(&mut self, format: &VideoFormat) -> Result<DmaBuffer> {
        self.ensure(format)?;
        Ok(self.targets[self.back].buffer.clone())
    }

    fn position(&self, buffer: &DmaBuffer) -> Option<usize> {
        self.targets
            .iter()
            .position(|t| t.buffer.is_same_buffer(buffer))
    }

    fn copy_in(&mut self, format: &VideoFormat, mem: &MemFrame) -> Result<usize> {
        self.ensure(format)?;
        self.targets[self.back]
            .buffer
            .write_from(format, mem)
            .map_err(|e| Error::Transfer(format!("copy into DMA buffer: {e}")))?;
        Ok(self.back)
    }

    fn show(
        &mut self,
        gpu: &mut dyn Gpu,
        format: &VideoFormat,
        index: usize,
        pts: i64,
    ) -> Result<Current> {
        let target = &mut self.targets[index];
        let textures = match &target.textures {
            Some(textures) => textures.clone(),
            None => {
                let textures = gpu.import_dma(&target.buffer, format)?;
                trace!("imported render target {index}");
                target.textures = Some(textures.clone());
                textures
            }
        };
        self.back = (index + 1) % self.targets.len();
        Ok(Current::Owned { textures, pts })
    }

    fn release(&mut self, gpu: &mut dyn Gpu) {
        for target in self.targets.drain(..) {
            if let Some(textures) = target.textures {
                gpu.delete_textures(&textures);
            }
            self.dma.recycle(target.buffer);
        }
        self.dma.clear();
        self.back = 0;
    }
}

/// The producer renders into buffers from [`Ingest::get_frame`]; system
/// memory frames are copied in.
#[derive(Debug)]
pub(crate) struct DmaGetFrame {
    targets: DmaTargets,
}

impl Ingest for DmaGetFrame {
    fn mode(&self) -> TransferMode {
        TransferMode::DmaGetFrame
    }

    fn ingest(
        &mut self,
        gpu: &mut dyn Gpu,
        format: &VideoFormat,
        frame: &Arc<VideoFrame>,
    ) -> Result<Current> {
        let index = match &frame.storage {
            FrameStorage::Dma(buffer) => self.targets.position(buffer).ok_or_else(|| {
                Error::Transfer("DMA frame was not obtained from this port".to_owned())
            })?,
            FrameStorage::Mem(mem) => self.targets.copy_in(format, mem)?,
            _ => {
                return Err(Error::Transfer(format!(
                    "cannot render {:?} frames into DMA buffers",
                    frame.memory()
                )));
            }
        };
        self.targets.show(gpu, format, index, frame.pts)
    }

    fn get_frame(&mut self, format: &VideoFormat) -> Option<DmaBuffer> {
        match self.targets.back_buffer(format) {
            Ok(buffer) => Some(buffer),
            Err(e) => {
                warn!("no DMA render target: {e}");
                None
            }
        }
    }

    fn release(&mut self, gpu: &mut dyn Gpu) {
        self.targets.release(gpu);
    }
}

/// System memory frames are reordered into DMA buffers of a layout the GPU
/// imports.
#[derive(Debug)]
pub(crate) struct DmaTransfer {
    targets: DmaTargets,
}

impl Ingest for DmaTransfer {
    fn mode(&self) -> TransferMode {
        TransferMode::DmaTransfer
    }

    fn ingest(
        &mut self,
        gpu: &mut dyn Gpu,
        format: &VideoFormat,
        frame: &Arc<VideoFrame>,
    ) -> Result<Current> {
        let FrameStorage::Mem(mem) = &frame.storage else {
            return Err(Error::Transfer(format!(
                "cannot copy {:?} frames",
                frame.memory()
            )));
        };
        let index = self.targets.copy_in(format, mem)?;
        self.targets.show(gpu, format, index, frame.pts)
    }

    fn get_frame(&mut self, _format: &VideoFormat) -> Option<DmaBuffer> {
        None
    }

    fn release(&mut self, gpu: &mut dyn Gpu) {
        self.targets.release(gpu);
    }
}

/// Program with and without the colour matrix.
#[derive(Debug)]
pub(crate) struct Programs {
    pub(crate) colormatrix: Program,
    pub(crate) plain: Program,
}

/// Overlay placement: source rectangle and position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placement {
    pub(crate) src: Rect,
    pub(crate) dst_x: i64,
    pub(crate) dst_y: i64,
}

/// One compositing channel. Index 0 is the video, higher indices overlays.
#[derive(Debug)]
pub struct Port {
    pub(crate) index: usize,
    pub(crate) format: VideoFormat,
    pub(crate) api: GlApi,
    pub(crate) entry: ImageFormat,
    pub(crate) ingestion: Ingestion,
    pub(crate) current: Option<Current>,
    pub(crate) programs: Programs,
    pub(crate) vertex_array: VertexArray,
    /// Conversion of the sampled values to RGB.
    pub(crate) format_matrix: ColorMatrix,
    /// The colour matrix program is needed.
    pub(crate) use_colormatrix: bool,
    pub(crate) overlay_changed: bool,
    pub(crate) placement: Option<Placement>,
    /// Some part of the overlay lies inside the video.
    pub(crate) visible: bool,
}

impl Port {
    /// Builds programs and buffers. Needs a current context of `api`.
    pub(crate) fn open(
        gpu: &mut dyn Gpu,
        index: usize,
        format: VideoFormat,
        api: GlApi,
        entry: ImageFormat,
        ingestion: Ingestion,
    ) -> Result<Port> {
        let external = entry.is_dma();
        let planar = !external && format.pixel_format.num_planes() == 3;
        let dialect = shader::dialect(api);

        let colormatrix = gpu.build_program(&ProgramSource::new(
            dialect,
            ProgramSpec {
                planar,
                colormatrix: true,
                external,
            },
        )?)?;
        let plain = match ProgramSource::new(
            dialect,
            ProgramSpec {
                planar,
                colormatrix: false,
                external,
            },
        )
        .and_then(|source| gpu.build_program(&source))
        {
            Ok(program) => program,
            Err(e) => {
                gpu.delete_program(&colormatrix);
                return Err(e);
            }
        };
        let vertex_array = match gpu.create_vertex_array() {
            Ok(vertex_array) => vertex_array,
            Err(e) => {
                gpu.delete_program(&colormatrix);
                gpu.delete_program(&plain);
                return Err(e);
            }
        };

        // external samplers deliver RGB
        let format_matrix = if external {
            ColorMatrix::IDENTITY
        } else {
            ColorMatrix::for_pixel_format(format.pixel_format)
        };

        debug!(
            "port {index}: {format} as {:?} with {api:?}",
            ingestion.mode()
        );
        let mut port = Port {
            index,
            format,
            api,
            entry,
            ingestion,
            current: None,
            programs: Programs { colormatrix, plain },
            vertex_array,
            format_matrix,
            use_colormatrix: false,
            overlay_changed: true,
            placement: None,
            visible: false,
        };
        if index > 0 {
            port.load_colormatrix(gpu, &ColorMatrix::IDENTITY);
        }
        Ok(port)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn format(&self) -> &VideoFormat {
        &self.format
    }

    pub fn mode(&self) -> TransferMode {
        self.ingestion.mode()
    }

    pub fn api(&self) -> GlApi {
        self.api
    }

    /// Storage domain of the shown frame, `None` without a frame.
    pub fn current_domain(&self) -> Option<MemoryDomain> {
        self.current.as_ref().map(|_| self.mode().domain(self.api))
    }

    pub fn current_pts(&self) -> Option<i64> {
        self.current.as_ref().map(Current::pts)
    }

    pub(crate) fn textures(&self) -> Option<TextureFrame> {
        self.current.as_ref().and_then(Current::textures)
    }

    /// Composes `adjustment` with the format matrix and uploads it when it
    /// is not the identity.
    pub(crate) fn load_colormatrix(&mut self, gpu: &mut dyn Gpu, adjustment: &ColorMatrix) {
        let matrix = adjustment.compose(&self.format_matrix);
        self.use_colormatrix = !matrix.is_identity();
        if self.use_colormatrix {
            gpu.upload_colormatrix(&self.programs.colormatrix, &matrix);
        }
    }

    pub(crate) fn program(&self) -> &Program {
        if self.use_colormatrix {
            &self.programs.colormatrix
        } else {
            &self.programs.plain
        }
    }

    /// Shows `frame`, or nothing for `None`. On error the shown frame stays.
    pub(crate) fn set_frame(
        &mut self,
        gpu: &mut dyn Gpu,
        frame: Option<&Arc<VideoFrame>>,
    ) -> Result<()> {
        let Some(frame) = frame else {
            trace!("port {}: cleared", self.index);
            self.current = None;
            self.overlay_changed = true;
            return Ok(());
        };

        if self.index > 0
            && let Some(src) = frame.src_rect
            && src.is_empty()
        {
            trace!("port {}: empty overlay", self.index);
            self.current = None;
            self.overlay_changed = true;
            return Ok(());
        }

        match self.ingestion.ingest(gpu, &self.format, frame) {
            Ok(current) => {
                self.current = Some(current);
                self.placement = Some(Placement {
                    src: frame.src_rect.unwrap_or(Rect::new(
                        0,
                        0,
                        self.format.width,
                        self.format.height,
                    )),
                    dst_x: frame.dst_x,
                    dst_y: frame.dst_y,
                });
                self.overlay_changed = true;
                Ok(())
            }
            Err(e) => {
                warn!("port {}: dropping frame {}: {e}", self.index, frame.pts);
                Err(match e {
                    Error::Transfer(_) => e,
                    e => Error::Transfer(e.to_string()),
                })
            }
        }
    }

    pub(crate) fn get_frame(&mut self) -> Option<DmaBuffer> {
        self.ingestion.get_frame(&self.format)
    }

    /// Frees all GPU resources. The shown frame is dropped first.
    pub(crate) fn close(mut self, gpu: &mut dyn Gpu) {
        self.current = None;
        self.ingestion.release(gpu);
        gpu.delete_program(&self.programs.colormatrix);
        gpu.delete_program(&self.programs.plain);
        gpu.delete_vertex_array(&self.vertex_array);
        debug!("port {}: closed", self.index);
    }
}
