// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use crate::{
    Result,
    colormatrix::ColorMatrix,
    geometry::Vertex,
    shader::{Program, ProgramSource},
};
use std::ops::{BitAnd, BitOr, Deref, DerefMut};
use vidpresent_frame::{DmaBuffer, DrmFourcc, GlApi, TextureFrame, VideoFormat};

/// Set of GL APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ApiMask(u8);

impl ApiMask {
    pub const NONE: ApiMask = ApiMask(0);
    pub const GL: ApiMask = ApiMask(1);
    pub const GLES: ApiMask = ApiMask(2);
    pub const ALL: ApiMask = ApiMask(3);

    pub fn contains(self, api: GlApi) -> bool {
        self.intersects(api.into())
    }

    pub fn intersects(self, other: ApiMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn without(self, other: ApiMask) -> ApiMask {
        ApiMask(self.0 & !other.0)
    }

    pub fn apis(self) -> impl Iterator<Item = GlApi> {
        [GlApi::Gl, GlApi::Gles]
            .into_iter()
            .filter(move |api| self.contains(*api))
    }
}

impl From<GlApi> for ApiMask {
    fn from(api: GlApi) -> Self {
        match api {
            GlApi::Gl => ApiMask::GL,
            GlApi::Gles => ApiMask::GLES,
        }
    }
}

impl BitOr for ApiMask {
    type Output = ApiMask;

    fn bitor(self, rhs: ApiMask) -> ApiMask {
        ApiMask(self.0 | rhs.0)
    }
}

impl BitAnd for ApiMask {
    type Output = ApiMask;

    fn bitand(self, rhs: ApiMask) -> ApiMask {
        ApiMask(self.0 & rhs.0)
    }
}

/// Which window surface is rendered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SurfaceSlot {
    #[default]
    Normal,
    Fullscreen,
}

/// What the created contexts can do.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub apis: ApiMask,
    pub gl_max_texture: usize,
    pub gles_max_texture: usize,
    /// DRM formats the GLES context imports as EGL images.
    pub dma_import_fourccs: Vec<DrmFourcc>,
    /// `samplerExternalOES` is available.
    pub external_sampler: bool,
}

impl Capabilities {
    pub fn max_texture(&self, api: GlApi) -> usize {
        match api {
            GlApi::Gl => self.gl_max_texture,
            GlApi::Gles => self.gles_max_texture,
        }
    }

    pub fn supports_dma(&self) -> bool {
        self.apis.contains(GlApi::Gles)
            && self.external_sampler
            && !self.dma_import_fourccs.is_empty()
    }
}

/// Vertex array object and its vertex buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexArray {
    pub vao: u32,
    pub vbo: u32,
}

/// One plane of pixel data to upload.
#[derive(Debug, Clone, Copy)]
pub struct PlaneData<'a> {
    pub data: &'a [u8],
    /// Bytes per row.
    pub stride: usize,
}

/// Everything needed to draw one port.
#[derive(Debug, Clone, Copy)]
pub struct Quad<'a> {
    pub port: usize,
    pub program: &'a Program,
    pub textures: &'a TextureFrame,
    pub vertex_array: &'a VertexArray,
}

/// GPU commands issued by the pipeline. All calls except context handling
/// assume a context was made current.
pub trait Gpu {
    /// Creates the contexts of `apis` not created yet and reports what they
    /// support. Fails only if none of the requested APIs is usable.
    fn ensure_contexts(&mut self, apis: ApiMask) -> Result<Capabilities>;

    /// Creates a surface for every available native window.
    fn create_window_surfaces(&mut self, api: GlApi) -> Result<()>;

    fn destroy_window_surfaces(&mut self);

    /// Binds the context of `api` with the surface of `slot`, or without a
    /// surface for resource work.
    fn make_current(&mut self, api: GlApi, slot: Option<SurfaceSlot>) -> Result<()>;

    fn release_current(&mut self);

    fn build_program(&mut self, source: &ProgramSource) -> Result<Program>;

    fn delete_program(&mut self, program: &Program);

    fn create_vertex_array(&mut self) -> Result<VertexArray>;

    fn upload_vertices(&mut self, vertex_array: &VertexArray, vertices: &[Vertex; 4]);

    fn delete_vertex_array(&mut self, vertex_array: &VertexArray);

    /// Creates one texture per plane of `format`.
    fn create_textures(&mut self, format: &VideoFormat) -> Result<TextureFrame>;

    fn upload_planes(
        &mut self,
        textures: &TextureFrame,
        format: &VideoFormat,
        planes: &[PlaneData<'_>],
    ) -> Result<()>;

    /// Wraps a DMA buffer in an external texture.
    fn import_dma(&mut self, buffer: &DmaBuffer, format: &VideoFormat) -> Result<TextureFrame>;

    /// Deletes textures created or imported by this GPU.
    fn delete_textures(&mut self, textures: &TextureFrame);

    fn upload_colormatrix(&mut self, program: &Program, matrix: &ColorMatrix);

    /// Sets the viewport and clears to opaque black.
    fn begin_frame(&mut self, width: usize, height: usize);

    /// Alpha blending with `SRC_ALPHA, ONE_MINUS_SRC_ALPHA`.
    fn set_blending(&mut self, enabled: bool);

    fn draw_quad(&mut self, quad: &Quad<'_>);

    /// Blocks until the GPU finished all submitted work.
    fn wait_idle(&mut self);

    fn swap_buffers(&mut self) -> Result<()>;
}

/// A context made current for the lifetime of the guard.
pub struct CurrentContext<'a, G: Gpu + ?Sized = dyn Gpu + 'a> {
    gpu: &'a mut G,
}

impl<'a, G: Gpu + ?Sized> CurrentContext<'a, G> {
    pub fn acquire(gpu: &'a mut G, api: GlApi, slot: Option<SurfaceSlot>) -> Result<Self> {
        gpu.make_current(api, slot)?;
        Ok(Self { gpu })
    }
}

impl<G: Gpu + ?Sized> Deref for CurrentContext<'_, G> {
    type Target = G;

    fn deref(&self) -> &Self::Target {
        self.gpu
    }
}

impl<G: Gpu + ?Sized> DerefMut for CurrentContext<'_, G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.gpu
    }
}

impl<G: Gpu + ?Sized> Drop for CurrentContext<'_, G> {
    fn drop(&mut self) {
        self.gpu.release_current();
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use crate::Error;
    use std::{cell::RefCell, collections::BTreeSet, rc::Rc};

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        EnsureContexts(ApiMask),
        CreateSurfaces(GlApi),
        DestroySurfaces,
        MakeCurrent(GlApi, Option<SurfaceSlot>),
        ReleaseCurrent,
        BuildProgram(u32, ProgramSource),
        DeleteProgram(u32),
        CreateVertexArray(u32),
        UploadVertices(u32, [Vertex; 4]),
        DeleteVertexArray(u32),
        CreateTextures(Vec<u32>),
        Upload(Vec<u32>),
        ImportDma(Vec<u32>),
        DeleteTextures(Vec<u32>),
        UploadColormatrix(u32, ColorMatrix),
        BeginFrame(usize, usize),
        Blend(bool),
        Draw {
            port: usize,
            program: u32,
            colormatrix: bool,
            textures: Vec<u32>,
            vertex_array: u32,
        },
        WaitIdle,
        Swap,
    }

    #[derive(Debug, Default)]
    pub struct GpuState {
        pub calls: Vec<Call>,
        pub caps: Capabilities,
        pub current: Option<GlApi>,
        pub fail_uploads: bool,
        pub fail_imports: bool,
        pub fail_compile: bool,
        pub live_textures: BTreeSet<u32>,
        pub live_programs: BTreeSet<u32>,
        next_id: u32,
    }

    impl GpuState {
        fn id(&mut self) -> u32 {
            self.next_id += 1;
            self.next_id
        }

        pub fn draws(&self) -> Vec<Call> {
            self.calls
                .iter()
                .filter(|c| matches!(c, Call::Draw { .. }))
                .cloned()
                .collect()
        }
    }

    /// Records every command. Clones share the same state.
    #[derive(Debug, Clone)]
    pub struct RecordingGpu {
        pub state: Rc<RefCell<GpuState>>,
    }

    pub fn default_caps() -> Capabilities {
        Capabilities {
            apis: ApiMask::ALL,
            gl_max_texture: 8192,
            gles_max_texture: 4096,
            dma_import_fourccs: vec![
                DrmFourcc::Abgr8888,
                DrmFourcc::Argb8888,
                DrmFourcc::Xbgr8888,
                DrmFourcc::Nv12,
            ],
            external_sampler: true,
        }
    }

    impl RecordingGpu {
        pub fn new(caps: Capabilities) -> Self {
            Self {
                state: Rc::new(RefCell::new(GpuState {
                    caps,
                    ..Default::default()
                })),
            }
        }

        fn record(&self, call: Call) {
            self.state.borrow_mut().calls.push(call);
        }

        fn textures(&self, count: usize, api: GlApi, target: u32) -> TextureFrame {
            let mut state = self.state.borrow_mut();
            let textures: Vec<u32> = (0..count).map(|_| state.id()).collect();
            state.live_textures.extend(textures.iter().copied());
            TextureFrame {
                api,
                target,
                textures,
            }
        }

        fn current_api(&self) -> GlApi {
            self.state.borrow().current.unwrap_or(GlApi::Gles)
        }
    }

    impl Gpu for RecordingGpu {
        fn ensure_contexts(&mut self, apis: ApiMask) -> Result<Capabilities> {
            self.record(Call::EnsureContexts(apis));
            let mut caps = self.state.borrow().caps.clone();
            caps.apis = caps.apis & apis;
            if caps.apis.is_empty() {
                return Err(Error::ContextCreation("no context available".to_owned()));
            }
            Ok(caps)
        }

        fn create_window_surfaces(&mut self, api: GlApi) -> Result<()> {
            self.record(Call::CreateSurfaces(api));
            Ok(())
        }

        fn destroy_window_surfaces(&mut self) {
            self.record(Call::DestroySurfaces);
        }

        fn make_current(&mut self, api: GlApi, slot: Option<SurfaceSlot>) -> Result<()> {
            self.record(Call::MakeCurrent(api, slot));
            self.state.borrow_mut().current = Some(api);
            Ok(())
        }

        fn release_current(&mut self) {
            self.record(Call::ReleaseCurrent);
            self.state.borrow_mut().current = None;
        }

        fn build_program(&mut self, source: &ProgramSource) -> Result<Program> {
            if self.state.borrow().fail_compile {
                return Err(Error::ShaderCompile("0:1(1): error: syntax error".to_owned()));
            }
            let id = self.state.borrow_mut().id();
            self.state.borrow_mut().live_programs.insert(id);
            self.record(Call::BuildProgram(id, source.clone()));
            Ok(Program {
                id,
                api: source.api,
                spec: source.spec,
                uniforms: Default::default(),
            })
        }

        fn delete_program(&mut self, program: &Program) {
            self.state.borrow_mut().live_programs.remove(&program.id);
            self.record(Call::DeleteProgram(program.id));
        }

        fn create_vertex_array(&mut self) -> Result<VertexArray> {
            let vao = self.state.borrow_mut().id();
            let vbo = self.state.borrow_mut().id();
            self.record(Call::CreateVertexArray(vao));
            Ok(VertexArray { vao, vbo })
        }

        fn upload_vertices(&mut self, vertex_array: &VertexArray, vertices: &[Vertex; 4]) {
            self.record(Call::UploadVertices(vertex_array.vao, *vertices));
        }

        fn delete_vertex_array(&mut self, vertex_array: &VertexArray) {
            self.record(Call::DeleteVertexArray(vertex_array.vao));
        }

        fn create_textures(&mut self, format: &VideoFormat) -> Result<TextureFrame> {
            let frame = self.textures(
                format.pixel_format.num_planes(),
                self.current_api(),
                0x0DE1,
            );
            self.record(Call::CreateTextures(frame.textures.clone()));
            Ok(frame)
        }

        fn upload_planes(
            &mut self,
            textures: &TextureFrame,
            _format: &VideoFormat,
            _planes: &[PlaneData<'_>],
        ) -> Result<()> {
            if self.state.borrow().fail_uploads {
                return Err(Error::Transfer("upload failed".to_owned()));
            }
            self.record(Call::Upload(textures.textures.clone()));
            Ok(())
        }

        fn import_dma(&mut self, _buffer: &DmaBuffer, _format: &VideoFormat) -> Result<TextureFrame> {
            if self.state.borrow().fail_imports {
                return Err(Error::Transfer("import failed".to_owned()));
            }
            let frame = self.textures(1, GlApi::Gles, 0x8D65);
            self.record(Call::ImportDma(frame.textures.clone()));
            Ok(frame)
        }

        fn delete_textures(&mut self, textures: &TextureFrame) {
            let mut state = self.state.borrow_mut();
            for t in &textures.textures {
                state.live_textures.remove(t);
            }
            state.calls.push(Call::DeleteTextures(textures.textures.clone()));
        }

        fn upload_colormatrix(&mut self, program: &Program, matrix: &ColorMatrix) {
            self.record(Call::UploadColormatrix(program.id, *matrix));
        }

        fn begin_frame(&mut self, width: usize, height: usize) {
            self.record(Call::BeginFrame(width, height));
        }

        fn set_blending(&mut self, enabled: bool) {
            self.record(Call::Blend(enabled));
        }

        fn draw_quad(&mut self, quad: &Quad<'_>) {
            self.record(Call::Draw {
                port: quad.port,
                program: quad.program.id,
                colormatrix: quad.program.spec.colormatrix,
                textures: quad.textures.textures.clone(),
                vertex_array: quad.vertex_array.vao,
            });
        }

        fn wait_idle(&mut self) {
            self.record(Call::WaitIdle);
        }

        fn swap_buffers(&mut self) -> Result<()> {
            self.record(Call::Swap);
            Ok(())
        }
    }
}
