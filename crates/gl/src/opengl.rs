// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

#![cfg(target_os = "linux")]
#![cfg(feature = "opengl")]

use crate::{
    Error, Result,
    colormatrix::ColorMatrix,
    config::OutputConfig,
    geometry::Vertex,
    gpu::{ApiMask, Capabilities, CurrentContext, Gpu, PlaneData, Quad, SurfaceSlot, VertexArray},
    shader::{
        ATTRIB_POS, ATTRIB_TEX, COLORMATRIX_UNIFORM, COLOROFFSET_UNIFORM, FRAG_OUTPUT,
        FRAME_UNIFORMS, Program, ProgramSource, UniformLocations,
    },
};
use khronos_egl::{self as egl, Attrib, Display, EGL1_4};
use log::{debug, error, trace, warn};
use std::{
    collections::{BTreeSet, HashMap},
    ffi::{CStr, CString, c_char, c_void},
    os::fd::AsRawFd,
    ptr::{null, null_mut},
    rc::Rc,
    sync::Once,
};
use vidpresent_frame::{DmaBuffer, DrmFourcc, GlApi, PixelFormat, TextureFrame, VideoFormat};

macro_rules! function {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);

        // Find and cut the rest of the path
        match &name[..name.len() - 3].rfind(':') {
            Some(pos) => &name[pos + 1..name.len() - 3],
            None => &name[..name.len() - 3],
        }
    }};
}

type Egl = egl::Instance<egl::Dynamic<libloading::Library, EGL1_4>>;

type BindFragDataLocationFn = unsafe extern "system" fn(u32, u32, *const c_char);

const TEXTURE_EXTERNAL_OES: u32 = 0x8D65;
// desktop GL only
const RGB16: u32 = 0x8054;
const RGBA16: u32 = 0x805B;

const MAX_DMA_FORMATS: usize = 128;

static GL_LOADER: Once = Once::new();

/// Native windows to draw into, as passed to `eglCreateWindowSurface`.
#[derive(Debug, Clone, Copy)]
pub struct NativeWindows {
    pub normal: egl::NativeWindowType,
    pub fullscreen: Option<egl::NativeWindowType>,
}

struct ApiContext {
    config: egl::Config,
    ctx: egl::Context,
}

struct EglImage {
    egl_image: egl::Image,
    egl: Rc<Egl>,
    display: egl::Display,
}

impl Drop for EglImage {
    fn drop(&mut self) {
        if self.egl_image.as_ptr() == egl::NO_IMAGE {
            return;
        }

        let e = egl_destroy_image_with_fallback(&self.egl, self.display, self.egl_image);
        if let Err(e) = e {
            error!("Could not destroy EGL image: {e:?}");
        }
    }
}

/// [`Gpu`] on top of the system EGL with one GL and one GLES context.
pub struct EglGpu {
    egl: Rc<Egl>,
    display: Display,
    windows: NativeWindows,
    contexts: HashMap<GlApi, ApiContext>,
    surfaces: HashMap<SurfaceSlot, egl::Surface>,
    current: Option<(GlApi, Option<SurfaceSlot>)>,
    /// EGL images backing imported textures, by texture name.
    images: HashMap<u32, EglImage>,
    bind_frag_data_location: Option<BindFragDataLocationFn>,
    gl_debug: bool,
    caps: Option<Capabilities>,
}

impl std::fmt::Debug for EglGpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EglGpu")
            .field("display", &self.display)
            .field("apis", &self.contexts.keys().collect::<Vec<_>>())
            .field("surfaces", &self.surfaces.keys().collect::<Vec<_>>())
            .field("current", &self.current)
            .field("images", &self.images.len())
            .finish()
    }
}

impl EglGpu {
    /// Loads the EGL library and initializes the default display. Contexts
    /// are created by [`Gpu::ensure_contexts`].
    pub fn new(config: &OutputConfig, windows: NativeWindows) -> Result<EglGpu> {
        let lib = unsafe { libloading::Library::new(&config.egl_library) }?;
        let egl = unsafe { egl::DynamicInstance::<egl::EGL1_4>::load_required_from(lib)? };
        let display = unsafe { egl.get_display(egl::DEFAULT_DISPLAY) }
            .ok_or_else(|| Error::ContextCreation("Could not obtain EGL Display".to_string()))?;
        let (major, minor) = egl.initialize(display)?;
        debug!("EGL {major}.{minor} on {display:?}");

        Ok(EglGpu {
            egl: Rc::new(egl),
            display,
            windows,
            contexts: HashMap::new(),
            surfaces: HashMap::new(),
            current: None,
            images: HashMap::new(),
            bind_frag_data_location: None,
            gl_debug: cfg!(debug_assertions) || config.gl_debug,
            caps: None,
        })
    }

    fn check(&self, name: &str, line: u32) -> Result<()> {
        if self.gl_debug {
            check_gl_error(name, line)
        } else {
            Ok(())
        }
    }

    fn create_context(&self, api: GlApi) -> Result<ApiContext> {
        let (bind, renderable) = match api {
            GlApi::Gl => (egl::OPENGL_API, egl::OPENGL_BIT),
            GlApi::Gles => (egl::OPENGL_ES_API, egl::OPENGL_ES3_BIT),
        };
        self.egl.bind_api(bind)?;

        let mut attributes = vec![
            egl::SURFACE_TYPE,
            egl::WINDOW_BIT,
            egl::RENDERABLE_TYPE,
            renderable,
            egl::RED_SIZE,
            8,
            egl::GREEN_SIZE,
            8,
            egl::BLUE_SIZE,
            8,
            egl::ALPHA_SIZE,
            8,
        ];
        if api == GlApi::Gles {
            attributes.extend([egl::CONFORMANT, egl::OPENGL_ES3_BIT]);
        }
        attributes.push(egl::NONE);

        let config = self
            .egl
            .choose_first_config(self.display, &attributes)?
            .ok_or_else(|| Error::ContextCreation(format!("no {api:?} EGL config")))?;
        debug!("{api:?} config: {config:?}");

        let context_attributes = match api {
            GlApi::Gl => vec![egl::NONE],
            GlApi::Gles => vec![egl::CONTEXT_CLIENT_VERSION, 3, egl::NONE],
        };
        let ctx = self
            .egl
            .create_context(self.display, config, None, &context_attributes)?;
        debug!("{api:?} ctx: {ctx:?}");
        Ok(ApiContext { config, ctx })
    }

    fn bind(&self, api: GlApi) -> Result<()> {
        self.egl.bind_api(match api {
            GlApi::Gl => egl::OPENGL_API,
            GlApi::Gles => egl::OPENGL_ES_API,
        })?;
        Ok(())
    }

    fn load_gl(&self) {
        GL_LOADER.call_once(|| {
            gls::load_with(|s| {
                self.egl
                    .get_proc_address(s)
                    .map_or(std::ptr::null(), |p| p as *const _)
            });
            debug!("GL entry points loaded");
        });
    }

    /// Queries what the context of `api` supports. The context must be
    /// current.
    fn query_capabilities(&mut self, api: GlApi, caps: &mut Capabilities) {
        let mut max_texture = 0;
        unsafe { gls::gl::GetIntegerv(gls::gl::MAX_TEXTURE_SIZE, &raw mut max_texture) };
        let max_texture = max_texture.max(0) as usize;
        debug!("{api:?} max texture size {max_texture}");

        match api {
            GlApi::Gl => {
                caps.gl_max_texture = max_texture;
                if let Some(ext) = self.egl.get_proc_address("glBindFragDataLocation") {
                    self.bind_frag_data_location = Some(unsafe { std::mem::transmute(ext) });
                }
            }
            GlApi::Gles => {
                caps.gles_max_texture = max_texture;
                caps.external_sampler = match gl_extensions() {
                    Ok(extensions) => extensions.contains("GL_OES_EGL_image_external_essl3"),
                    Err(e) => {
                        warn!("{e}");
                        false
                    }
                };
                caps.dma_import_fourccs = match self.query_dma_formats() {
                    Ok(fourccs) => fourccs,
                    Err(e) => {
                        debug!("no DMA-buf import: {e}");
                        Vec::new()
                    }
                };
            }
        }
    }

    fn query_dma_formats(&self) -> Result<Vec<DrmFourcc>> {
        egl_check_support_dma(&self.egl)?;
        let Some(ext) = self.egl.get_proc_address("eglQueryDmaBufFormatsEXT") else {
            return Err(Error::GLVersion(
                "EGL does not support eglQueryDmaBufFormatsEXT function".to_string(),
            ));
        };
        let func: unsafe extern "system" fn(
            display: egl::EGLDisplay,
            max_formats: egl::Int,
            formats: *mut egl::Int,
            num_formats: *mut egl::Int,
        ) -> egl::Boolean = unsafe { std::mem::transmute(ext) };

        let mut formats = [0 as egl::Int; MAX_DMA_FORMATS];
        let mut num_formats = 0;
        let res = unsafe {
            func(
                self.display.as_ptr(),
                formats.len() as egl::Int,
                formats.as_mut_ptr(),
                &raw mut num_formats,
            )
        };
        if res != egl::TRUE {
            return Err(Error::GLVersion("eglQueryDmaBufFormatsEXT failed".to_string()));
        }

        let fourccs: Vec<DrmFourcc> = formats[..(num_formats.max(0) as usize).min(formats.len())]
            .iter()
            .filter_map(|f| DrmFourcc::try_from(*f as u32).ok())
            .collect();
        debug!("DMA-buf import formats: {fourccs:?}");
        Ok(fourccs)
    }

    fn surface(&self, slot: SurfaceSlot) -> Result<egl::Surface> {
        self.surfaces
            .get(&slot)
            .or_else(|| self.surfaces.get(&SurfaceSlot::Normal))
            .copied()
            .ok_or_else(|| Error::NotSupported(format!("no {slot:?} window surface")))
    }

    fn new_egl_image_owned(&self, target: egl::Enum, attrib_list: &[Attrib]) -> Result<EglImage> {
        let image = egl_create_image_with_fallback(
            &self.egl,
            self.display,
            unsafe { egl::Context::from_ptr(egl::NO_CONTEXT) },
            target,
            unsafe { egl::ClientBuffer::from_ptr(null_mut()) },
            attrib_list,
        )?;
        Ok(EglImage {
            egl_image: image,
            display: self.display,
            egl: self.egl.clone(),
        })
    }
}

impl Gpu for EglGpu {
    fn ensure_contexts(&mut self, apis: ApiMask) -> Result<Capabilities> {
        let mut created = false;
        for api in apis.apis() {
            if self.contexts.contains_key(&api) {
                continue;
            }
            match self.create_context(api) {
                Ok(ctx) => {
                    self.contexts.insert(api, ctx);
                    created = true;
                }
                Err(e) => warn!("no {api:?} context: {e}"),
            }
        }
        if self.contexts.is_empty() {
            return Err(Error::ContextCreation(
                "no usable GL or GLES context".to_string(),
            ));
        }

        if created || self.caps.is_none() {
            let mut caps = Capabilities::default();
            let available: Vec<GlApi> = [GlApi::Gl, GlApi::Gles]
                .into_iter()
                .filter(|api| self.contexts.contains_key(api))
                .collect();
            for api in available {
                let mut ctx = CurrentContext::acquire(&mut *self, api, None)?;
                ctx.load_gl();
                ctx.query_capabilities(api, &mut caps);
                caps.apis = caps.apis | api.into();
            }
            self.caps = Some(caps);
        }
        let mut caps = self.caps.clone().unwrap_or_default();
        caps.apis = caps.apis & apis;
        Ok(caps)
    }

    fn create_window_surfaces(&mut self, api: GlApi) -> Result<()> {
        self.destroy_window_surfaces();
        let config = self
            .contexts
            .get(&api)
            .map(|c| c.config)
            .ok_or_else(|| Error::ContextCreation(format!("no {api:?} context")))?;

        let normal = unsafe {
            self.egl
                .create_window_surface(self.display, config, self.windows.normal, None)?
        };
        self.surfaces.insert(SurfaceSlot::Normal, normal);

        if let Some(window) = self.windows.fullscreen {
            match unsafe {
                self.egl
                    .create_window_surface(self.display, config, window, None)
            } {
                Ok(surface) => {
                    self.surfaces.insert(SurfaceSlot::Fullscreen, surface);
                }
                Err(e) => warn!("no fullscreen surface: {e:?}"),
            }
        }
        debug!("{} window surfaces for {api:?}", self.surfaces.len());
        Ok(())
    }

    fn destroy_window_surfaces(&mut self) {
        if matches!(self.current, Some((_, Some(_)))) {
            self.release_current();
        }
        for (slot, surface) in self.surfaces.drain() {
            if let Err(e) = self.egl.destroy_surface(self.display, surface) {
                warn!("Could not destroy {slot:?} surface: {e:?}");
            }
        }
    }

    fn make_current(&mut self, api: GlApi, slot: Option<SurfaceSlot>) -> Result<()> {
        let ctx = self
            .contexts
            .get(&api)
            .map(|c| c.ctx)
            .ok_or_else(|| Error::ContextCreation(format!("no {api:?} context")))?;
        let surface = slot.map(|slot| self.surface(slot)).transpose()?;
        self.bind(api)?;
        self.egl
            .make_current(self.display, surface, surface, Some(ctx))?;
        self.current = Some((api, slot));
        Ok(())
    }

    fn release_current(&mut self) {
        if let Err(e) = self.egl.make_current(self.display, None, None, None) {
            warn!("Could not release context: {e:?}");
        }
        self.current = None;
    }

    fn build_program(&mut self, source: &ProgramSource) -> Result<Program> {
        let vertex = compile_shader_from_str(gls::gl::VERTEX_SHADER, &source.vertex, "vertex")?;
        let fragment =
            match compile_shader_from_str(gls::gl::FRAGMENT_SHADER, &source.fragment, "fragment")
            {
                Ok(fragment) => fragment,
                Err(e) => {
                    unsafe { gls::gl::DeleteShader(vertex) };
                    return Err(e);
                }
            };

        let id = unsafe { gls::gl::CreateProgram() };
        unsafe {
            gls::gl::AttachShader(id, vertex);
            gls::gl::AttachShader(id, fragment);
            gls::gl::BindAttribLocation(id, ATTRIB_POS, c"pos".as_ptr());
            gls::gl::BindAttribLocation(id, ATTRIB_TEX, c"tex".as_ptr());
        }
        if source.bind_frag_data {
            let Some(bind_frag_data_location) = self.bind_frag_data_location else {
                unsafe {
                    gls::gl::DeleteShader(vertex);
                    gls::gl::DeleteShader(fragment);
                    gls::gl::DeleteProgram(id);
                }
                return Err(Error::GLVersion(
                    "glBindFragDataLocation is not available".to_string(),
                ));
            };
            let output = CString::new(FRAG_OUTPUT)
                .map_err(|e| Error::Internal(format!("output name: {e}")))?;
            unsafe { bind_frag_data_location(id, 0, output.as_ptr()) };
        }

        let mut linked = 0;
        unsafe {
            gls::gl::LinkProgram(id);
            gls::gl::DeleteShader(vertex);
            gls::gl::DeleteShader(fragment);
            gls::gl::GetProgramiv(id, gls::gl::LINK_STATUS, &raw mut linked);
        }
        if linked == 0 {
            let log = program_info_log(id);
            error!("Program link failed: {log}");
            unsafe { gls::gl::DeleteProgram(id) };
            return Err(Error::ShaderCompile(log));
        }

        let location = |name: &str| -> i32 {
            match CString::new(name) {
                Ok(name) => unsafe { gls::gl::GetUniformLocation(id, name.as_ptr()) },
                Err(_) => -1,
            }
        };
        let mut uniforms = UniformLocations::default();
        unsafe { gls::gl::UseProgram(id) };
        for (unit, name) in FRAME_UNIFORMS.iter().enumerate() {
            uniforms.frames[unit] = location(name);
            if uniforms.frames[unit] >= 0 {
                unsafe { gls::gl::Uniform1i(uniforms.frames[unit], unit as i32) };
            }
        }
        uniforms.colormatrix = location(COLORMATRIX_UNIFORM);
        uniforms.coloroffset = location(COLOROFFSET_UNIFORM);
        unsafe { gls::gl::UseProgram(0) };
        self.check(function!(), line!())?;

        trace!("program {id}: {:?} {:?}", source.api, source.spec);
        Ok(Program {
            id,
            api: source.api,
            spec: source.spec,
            uniforms,
        })
    }

    fn delete_program(&mut self, program: &Program) {
        unsafe { gls::gl::DeleteProgram(program.id) };
    }

    fn create_vertex_array(&mut self) -> Result<VertexArray> {
        let mut vao = 0;
        let mut vbo = 0;
        let stride = size_of::<Vertex>() as i32;
        unsafe {
            gls::gl::GenVertexArrays(1, &raw mut vao);
            gls::gl::BindVertexArray(vao);
            gls::gl::GenBuffers(1, &raw mut vbo);
            gls::gl::BindBuffer(gls::gl::ARRAY_BUFFER, vbo);
            gls::gl::BufferData(
                gls::gl::ARRAY_BUFFER,
                (size_of::<Vertex>() * 4) as isize,
                null(),
                gls::gl::DYNAMIC_DRAW,
            );
            gls::gl::VertexAttribPointer(
                ATTRIB_POS,
                2,
                gls::gl::FLOAT,
                gls::gl::FALSE,
                stride,
                null(),
            );
            gls::gl::EnableVertexAttribArray(ATTRIB_POS);
            gls::gl::VertexAttribPointer(
                ATTRIB_TEX,
                2,
                gls::gl::FLOAT,
                gls::gl::FALSE,
                stride,
                size_of::<[f32; 2]>() as *const c_void,
            );
            gls::gl::EnableVertexAttribArray(ATTRIB_TEX);
            gls::gl::BindVertexArray(0);
            gls::gl::BindBuffer(gls::gl::ARRAY_BUFFER, 0);
        }
        self.check(function!(), line!())?;
        Ok(VertexArray { vao, vbo })
    }

    fn upload_vertices(&mut self, vertex_array: &VertexArray, vertices: &[Vertex; 4]) {
        unsafe {
            gls::gl::BindBuffer(gls::gl::ARRAY_BUFFER, vertex_array.vbo);
            gls::gl::BufferSubData(
                gls::gl::ARRAY_BUFFER,
                0,
                size_of_val(vertices) as isize,
                vertices.as_ptr() as *const c_void,
            );
            gls::gl::BindBuffer(gls::gl::ARRAY_BUFFER, 0);
        }
    }

    fn delete_vertex_array(&mut self, vertex_array: &VertexArray) {
        unsafe {
            gls::gl::DeleteBuffers(1, &raw const vertex_array.vbo);
            gls::gl::DeleteVertexArrays(1, &raw const vertex_array.vao);
        }
    }

    fn create_textures(&mut self, format: &VideoFormat) -> Result<TextureFrame> {
        let api = self
            .current
            .map(|(api, _)| api)
            .ok_or_else(|| Error::Internal("no current context".to_string()))?;
        let pixel_format = format.pixel_format;
        let mut textures = Vec::with_capacity(pixel_format.num_planes());
        for plane in 0..pixel_format.num_planes() {
            let (internal, gl_format, gl_type) = plane_format(pixel_format, api)?;
            let (width, height) = pixel_format.plane_size(plane, format.width, format.height);
            let mut id = 0;
            unsafe {
                gls::gl::GenTextures(1, &raw mut id);
                gls::gl::BindTexture(gls::gl::TEXTURE_2D, id);
                set_texture_params(gls::gl::TEXTURE_2D);
                if pixel_format == PixelFormat::Gray8 {
                    for swizzle in [
                        gls::gl::TEXTURE_SWIZZLE_R,
                        gls::gl::TEXTURE_SWIZZLE_G,
                        gls::gl::TEXTURE_SWIZZLE_B,
                    ] {
                        gls::gl::TexParameteri(gls::gl::TEXTURE_2D, swizzle, gls::gl::RED as i32);
                    }
                }
                gls::gl::TexImage2D(
                    gls::gl::TEXTURE_2D,
                    0,
                    internal as i32,
                    width as i32,
                    height as i32,
                    0,
                    gl_format,
                    gl_type,
                    null(),
                );
            }
            textures.push(id);
        }
        unsafe { gls::gl::BindTexture(gls::gl::TEXTURE_2D, 0) };
        if let Err(e) = self.check(function!(), line!()) {
            unsafe { gls::gl::DeleteTextures(textures.len() as i32, textures.as_ptr()) };
            return Err(e);
        }
        Ok(TextureFrame {
            api,
            target: gls::gl::TEXTURE_2D,
            textures,
        })
    }

    fn upload_planes(
        &mut self,
        textures: &TextureFrame,
        format: &VideoFormat,
        planes: &[PlaneData<'_>],
    ) -> Result<()> {
        let pixel_format = format.pixel_format;
        for (plane, (data, texture)) in planes.iter().zip(&textures.textures).enumerate() {
            let (_, gl_format, gl_type) = plane_format(pixel_format, textures.api)?;
            let (width, height) = pixel_format.plane_size(plane, format.width, format.height);
            let bpp = pixel_format.bytes_per_pixel(plane);
            let needed = data.stride * height.saturating_sub(1) + width * bpp;
            if data.data.len() < needed || data.stride % bpp != 0 {
                return Err(Error::Transfer(format!(
                    "plane {plane}: {} bytes with stride {} cannot hold {width}x{height}",
                    data.data.len(),
                    data.stride
                )));
            }
            unsafe {
                gls::gl::BindTexture(gls::gl::TEXTURE_2D, *texture);
                gls::gl::PixelStorei(gls::gl::UNPACK_ALIGNMENT, 1);
                gls::gl::PixelStorei(gls::gl::UNPACK_ROW_LENGTH, (data.stride / bpp) as i32);
                gls::gl::TexSubImage2D(
                    gls::gl::TEXTURE_2D,
                    0,
                    0,
                    0,
                    width as i32,
                    height as i32,
                    gl_format,
                    gl_type,
                    data.data.as_ptr() as *const c_void,
                );
            }
        }
        unsafe {
            gls::gl::PixelStorei(gls::gl::UNPACK_ROW_LENGTH, 0);
            gls::gl::BindTexture(gls::gl::TEXTURE_2D, 0);
        }
        self.check(function!(), line!())
            .map_err(|e| Error::Transfer(e.to_string()))
    }

    fn import_dma(&mut self, buffer: &DmaBuffer, format: &VideoFormat) -> Result<TextureFrame> {
        const PLANE_ATTRIBUTES: [[u32; 3]; 3] = [
            [
                egl_ext::DMA_BUF_PLANE0_FD,
                egl_ext::DMA_BUF_PLANE0_OFFSET,
                egl_ext::DMA_BUF_PLANE0_PITCH,
            ],
            [
                egl_ext::DMA_BUF_PLANE1_FD,
                egl_ext::DMA_BUF_PLANE1_OFFSET,
                egl_ext::DMA_BUF_PLANE1_PITCH,
            ],
            [
                egl_ext::DMA_BUF_PLANE2_FD,
                egl_ext::DMA_BUF_PLANE2_OFFSET,
                egl_ext::DMA_BUF_PLANE2_PITCH,
            ],
        ];

        let mut egl_img_attr = vec![
            egl_ext::LINUX_DRM_FOURCC as Attrib,
            buffer.fourcc as Attrib,
            khronos_egl::WIDTH as Attrib,
            buffer.width as Attrib,
            khronos_egl::HEIGHT as Attrib,
            buffer.height as Attrib,
        ];
        for (plane, [fd, offset, pitch]) in buffer.planes.iter().zip(PLANE_ATTRIBUTES) {
            egl_img_attr.extend([
                fd as Attrib,
                plane.fd.as_raw_fd() as Attrib,
                offset as Attrib,
                plane.offset as Attrib,
                pitch as Attrib,
                plane.pitch as Attrib,
            ]);
        }
        if format.pixel_format.is_yuv() {
            let range = if format.pixel_format.is_full_range() {
                egl_ext::YUV_FULL_RANGE
            } else {
                egl_ext::YUV_NARROW_RANGE
            };
            egl_img_attr.extend([
                egl_ext::YUV_COLOR_SPACE_HINT as Attrib,
                egl_ext::ITU_REC601 as Attrib,
                egl_ext::SAMPLE_RANGE_HINT as Attrib,
                range as Attrib,
            ]);
        }
        egl_img_attr.push(khronos_egl::NONE as Attrib);

        let image = self
            .new_egl_image_owned(egl_ext::LINUX_DMA_BUF, &egl_img_attr)
            .map_err(|e| Error::Transfer(format!("{:?} import: {e}", buffer.fourcc)))?;

        let mut id = 0;
        unsafe {
            gls::gl::GenTextures(1, &raw mut id);
            gls::gl::BindTexture(TEXTURE_EXTERNAL_OES, id);
            set_texture_params(TEXTURE_EXTERNAL_OES);
            gls::egl_image_target_texture_2d_oes(TEXTURE_EXTERNAL_OES, image.egl_image.as_ptr());
            gls::gl::BindTexture(TEXTURE_EXTERNAL_OES, 0);
        }
        if let Err(e) = check_gl_error(function!(), line!()) {
            unsafe { gls::gl::DeleteTextures(1, &raw const id) };
            return Err(Error::Transfer(e.to_string()));
        }
        self.images.insert(id, image);
        Ok(TextureFrame {
            api: GlApi::Gles,
            target: TEXTURE_EXTERNAL_OES,
            textures: vec![id],
        })
    }

    fn delete_textures(&mut self, textures: &TextureFrame) {
        unsafe {
            gls::gl::DeleteTextures(textures.textures.len() as i32, textures.textures.as_ptr())
        };
        for id in &textures.textures {
            self.images.remove(id);
        }
    }

    fn upload_colormatrix(&mut self, program: &Program, matrix: &ColorMatrix) {
        let (matrix, offset) = matrix.to_gl();
        unsafe {
            gls::gl::UseProgram(program.id);
            gls::gl::UniformMatrix4fv(
                program.uniforms.colormatrix,
                1,
                gls::gl::TRUE,
                matrix.as_ptr(),
            );
            gls::gl::Uniform4fv(program.uniforms.coloroffset, 1, offset.as_ptr());
            gls::gl::UseProgram(0);
        }
    }

    fn begin_frame(&mut self, width: usize, height: usize) {
        unsafe {
            gls::gl::Viewport(0, 0, width as i32, height as i32);
            gls::gl::ClearColor(0.0, 0.0, 0.0, 1.0);
            gls::gl::Clear(gls::gl::COLOR_BUFFER_BIT);
        }
    }

    fn set_blending(&mut self, enabled: bool) {
        unsafe {
            if enabled {
                gls::gl::Enable(gls::gl::BLEND);
                gls::gl::BlendFunc(gls::gl::SRC_ALPHA, gls::gl::ONE_MINUS_SRC_ALPHA);
            } else {
                gls::gl::Disable(gls::gl::BLEND);
            }
        }
    }

    fn draw_quad(&mut self, quad: &Quad<'_>) {
        unsafe {
            gls::gl::UseProgram(quad.program.id);
            for (unit, texture) in quad.textures.textures.iter().enumerate() {
                gls::gl::ActiveTexture(gls::gl::TEXTURE0 + unit as u32);
                gls::gl::BindTexture(quad.textures.target, *texture);
            }
            gls::gl::BindVertexArray(quad.vertex_array.vao);
            gls::gl::DrawArrays(gls::gl::TRIANGLE_STRIP, 0, 4);
            gls::gl::BindVertexArray(0);
            gls::gl::ActiveTexture(gls::gl::TEXTURE0);
            gls::gl::UseProgram(0);
        }
        if let Err(e) = self.check(function!(), line!()) {
            warn!("port {}: draw failed: {e}", quad.port);
        }
    }

    fn wait_idle(&mut self) {
        unsafe { gls::gl::Finish() };
    }

    fn swap_buffers(&mut self) -> Result<()> {
        let slot = match self.current {
            Some((_, Some(slot))) => slot,
            _ => return Err(Error::Internal("swap without a window surface".to_string())),
        };
        let surface = self.surface(slot)?;
        self.egl.swap_buffers(self.display, surface)?;
        Ok(())
    }
}

impl Drop for EglGpu {
    fn drop(&mut self) {
        self.images.clear();
        self.destroy_window_surfaces();
        self.release_current();
        for (_, ctx) in self.contexts.drain() {
            let _ = self.egl.destroy_context(self.display, ctx.ctx);
        }
        let _ = self.egl.terminate(self.display);
    }
}

/// Internal format, format and type of the textures of `pixel_format`.
fn plane_format(pixel_format: PixelFormat, api: GlApi) -> Result<(u32, u32, u32)> {
    Ok(match pixel_format {
        PixelFormat::Gray8
        | PixelFormat::Yuv420P
        | PixelFormat::Yuv422P
        | PixelFormat::Yuv444P
        | PixelFormat::Yuvj420P
        | PixelFormat::Yuvj422P
        | PixelFormat::Yuvj444P => (gls::gl::R8, gls::gl::RED, gls::gl::UNSIGNED_BYTE),
        PixelFormat::Rgb24 => (gls::gl::RGB8, gls::gl::RGB, gls::gl::UNSIGNED_BYTE),
        PixelFormat::Rgba32 => (gls::gl::RGBA8, gls::gl::RGBA, gls::gl::UNSIGNED_BYTE),
        PixelFormat::Rgb48 if api == GlApi::Gl => (RGB16, gls::gl::RGB, gls::gl::UNSIGNED_SHORT),
        PixelFormat::Rgba64 if api == GlApi::Gl => {
            (RGBA16, gls::gl::RGBA, gls::gl::UNSIGNED_SHORT)
        }
        _ => {
            return Err(Error::NotSupported(format!(
                "{pixel_format} textures with {api:?}"
            )));
        }
    })
}

unsafe fn set_texture_params(target: u32) {
    unsafe {
        gls::gl::TexParameteri(target, gls::gl::TEXTURE_MIN_FILTER, gls::gl::LINEAR as i32);
        gls::gl::TexParameteri(target, gls::gl::TEXTURE_MAG_FILTER, gls::gl::LINEAR as i32);
        gls::gl::TexParameteri(target, gls::gl::TEXTURE_WRAP_S, gls::gl::CLAMP_TO_EDGE as i32);
        gls::gl::TexParameteri(target, gls::gl::TEXTURE_WRAP_T, gls::gl::CLAMP_TO_EDGE as i32);
    }
}

fn gl_extensions() -> Result<BTreeSet<String>> {
    let extensions = unsafe {
        let str = gls::gl::GetString(gls::gl::EXTENSIONS);
        if str.is_null() {
            return Err(Error::GLVersion(
                "GL returned no supported extensions".to_string(),
            ));
        }
        CStr::from_ptr(str as *const c_char)
            .to_string_lossy()
            .to_string()
    };
    debug!("GL Extensions: {extensions}");
    Ok(extensions
        .split_ascii_whitespace()
        .map(str::to_owned)
        .collect())
}

fn egl_check_support_dma(egl: &Egl) -> Result<()> {
    let extensions = egl.query_string(None, egl::EXTENSIONS)?;
    let extensions = extensions.to_string_lossy();
    debug!("EGL Extensions: {}", extensions);

    if egl.upcast::<egl::EGL1_5>().is_some() {
        return Ok(());
    }

    if !extensions.contains("EGL_EXT_image_dma_buf_import") {
        return Err(Error::GLVersion(
            "EGL does not support EGL_EXT_image_dma_buf_import extension".to_string(),
        ));
    }

    for function in ["eglCreateImageKHR", "eglDestroyImageKHR"] {
        if egl.get_proc_address(function).is_none() {
            return Err(Error::GLVersion(format!(
                "EGL does not support {function} function"
            )));
        }
    }
    Ok(())
}

fn egl_create_image_with_fallback(
    egl: &Egl,
    display: Display,
    ctx: egl::Context,
    target: egl::Enum,
    buffer: egl::ClientBuffer,
    attrib_list: &[Attrib],
) -> Result<egl::Image> {
    if let Some(egl) = egl.upcast::<egl::EGL1_5>() {
        egl.create_image(display, ctx, target, buffer, attrib_list)
            .map_err(|e| e.into())
    } else if let Some(ext) = egl.get_proc_address("eglCreateImageKHR") {
        trace!("eglCreateImageKHR addr: {:?}", ext);
        let func: unsafe extern "system" fn(
            display: egl::EGLDisplay,
            ctx: egl::EGLContext,
            target: egl::Enum,
            buffer: egl::EGLClientBuffer,
            attrib_list: *const egl::Int,
        ) -> egl::EGLImage = unsafe { std::mem::transmute(ext) };
        let new_attrib_list = attrib_list
            .iter()
            .map(|x| *x as egl::Int)
            .collect::<Vec<_>>();

        let image = unsafe {
            func(
                display.as_ptr(),
                ctx.as_ptr(),
                target,
                buffer.as_ptr(),
                new_attrib_list.as_ptr(),
            )
        };
        if image != egl::NO_IMAGE {
            Ok(unsafe { egl::Image::from_ptr(image) })
        } else {
            Err(egl_error(egl))
        }
    } else {
        Err(Error::EGLLoad(egl::LoadError::InvalidVersion {
            provided: egl.version(),
            required: khronos_egl::Version::EGL1_5,
        }))
    }
}

fn egl_destroy_image_with_fallback(egl: &Egl, display: Display, image: egl::Image) -> Result<()> {
    if let Some(egl) = egl.upcast::<egl::EGL1_5>() {
        egl.destroy_image(display, image).map_err(|e| e.into())
    } else if let Some(ext) = egl.get_proc_address("eglDestroyImageKHR") {
        let func: unsafe extern "system" fn(
            display: egl::EGLDisplay,
            image: egl::EGLImage,
        ) -> egl::Boolean = unsafe { std::mem::transmute(ext) };
        let res = unsafe { func(display.as_ptr(), image.as_ptr()) };
        if res == egl::TRUE {
            Ok(())
        } else {
            Err(egl_error(egl))
        }
    } else {
        Err(Error::EGLLoad(egl::LoadError::InvalidVersion {
            provided: egl.version(),
            required: khronos_egl::Version::EGL1_5,
        }))
    }
}

fn egl_error(egl: &Egl) -> Error {
    match egl.get_error() {
        Some(e) => e.into(),
        None => Error::OpenGl("EGL call failed without an error".to_string()),
    }
}

/// Compiles a shader, returning the compiler log on failure.
fn compile_shader_from_str(kind: u32, shader_source: &str, shader_name: &str) -> Result<u32> {
    let src = CString::new(shader_source)
        .map_err(|e| Error::ShaderCompile(format!("{shader_name} source: {e}")))?;
    let src_ptr = src.as_ptr();
    unsafe {
        let shader = gls::gl::CreateShader(kind);
        gls::gl::ShaderSource(shader, 1, &raw const src_ptr, null());
        gls::gl::CompileShader(shader);
        let mut is_compiled = 0;
        gls::gl::GetShaderiv(shader, gls::gl::COMPILE_STATUS, &raw mut is_compiled);
        if is_compiled == 0 {
            let mut max_length = 0;
            gls::gl::GetShaderiv(shader, gls::gl::INFO_LOG_LENGTH, &raw mut max_length);
            let mut error_log: Vec<u8> = vec![0; max_length.max(0) as usize + 1];
            gls::gl::GetShaderInfoLog(
                shader,
                max_length,
                &raw mut max_length,
                error_log.as_mut_ptr() as *mut c_char,
            );
            error_log.truncate(max_length.max(0) as usize);
            let log = String::from_utf8_lossy(&error_log).into_owned();
            error!("Shader '{shader_name}' failed: {log}\n{shader_source}");
            gls::gl::DeleteShader(shader);
            return Err(Error::ShaderCompile(log));
        }
        Ok(shader)
    }
}

fn program_info_log(program: u32) -> String {
    unsafe {
        let mut max_length = 0;
        gls::gl::GetProgramiv(program, gls::gl::INFO_LOG_LENGTH, &raw mut max_length);
        let mut log: Vec<u8> = vec![0; max_length.max(0) as usize + 1];
        gls::gl::GetProgramInfoLog(
            program,
            max_length,
            &raw mut max_length,
            log.as_mut_ptr() as *mut c_char,
        );
        log.truncate(max_length.max(0) as usize);
        String::from_utf8_lossy(&log).into_owned()
    }
}

fn check_gl_error(name: &str, line: u32) -> Result<()> {
    unsafe {
        let err = gls::gl::GetError();
        if err != gls::gl::NO_ERROR {
            error!("GL Error: {name}:{line}: {err:#X}");
            return Err(Error::OpenGl(format!("{err:#X}")));
        }
    }
    Ok(())
}

mod egl_ext {
    pub const LINUX_DMA_BUF: u32 = 0x3270;
    pub const LINUX_DRM_FOURCC: u32 = 0x3271;
    pub const DMA_BUF_PLANE0_FD: u32 = 0x3272;
    pub const DMA_BUF_PLANE0_OFFSET: u32 = 0x3273;
    pub const DMA_BUF_PLANE0_PITCH: u32 = 0x3274;
    pub const DMA_BUF_PLANE1_FD: u32 = 0x3275;
    pub const DMA_BUF_PLANE1_OFFSET: u32 = 0x3276;
    pub const DMA_BUF_PLANE1_PITCH: u32 = 0x3277;
    pub const DMA_BUF_PLANE2_FD: u32 = 0x3278;
    pub const DMA_BUF_PLANE2_OFFSET: u32 = 0x3279;
    pub const DMA_BUF_PLANE2_PITCH: u32 = 0x327A;
    pub const YUV_COLOR_SPACE_HINT: u32 = 0x327B;
    pub const SAMPLE_RANGE_HINT: u32 = 0x327C;

    pub const ITU_REC601: u32 = 0x327F;

    pub const YUV_FULL_RANGE: u32 = 0x3282;
    pub const YUV_NARROW_RANGE: u32 = 0x3283;
}
