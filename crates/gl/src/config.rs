// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use crate::gpu::ApiMask;
use log::debug;
use vidpresent_frame::DmaBacking;

pub const DEFAULT_EGL_LIBRARY: &str = "libEGL.so.1";

/// Runtime switches of a [`crate::VideoOutput`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub disable_gl: bool,
    pub disable_gles: bool,
    /// No DMA-buf import or render targets.
    pub disable_dma: bool,
    /// Use GLES for texture uploads even when GL could do it.
    pub prefer_gles: bool,
    /// Check for GL errors after every risky call, also in release builds.
    pub gl_debug: bool,
    pub dma_backing: DmaBacking,
    pub egl_library: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            disable_gl: false,
            disable_gles: false,
            disable_dma: false,
            prefer_gles: false,
            gl_debug: false,
            dma_backing: DmaBacking::Heap,
            egl_library: DEFAULT_EGL_LIBRARY.to_owned(),
        }
    }
}

fn env_flag(name: &str) -> bool {
    let set = std::env::var(name)
        .map(|x| x != "0" && x.to_lowercase() != "false")
        .unwrap_or(false);
    if set {
        debug!("{name} is set");
    }
    set
}

impl OutputConfig {
    /// Reads the `VIDPRESENT_*` environment variables.
    pub fn from_env() -> Self {
        let dma_backing = match std::env::var("VIDPRESENT_DMA_BACKING")
            .map(|x| x.to_lowercase())
            .as_deref()
        {
            Ok("memfd") => DmaBacking::Memfd,
            _ => DmaBacking::Heap,
        };
        Self {
            disable_gl: env_flag("VIDPRESENT_DISABLE_GL"),
            disable_gles: env_flag("VIDPRESENT_DISABLE_GLES"),
            disable_dma: env_flag("VIDPRESENT_DISABLE_DMA"),
            prefer_gles: env_flag("VIDPRESENT_PREFER_GLES"),
            gl_debug: env_flag("VIDPRESENT_GL_DEBUG"),
            dma_backing,
            egl_library: std::env::var("VIDPRESENT_EGL_LIBRARY")
                .unwrap_or_else(|_| DEFAULT_EGL_LIBRARY.to_owned()),
        }
    }

    /// APIs contexts may be created for.
    pub fn apis(&self) -> ApiMask {
        let mut apis = ApiMask::ALL;
        if self.disable_gl {
            apis = apis.without(ApiMask::GL);
        }
        if self.disable_gles {
            apis = apis.without(ApiMask::GLES);
        }
        apis
    }
}
