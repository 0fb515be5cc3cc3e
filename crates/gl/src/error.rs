// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Frame(vidpresent_frame::Error),
    #[cfg(target_os = "linux")]
    #[cfg(feature = "opengl")]
    Library(libloading::Error),
    #[cfg(target_os = "linux")]
    #[cfg(feature = "opengl")]
    EGL(khronos_egl::Error),
    #[cfg(target_os = "linux")]
    #[cfg(feature = "opengl")]
    EGLLoad(khronos_egl::LoadError<libloading::Error>),
    /// No catalog entry can carry the requested format.
    FormatSelection(String),
    /// A shader failed to compile or a program failed to link.
    ShaderCompile(String),
    /// A frame could not be turned into sampleable textures.
    Transfer(String),
    /// No usable GL or GLES context could be created.
    ContextCreation(String),
    GLVersion(String),
    OpenGl(String),
    NotSupported(String),
    InvalidPort(usize),
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<vidpresent_frame::Error> for Error {
    fn from(err: vidpresent_frame::Error) -> Self {
        Error::Frame(err)
    }
}

#[cfg(target_os = "linux")]
#[cfg(feature = "opengl")]
impl From<libloading::Error> for Error {
    fn from(err: libloading::Error) -> Self {
        Error::Library(err)
    }
}

#[cfg(target_os = "linux")]
#[cfg(feature = "opengl")]
impl From<khronos_egl::Error> for Error {
    fn from(err: khronos_egl::Error) -> Self {
        Error::EGL(err)
    }
}

#[cfg(target_os = "linux")]
#[cfg(feature = "opengl")]
impl From<khronos_egl::LoadError<libloading::Error>> for Error {
    fn from(err: khronos_egl::LoadError<libloading::Error>) -> Self {
        Error::EGLLoad(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Frame(e) => write!(f, "Frame error: {}", e),
            #[cfg(target_os = "linux")]
            #[cfg(feature = "opengl")]
            Error::Library(e) => write!(f, "Library error: {}", e),
            #[cfg(target_os = "linux")]
            #[cfg(feature = "opengl")]
            Error::EGL(e) => write!(f, "EGL error: {:?}", e),
            #[cfg(target_os = "linux")]
            #[cfg(feature = "opengl")]
            Error::EGLLoad(e) => write!(f, "EGL load error: {:?}", e),
            Error::FormatSelection(msg) => write!(f, "Image format selection failed: {}", msg),
            Error::ShaderCompile(msg) => write!(f, "Shader compile error: {}", msg),
            Error::Transfer(msg) => write!(f, "Frame transfer failed: {}", msg),
            Error::ContextCreation(msg) => write!(f, "Context creation failed: {}", msg),
            Error::GLVersion(msg) => write!(f, "GL version error: {}", msg),
            Error::OpenGl(msg) => write!(f, "OpenGL error: {}", msg),
            Error::NotSupported(msg) => write!(f, "Not supported: {}", msg),
            Error::InvalidPort(index) => write!(f, "Invalid port: {}", index),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
