// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! GPU video presentation: the frame model of [`frame`] and the EGL/OpenGL
//! output of [`gl`] under one crate.

pub use vidpresent_frame as frame;
pub use vidpresent_gl as gl;

pub use vidpresent_frame::{
    FrameStorage, GlApi, MemFrame, MemoryDomain, Orientation, PixelFormat, Rect, VideoFormat,
    VideoFrame,
};
pub use vidpresent_gl::{
    Error, OutputConfig, PortHandle, Result, SourceFlags, StateValue, SurfaceSlot, TransferMode,
    VideoOutput,
};
#[cfg(target_os = "linux")]
#[cfg(feature = "opengl")]
pub use vidpresent_gl::{EglGpu, NativeWindows};
