// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use crate::{
    error::{Error, Result},
    MemFrame, PixelFormat, Shuffle, VideoFormat,
};
use drm_fourcc::DrmFourcc;
use log::{debug, trace, warn};
use std::{
    ffi::c_void,
    ops::{Deref, DerefMut},
    os::fd::{AsRawFd, OwnedFd},
    ptr::NonNull,
    sync::Arc,
};

/// Row pitch alignment of allocated buffers, enough for the common GPU
/// import paths.
const PITCH_ALIGN: usize = 64;

/// Memory backing DMA-buf allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmaBacking {
    /// Kernel DMA heap, CMA with fallback to the system heap.
    #[default]
    Heap,
    /// Anonymous shared memory. Mappable like a DMA-buf but not importable
    /// by most GPUs.
    Memfd,
}

/// CPU access announced to the exporter while a buffer is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAccess {
    Read,
    Write,
    ReadWrite,
}

/// One plane of a DMA-buf frame.
#[derive(Debug, Clone)]
pub struct DmaPlane {
    pub fd: Arc<OwnedFd>,
    pub offset: usize,
    pub pitch: usize,
}

/// A frame stored in one or more DMA-buf file descriptors.
#[derive(Debug, Clone)]
pub struct DmaBuffer {
    pub fourcc: DrmFourcc,
    pub width: usize,
    pub height: usize,
    pub planes: Vec<DmaPlane>,
    /// Size of the allocation behind the first plane's descriptor.
    pub size: usize,
}

impl DmaBuffer {
    /// Allocates a buffer for a `width` x `height` image stored as `fourcc`.
    pub fn allocate(
        backing: DmaBacking,
        fourcc: DrmFourcc,
        width: usize,
        height: usize,
    ) -> Result<Self> {
        let layout = plane_layout(fourcc, width, height)?;

        let mut offset = 0;
        let mut placed = Vec::with_capacity(layout.len());
        for (row_bytes, rows) in layout {
            let pitch = row_bytes.next_multiple_of(PITCH_ALIGN);
            placed.push((offset, pitch));
            offset += pitch * rows;
        }
        let size = offset;
        if size == 0 {
            return Err(Error::InvalidSize(0));
        }

        let fd = Arc::new(allocate_fd(backing, size)?);
        debug!(
            "allocated {size} byte {backing:?} buffer for {fourcc:?} {width}x{height} fd {}",
            fd.as_raw_fd()
        );

        Ok(Self {
            fourcc,
            width,
            height,
            planes: placed
                .into_iter()
                .map(|(offset, pitch)| DmaPlane {
                    fd: fd.clone(),
                    offset,
                    pitch,
                })
                .collect(),
            size,
        })
    }

    /// Wraps descriptors received from another component.
    pub fn from_planes(
        fourcc: DrmFourcc,
        width: usize,
        height: usize,
        planes: Vec<DmaPlane>,
        size: usize,
    ) -> Result<Self> {
        let expected = plane_layout(fourcc, width, height)?.len();
        if planes.len() != expected {
            return Err(Error::InvalidLayout(format!(
                "{fourcc:?} needs {expected} planes, got {}",
                planes.len()
            )));
        }
        Ok(Self {
            fourcc,
            width,
            height,
            planes,
            size,
        })
    }

    /// Both handles refer to the same underlying buffer.
    pub fn is_same_buffer(&self, other: &DmaBuffer) -> bool {
        match (self.planes.first(), other.planes.first()) {
            (Some(a), Some(b)) => {
                Arc::ptr_eq(&a.fd, &b.fd) || a.fd.as_raw_fd() == b.fd.as_raw_fd()
            }
            _ => false,
        }
    }

    /// Maps the whole buffer into the address space. Only buffers whose
    /// planes share one descriptor can be mapped.
    pub fn map(&self, access: SyncAccess) -> Result<DmaMap> {
        let first = self
            .planes
            .first()
            .ok_or_else(|| Error::InvalidLayout("buffer without planes".to_owned()))?;
        if self
            .planes
            .iter()
            .any(|p| p.fd.as_raw_fd() != first.fd.as_raw_fd())
        {
            return Err(Error::NotImplemented(
                "mapping multi-descriptor DMA buffers".to_owned(),
            ));
        }
        DmaMap::new(first.fd.clone(), self.size, access)
    }

    /// Copies a system memory frame into the buffer, reordering bytes when
    /// the DRM layout differs from the frame layout.
    pub fn write_from(&self, format: &VideoFormat, frame: &MemFrame) -> Result<()> {
        let (stored, shuffle) = PixelFormat::from_drm_fourcc(self.fourcc).ok_or_else(|| {
            Error::UnsupportedFormat(format!("no pixel format for {:?}", self.fourcc))
        })?;
        if stored != format.pixel_format.limited_range() {
            return Err(Error::UnsupportedFormat(format!(
                "cannot store {} in a {:?} buffer",
                format.pixel_format, self.fourcc
            )));
        }
        if format.width != self.width || format.height != self.height {
            return Err(Error::InvalidLayout(format!(
                "frame is {}x{} but buffer is {}x{}",
                format.width, format.height, self.width, self.height
            )));
        }
        frame.check(format)?;
        if frame.planes().len() != self.planes.len() {
            return Err(Error::InvalidLayout(format!(
                "frame has {} planes but buffer has {}",
                frame.planes().len(),
                self.planes.len()
            )));
        }

        let layout = plane_layout(self.fourcc, self.width, self.height)?;
        for (plane, (dst_row_bytes, rows)) in self.planes.iter().zip(&layout) {
            let end = plane.offset + plane.pitch * rows.saturating_sub(1) + dst_row_bytes;
            if *rows > 0 && end > self.size {
                return Err(Error::InvalidSize(end));
            }
        }

        let mut map = self.map(SyncAccess::Write)?;
        for (i, (plane, (dst_row_bytes, rows))) in self.planes.iter().zip(layout).enumerate() {
            let src_row_bytes = format.row_bytes(i);
            for row in 0..rows {
                let start = plane.offset + row * plane.pitch;
                let src = frame
                    .row(i, row, src_row_bytes)
                    .ok_or_else(|| {
                        Error::InvalidSize(frame.planes().get(i).map_or(0, |p| p.data.len()))
                    })?;
                copy_row(shuffle, src, &mut map[start..start + dst_row_bytes]);
            }
        }
        trace!("copied {} into {:?} buffer", format, self.fourcc);
        Ok(())
    }
}

fn copy_row(shuffle: Shuffle, src: &[u8], dst: &mut [u8]) {
    match shuffle {
        Shuffle::None => dst[..src.len()].copy_from_slice(src),
        Shuffle::RgbToRgbx => {
            for (s, d) in src.chunks_exact(3).zip(dst.chunks_exact_mut(4)) {
                d[..3].copy_from_slice(s);
                d[3] = 0xff;
            }
        }
        Shuffle::RgbaToBgra => {
            for (s, d) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
                d[0] = s[2];
                d[1] = s[1];
                d[2] = s[0];
                d[3] = s[3];
            }
        }
    }
}

/// Bytes per row and row count of each plane of a DRM buffer.
fn plane_layout(fourcc: DrmFourcc, width: usize, height: usize) -> Result<Vec<(usize, usize)>> {
    let (format, shuffle) = PixelFormat::from_drm_fourcc(fourcc)
        .ok_or_else(|| Error::UnsupportedFormat(format!("{fourcc:?}")))?;

    Ok((0..format.num_planes())
        .map(|plane| {
            let (w, h) = format.plane_size(plane, width, height);
            let bpp = match shuffle {
                Shuffle::None => format.bytes_per_pixel(plane),
                Shuffle::RgbToRgbx | Shuffle::RgbaToBgra => 4,
            };
            (w * bpp, h)
        })
        .collect())
}

#[cfg(target_os = "linux")]
fn allocate_fd(backing: DmaBacking, size: usize) -> Result<OwnedFd> {
    match backing {
        DmaBacking::Heap => {
            let heap = match dma_heap::Heap::new(dma_heap::HeapKind::Cma) {
                Ok(heap) => heap,
                Err(_) => dma_heap::Heap::new(dma_heap::HeapKind::System)
                    .map_err(|e| Error::Allocation(format!("no DMA heap: {e:?}")))?,
            };
            heap.allocate(size)
                .map_err(|e| Error::Allocation(format!("{e:?}")))
        }
        DmaBacking::Memfd => {
            use nix::sys::memfd::{MemFdCreateFlag, memfd_create};

            let fd = memfd_create(c"vidpresent-dma", MemFdCreateFlag::MFD_CLOEXEC)?;
            nix::unistd::ftruncate(&fd, size as nix::libc::off_t)?;
            Ok(fd)
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn allocate_fd(_backing: DmaBacking, _size: usize) -> Result<OwnedFd> {
    Err(Error::NotImplemented(
        "DMA buffers are not supported on this platform".to_owned(),
    ))
}

/// CPU mapping of a DMA-buf, unmapped on drop.
#[derive(Debug)]
pub struct DmaMap {
    ptr: DmaPtr,
    len: usize,
    fd: Arc<OwnedFd>,
    access: SyncAccess,
}

impl DmaMap {
    #[cfg(target_os = "linux")]
    fn new(fd: Arc<OwnedFd>, len: usize, access: SyncAccess) -> Result<Self> {
        use nix::sys::mman::{MapFlags, ProtFlags, mmap};
        use std::num::NonZero;

        // memfd backed buffers have no sync ioctl
        if let Err(e) = crate::dmabuf::start(&fd, access) {
            trace!("DMA_BUF_IOCTL_SYNC start failed: {e}");
        }

        let prot = match access {
            SyncAccess::Read => ProtFlags::PROT_READ,
            SyncAccess::Write | SyncAccess::ReadWrite => {
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
            }
        };
        let ptr = unsafe {
            mmap(
                None,
                NonZero::new(len).ok_or(Error::InvalidSize(len))?,
                prot,
                MapFlags::MAP_SHARED,
                &*fd,
                0,
            )?
        };

        trace!("Mapping DMA memory: {ptr:?}");
        Ok(DmaMap {
            ptr: DmaPtr(ptr),
            len,
            fd,
            access,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn new(_fd: Arc<OwnedFd>, _len: usize, _access: SyncAccess) -> Result<Self> {
        Err(Error::NotImplemented(
            "DMA buffers are not supported on this platform".to_owned(),
        ))
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.0.as_ptr() as *const u8, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.0.as_ptr() as *mut u8, self.len) }
    }
}

impl Deref for DmaMap {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for DmaMap {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl Drop for DmaMap {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        {
            if let Err(e) = unsafe { nix::sys::mman::munmap(self.ptr.0, self.len) } {
                warn!("Failed to unmap DMA memory: {e}");
            }
            if let Err(e) = crate::dmabuf::end(&self.fd, self.access) {
                trace!("DMA_BUF_IOCTL_SYNC end failed: {e}");
            }
        }
        #[cfg(not(target_os = "linux"))]
        warn!("dropping DMA map of fd {} without platform support", self.fd.as_raw_fd());
    }
}

#[derive(Debug)]
struct DmaPtr(NonNull<c_void>);

unsafe impl Send for DmaPtr {}

#[cfg(test)]
#[cfg(target_os = "linux")]
mod dma_tests {
    use super::*;
    use crate::Plane;

    #[test]
    fn test_allocate_layout() -> Result<()> {
        let buffer = DmaBuffer::allocate(DmaBacking::Memfd, DrmFourcc::Yuv420, 100, 50)?;
        assert_eq!(buffer.planes.len(), 3);
        assert_eq!(buffer.planes[0].pitch, 128);
        assert_eq!(buffer.planes[1].offset, 128 * 50);
        assert_eq!(buffer.planes[1].pitch, 64);
        assert_eq!(buffer.planes[2].offset, 128 * 50 + 64 * 25);
        assert_eq!(buffer.size, 128 * 50 + 2 * 64 * 25);

        let clone = buffer.clone();
        assert!(clone.is_same_buffer(&buffer));
        let other = DmaBuffer::allocate(DmaBacking::Memfd, DrmFourcc::Yuv420, 100, 50)?;
        assert!(!other.is_same_buffer(&buffer));
        Ok(())
    }

    #[test]
    fn test_write_shuffle_rgb() -> Result<()> {
        let format = VideoFormat::new(PixelFormat::Rgb24, 2, 2);
        let frame = MemFrame::from_planes(
            &format,
            vec![Plane {
                data: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12],
                stride: 6,
            }],
        )?;

        let buffer = DmaBuffer::allocate(DmaBacking::Memfd, DrmFourcc::Xbgr8888, 2, 2)?;
        buffer.write_from(&format, &frame)?;

        let map = buffer.map(SyncAccess::Read)?;
        assert_eq!(&map[..8], &[1, 2, 3, 255, 4, 5, 6, 255]);
        let pitch = buffer.planes[0].pitch;
        assert_eq!(&map[pitch..pitch + 8], &[7, 8, 9, 255, 10, 11, 12, 255]);
        Ok(())
    }

    #[test]
    fn test_write_shuffle_bgra() -> Result<()> {
        let format = VideoFormat::new(PixelFormat::Rgba32, 1, 1);
        let frame = MemFrame::from_planes(
            &format,
            vec![Plane {
                data: vec![10, 20, 30, 40],
                stride: 4,
            }],
        )?;
        let buffer = DmaBuffer::allocate(DmaBacking::Memfd, DrmFourcc::Argb8888, 1, 1)?;
        buffer.write_from(&format, &frame)?;
        let map = buffer.map(SyncAccess::Read)?;
        assert_eq!(&map[..4], &[30, 20, 10, 40]);
        Ok(())
    }

    #[test]
    fn test_write_mismatch() -> Result<()> {
        let buffer = DmaBuffer::allocate(DmaBacking::Memfd, DrmFourcc::Abgr8888, 4, 4)?;

        let format = VideoFormat::new(PixelFormat::Rgba32, 8, 4);
        let result = buffer.write_from(&format, &MemFrame::new(&format));
        assert!(matches!(result, Err(Error::InvalidLayout(_))));

        let format = VideoFormat::new(PixelFormat::Rgb24, 4, 4);
        let result = buffer.write_from(&format, &MemFrame::new(&format));
        assert!(matches!(result, Err(Error::UnsupportedFormat(_))));

        // full range frames fit limited range buffers
        let buffer = DmaBuffer::allocate(DmaBacking::Memfd, DrmFourcc::Yuv420, 4, 4)?;
        let format = VideoFormat::new(PixelFormat::Yuvj420P, 4, 4);
        buffer.write_from(&format, &MemFrame::new(&format))?;
        Ok(())
    }

    #[test]
    fn test_from_planes() -> Result<()> {
        let buffer = DmaBuffer::allocate(DmaBacking::Memfd, DrmFourcc::Nv12, 16, 16)?;
        let result =
            DmaBuffer::from_planes(DrmFourcc::Nv12, 16, 16, buffer.planes[..1].to_vec(), 0);
        assert!(matches!(result, Err(Error::InvalidLayout(_))));

        let imported = DmaBuffer::from_planes(
            DrmFourcc::Nv12,
            16,
            16,
            buffer.planes.clone(),
            buffer.size,
        )?;
        assert!(imported.is_same_buffer(&buffer));
        Ok(())
    }
}
