// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use crate::SyncAccess;
use nix::ioctl_write_ptr;
use std::os::fd::{AsRawFd, OwnedFd};

const DMA_BUF_BASE: u8 = b'b';
const DMA_BUF_IOCTL_SYNC: u8 = 0;

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 1 << 1;
const DMA_BUF_SYNC_START: u64 = 0 << 2;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

#[derive(Default)]
#[repr(C)]
struct DmaBufSync {
    flags: u64,
}

ioctl_write_ptr!(
    ioctl_dma_buf_sync,
    DMA_BUF_BASE,
    DMA_BUF_IOCTL_SYNC,
    DmaBufSync
);

fn access_flags(access: SyncAccess) -> u64 {
    match access {
        SyncAccess::Read => DMA_BUF_SYNC_READ,
        SyncAccess::Write => DMA_BUF_SYNC_WRITE,
        SyncAccess::ReadWrite => DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE,
    }
}

fn sync(fd: &OwnedFd, flags: u64) -> nix::Result<()> {
    let sync = DmaBufSync { flags };
    unsafe { ioctl_dma_buf_sync(fd.as_raw_fd(), &sync) }?;
    Ok(())
}

/// Begins CPU access to a DMA-buf.
pub(crate) fn start(fd: &OwnedFd, access: SyncAccess) -> nix::Result<()> {
    sync(fd, access_flags(access) | DMA_BUF_SYNC_START)
}

/// Ends CPU access to a DMA-buf, flushing caches for the device.
pub(crate) fn end(fd: &OwnedFd, access: SyncAccess) -> nix::Result<()> {
    sync(fd, access_flags(access) | DMA_BUF_SYNC_END)
}
