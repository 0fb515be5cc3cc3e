// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use crate::Result;
use log::{debug, trace};
use std::cell::RefCell;
use vidpresent_frame::{DmaBacking, DmaBuffer, DrmFourcc};

/// Buffers kept for reuse per context.
const MAX_POOLED: usize = 4;

/// DMA-buf import formats and buffer allocation shared by the ports of one
/// output.
#[derive(Debug)]
pub struct DmaContext {
    backing: DmaBacking,
    import_fourccs: Vec<DrmFourcc>,
    pool: RefCell<Vec<DmaBuffer>>,
}

impl DmaContext {
    pub fn new(backing: DmaBacking, import_fourccs: Vec<DrmFourcc>) -> Self {
        debug!(
            "DMA context with {backing:?} backing, {} import formats",
            import_fourccs.len()
        );
        Self {
            backing,
            import_fourccs,
            pool: RefCell::new(Vec::new()),
        }
    }

    /// A context with the same formats and its own buffers, for ports
    /// rendering into DMA buffers.
    pub fn private(&self) -> Self {
        Self::new(self.backing, self.import_fourccs.clone())
    }

    pub fn backing(&self) -> DmaBacking {
        self.backing
    }

    pub fn import_fourccs(&self) -> &[DrmFourcc] {
        &self.import_fourccs
    }

    pub fn supports(&self, fourcc: DrmFourcc) -> bool {
        self.import_fourccs.contains(&fourcc)
    }

    /// A buffer of the given layout, reused from the pool when possible.
    pub fn acquire(&self, fourcc: DrmFourcc, width: usize, height: usize) -> Result<DmaBuffer> {
        let mut pool = self.pool.borrow_mut();
        if let Some(i) = pool
            .iter()
            .position(|b| b.fourcc == fourcc && b.width == width && b.height == height)
        {
            trace!("reusing pooled {fourcc:?} {width}x{height} buffer");
            return Ok(pool.swap_remove(i));
        }
        drop(pool);
        Ok(DmaBuffer::allocate(self.backing, fourcc, width, height)?)
    }

    /// Returns a buffer for reuse. The pool is bounded, surplus buffers are
    /// released.
    pub fn recycle(&self, buffer: DmaBuffer) {
        let mut pool = self.pool.borrow_mut();
        if pool.len() < MAX_POOLED {
            pool.push(buffer);
        }
    }

    pub fn pooled(&self) -> usize {
        self.pool.borrow().len()
    }

    pub fn clear(&self) {
        self.pool.borrow_mut().clear();
    }
}

#[cfg(test)]
#[cfg(target_os = "linux")]
mod dma_context_tests {
    use super::*;

    #[test]
    fn test_pool_reuse() -> Result<()> {
        let ctx = DmaContext::new(DmaBacking::Memfd, vec![DrmFourcc::Abgr8888]);
        assert!(ctx.supports(DrmFourcc::Abgr8888));
        assert!(!ctx.supports(DrmFourcc::Nv12));

        let a = ctx.acquire(DrmFourcc::Abgr8888, 16, 16)?;
        let keep = a.clone();
        ctx.recycle(a);
        assert_eq!(ctx.pooled(), 1);

        let b = ctx.acquire(DrmFourcc::Abgr8888, 16, 16)?;
        assert!(b.is_same_buffer(&keep));
        assert_eq!(ctx.pooled(), 0);

        let c = ctx.acquire(DrmFourcc::Abgr8888, 32, 16)?;
        assert!(!c.is_same_buffer(&keep));
        Ok(())
    }

    #[test]
    fn test_private_context_has_own_pool() -> Result<()> {
        let shared = DmaContext::new(DmaBacking::Memfd, vec![DrmFourcc::Nv12]);
        shared.recycle(shared.acquire(DrmFourcc::Nv12, 16, 16)?);

        let private = shared.private();
        assert_eq!(private.import_fourccs(), shared.import_fourccs());
        assert_eq!(private.pooled(), 0);
        assert_eq!(shared.pooled(), 1);

        let buffers = (0..MAX_POOLED + 2)
            .map(|_| private.acquire(DrmFourcc::Nv12, 8, 8))
            .collect::<Result<Vec<_>>>()?;
        for buffer in buffers {
            private.recycle(buffer);
        }
        assert_eq!(private.pooled(), MAX_POOLED);
        shared.clear();
        assert_eq!(shared.pooled(), 0);
        Ok(())
    }
}
