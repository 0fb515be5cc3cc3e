// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use crate::{
    Error, Result,
    gpu::{ApiMask, Capabilities},
};
use log::{debug, log_enabled};
use vidpresent_frame::{DrmFourcc, GlApi, PixelFormat, Shuffle, conversion_penalty};

/// Pixel formats the texture upload path handles.
const TEXTURE_FORMATS: [PixelFormat; 11] = [
    PixelFormat::Gray8,
    PixelFormat::Rgb24,
    PixelFormat::Rgba32,
    PixelFormat::Yuv420P,
    PixelFormat::Yuv422P,
    PixelFormat::Yuv444P,
    PixelFormat::Yuvj420P,
    PixelFormat::Yuvj422P,
    PixelFormat::Yuvj444P,
    PixelFormat::Rgb48,
    PixelFormat::Rgba64,
];

/// Where the pixels of a catalog entry live while they are sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Ordinary textures of the given APIs.
    Texture(ApiMask),
    /// A DMA buffer imported into GLES as an external image.
    DmaBuf,
}

/// How frames reach the entry's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// The producer writes straight into the storage.
    Map,
    /// Frames are copied in.
    Transfer,
}

/// One way of getting a pixel format onto the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFormat {
    pub pixel_format: PixelFormat,
    pub residency: Residency,
    pub mode: AccessMode,
    pub dma_fourcc: Option<DrmFourcc>,
    pub shuffle: Shuffle,
    pub max_width: usize,
    pub max_height: usize,
}

impl ImageFormat {
    /// APIs able to sample the entry.
    pub fn apis(&self) -> ApiMask {
        match self.residency {
            Residency::Texture(apis) => apis,
            Residency::DmaBuf => ApiMask::GLES,
        }
    }

    pub fn is_dma(&self) -> bool {
        self.residency == Residency::DmaBuf
    }

    pub fn fits(&self, width: usize, height: usize) -> bool {
        width <= self.max_width && height <= self.max_height
    }
}

/// A format selection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatQuery {
    pub pixel_format: PixelFormat,
    pub width: usize,
    pub height: usize,
    /// APIs the port may render with.
    pub domains: ApiMask,
    /// The producer can write into or hand over DMA buffers.
    pub allow_direct_import: bool,
    pub is_overlay: bool,
}

/// Every format and transfer path the created contexts support.
#[derive(Debug, Clone, Default)]
pub struct FormatCatalog {
    entries: Vec<ImageFormat>,
}

impl FormatCatalog {
    pub fn new(caps: &Capabilities) -> Self {
        let mut entries = Vec::new();

        for pixel_format in TEXTURE_FORMATS {
            let apis = if pixel_format.bits_per_channel() > 8 {
                caps.apis & ApiMask::GL
            } else {
                caps.apis
            };
            if apis.is_empty() {
                continue;
            }
            let max = if apis.contains(GlApi::Gles) {
                caps.gles_max_texture
            } else {
                caps.gl_max_texture
            };
            entries.push(ImageFormat {
                pixel_format,
                residency: Residency::Texture(apis),
                mode: AccessMode::Transfer,
                dma_fourcc: None,
                shuffle: Shuffle::None,
                max_width: max,
                max_height: max,
            });
        }

        if caps.supports_dma() {
            for fourcc in &caps.dma_import_fourccs {
                let Some((pixel_format, shuffle)) = PixelFormat::from_drm_fourcc(*fourcc) else {
                    debug!("no pixel format for DMA import format {fourcc:?}");
                    continue;
                };
                let variants = [Some(pixel_format), pixel_format.full_range()];
                for pixel_format in variants.into_iter().flatten() {
                    entries.push(ImageFormat {
                        pixel_format,
                        residency: Residency::DmaBuf,
                        mode: if shuffle.is_some() {
                            AccessMode::Transfer
                        } else {
                            AccessMode::Map
                        },
                        dma_fourcc: Some(*fourcc),
                        shuffle,
                        max_width: caps.gles_max_texture,
                        max_height: caps.gles_max_texture,
                    });
                }
            }
        }

        let catalog = Self { entries };
        if log_enabled!(log::Level::Debug) {
            catalog.dump();
        }
        catalog
    }

    pub fn entries(&self) -> &[ImageFormat] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&ImageFormat> {
        self.entries.get(index)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dump(&self) {
        debug!("image format catalog, {} entries", self.entries.len());
        for (i, e) in self.entries.iter().enumerate() {
            debug!(
                "  {i:2}: {} {:?} {:?} fourcc {:?} shuffle {:?} max {}x{}",
                e.pixel_format,
                e.residency,
                e.mode,
                e.dma_fourcc,
                e.shuffle,
                e.max_width,
                e.max_height
            );
        }
    }

    /// Picks the entry for `query`. The result only depends on the catalog
    /// and the query.
    pub fn select_format(&self, query: &FormatQuery) -> Result<usize> {
        let candidates: Vec<(usize, &ImageFormat)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !query.is_overlay || e.pixel_format.has_alpha())
            .filter(|(_, e)| e.apis().intersects(query.domains))
            .filter(|(_, e)| e.fits(query.width, query.height))
            .collect();
        let exact = || {
            candidates
                .iter()
                .filter(|(_, e)| e.pixel_format == query.pixel_format)
        };
        let gles = query.domains.contains(GlApi::Gles);

        if query.allow_direct_import
            && gles
            && let Some((i, _)) = exact().find(|(_, e)| e.is_dma() && e.mode == AccessMode::Map)
        {
            return Ok(*i);
        }

        if let Some(i) = lowest(
            exact()
                .filter(|(_, e)| !e.is_dma() && e.mode == AccessMode::Transfer)
                .map(|(i, e)| (*i, score(query.pixel_format, e))),
        ) {
            return Ok(i);
        }

        if gles {
            if let Some((i, _)) =
                exact().find(|(_, e)| e.is_dma() && e.mode == AccessMode::Map && !e.shuffle.is_some())
            {
                return Ok(*i);
            }
            if let Some((i, _)) = exact().find(|(_, e)| e.is_dma() && e.shuffle.is_some()) {
                return Ok(*i);
            }
        }

        lowest(
            candidates
                .iter()
                .map(|(i, e)| (*i, score(query.pixel_format, e))),
        )
        .ok_or_else(|| {
            Error::FormatSelection(format!(
                "format selection failed for {} {}x{}",
                query.pixel_format, query.width, query.height
            ))
        })
    }
}

/// Conversion loss dominates, then copying, then reordering.
fn score(requested: PixelFormat, entry: &ImageFormat) -> u32 {
    let transfer = (entry.mode == AccessMode::Transfer) as u32;
    let shuffle = entry.shuffle.is_some() as u32;
    conversion_penalty(requested, entry.pixel_format) * 4 + transfer * 2 + shuffle
}

/// Index with the lowest score, the first one on ties.
fn lowest(scored: impl Iterator<Item = (usize, u32)>) -> Option<usize> {
    scored
        .fold(None, |best: Option<(usize, u32)>, (i, s)| match best {
            Some((_, b)) if b <= s => best,
            _ => Some((i, s)),
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod catalog_tests {
    use super::*;
    use crate::gpu::recording::default_caps;

    fn query(pixel_format: PixelFormat) -> FormatQuery {
        FormatQuery {
            pixel_format,
            width: 640,
            height: 480,
            domains: ApiMask::ALL,
            allow_direct_import: false,
            is_overlay: false,
        }
    }

    #[test]
    fn test_catalog_entries() {
        let catalog = FormatCatalog::new(&default_caps());
        let rgb48 = catalog
            .entries()
            .iter()
            .find(|e| e.pixel_format == PixelFormat::Rgb48)
            .unwrap();
        assert_eq!(rgb48.residency, Residency::Texture(ApiMask::GL));
        assert_eq!(rgb48.max_width, 8192);

        let rgba = catalog
            .entries()
            .iter()
            .find(|e| e.pixel_format == PixelFormat::Rgba32)
            .unwrap();
        assert_eq!(rgba.residency, Residency::Texture(ApiMask::ALL));
        assert_eq!(rgba.max_width, 4096);

        let xbgr = catalog
            .entries()
            .iter()
            .find(|e| e.dma_fourcc == Some(DrmFourcc::Xbgr8888))
            .unwrap();
        assert_eq!(xbgr.pixel_format, PixelFormat::Rgb24);
        assert_eq!(xbgr.mode, AccessMode::Transfer);
        assert!(xbgr.shuffle.is_some());

        let nv12 = catalog
            .entries()
            .iter()
            .find(|e| e.dma_fourcc == Some(DrmFourcc::Nv12))
            .unwrap();
        assert_eq!(nv12.mode, AccessMode::Map);
    }

    #[test]
    fn test_planar_dma_gets_full_range_variant() {
        let mut caps = default_caps();
        caps.dma_import_fourccs = vec![DrmFourcc::Yuv420];
        let catalog = FormatCatalog::new(&caps);
        let dma: Vec<_> = catalog
            .entries()
            .iter()
            .filter(|e| e.is_dma())
            .map(|e| e.pixel_format)
            .collect();
        assert_eq!(dma, vec![PixelFormat::Yuv420P, PixelFormat::Yuvj420P]);
    }

    #[test]
    fn test_no_dma_without_gles() {
        let mut caps = default_caps();
        caps.apis = ApiMask::GL;
        let catalog = FormatCatalog::new(&caps);
        assert!(!catalog.entries().iter().any(|e| e.is_dma()));
        assert!(
            catalog
                .entries()
                .iter()
                .all(|e| e.residency == Residency::Texture(ApiMask::GL))
        );
    }

    #[test]
    fn test_direct_import_prefers_dma_map() {
        let catalog = FormatCatalog::new(&default_caps());
        let mut q = query(PixelFormat::Rgba32);
        q.allow_direct_import = true;
        let e = catalog.get(catalog.select_format(&q).unwrap()).unwrap();
        assert!(e.is_dma());
        assert_eq!(e.mode, AccessMode::Map);
        assert_eq!(e.dma_fourcc, Some(DrmFourcc::Abgr8888));

        // without GLES there is nothing to import into
        q.domains = ApiMask::GL;
        let e = catalog.get(catalog.select_format(&q).unwrap()).unwrap();
        assert_eq!(e.residency, Residency::Texture(ApiMask::ALL));
    }

    #[test]
    fn test_texture_transfer_exact() {
        let catalog = FormatCatalog::new(&default_caps());
        for format in TEXTURE_FORMATS {
            let e = catalog
                .get(catalog.select_format(&query(format)).unwrap())
                .unwrap();
            assert_eq!(e.pixel_format, format);
            assert!(!e.is_dma());
        }
    }

    #[test]
    fn test_dma_only_formats() {
        let catalog = FormatCatalog::new(&default_caps());
        let e = catalog
            .get(catalog.select_format(&query(PixelFormat::Nv12)).unwrap())
            .unwrap();
        assert_eq!(e.dma_fourcc, Some(DrmFourcc::Nv12));

        // NV12 cannot be shown with GL alone, the closest texture wins
        let mut q = query(PixelFormat::Nv12);
        q.domains = ApiMask::GL;
        let e = catalog.get(catalog.select_format(&q).unwrap()).unwrap();
        assert_eq!(e.pixel_format, PixelFormat::Yuv420P);
    }

    #[test]
    fn test_shuffle_tier() {
        let mut caps = default_caps();
        caps.apis = ApiMask::GLES;
        caps.dma_import_fourccs = vec![DrmFourcc::Xbgr8888];
        let mut catalog = FormatCatalog::new(&caps);
        // drop the texture entry for RGB so the shuffle entry is the only exact one
        catalog
            .entries
            .retain(|e| e.is_dma() || e.pixel_format != PixelFormat::Rgb24);
        let e = catalog
            .get(catalog.select_format(&query(PixelFormat::Rgb24)).unwrap())
            .unwrap();
        assert_eq!(e.dma_fourcc, Some(DrmFourcc::Xbgr8888));
        assert_eq!(e.mode, AccessMode::Transfer);
    }

    #[test]
    fn test_overlay_excludes_opaque_entries() {
        let catalog = FormatCatalog::new(&default_caps());
        for format in PixelFormat::ALL {
            for allow_direct_import in [false, true] {
                let mut q = query(format);
                q.is_overlay = true;
                q.allow_direct_import = allow_direct_import;
                let e = catalog.get(catalog.select_format(&q).unwrap()).unwrap();
                assert!(e.pixel_format.has_alpha(), "{format} -> {e:?}");
            }
        }
    }

    #[test]
    fn test_selection_is_deterministic() {
        let catalog = FormatCatalog::new(&default_caps());
        for format in PixelFormat::ALL {
            let q = query(format);
            let first = catalog.select_format(&q).ok();
            for _ in 0..3 {
                assert_eq!(catalog.select_format(&q).ok(), first);
            }
        }
    }

    #[test]
    fn test_oversize_falls_back() {
        let catalog = FormatCatalog::new(&default_caps());
        let mut q = query(PixelFormat::Rgba32);
        q.width = 5000;
        q.height = 3000;
        let e = catalog.get(catalog.select_format(&q).unwrap()).unwrap();
        assert_eq!(e.pixel_format, PixelFormat::Rgba64);
        assert!(e.fits(5000, 3000));

        q.width = 10000;
        assert!(matches!(
            catalog.select_format(&q),
            Err(Error::FormatSelection(_))
        ));
    }

    #[test]
    fn test_empty_catalog_fails() {
        let catalog = FormatCatalog::new(&Capabilities::default());
        assert!(catalog.is_empty());
        assert!(matches!(
            catalog.select_format(&query(PixelFormat::Rgb24)),
            Err(Error::FormatSelection(_))
        ));
    }
}
