// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use crate::{Error, Result, VideoFormat};

/// One plane of a system memory frame.
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Vec<u8>,
    /// Bytes between the starts of two rows.
    pub stride: usize,
}

/// Frame stored in system memory.
#[derive(Debug, Clone)]
pub struct MemFrame {
    planes: Vec<Plane>,
}

impl MemFrame {
    /// Allocates zeroed, unpadded planes for `format`.
    pub fn new(format: &VideoFormat) -> Self {
        let planes = (0..format.pixel_format.num_planes())
            .map(|plane| {
                let stride = format.row_bytes(plane);
                Plane {
                    data: vec![0; stride * format.rows(plane)],
                    stride,
                }
            })
            .collect();
        Self { planes }
    }

    /// Wraps caller provided planes after checking they can hold `format`.
    pub fn from_planes(format: &VideoFormat, planes: Vec<Plane>) -> Result<Self> {
        check_planes(format, &planes)?;
        Ok(Self { planes })
    }

    /// Checks that the planes hold every row of `format`.
    pub fn check(&self, format: &VideoFormat) -> Result<()> {
        check_planes(format, &self.planes)
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn planes_mut(&mut self) -> &mut [Plane] {
        &mut self.planes
    }

    /// Row `row` of `plane`, `len` bytes long. `None` past the end of the
    /// plane.
    pub fn row(&self, plane: usize, row: usize, len: usize) -> Option<&[u8]> {
        let plane = self.planes.get(plane)?;
        let start = row.checked_mul(plane.stride)?;
        plane.data.get(start..start.checked_add(len)?)
    }
}

fn check_planes(format: &VideoFormat, planes: &[Plane]) -> Result<()> {
    let expected = format.pixel_format.num_planes();
    if planes.len() != expected {
        return Err(Error::InvalidLayout(format!(
            "{} needs {expected} planes, got {}",
            format.pixel_format,
            planes.len()
        )));
    }

    for (i, plane) in planes.iter().enumerate() {
        let row_bytes = format.row_bytes(i);
        let rows = format.rows(i);
        if plane.stride < row_bytes {
            return Err(Error::InvalidLayout(format!(
                "plane {i} stride {} is smaller than a row of {row_bytes} bytes",
                plane.stride
            )));
        }
        let needed = plane.stride * rows.saturating_sub(1) + row_bytes;
        if rows > 0 && plane.data.len() < needed {
            return Err(Error::InvalidSize(plane.data.len()));
        }
    }
    Ok(())
}
