//! Similarity scores between noise residuals and fingerprints.
//!
//! - **NCC**: normalized cross-correlation in `[-1, 1]`
//! - **PCE**: peak correlation energy of the zero-lag product
//! - **Local PCE grid**: PCE per non-overlapping square tile
//!
//! PCE here follows the zero-lag definition: both inputs are zero-meaned and
//! scaled to unit energy, multiplied element-wise, and
//! `PCE = max(product)^2 / mean(product^2)`. The energy term averages over the
//! whole product, peak included, so values run lower than the textbook
//! metric that excludes a neighbourhood around the peak.

use rayon::prelude::*;

use crate::error::{Error, Result};

fn check_lengths(a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() == b.len() {
        Ok(())
    } else {
        Err(Error::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(data: &[f32]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().map(|&v| f64::from(v)).sum::<f64>() / data.len() as f64
}

/// Zero-mean, unit-energy copy of `data`, or `None` if it has no variance.
fn normalize(data: &[f32]) -> Option<Vec<f64>> {
    let m = mean(data);
    let centred: Vec<f64> = data.iter().map(|&v| f64::from(v) - m).collect();
    let energy = centred.iter().map(|v| v * v).sum::<f64>().sqrt();
    if energy <= f64::MIN_POSITIVE {
        return None;
    }
    Some(centred.into_iter().map(|v| v / energy).collect())
}

/// Normalized Cross-Correlation between two equal-length slices.
///
/// `NCC = sum((a-mean_a)*(b-mean_b)) / sqrt(sum((a-mean_a)^2) * sum((b-mean_b)^2))`
///
/// Returns 0 when either input has zero variance.
///
/// # Errors
///
/// Returns [`Error::DimensionMismatch`] if the slices differ in length.
pub fn ncc(a: &[f32], b: &[f32]) -> Result<f32> {
    check_lengths(a, b)?;
    if a.is_empty() {
        return Ok(0.0);
    }

    let mean_a = mean(a);
    let mean_b = mean(b);

    let mut numerator = 0.0_f64;
    let mut denom_a = 0.0_f64;
    let mut denom_b = 0.0_f64;

    for (&va, &vb) in a.iter().zip(b) {
        let da = f64::from(va) - mean_a;
        let db = f64::from(vb) - mean_b;
        numerator += da * db;
        denom_a += da * da;
        denom_b += db * db;
    }

    let denom = (denom_a * denom_b).sqrt();
    if denom <= f64::MIN_POSITIVE {
        return Ok(0.0);
    }
    #[allow(clippy::cast_possible_truncation)]
    let score = (numerator / denom).clamp(-1.0, 1.0) as f32;
    Ok(score)
}

/// Peak correlation energy of `residual` against `fingerprint`.
///
/// Returns 0 when either input has zero variance.
///
/// # Errors
///
/// Returns [`Error::DimensionMismatch`] if the slices differ in length.
pub fn pce(residual: &[f32], fingerprint: &[f32]) -> Result<f32> {
    check_lengths(fingerprint, residual)?;
    let (Some(r), Some(f)) = (normalize(residual), normalize(fingerprint)) else {
        return Ok(0.0);
    };

    let mut peak = f64::NEG_INFINITY;
    let mut energy = 0.0_f64;
    for (x, y) in r.iter().zip(&f) {
        let p = x * y;
        peak = peak.max(p);
        energy += p * p;
    }
    #[allow(clippy::cast_precision_loss)]
    let energy = energy / r.len() as f64;

    if energy <= f64::MIN_POSITIVE {
        return Ok(0.0);
    }
    #[allow(clippy::cast_possible_truncation)]
    let score = (peak * peak / energy) as f32;
    Ok(score)
}

/// Per-tile PCE scores over a `cols x rows` grid.
#[derive(Debug, Clone, PartialEq)]
pub struct PceGrid {
    /// Scores in row-major tile order.
    pub scores: Vec<f32>,
    /// Tiles per row.
    pub cols: u32,
    /// Tiles per column.
    pub rows: u32,
    /// Tile edge length in pixels.
    pub block_size: u32,
}

impl PceGrid {
    /// Pixel-space origin of tile `index`.
    #[must_use]
    pub fn tile_origin(&self, index: usize) -> (u32, u32) {
        #[allow(clippy::cast_possible_truncation)]
        let index = index as u32;
        (
            (index % self.cols) * self.block_size,
            (index / self.cols) * self.block_size,
        )
    }
}

/// Copy one tile out of a row-major buffer.
fn extract_tile(data: &[f32], width: usize, x0: usize, y0: usize, size: usize) -> Vec<f32> {
    let mut tile = Vec::with_capacity(size * size);
    for y in y0..y0 + size {
        let row = y * width;
        tile.extend_from_slice(&data[row + x0..row + x0 + size]);
    }
    tile
}

/// PCE of each `block_size x block_size` tile, in row-major tile order.
///
/// Pixels beyond the last whole tile on either axis are ignored.
///
/// # Errors
///
/// Returns [`Error::DimensionMismatch`] if either buffer is not
/// `width * height` long, and [`Error::ProcessingFailure`] if no whole tile fits.
pub fn local_pce_grid(
    residual: &[f32],
    fingerprint: &[f32],
    width: u32,
    height: u32,
    block_size: u32,
) -> Result<PceGrid> {
    let expected = width as usize * height as usize;
    for buf in [residual, fingerprint] {
        if buf.len() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: buf.len(),
            });
        }
    }
    if block_size == 0 || width < block_size || height < block_size {
        return Err(Error::ProcessingFailure(format!(
            "no {block_size}px tile fits in {width}x{height}"
        )));
    }

    let cols = width / block_size;
    let rows = height / block_size;
    let size = block_size as usize;
    let stride = width as usize;

    let scores = (0..(cols * rows) as usize)
        .into_par_iter()
        .map(|index| {
            let x0 = (index % cols as usize) * size;
            let y0 = (index / cols as usize) * size;
            let r = extract_tile(residual, stride, x0, y0, size);
            let f = extract_tile(fingerprint, stride, x0, y0, size);
            pce(&r, &f)
        })
        .collect::<Result<Vec<f32>>>()?;

    Ok(PceGrid {
        scores,
        cols,
        rows,
        block_size,
    })
}
