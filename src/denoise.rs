//! Denoising and noise-residual extraction.
//!
//! The residual `pixel - denoised` is what carries the sensor pattern. Two
//! denoisers are available:
//!
//! 1. **Adaptive**: local Wiener-style shrinkage over a `(2k+1)²` window,
//!    `denoised = mean + gain * (pixel - mean)` with
//!    `gain = max(0, var - NOISE_FLOOR) / max(var, eps)`
//! 2. **Fast**: fixed 3x3 binomial kernel `[1,2,1; 2,4,2; 1,2,1] / 16`

use crate::config::{Config, DenoiserMode};
use crate::error::{Error, Result};

/// Variance attributed to sensor noise, in normalized `[0, 1]` units.
pub const NOISE_FLOOR: f64 = 0.01;

/// Guard against division by a vanishing local variance.
const VARIANCE_EPSILON: f64 = 1e-10;

/// 3x3 binomial kernel, row-major, sums to 16.
const FAST_KERNEL: [f32; 9] = [1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0];

/// Produces smoothed estimates and noise residuals of luminance buffers.
#[derive(Debug, Clone, Copy)]
pub struct Denoiser {
    mode: DenoiserMode,
    radius: usize,
}

impl Denoiser {
    /// Build a denoiser from the configured mode and window radius.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            mode: config.denoiser,
            radius: config.denoise_radius,
        }
    }

    /// Build a denoiser with an explicit mode and adaptive window radius.
    #[must_use]
    pub fn with_mode(mode: DenoiserMode, radius: usize) -> Self {
        Self { mode, radius }
    }

    /// Smoothed estimate of `pixels`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] if `pixels.len() != width * height`.
    pub fn denoise(&self, pixels: &[f32], width: usize, height: usize) -> Result<Vec<f32>> {
        check_len(pixels, width, height)?;
        Ok(match self.mode {
            DenoiserMode::Adaptive => adaptive_wiener(pixels, width, height, self.radius),
            DenoiserMode::Fast => binomial_3x3(pixels, width, height),
        })
    }

    /// Noise residual `pixels - denoise(pixels)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] if `pixels.len() != width * height`.
    pub fn residual(&self, pixels: &[f32], width: usize, height: usize) -> Result<Vec<f32>> {
        let denoised = self.denoise(pixels, width, height)?;
        Ok(pixels.iter().zip(&denoised).map(|(p, d)| p - d).collect())
    }
}

fn check_len(pixels: &[f32], width: usize, height: usize) -> Result<()> {
    if pixels.len() == width * height {
        Ok(())
    } else {
        Err(Error::DimensionMismatch {
            expected: width * height,
            actual: pixels.len(),
        })
    }
}

/// Summed-area tables of values and squared values.
///
/// Both tables are `(width + 1) x (height + 1)` with a zero first row and
/// column, so any window sum is four lookups.
struct IntegralImage {
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
    stride: usize,
}

impl IntegralImage {
    fn new(data: &[f32], width: usize, height: usize) -> Self {
        let stride = width + 1;
        let mut sum = vec![0.0_f64; stride * (height + 1)];
        let mut sum_sq = vec![0.0_f64; stride * (height + 1)];

        for y in 0..height {
            let mut row = 0.0_f64;
            let mut row_sq = 0.0_f64;
            for x in 0..width {
                let v = f64::from(data[y * width + x]);
                row += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row;
                sum_sq[idx] = sum_sq[idx - stride] + row_sq;
            }
        }

        Self {
            sum,
            sum_sq,
            stride,
        }
    }

    /// Sum and squared sum over `[x0, x1) x [y0, y1)`.
    fn window(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> (f64, f64) {
        let a = y0 * self.stride + x0;
        let b = y0 * self.stride + x1;
        let c = y1 * self.stride + x0;
        let d = y1 * self.stride + x1;
        (
            self.sum[d] - self.sum[b] - self.sum[c] + self.sum[a],
            self.sum_sq[d] - self.sum_sq[b] - self.sum_sq[c] + self.sum_sq[a],
        )
    }
}

/// Locally adaptive shrinkage towards the window mean.
///
/// Windows are clipped at the image border; statistics use only the pixels
/// that fall inside the image.
fn adaptive_wiener(data: &[f32], width: usize, height: usize, radius: usize) -> Vec<f32> {
    let table = IntegralImage::new(data, width, height);
    let mut out = vec![0.0_f32; width * height];

    for y in 0..height {
        let y0 = y.saturating_sub(radius);
        let y1 = (y + radius + 1).min(height);
        for x in 0..width {
            let x0 = x.saturating_sub(radius);
            let x1 = (x + radius + 1).min(width);

            #[allow(clippy::cast_precision_loss)]
            let count = ((x1 - x0) * (y1 - y0)) as f64;
            let (s, sq) = table.window(x0, y0, x1, y1);
            let mean = s / count;
            let variance = (sq / count - mean * mean).max(0.0);
            let gain = (variance - NOISE_FLOOR).max(0.0) / variance.max(VARIANCE_EPSILON);

            let pixel = f64::from(data[y * width + x]);
            #[allow(clippy::cast_possible_truncation)]
            let denoised = (mean + gain * (pixel - mean)) as f32;
            out[y * width + x] = denoised;
        }
    }

    out
}

/// 3x3 binomial blur. Border pixels are copied unchanged.
fn binomial_3x3(data: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut out = data.to_vec();
    if width < 3 || height < 3 {
        return out;
    }

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let mut acc = 0.0_f32;
            for ky in 0..3 {
                let row = (y + ky - 1) * width;
                for kx in 0..3 {
                    acc += FAST_KERNEL[ky * 3 + kx] * data[row + x + kx - 1];
                }
            }
            out[y * width + x] = acc / 16.0;
        }
    }

    out
}
