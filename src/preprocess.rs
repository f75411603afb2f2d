//! Image normalization into fixed-size luminance buffers.
//!
//! Every image, whether used for enrollment or as a query, goes through the
//! same steps: resample to the processing size, collapse to luminance in
//! `[0, 1]`, and optionally apply gamma.

use std::path::Path;

use image::imageops::FilterType;
use image::DynamicImage;

use crate::config::Config;
use crate::error::{Error, Result};

/// Luminance weights for R, G, B.
const LUMA_WEIGHTS: [f32; 3] = [0.299, 0.587, 0.114];

/// Converts decoded images into row-major `f32` luminance buffers.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    width: u32,
    height: u32,
    gamma: Option<f32>,
}

impl Preprocessor {
    /// Build a preprocessor for the configured processing size and gamma.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            width: config.width,
            height: config.height,
            gamma: config.gamma_correction.then_some(config.gamma),
        }
    }

    /// Same gamma handling, different output size.
    ///
    /// Queries are scored at the size recorded in the stored fingerprint.
    #[must_use]
    pub fn with_dimensions(&self, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            gamma: self.gamma,
        }
    }

    /// Output width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Output height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Normalize `image` into a buffer of `width * height` samples in `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImageProcessingFailure`] for empty images, when
    /// resampling yields an unexpected size, or when the image contains
    /// non-finite samples.
    pub fn process(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::ImageProcessingFailure(format!(
                "degenerate {}x{} image",
                image.width(),
                image.height()
            )));
        }

        let rgb = if (image.width(), image.height()) == (self.width, self.height) {
            image.to_rgb32f()
        } else {
            image
                .resize_exact(self.width, self.height, FilterType::Lanczos3)
                .to_rgb32f()
        };

        if rgb.dimensions() != (self.width, self.height) {
            return Err(Error::ImageProcessingFailure(format!(
                "resampling produced {}x{}, expected {}x{}",
                rgb.width(),
                rgb.height(),
                self.width,
                self.height
            )));
        }

        let mut out = Vec::with_capacity(self.width as usize * self.height as usize);
        for px in rgb.pixels() {
            let lum = LUMA_WEIGHTS[0] * px[0] + LUMA_WEIGHTS[1] * px[1] + LUMA_WEIGHTS[2] * px[2];
            if !lum.is_finite() {
                return Err(Error::ImageProcessingFailure(
                    "image contains non-finite samples".into(),
                ));
            }
            let lum = lum.clamp(0.0, 1.0);
            out.push(match self.gamma {
                Some(gamma) => lum.powf(gamma),
                None => lum,
            });
        }

        Ok(out)
    }
}

/// Decode an image file.
///
/// # Errors
///
/// Returns [`Error::ImageProcessingFailure`] if the file cannot be opened or decoded.
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path)
        .map_err(|e| Error::ImageProcessingFailure(format!("{}: {e}", path.display())))
}

/// Check if a file has a supported image extension.
#[must_use]
pub fn is_supported_image(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => matches!(
            ext.to_lowercase().as_str(),
            "jpg" | "jpeg" | "png" | "webp" | "bmp" | "tif" | "tiff"
        ),
        None => false,
    }
}
