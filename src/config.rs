//! Engine configuration.
//!
//! Every field has a default, so a JSON config file only needs to name the
//! values it overrides:
//!
//! ```json
//! { "width": 1024, "height": 1024, "denoiser": "fast" }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Smoothing strategy used to estimate the noise-free image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DenoiserMode {
    /// Locally adaptive Wiener-style filter over a `(2k+1)²` window.
    #[default]
    Adaptive,
    /// Fixed 3x3 binomial blur; border pixels pass through.
    Fast,
}

/// Options controlling preprocessing, scoring, and the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minimum number of images accepted for enrollment.
    pub min_enrollment_images: usize,
    /// Global PCE at or above which an image is declared authentic.
    pub pce_threshold: f32,
    /// Processing width in pixels.
    pub width: u32,
    /// Processing height in pixels.
    pub height: u32,
    /// Denoiser used for residual extraction.
    pub denoiser: DenoiserMode,
    /// Window radius `k` of the adaptive denoiser.
    pub denoise_radius: usize,
    /// Apply `pixel^gamma` after normalization.
    pub gamma_correction: bool,
    /// Exponent used when `gamma_correction` is set.
    pub gamma: f32,
    /// Tile edge length for tamper localization.
    pub block_size: u32,
    /// Number of worker threads in the analysis pool.
    pub worker_threads: usize,
    /// Seal persisted fingerprints and require an unlocked store.
    pub secure_storage: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_enrollment_images: 50,
            pce_threshold: 60.0,
            width: 512,
            height: 512,
            denoiser: DenoiserMode::Adaptive,
            denoise_radius: 5,
            gamma_correction: false,
            gamma: 2.2,
            block_size: 128,
            worker_threads: 4,
            secure_storage: true,
        }
    }
}

impl Config {
    /// Load a JSON config file and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the file cannot be read, is not
    /// valid JSON, or fails [`Config::validate`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the pipeline relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "processing size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("block_size must be non-zero".into()));
        }
        if self.width % self.block_size != 0 || self.height % self.block_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "{}x{} is not divisible by block_size {}",
                self.width, self.height, self.block_size
            )));
        }
        if self.min_enrollment_images == 0 {
            return Err(Error::InvalidConfig("min_enrollment_images must be at least 1".into()));
        }
        if !(self.pce_threshold.is_finite() && self.pce_threshold > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "pce_threshold must be positive, got {}",
                self.pce_threshold
            )));
        }
        if self.gamma_correction && !(self.gamma.is_finite() && self.gamma > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "gamma must be positive, got {}",
                self.gamma
            )));
        }
        if self.worker_threads == 0 {
            return Err(Error::InvalidConfig("worker_threads must be at least 1".into()));
        }
        Ok(())
    }

    /// Number of samples in a processed buffer.
    #[must_use]
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}
