//! Camera fingerprints and their estimation from enrollment images.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::correlation;
use crate::error::{Error, Result};

/// Schema version written into every new fingerprint record.
pub const FINGERPRINT_VERSION: &str = "1.0";

/// A sensor fingerprint enrolled for one camera.
///
/// The record is immutable: re-enrolling a camera produces a new
/// fingerprint that replaces the stored one wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraFingerprint {
    #[serde(rename = "cameraID")]
    camera_id: String,
    fingerprint: Vec<f32>,
    width: u32,
    height: u32,
    enrollment_date: DateTime<Utc>,
    number_of_images: usize,
    #[serde(rename = "averagePCE")]
    average_pce: f32,
    version: String,
}

impl CameraFingerprint {
    /// Build a fingerprint record stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] if `data.len() != width * height`,
    /// or [`Error::ProcessingFailure`] for an empty camera id or non-finite data.
    pub fn new(
        camera_id: impl Into<String>,
        data: Vec<f32>,
        width: u32,
        height: u32,
        number_of_images: usize,
        average_pce: f32,
    ) -> Result<Self> {
        let fingerprint = Self {
            camera_id: camera_id.into(),
            fingerprint: data,
            width,
            height,
            enrollment_date: Utc::now(),
            number_of_images,
            average_pce,
            version: FINGERPRINT_VERSION.to_string(),
        };
        fingerprint.validate()?;
        Ok(fingerprint)
    }

    /// Check the record's structural invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] if the vector length disagrees with
    /// the stored dimensions, or [`Error::ProcessingFailure`] for an empty
    /// camera id or non-finite samples.
    pub fn validate(&self) -> Result<()> {
        if self.camera_id.is_empty() {
            return Err(Error::ProcessingFailure("empty camera id".into()));
        }
        let expected = self.width as usize * self.height as usize;
        if self.fingerprint.len() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: self.fingerprint.len(),
            });
        }
        if self.fingerprint.iter().any(|v| !v.is_finite()) {
            return Err(Error::ProcessingFailure(format!(
                "fingerprint for '{}' contains non-finite samples",
                self.camera_id
            )));
        }
        Ok(())
    }

    /// Camera this fingerprint belongs to.
    #[must_use]
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Row-major fingerprint samples, `width * height` long.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.fingerprint
    }

    /// Width the fingerprint was estimated at.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height the fingerprint was estimated at.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// When enrollment finished.
    #[must_use]
    pub fn enrollment_date(&self) -> DateTime<Utc> {
        self.enrollment_date
    }

    /// Number of images the fingerprint was estimated from.
    #[must_use]
    pub fn number_of_images(&self) -> usize {
        self.number_of_images
    }

    /// Mean global PCE of the enrollment residuals against this fingerprint.
    #[must_use]
    pub fn average_pce(&self) -> f32 {
        self.average_pce
    }

    /// Record schema version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }
}

/// Maximum-likelihood PRNU estimate from images and their residuals.
///
/// Per pixel: `K = sum(residual * image) / sum(image^2)`, or 0 where every
/// image is black. The result is mean-centred.
///
/// # Errors
///
/// Returns [`Error::ProcessingFailure`] when no images are given or the
/// image and residual counts differ, and [`Error::DimensionMismatch`] when
/// buffers differ in length.
pub fn aggregate(images: &[Vec<f32>], residuals: &[Vec<f32>]) -> Result<Vec<f32>> {
    let Some(first) = images.first() else {
        return Err(Error::ProcessingFailure("no images to aggregate".into()));
    };
    if images.len() != residuals.len() {
        return Err(Error::ProcessingFailure(format!(
            "{} images but {} residuals",
            images.len(),
            residuals.len()
        )));
    }

    let n = first.len();
    for buf in images.iter().chain(residuals) {
        if buf.len() != n {
            return Err(Error::DimensionMismatch {
                expected: n,
                actual: buf.len(),
            });
        }
    }

    let mut numerator = vec![0.0_f64; n];
    let mut denominator = vec![0.0_f64; n];
    for (image, residual) in images.iter().zip(residuals) {
        numerator
            .par_iter_mut()
            .zip(denominator.par_iter_mut())
            .zip(image.par_iter().zip(residual.par_iter()))
            .for_each(|((num, den), (&i, &r))| {
                let i = f64::from(i);
                *num += f64::from(r) * i;
                *den += i * i;
            });
    }

    let mut estimate: Vec<f64> = numerator
        .iter()
        .zip(&denominator)
        .map(|(&num, &den)| if den == 0.0 { 0.0 } else { num / den })
        .collect();

    #[allow(clippy::cast_precision_loss)]
    let mean = estimate.iter().sum::<f64>() / n.max(1) as f64;
    for v in &mut estimate {
        *v -= mean;
    }

    #[allow(clippy::cast_possible_truncation)]
    let estimate = estimate.into_iter().map(|v| v as f32).collect();
    Ok(estimate)
}

/// Mean global PCE of each residual against a finished fingerprint.
///
/// # Errors
///
/// Returns [`Error::DimensionMismatch`] if any residual differs in length
/// from the fingerprint.
pub fn enrollment_quality(residuals: &[Vec<f32>], fingerprint: &[f32]) -> Result<f32> {
    if residuals.is_empty() {
        return Ok(0.0);
    }
    let scores = residuals
        .par_iter()
        .map(|r| correlation::pce(r, fingerprint))
        .collect::<Result<Vec<f32>>>()?;
    #[allow(clippy::cast_precision_loss)]
    let average = scores.iter().sum::<f32>() / scores.len() as f32;
    Ok(average)
}
