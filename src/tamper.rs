//! Block-wise tamper localization from a local PCE grid.
//!
//! A tile is flagged when its score falls more than [`OUTLIER_SIGMAS`]
//! standard deviations below the grid mean. Replaced or heavily edited
//! content no longer carries the sensor pattern, so its local match drops.

use serde::Serialize;

use crate::correlation::PceGrid;

/// Tiles scoring below `mean - OUTLIER_SIGMAS * stddev` are flagged.
pub const OUTLIER_SIGMAS: f64 = 2.0;

/// Axis-aligned rectangle in processing-pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Region {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// How much of the image was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TamperSeverity {
    /// No tile flagged.
    None,
    /// Under 5% of tiles.
    Minimal,
    /// 5% up to 20%.
    Minor,
    /// 20% up to 50%.
    Moderate,
    /// Half the tiles or more.
    Severe,
}

impl TamperSeverity {
    /// Bucket a flagged-tile fraction in `[0, 1]`.
    #[must_use]
    pub fn from_fraction(fraction: f64) -> Self {
        if fraction <= 0.0 {
            Self::None
        } else if fraction < 0.05 {
            Self::Minimal
        } else if fraction < 0.20 {
            Self::Minor
        } else if fraction < 0.50 {
            Self::Moderate
        } else {
            Self::Severe
        }
    }
}

impl std::fmt::Display for TamperSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Minimal => "minimal",
            Self::Minor => "minor",
            Self::Moderate => "moderate",
            Self::Severe => "severe",
        };
        f.write_str(s)
    }
}

/// Outcome of a tamper scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TamperDetectionResult {
    /// Whether any tile was flagged.
    pub is_tampered: bool,
    /// Flagged tiles in row-major order.
    pub tampered_regions: Vec<Region>,
    /// Mean of the local PCE scores.
    pub overall_pce: f32,
    /// Dispersion of the local scores, `min(100, 100 * stddev / mean)`.
    pub confidence: f32,
    /// Number of tiles scored.
    pub total_blocks: usize,
    /// Bucketed flagged-tile fraction.
    pub severity: TamperSeverity,
    /// Tile edge length in pixels.
    pub block_size: u32,
}

/// Flag low-outlier tiles of `grid`.
#[must_use]
pub fn localize(grid: &PceGrid) -> TamperDetectionResult {
    let total = grid.scores.len();
    if total == 0 {
        return TamperDetectionResult {
            is_tampered: false,
            tampered_regions: Vec::new(),
            overall_pce: 0.0,
            confidence: 0.0,
            total_blocks: 0,
            severity: TamperSeverity::None,
            block_size: grid.block_size,
        };
    }

    #[allow(clippy::cast_precision_loss)]
    let n = total as f64;
    let mean = grid.scores.iter().map(|&s| f64::from(s)).sum::<f64>() / n;
    let variance = grid
        .scores
        .iter()
        .map(|&s| {
            let d = f64::from(s) - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let stddev = variance.sqrt();
    let cutoff = mean - OUTLIER_SIGMAS * stddev;

    let tampered_regions: Vec<Region> = grid
        .scores
        .iter()
        .enumerate()
        .filter(|&(_, &s)| f64::from(s) < cutoff)
        .map(|(i, _)| {
            let (x, y) = grid.tile_origin(i);
            Region {
                x,
                y,
                width: grid.block_size,
                height: grid.block_size,
            }
        })
        .collect();

    let confidence = if mean > 0.0 {
        (100.0 * stddev / mean).min(100.0)
    } else {
        0.0
    };

    #[allow(clippy::cast_precision_loss)]
    let fraction = tampered_regions.len() as f64 / n;

    #[allow(clippy::cast_possible_truncation)]
    let (overall_pce, confidence) = (mean as f32, confidence as f32);

    TamperDetectionResult {
        is_tampered: !tampered_regions.is_empty(),
        severity: TamperSeverity::from_fraction(fraction),
        tampered_regions,
        overall_pce,
        confidence,
        total_blocks: total,
        block_size: grid.block_size,
    }
}
