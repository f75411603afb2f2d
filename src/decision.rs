//! Authenticity verdicts from a global PCE score.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Coarse label for how strongly an image matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchQuality {
    /// Confidence 80 and above.
    Excellent,
    /// Confidence in `[60, 80)`.
    Good,
    /// Confidence in `[40, 60)`.
    Fair,
    /// Confidence below 40.
    Poor,
}

impl MatchQuality {
    /// Bucket a confidence in `[0, 100]`.
    #[must_use]
    pub fn from_confidence(confidence: f32) -> Self {
        if confidence >= 80.0 {
            Self::Excellent
        } else if confidence >= 60.0 {
            Self::Good
        } else if confidence >= 40.0 {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

impl std::fmt::Display for MatchQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        })
    }
}

/// Verdict for one query image against one enrolled camera.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthenticationResult {
    /// `pce_score >= threshold`.
    pub is_authentic: bool,
    /// Global PCE of the query residual against the fingerprint.
    pub pce_score: f32,
    /// `min(100, pce / threshold * 100)`.
    pub confidence: f32,
    /// Camera the image was checked against.
    pub camera_id: String,
    /// When the verdict was produced.
    pub timestamp: DateTime<Utc>,
    /// Free-form details for reporting layers.
    pub metadata: BTreeMap<String, String>,
    /// Bucketed confidence.
    pub quality: MatchQuality,
}

impl AuthenticationResult {
    /// Apply the threshold rule to `pce_score`.
    ///
    /// `threshold` must be positive; [`Config::validate`](crate::Config::validate)
    /// guarantees this for engine-produced results.
    #[must_use]
    pub fn decide(camera_id: impl Into<String>, pce_score: f32, threshold: f32) -> Self {
        let confidence = if threshold > 0.0 {
            (pce_score / threshold * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        let quality = MatchQuality::from_confidence(confidence);
        let mut metadata = BTreeMap::new();
        metadata.insert("quality".to_string(), quality.to_string());
        metadata.insert("threshold".to_string(), format!("{threshold}"));

        Self {
            is_authentic: pce_score >= threshold,
            pce_score,
            confidence,
            camera_id: camera_id.into(),
            timestamp: Utc::now(),
            metadata,
            quality,
        }
    }
}
