//! Pure GPS quality / signal-strength classification.
//!
//! Both values are always derived together from one (sample, error) snapshot
//! so a stale error can never be paired with a fresh sample.

use beacon_proto::{GpsQuality, RawSample};
use serde::Deserialize;

use crate::sensor::SensorError;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QualityThresholds {
    /// Accuracy at or below this is a good fix.
    pub weak_m: f64,
    /// Accuracy above this is a lost fix.
    pub lost_m: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            weak_m: 100.0,
            lost_m: 500.0,
        }
    }
}

/// Classifies one snapshot into (quality tier, 0-100 signal strength).
pub fn classify(
    sample: Option<&RawSample>,
    error: Option<&SensorError>,
    th: QualityThresholds,
) -> (GpsQuality, u8) {
    if let Some(err) = error {
        let quality = match err {
            SensorError::Unavailable(_) | SensorError::Timeout => GpsQuality::Lost,
            SensorError::PermissionDenied | SensorError::Unsupported => GpsQuality::Unknown,
        };
        return (quality, 0);
    }

    let Some(acc) = sample.and_then(|s| s.accuracy_m) else {
        return (GpsQuality::Unknown, 0);
    };

    let quality = if acc > th.lost_m {
        GpsQuality::Lost
    } else if acc <= th.weak_m {
        GpsQuality::Good
    } else {
        GpsQuality::Weak
    };
    let strength = (100.0 - (acc / th.lost_m) * 100.0).clamp(0.0, 100.0).round() as u8;
    (quality, strength)
}

/// Quality tier alone; delegates to [`classify`] so the rule cannot diverge.
pub fn quality(
    sample: Option<&RawSample>,
    error: Option<&SensorError>,
    th: QualityThresholds,
) -> GpsQuality {
    classify(sample, error, th).0
}

/// Signal strength alone; delegates to [`classify`].
pub fn strength(
    sample: Option<&RawSample>,
    error: Option<&SensorError>,
    th: QualityThresholds,
) -> u8 {
    classify(sample, error, th).1
}
