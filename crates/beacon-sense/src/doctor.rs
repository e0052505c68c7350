use anyhow::Result;

use crate::quality::QualityThresholds;

pub fn check_quality_thresholds(th: &QualityThresholds) -> Result<()> {
    anyhow::ensure!(th.weak_m > 0.0, "sensor.weak_threshold_m must be positive");
    anyhow::ensure!(
        th.lost_m > th.weak_m,
        "sensor.lost_threshold_m must exceed weak_threshold_m"
    );
    Ok(())
}

pub fn check_watch_timing(timeout_s: u64, max_sample_age_s: u64) -> Result<()> {
    anyhow::ensure!(
        (1..=120).contains(&timeout_s),
        "sensor.timeout_s should be 1..120"
    );
    anyhow::ensure!(
        max_sample_age_s >= timeout_s,
        "sensor.max_sample_age_s should be >= sensor.timeout_s"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_thresholds_are_rejected() {
        let th = QualityThresholds {
            weak_m: 500.0,
            lost_m: 100.0,
        };
        assert!(check_quality_thresholds(&th).is_err());
        assert!(check_quality_thresholds(&QualityThresholds::default()).is_ok());
    }

    #[test]
    fn watch_timing_bounds() {
        assert!(check_watch_timing(15, 30).is_ok());
        assert!(check_watch_timing(0, 30).is_err());
        assert!(check_watch_timing(15, 5).is_err());
    }
}
