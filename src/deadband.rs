use serde::{Deserialize, Serialize};

/// Suppresses analog readings that moved less than `threshold` away from the last
/// delivered value.
///
/// The filter holds at most one baseline. The first finite observation is always
/// delivered; after that an observation is delivered (and becomes the new baseline)
/// only when `|value - baseline| > threshold`. Changing the threshold never
/// re-evaluates the stored baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadbandFilter {
    threshold: f64,
    baseline: Option<f64>,
}

impl DeadbandFilter {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.abs(),
            baseline: None,
        }
    }

    /// Returns `true` when the value should be propagated downstream.
    pub fn observe(&mut self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }

        match self.baseline {
            Some(baseline) if (value - baseline).abs() <= self.threshold => false,
            _ => {
                self.baseline = Some(value);
                true
            }
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f64) {
        self.threshold = threshold.abs();
    }

    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }

    /// Forget the baseline so the next observation is delivered unconditionally.
    pub fn reset(&mut self) {
        self.baseline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_always_delivered() {
        let mut filter = DeadbandFilter::new(10.0);
        assert!(filter.observe(0.0));
        assert_eq!(filter.baseline(), Some(0.0));
    }

    #[test]
    fn test_small_changes_dropped() {
        let mut filter = DeadbandFilter::new(0.5);
        assert!(filter.observe(1.0));
        assert!(!filter.observe(1.3));
        assert!(!filter.observe(1.5));
        assert!(!filter.observe(0.5));
        assert_eq!(filter.baseline(), Some(1.0));
    }

    #[test]
    fn test_changes_measured_against_last_delivered() {
        let mut filter = DeadbandFilter::new(0.5);
        assert!(filter.observe(1.0));
        // Drift in small steps never accumulates into a delivery
        assert!(!filter.observe(1.4));
        assert!(!filter.observe(1.2));
        assert!(filter.observe(1.6));
        assert_eq!(filter.baseline(), Some(1.6));
        assert!(!filter.observe(1.2));
        assert!(filter.observe(1.0));
    }

    #[test]
    fn test_threshold_change_does_not_redeliver() {
        let mut filter = DeadbandFilter::new(1.0);
        assert!(filter.observe(5.0));
        assert!(!filter.observe(5.5));

        filter.set_threshold(0.1);
        // The dropped 5.5 stays dropped; only new observations are judged
        assert_eq!(filter.baseline(), Some(5.0));
        assert!(!filter.observe(5.05));
        assert!(filter.observe(5.2));
    }

    #[test]
    fn test_widened_threshold_applies_to_next_observation() {
        let mut filter = DeadbandFilter::new(0.01);
        assert!(filter.observe(0.0));
        filter.set_threshold(2.0);
        assert!(!filter.observe(1.9));
        assert!(filter.observe(2.1));
    }

    #[test]
    fn test_non_finite_values_ignored() {
        let mut filter = DeadbandFilter::new(0.1);
        assert!(!filter.observe(f64::NAN));
        assert_eq!(filter.baseline(), None);
        assert!(filter.observe(3.0));
        assert!(!filter.observe(f64::INFINITY));
        assert_eq!(filter.baseline(), Some(3.0));
    }

    #[test]
    fn test_reset_forgets_baseline() {
        let mut filter = DeadbandFilter::new(1.0);
        assert!(filter.observe(2.0));
        filter.reset();
        assert!(filter.observe(2.1));
    }

    #[test]
    fn test_exact_threshold_is_not_a_change() {
        let mut filter = DeadbandFilter::new(0.5);
        assert!(filter.observe(1.0));
        assert!(!filter.observe(1.5));
    }
}
