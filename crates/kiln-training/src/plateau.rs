//! Accuracy plateau detection for the local train loop.

/// Length of an identical-accuracy run that forces the run to stop.
pub const PLATEAU_THRESHOLD: u32 = 10;

/// Tracks how many consecutive iterations reported the same accuracy.
///
/// Accuracies are compared with exact equality. The counter holds the length
/// of the current run: a repeated value extends it, a new value restarts it
/// at one.
#[derive(Debug, Clone)]
pub struct PlateauDetector {
    threshold: u32,
    previous: Option<f64>,
    stagnant: u32,
}

impl PlateauDetector {
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self { threshold, previous: None, stagnant: 0 }
    }

    /// Records one iteration's accuracy. Returns `true` once the run length
    /// reaches the threshold.
    #[allow(clippy::float_cmp)]
    pub fn observe(&mut self, current_accuracy: f64) -> bool {
        self.stagnant = match self.previous {
            Some(previous) if previous == current_accuracy => self.stagnant + 1,
            _ => 1,
        };
        self.previous = Some(current_accuracy);
        self.is_plateau()
    }

    #[must_use]
    pub fn is_plateau(&self) -> bool {
        self.stagnant >= self.threshold
    }

    #[must_use]
    pub fn stagnant_iterations(&self) -> u32 {
        self.stagnant
    }
}

impl Default for PlateauDetector {
    fn default() -> Self {
        Self::new(PLATEAU_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_tracks_run_length() {
        let mut detector = PlateauDetector::default();
        for accuracy in [0.5, 0.6, 0.7, 0.7, 0.7] {
            assert!(!detector.observe(accuracy));
        }
        assert_eq!(detector.stagnant_iterations(), 3);
    }

    #[test]
    fn test_ten_identical_iterations_trigger_stop() {
        let mut detector = PlateauDetector::default();
        assert!(!detector.observe(0.1));
        let mut stopped_at = None;
        for iteration in 2..=20u32 {
            if detector.observe(0.42) {
                stopped_at = Some(iteration);
                break;
            }
        }
        assert_eq!(stopped_at, Some(11));
    }

    #[test]
    fn test_change_restarts_run() {
        let mut detector = PlateauDetector::new(3);
        assert!(!detector.observe(0.3));
        assert!(!detector.observe(0.3));
        assert!(!detector.observe(0.31));
        assert_eq!(detector.stagnant_iterations(), 1);
        assert!(!detector.observe(0.31));
        assert!(detector.observe(0.31));
    }

    #[test]
    fn test_nearly_equal_values_do_not_count() {
        let mut detector = PlateauDetector::default();
        detector.observe(0.7);
        detector.observe(0.7 + 1e-12);
        assert_eq!(detector.stagnant_iterations(), 1);
    }
}
