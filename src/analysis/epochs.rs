use log::debug;
use serde::{Deserialize, Serialize};

use crate::analysis::error::{Result, SignalError};

/// Plateaus shorter than this are dropped.
pub const MIN_EPOCH_SECONDS: f64 = 7.0;
/// Removed from both ends of a kept plateau to skip ramp transients.
pub const TRANSITION_TRIM_SECONDS: f64 = 2.0;
const BOUNDARY_TOLERANCE: f64 = 1e-9;

/// One side's stimulation amplitude as a step function over time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StimulationSeries {
    pub time: Vec<f64>,
    pub amplitude: Vec<f64>,
}

impl StimulationSeries {
    pub fn new(time: Vec<f64>, amplitude: Vec<f64>) -> Result<Self> {
        if time.len() != amplitude.len() {
            return Err(SignalError::length_mismatch(
                "stimulation series",
                time.len(),
                amplitude.len(),
            ));
        }
        if time.windows(2).any(|w| w[1] < w[0]) {
            return Err(SignalError::Malformed(
                "stimulation times must be in time order".into(),
            ));
        }
        Ok(Self { time, amplitude })
    }

    /// Build from change points only; the last level holds until `end_time`.
    pub fn from_change_points(times: &[f64], amplitudes: &[f64], end_time: f64) -> Result<Self> {
        let mut time = times.to_vec();
        let mut amplitude = amplitudes.to_vec();
        if let (Some(&last_t), Some(&last_a)) = (times.last(), amplitudes.last()) {
            if end_time > last_t {
                time.push(end_time);
                amplitude.push(last_a);
            }
        }
        Self::new(time, amplitude)
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// A maximal constant-amplitude interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StimulationEpoch {
    pub amplitude: f64,
    pub start_index: usize,
    /// Index of the sample that ends the plateau (first sample of the next
    /// level, or the final sample).
    pub end_index: usize,
    pub start_time: f64,
    pub end_time: f64,
    /// Inclusive interior window used for feature extraction.
    pub window: (f64, f64),
}

impl StimulationEpoch {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn contains(&self, t: f64) -> bool {
        t >= self.window.0 && t <= self.window.1
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EpochSegmenter {
    pub min_duration_s: f64,
    pub trim_s: f64,
}

impl Default for EpochSegmenter {
    fn default() -> Self {
        Self {
            min_duration_s: MIN_EPOCH_SECONDS,
            trim_s: TRANSITION_TRIM_SECONDS,
        }
    }
}

impl EpochSegmenter {
    /// Plateaus of at least `min_duration_s`, sorted by ascending amplitude.
    pub fn segment(&self, series: &StimulationSeries) -> Vec<StimulationEpoch> {
        let mut epochs = self.segment_in_time_order(series);
        // stable: equal amplitudes keep their time order
        epochs.sort_by(|a, b| a.amplitude.total_cmp(&b.amplitude));
        epochs
    }

    pub fn segment_in_time_order(&self, series: &StimulationSeries) -> Vec<StimulationEpoch> {
        let n = series.len();
        let mut epochs = Vec::new();
        if n < 2 {
            return epochs;
        }
        let mut start = 0;
        for i in 1..=n {
            let boundary = i == n || series.amplitude[i] != series.amplitude[i - 1];
            if !boundary {
                continue;
            }
            let end = i.min(n - 1);
            let (t0, t1) = (series.time[start], series.time[end]);
            let amplitude = series.amplitude[start];
            if amplitude.is_finite() && t1 - t0 >= self.min_duration_s - BOUNDARY_TOLERANCE {
                epochs.push(StimulationEpoch {
                    amplitude,
                    start_index: start,
                    end_index: end,
                    start_time: t0,
                    end_time: t1,
                    window: (t0 + self.trim_s, t1 - self.trim_s),
                });
            }
            start = i;
        }
        debug!("{} stimulation epochs kept", epochs.len());
        epochs
    }
}

/// `(amplitude, index)` for every time point that lies inside an epoch window.
pub fn samples_in_epochs(epochs: &[StimulationEpoch], times: &[f64]) -> Vec<(f64, usize)> {
    let mut selected = Vec::new();
    for epoch in epochs {
        for (idx, &t) in times.iter().enumerate() {
            if epoch.contains(t) {
                selected.push((epoch.amplitude, idx));
            }
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plateau_of_exactly_seven_seconds_is_kept() {
        let series = StimulationSeries::new(vec![0.0, 7.0, 10.0], vec![1.0, 2.0, 2.0]).unwrap();
        let epochs = EpochSegmenter::default().segment(&series);
        assert_eq!(epochs.len(), 1);
        assert_eq!(epochs[0].amplitude, 1.0);
        assert_eq!(epochs[0].window, (2.0, 5.0));
    }

    #[test]
    fn plateau_just_under_seven_seconds_is_dropped() {
        let series = StimulationSeries::new(vec![0.0, 6.99, 10.0], vec![1.0, 2.0, 2.0]).unwrap();
        assert!(EpochSegmenter::default().segment(&series).is_empty());
    }

    #[test]
    fn epochs_come_back_sorted_by_amplitude() {
        let series =
            StimulationSeries::from_change_points(&[0.0, 10.0, 20.0, 30.0], &[2.0, 0.5, 1.0, 0.5], 40.0)
                .unwrap();
        let epochs = EpochSegmenter::default().segment(&series);
        let amplitudes: Vec<f64> = epochs.iter().map(|e| e.amplitude).collect();
        assert_eq!(amplitudes, vec![0.5, 0.5, 1.0, 2.0]);
        assert_eq!(epochs[0].start_time, 10.0);
        assert_eq!(epochs[1].start_time, 30.0);
        assert_eq!(epochs[1].window, (32.0, 38.0));
    }

    #[test]
    fn sample_level_series_splits_on_changes() {
        let time: Vec<f64> = (0..300).map(|i| i as f64 * 0.1).collect();
        let amplitude: Vec<f64> = (0..300).map(|i| if i < 150 { 0.0 } else { 1.5 }).collect();
        let series = StimulationSeries::new(time, amplitude).unwrap();
        let epochs = EpochSegmenter::default().segment_in_time_order(&series);
        assert_eq!(epochs.len(), 2);
        assert_eq!(epochs[0].end_index, 150);
        assert!((epochs[0].duration() - 15.0).abs() < 1e-9);
        assert!((epochs[1].duration() - 14.9).abs() < 1e-9);
    }

    #[test]
    fn epoch_window_selects_interior_samples() {
        let series = StimulationSeries::new(vec![0.0, 8.0, 9.0], vec![3.0, 4.0, 4.0]).unwrap();
        let epochs = EpochSegmenter::default().segment(&series);
        let times: Vec<f64> = (0..9).map(|i| i as f64).collect();
        let picked = samples_in_epochs(&epochs, &times);
        assert_eq!(picked, vec![(3.0, 2), (3.0, 3), (3.0, 4), (3.0, 5), (3.0, 6)]);
    }

    #[test]
    fn mismatched_series_is_rejected() {
        assert!(StimulationSeries::new(vec![0.0, 1.0], vec![1.0]).is_err());
    }
}
