use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::analysis::epochs::{samples_in_epochs, EpochSegmenter, StimulationEpoch, StimulationSeries};
use crate::analysis::spectral::SpectralResult;
use crate::analysis::stats;

/// Sentinel for "no usable frequency".
pub const NO_FREQUENCY: f64 = -1.0;
/// Physiologically plausible search band.
pub const SEARCH_BAND_HZ: (f64, f64) = (5.0, 50.0);
pub const MIN_AMPLITUDE_LEVELS: usize = 3;
const SCORE_SMOOTHING: usize = 5;
const DEGENERATE: f64 = 1e-12;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrequencyOfInterest {
    pub center_frequency: f64,
    /// Mean in-band score over mean out-of-band score.
    pub goodness_of_fit: f64,
    pub frequencies: Vec<f64>,
    /// Smoothed combined modulation x correlation score per frequency.
    pub score: Vec<f64>,
}

impl FrequencyOfInterest {
    pub fn none() -> Self {
        Self {
            center_frequency: NO_FREQUENCY,
            goodness_of_fit: NO_FREQUENCY,
            frequencies: Vec::new(),
            score: Vec::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.center_frequency >= 0.0
    }
}

/// Frequency whose power tracks stimulation amplitude best, using the
/// constant-amplitude plateaus of `series`.
pub fn extract_frequency_of_interest(
    spectral: &SpectralResult,
    series: &StimulationSeries,
) -> FrequencyOfInterest {
    let epochs = EpochSegmenter::default().segment(series);
    select_from_epochs(spectral, &epochs)
}

pub fn select_from_epochs(spectral: &SpectralResult, epochs: &[StimulationEpoch]) -> FrequencyOfInterest {
    let samples = samples_in_epochs(epochs, &spectral.times);
    let amplitudes: Vec<f64> = samples.iter().map(|(a, _)| *a).collect();
    let levels = stats::distinct_count(&amplitudes);
    if levels < MIN_AMPLITUDE_LEVELS {
        debug!("frequency selection needs {MIN_AMPLITUDE_LEVELS} amplitude levels, found {levels}");
        return FrequencyOfInterest::none();
    }
    let columns: Vec<usize> = samples.iter().map(|(_, c)| *c).collect();
    let log_power = spectral.log_power();

    let mut modulation = Vec::with_capacity(spectral.frequencies.len());
    let mut correlation = Vec::with_capacity(spectral.frequencies.len());
    for row in 0..spectral.frequencies.len() {
        let linear: Vec<f64> = columns.iter().map(|&c| spectral.power[[row, c]]).collect();
        let logged: Vec<f64> = columns.iter().map(|&c| log_power[[row, c]]).collect();
        modulation.push(stats::variance(&logged));
        correlation.push(stats::pearson(&amplitudes, &linear).map_or(0.0, |r| r * r));
    }

    let max_modulation = modulation.iter().copied().fold(0.0, f64::max);
    let max_correlation = correlation.iter().copied().fold(0.0, f64::max);
    if !(max_modulation > DEGENERATE && max_correlation > DEGENERATE)
        || !max_modulation.is_finite()
    {
        warn!("frequency selection: no modulation or correlation to normalise by");
        return FrequencyOfInterest::none();
    }
    let raw: Vec<f64> = modulation
        .iter()
        .zip(&correlation)
        .map(|(m, c)| (m / max_modulation) * (c / max_correlation))
        .collect();
    let score = stats::smooth(&raw, SCORE_SMOOTHING);

    let (low, high) = SEARCH_BAND_HZ;
    let in_band = |f: f64| f >= low && f <= high;
    let mut best: Option<usize> = None;
    for (i, &f) in spectral.frequencies.iter().enumerate() {
        if in_band(f) && best.map_or(true, |b| score[i] > score[b]) {
            best = Some(i);
        }
    }
    let Some(best) = best else {
        return FrequencyOfInterest::none();
    };

    let (inside, outside): (Vec<(f64, f64)>, Vec<(f64, f64)>) = spectral
        .frequencies
        .iter()
        .copied()
        .zip(score.iter().copied())
        .partition(|(f, _)| in_band(*f));
    let inside: Vec<f64> = inside.into_iter().map(|(_, s)| s).collect();
    let outside: Vec<f64> = outside.into_iter().map(|(_, s)| s).collect();
    let goodness_of_fit = stats::mean(&inside) / stats::mean(&outside).max(DEGENERATE);

    let center_frequency = spectral.frequencies[best];
    debug!("center frequency {center_frequency} Hz, goodness of fit {goodness_of_fit:.3}");
    FrequencyOfInterest {
        center_frequency,
        goodness_of_fit,
        frequencies: spectral.frequencies.clone(),
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// 0.5 Hz x 0.5 s grid; power around 20 Hz falls as amplitude rises.
    fn synthetic_spectrum(levels: &[(f64, f64)], end: f64) -> (SpectralResult, StimulationSeries) {
        let frequencies: Vec<f64> = (0..=120).map(|k| k as f64 * 0.5).collect();
        let times: Vec<f64> = (1..(end * 2.0) as usize).map(|k| k as f64 * 0.5).collect();
        let change_times: Vec<f64> = levels.iter().map(|(t, _)| *t).collect();
        let amplitudes: Vec<f64> = levels.iter().map(|(_, a)| *a).collect();
        let series = StimulationSeries::from_change_points(&change_times, &amplitudes, end).unwrap();
        let amplitude_at = |t: f64| {
            let idx = change_times.partition_point(|&c| c <= t).max(1) - 1;
            amplitudes[idx]
        };
        let power = Array2::from_shape_fn((frequencies.len(), times.len()), |(f, c)| {
            let freq = frequencies[f];
            let t = times[c];
            // deterministic "noise" so every bin has some variance
            let jitter = 1.0 + 0.1 * ((f * 7 + c * 13) % 11) as f64 / 11.0;
            let bump = (-(freq - 20.0).powi(2) / 2.0).exp();
            jitter * (1.0 + 50.0 * bump / (1.0 + amplitude_at(t)))
        });
        (
            SpectralResult {
                frequencies,
                times,
                power,
            },
            series,
        )
    }

    #[test]
    fn picks_the_stimulation_modulated_peak() {
        let (spectral, series) = synthetic_spectrum(&[(0.0, 0.0), (20.0, 1.0), (40.0, 2.0)], 60.0);
        let foi = extract_frequency_of_interest(&spectral, &series);
        assert!(foi.is_available());
        assert!((foi.center_frequency - 20.0).abs() <= 1.0);
        assert!(foi.goodness_of_fit > 1.0);
        assert_eq!(foi.score.len(), spectral.frequencies.len());
    }

    #[test]
    fn two_levels_give_no_frequency() {
        let (spectral, series) = synthetic_spectrum(&[(0.0, 0.0), (20.0, 1.0), (40.0, 0.0)], 60.0);
        let foi = extract_frequency_of_interest(&spectral, &series);
        assert_eq!(foi.center_frequency, -1.0);
        assert_eq!(foi.goodness_of_fit, -1.0);
        assert!(!foi.is_available());
    }

    #[test]
    fn flat_power_is_degenerate() {
        let (mut spectral, series) = synthetic_spectrum(&[(0.0, 0.0), (20.0, 1.0), (40.0, 2.0)], 60.0);
        spectral.power.fill(3.0);
        assert!(!extract_frequency_of_interest(&spectral, &series).is_available());
    }
}
