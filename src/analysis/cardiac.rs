//! Template subtraction of the cardiac (ECG) artifact.
//!
//! Beats are located on whichever polarity paces more regularly, an average
//! beat template is built from min-max normalised windows around the interior
//! beats, and each beat window gets the template fitted (gain + offset) and
//! subtracted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::analysis::error::{Result, SignalError};
use crate::analysis::filter::FilterChain;
use crate::analysis::peaks::{find_peaks, find_troughs};
use crate::analysis::stats;

/// Shared cancellation flag with an optional deadline.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Polarity {
    Positive,
    Negative,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CardiacOutcome {
    Removed {
        polarity: Polarity,
        beats: usize,
        period_samples: f64,
    },
    /// Signal left untouched.
    Skipped { reason: String },
}

#[derive(Clone, Copy, Debug)]
pub struct CardiacFilter {
    /// Minimum peak prominence in units of the signal's standard deviation.
    pub min_prominence_sd: f64,
    /// Minimum beat spacing in seconds.
    pub min_distance_s: f64,
    pub pre_fraction: f64,
    pub post_fraction: f64,
}

impl Default for CardiacFilter {
    fn default() -> Self {
        Self {
            min_prominence_sd: 2.0,
            min_distance_s: 0.5,
            pre_fraction: 0.25,
            post_fraction: 0.65,
        }
    }
}

struct BeatTrain {
    polarity: Polarity,
    peaks: Vec<usize>,
    jitter: f64,
}

impl BeatTrain {
    fn new(polarity: Polarity, peaks: Vec<usize>) -> Option<Self> {
        if peaks.len() < 3 {
            return None;
        }
        let intervals = intervals(&peaks);
        Some(Self {
            polarity,
            jitter: stats::variance(&intervals).sqrt(),
            peaks,
        })
    }
}

fn intervals(peaks: &[usize]) -> Vec<f64> {
    peaks.windows(2).map(|w| (w[1] - w[0]) as f64).collect()
}

impl CardiacFilter {
    /// Band-pass `signal` and remove the cardiac artifact from it. With
    /// `enabled == false` the input is returned unchanged.
    pub fn apply(
        &self,
        signal: &[f64],
        sampling_rate: f64,
        band_hz: (f64, f64),
        enabled: bool,
        cancel: &CancelToken,
    ) -> Result<(Vec<f64>, Option<CardiacOutcome>)> {
        if !enabled {
            return Ok((signal.to_vec(), None));
        }
        if cancel.is_cancelled() {
            return Err(SignalError::Cancelled);
        }
        let mut filtered = FilterChain::bandpass(sampling_rate, band_hz.0, band_hz.1).filtfilt(signal);
        let outcome = self.remove(&mut filtered, sampling_rate, cancel)?;
        Ok((filtered, Some(outcome)))
    }

    /// In-place artifact removal on an already filtered signal.
    pub fn remove(&self, signal: &mut [f64], sampling_rate: f64, cancel: &CancelToken) -> Result<CardiacOutcome> {
        if sampling_rate.is_nan() || sampling_rate <= 0.0 {
            return Err(SignalError::InvalidSampleRate);
        }
        let sd = stats::variance(signal).sqrt();
        if !(sd.is_finite() && sd > 0.0) {
            return Ok(skipped("flat or non-finite signal"));
        }
        let prominence = self.min_prominence_sd * sd;
        let distance = (self.min_distance_s * sampling_rate).ceil() as usize;

        let trains = [
            BeatTrain::new(Polarity::Positive, find_peaks(signal, prominence, distance)),
            BeatTrain::new(Polarity::Negative, find_troughs(signal, prominence, distance)),
        ];
        let Some(train) = trains
            .into_iter()
            .flatten()
            .min_by(|a, b| a.jitter.total_cmp(&b.jitter))
        else {
            return Ok(skipped("fewer than 3 heartbeat peaks"));
        };

        let period = stats::mean(&intervals(&train.peaks));
        let pre = (self.pre_fraction * period).round() as usize;
        let post = (self.post_fraction * period).round() as usize;
        let width = pre + post;
        debug!(
            "cardiac: {:?} polarity, {} peaks, period {:.1} samples, jitter {:.2}",
            train.polarity,
            train.peaks.len(),
            period,
            train.jitter
        );
        if width < 2 {
            return Ok(skipped("beat period too short"));
        }

        let interior = &train.peaks[1..train.peaks.len() - 1];
        let len = signal.len();
        let in_bounds = |peak: usize| peak >= pre && peak + post <= len;

        let mut template = vec![0.0; width];
        let mut used = 0usize;
        for &peak in interior.iter().filter(|&&p| in_bounds(p)) {
            let window = &signal[peak - pre..peak + post];
            let (lo, hi) = window
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            if hi - lo <= f64::EPSILON {
                continue;
            }
            for (t, &v) in template.iter_mut().zip(window) {
                *t += (v - lo) / (hi - lo);
            }
            used += 1;
        }
        if used == 0 {
            return Ok(skipped("no complete beat window"));
        }
        template.iter_mut().for_each(|t| *t /= used as f64);
        let template_mean = stats::mean(&template);
        let template_var = stats::variance(&template);
        if template_var <= f64::EPSILON {
            return Ok(skipped("flat beat template"));
        }

        let original = signal.to_vec();
        let mut beats = 0usize;
        for &peak in interior {
            if cancel.is_cancelled() {
                signal.copy_from_slice(&original);
                warn!("cardiac removal cancelled after {beats} beats");
                return Err(SignalError::Cancelled);
            }
            if !in_bounds(peak) {
                continue;
            }
            let window = &mut signal[peak - pre..peak + post];
            let window_mean = stats::mean(window);
            let covariance = window
                .iter()
                .zip(&template)
                .map(|(w, t)| (w - window_mean) * (t - template_mean))
                .sum::<f64>()
                / width as f64;
            let gain = covariance / template_var;
            let offset = window_mean - gain * template_mean;
            for (w, t) in window.iter_mut().zip(&template) {
                *w -= gain * t + offset;
            }
            beats += 1;
        }

        Ok(CardiacOutcome::Removed {
            polarity: train.polarity,
            beats,
            period_samples: period,
        })
    }
}

fn skipped(reason: &str) -> CardiacOutcome {
    debug!("cardiac removal skipped: {reason}");
    CardiacOutcome::Skipped {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const FS: f64 = 250.0;
    const BEAT: usize = 207;

    fn beat_train(n: usize) -> Vec<f64> {
        let mut artifact = vec![0.0; n];
        let mut centre = 60;
        while centre < n {
            for (i, a) in artifact.iter_mut().enumerate() {
                let d = i as f64 - centre as f64;
                *a += 10.0 * (-(d * d) / (2.0 * 25.0)).exp();
            }
            centre += BEAT;
        }
        artifact
    }

    fn lfp(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let t = i as f64 / FS;
                (2.0 * PI * 20.0 * t).sin() + 0.6 * (2.0 * PI * 7.3 * t).sin()
            })
            .collect()
    }

    #[test]
    fn disabled_filter_returns_input_exactly() {
        let signal: Vec<f64> = beat_train(2000).iter().zip(lfp(2000)).map(|(a, b)| a + b).collect();
        let (out, outcome) = CardiacFilter::default()
            .apply(&signal, FS, (1.0, 100.0), false, &CancelToken::new())
            .unwrap();
        assert_eq!(out, signal);
        assert!(outcome.is_none());
    }

    #[test]
    fn removes_most_of_the_beat_energy() {
        let n = 5000;
        let artifact = beat_train(n);
        let clean = lfp(n);
        let mut signal: Vec<f64> = artifact.iter().zip(&clean).map(|(a, b)| a + b).collect();
        let outcome = CardiacFilter::default()
            .remove(&mut signal, FS, &CancelToken::new())
            .unwrap();
        match outcome {
            CardiacOutcome::Removed { polarity, beats, period_samples } => {
                assert_eq!(polarity, Polarity::Positive);
                assert!(beats >= 20);
                assert!((period_samples - BEAT as f64).abs() < 1.0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let region = 400..4400;
        let before: f64 = artifact[region.clone()].iter().map(|v| v * v).sum();
        let after: f64 = signal[region.clone()]
            .iter()
            .zip(&clean[region])
            .map(|(s, c)| (s - c) * (s - c))
            .sum();
        assert!(after < 0.2 * before, "residual {after} vs artifact {before}");
    }

    #[test]
    fn too_few_peaks_leaves_signal_untouched() {
        let mut signal = vec![0.0; 600];
        signal[100] = 5.0;
        signal[400] = 5.0;
        let original = signal.clone();
        let outcome = CardiacFilter::default()
            .remove(&mut signal, FS, &CancelToken::new())
            .unwrap();
        assert!(matches!(outcome, CardiacOutcome::Skipped { .. }));
        assert_eq!(signal, original);
    }

    #[test]
    fn cancellation_restores_the_signal() {
        let mut signal: Vec<f64> = beat_train(3000).iter().zip(lfp(3000)).map(|(a, b)| a + b).collect();
        let original = signal.clone();
        let token = CancelToken::new();
        token.cancel();
        let err = CardiacFilter::default()
            .remove(&mut signal, FS, &token)
            .unwrap_err();
        assert!(matches!(err, SignalError::Cancelled));
        assert_eq!(signal, original);
    }

    #[test]
    fn expired_deadline_counts_as_cancelled() {
        let token = CancelToken::with_timeout(Duration::ZERO);
        assert!(token.is_cancelled());
        assert!(!CancelToken::new().is_cancelled());
    }

    #[test]
    fn spent_budget_stops_before_filtering() {
        // no beats at all, so only the up-front check can report cancellation
        let signal = lfp(2000);
        let token = CancelToken::with_timeout(Duration::ZERO);
        let err = CardiacFilter::default()
            .apply(&signal, FS, (1.0, 100.0), true, &token)
            .unwrap_err();
        assert!(matches!(err, SignalError::Cancelled));
    }
}
