use std::f64::consts::PI;

use log::debug;
use ndarray::{Array2, Axis};
use rustfft::{num_complex::Complex64, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::analysis::error::{Result, SignalError};
use crate::analysis::stats;
use crate::types::SpectrogramMethod;

/// Floor applied before taking `10 * log10` of power.
pub const LOG_POWER_FLOOR: f64 = 1e-10;
/// Moving-average length applied to each wavelet row.
pub const WAVELET_SMOOTHING: usize = 125;
const MORLET_W0: f64 = 6.0;

/// Power over frequency (and optionally time), in linear units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpectralResult {
    pub frequencies: Vec<f64>,
    /// Seconds from recording start; empty for a single whole-signal PSD.
    pub times: Vec<f64>,
    /// frequency x time
    pub power: Array2<f64>,
}

impl SpectralResult {
    pub fn log_power(&self) -> Array2<f64> {
        self.power.mapv(to_decibels)
    }

    /// Drop every frequency bin above `max_hz`.
    pub fn trim_frequencies(&mut self, max_hz: f64) {
        let keep = self.frequencies.partition_point(|&f| f <= max_hz);
        if keep == self.frequencies.len() {
            return;
        }
        self.frequencies.truncate(keep);
        self.power = self.power.slice(ndarray::s![..keep, ..]).to_owned();
    }

    /// Indices of frequency bins inside `[low, high]`.
    pub fn frequency_indices(&self, low: f64, high: f64) -> Vec<usize> {
        self.frequencies
            .iter()
            .enumerate()
            .filter_map(|(i, &f)| (f >= low && f <= high).then_some(i))
            .collect()
    }

    /// Indices of time columns inside `[start, end]`.
    pub fn time_indices(&self, start: f64, end: f64) -> Vec<usize> {
        self.times
            .iter()
            .enumerate()
            .filter_map(|(i, &t)| (t >= start && t <= end).then_some(i))
            .collect()
    }

    /// Mean linear PSD over the selected time columns.
    pub fn mean_over_columns(&self, columns: &[usize]) -> Option<Vec<f64>> {
        if columns.is_empty() {
            return None;
        }
        let selected = self.power.select(Axis(1), columns);
        selected.mean_axis(Axis(1)).map(|m| m.to_vec())
    }
}

pub fn to_decibels(power: f64) -> f64 {
    10.0 * power.max(LOG_POWER_FLOOR).log10()
}

/// One-sided PSD of a single signal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Psd {
    pub frequencies: Vec<f64>,
    pub power: Vec<f64>,
}

/// Computes spectra for a fixed sampling rate. Segment length is one second,
/// half overlapped, with a two-second FFT (0.5 Hz bins).
pub struct SpectralEstimator {
    sample_rate: f64,
    segment: usize,
}

impl SpectralEstimator {
    pub fn new(sample_rate: f64) -> Result<Self> {
        if sample_rate.is_nan() || sample_rate <= 0.0 {
            return Err(SignalError::InvalidSampleRate);
        }
        let segment = (sample_rate.round() as usize).max(2);
        Ok(Self {
            sample_rate,
            segment,
        })
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Time-frequency estimate of `signal` whose first sample sits at `start_time`.
    pub fn compute(
        &self,
        method: SpectrogramMethod,
        signal: &[f64],
        start_time: f64,
    ) -> Result<SpectralResult> {
        let result = match method {
            SpectrogramMethod::Welch => self.welch_frames(signal, start_time),
            SpectrogramMethod::Spectrogram => self.spectrogram(signal, start_time),
            SpectrogramMethod::Wavelet => self.wavelet(signal, start_time),
        }?;
        debug!(
            "{method:?}: {} frequencies x {} frames",
            result.frequencies.len(),
            result.times.len()
        );
        Ok(result)
    }

    /// Segment-averaged periodogram of the whole signal.
    pub fn welch(&self, signal: &[f64]) -> Result<Psd> {
        if signal.len() < 2 {
            return Err(SignalError::InsufficientSamples {
                context: "welch psd",
                required: 2,
                available: signal.len(),
            });
        }
        let nperseg = self.segment.min(signal.len());
        let nfft = 2 * self.segment;
        let starts = segment_starts(signal.len(), nperseg, nperseg / 2);
        let mut planner = FftPlanner::<f64>::new();
        let mut accum = vec![0.0; nfft / 2 + 1];
        for &start in &starts {
            let psd = periodogram(&mut planner, &signal[start..start + nperseg], nfft, self.sample_rate);
            for (a, p) in accum.iter_mut().zip(psd) {
                *a += p;
            }
        }
        let inv = 1.0 / starts.len() as f64;
        accum.iter_mut().for_each(|v| *v *= inv);
        Ok(Psd {
            frequencies: onesided_frequencies(nfft, self.sample_rate),
            power: accum,
        })
    }

    /// Short-time Fourier power with a one-second window.
    pub fn spectrogram(&self, signal: &[f64], start_time: f64) -> Result<SpectralResult> {
        let nperseg = self.segment;
        if signal.len() < nperseg {
            return Err(SignalError::InsufficientSamples {
                context: "spectrogram",
                required: nperseg,
                available: signal.len(),
            });
        }
        let nfft = 2 * nperseg;
        let starts = segment_starts(signal.len(), nperseg, nperseg / 2);
        let n_freq = nfft / 2 + 1;
        let mut power = Array2::<f64>::zeros((n_freq, starts.len()));
        let mut planner = FftPlanner::<f64>::new();
        let mut times = Vec::with_capacity(starts.len());
        for (frame, &start) in starts.iter().enumerate() {
            let psd = periodogram(&mut planner, &signal[start..start + nperseg], nfft, self.sample_rate);
            power.column_mut(frame).assign(&ndarray::Array1::from(psd));
            times.push(start_time + (start as f64 + nperseg as f64 / 2.0) / self.sample_rate);
        }
        Ok(SpectralResult {
            frequencies: onesided_frequencies(nfft, self.sample_rate),
            times,
            power,
        })
    }

    /// Welch PSDs over consecutive two-second frames, one second apart.
    pub fn welch_frames(&self, signal: &[f64], start_time: f64) -> Result<SpectralResult> {
        let frame = 2 * self.segment;
        if signal.len() < frame {
            return Err(SignalError::InsufficientSamples {
                context: "welch frames",
                required: frame,
                available: signal.len(),
            });
        }
        let starts = segment_starts(signal.len(), frame, self.segment);
        let mut columns = Vec::with_capacity(starts.len());
        let mut times = Vec::with_capacity(starts.len());
        for &start in &starts {
            columns.push(self.welch(&signal[start..start + frame])?);
            times.push(start_time + (start as f64 + frame as f64 / 2.0) / self.sample_rate);
        }
        let frequencies = columns[0].frequencies.clone();
        let mut power = Array2::<f64>::zeros((frequencies.len(), columns.len()));
        for (i, psd) in columns.into_iter().enumerate() {
            power.column_mut(i).assign(&ndarray::Array1::from(psd.power));
        }
        Ok(SpectralResult {
            frequencies,
            times,
            power,
        })
    }

    /// Morlet continuous wavelet power on 0.5 Hz steps from 1 Hz, smoothed
    /// with a moving average and decimated by `fs / 2` in time.
    pub fn wavelet(&self, signal: &[f64], start_time: f64) -> Result<SpectralResult> {
        if signal.len() < WAVELET_SMOOTHING {
            return Err(SignalError::InsufficientSamples {
                context: "wavelet",
                required: WAVELET_SMOOTHING,
                available: signal.len(),
            });
        }
        let nyquist = self.sample_rate / 2.0;
        let frequencies: Vec<f64> = (2..=400)
            .map(|k| k as f64 / 2.0)
            .filter(|&f| f < nyquist)
            .collect();
        if frequencies.is_empty() {
            return Err(SignalError::unavailable(format!(
                "wavelet frequencies below {nyquist} Hz Nyquist"
            )));
        }
        let n = signal.len();
        let max_len = wavelet_length(frequencies[0], self.sample_rate, n);
        let fft_len = (n + max_len - 1).next_power_of_two();

        let mut planner = FftPlanner::<f64>::new();
        let forward = planner.plan_fft_forward(fft_len);
        let inverse = planner.plan_fft_inverse(fft_len);
        let mut signal_spec: Vec<Complex64> = signal.iter().map(|&v| Complex64::new(v, 0.0)).collect();
        signal_spec.resize(fft_len, Complex64::new(0.0, 0.0));
        forward.process(&mut signal_spec);

        let decimation = ((self.sample_rate / 2.0).round() as usize).max(1);
        let kept: Vec<usize> = (0..n).step_by(decimation).collect();
        let mut power = Array2::<f64>::zeros((frequencies.len(), kept.len()));
        let norm = 1.0 / fft_len as f64;

        for (row, &freq) in frequencies.iter().enumerate() {
            let len = wavelet_length(freq, self.sample_rate, n);
            let mut kernel = morlet(len, MORLET_W0 * self.sample_rate / (2.0 * PI * freq));
            kernel.resize(fft_len, Complex64::new(0.0, 0.0));
            forward.process(&mut kernel);
            for (k, s) in kernel.iter_mut().zip(&signal_spec) {
                *k *= *s;
            }
            inverse.process(&mut kernel);
            // "same" slice of the full linear convolution
            let offset = (len - 1) / 2;
            let row_power: Vec<f64> = kernel[offset..offset + n]
                .iter()
                .map(|c| c.norm_sqr() * norm * norm)
                .collect();
            let smoothed = stats::smooth(&row_power, WAVELET_SMOOTHING);
            for (col, &idx) in kept.iter().enumerate() {
                power[[row, col]] = smoothed[idx];
            }
        }
        let times = kept
            .iter()
            .map(|&idx| start_time + idx as f64 / self.sample_rate)
            .collect();
        Ok(SpectralResult {
            frequencies,
            times,
            power,
        })
    }
}

fn wavelet_length(freq: f64, sample_rate: f64, signal_len: usize) -> usize {
    let scale = MORLET_W0 * sample_rate / (2.0 * PI * freq);
    ((10.0 * scale).ceil() as usize).clamp(1, signal_len)
}

fn morlet(len: usize, scale: f64) -> Vec<Complex64> {
    let centre = (len as f64 - 1.0) / 2.0;
    let amplitude = PI.powf(-0.25) * (1.0 / scale).sqrt();
    (0..len)
        .map(|i| {
            let x = (i as f64 - centre) / scale;
            Complex64::from_polar(amplitude * (-0.5 * x * x).exp(), MORLET_W0 * x)
        })
        .collect()
}

fn segment_starts(len: usize, nperseg: usize, noverlap: usize) -> Vec<usize> {
    if len < nperseg || nperseg == 0 {
        return Vec::new();
    }
    let step = (nperseg - noverlap).max(1);
    (0..=(len - nperseg)).step_by(step).collect()
}

/// Periodic Hann window.
fn hann(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / n as f64).cos())
        .collect()
}

fn onesided_frequencies(nfft: usize, sample_rate: f64) -> Vec<f64> {
    (0..=nfft / 2)
        .map(|k| k as f64 * sample_rate / nfft as f64)
        .collect()
}

/// Mean-detrended, Hann-windowed, density-scaled one-sided periodogram.
fn periodogram(planner: &mut FftPlanner<f64>, segment: &[f64], nfft: usize, sample_rate: f64) -> Vec<f64> {
    let window = hann(segment.len());
    let mean = stats::mean(segment);
    let mut buffer: Vec<Complex64> = segment
        .iter()
        .zip(&window)
        .map(|(v, w)| Complex64::new((v - mean) * w, 0.0))
        .collect();
    buffer.resize(nfft, Complex64::new(0.0, 0.0));
    planner.plan_fft_forward(nfft).process(&mut buffer);
    let scale = 1.0 / (sample_rate * window.iter().map(|w| w * w).sum::<f64>());
    let n_freq = nfft / 2 + 1;
    buffer[..n_freq]
        .iter()
        .enumerate()
        .map(|(k, c)| {
            let p = c.norm_sqr() * scale;
            let nyquist_bin = nfft % 2 == 0 && k == nfft / 2;
            if k == 0 || nyquist_bin {
                p
            } else {
                2.0 * p
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, amplitude: f64, fs: f64, seconds: f64) -> Vec<f64> {
        (0..(fs * seconds) as usize)
            .map(|i| amplitude * (2.0 * PI * freq * i as f64 / fs).sin())
            .collect()
    }

    fn peak_frequency(frequencies: &[f64], power: &[f64]) -> f64 {
        let idx = power
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        frequencies[idx]
    }

    #[test]
    fn welch_peaks_at_signal_frequency_with_half_hertz_bins() {
        let estimator = SpectralEstimator::new(250.0).unwrap();
        let psd = estimator.welch(&sine(20.0, 1.0, 250.0, 10.0)).unwrap();
        assert_eq!(psd.frequencies.len(), 251);
        assert!((psd.frequencies[1] - 0.5).abs() < 1e-12);
        assert!((peak_frequency(&psd.frequencies, &psd.power) - 20.0).abs() < 1e-9);
        // density scaling integrates back to the signal variance
        let total: f64 = psd.power.iter().sum::<f64>() * 0.5;
        assert!((total - 0.5).abs() < 0.02);
    }

    #[test]
    fn spectrogram_times_are_window_centres() {
        let estimator = SpectralEstimator::new(250.0).unwrap();
        let result = estimator
            .spectrogram(&sine(10.0, 1.0, 250.0, 5.0), 100.0)
            .unwrap();
        assert_eq!(result.times.len(), 9);
        assert!((result.times[0] - 100.5).abs() < 1e-12);
        assert!((result.times[1] - 101.0).abs() < 1e-12);
        assert_eq!(result.power.dim(), (251, 9));
        let column: Vec<f64> = result.power.column(4).to_vec();
        assert!((peak_frequency(&result.frequencies, &column) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn estimators_are_deterministic() {
        let estimator = SpectralEstimator::new(250.0).unwrap();
        let signal = sine(13.0, 2.0, 250.0, 6.0);
        for method in [
            SpectrogramMethod::Welch,
            SpectrogramMethod::Spectrogram,
            SpectrogramMethod::Wavelet,
        ] {
            let a = estimator.compute(method, &signal, 0.0).unwrap();
            let b = estimator.compute(method, &signal, 0.0).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn wavelet_grid_and_decimation() {
        let estimator = SpectralEstimator::new(250.0).unwrap();
        let result = estimator.wavelet(&sine(30.0, 1.0, 250.0, 4.0), 0.0).unwrap();
        assert_eq!(result.frequencies[0], 1.0);
        assert_eq!(result.frequencies[1], 1.5);
        assert!(*result.frequencies.last().unwrap() < 125.0);
        assert_eq!(result.times.len(), 8);
        assert!((result.times[1] - 0.5).abs() < 1e-12);
        let column: Vec<f64> = result.power.column(4).to_vec();
        assert!((peak_frequency(&result.frequencies, &column) - 30.0).abs() <= 1.5);
    }

    #[test]
    fn log_power_floors_zero_entries() {
        let result = SpectralResult {
            frequencies: vec![1.0, 2.0],
            times: vec![0.0],
            power: Array2::from_shape_vec((2, 1), vec![0.0, 100.0]).unwrap(),
        };
        let log = result.log_power();
        assert!((log[[0, 0]] + 100.0).abs() < 1e-9);
        assert!((log[[1, 0]] - 20.0).abs() < 1e-12);
        // canonical power stays linear
        assert_eq!(result.power[[0, 0]], 0.0);
    }

    #[test]
    fn trimming_drops_high_bins() {
        let estimator = SpectralEstimator::new(250.0).unwrap();
        let mut result = estimator
            .spectrogram(&sine(10.0, 1.0, 250.0, 3.0), 0.0)
            .unwrap();
        result.trim_frequencies(30.0);
        assert_eq!(*result.frequencies.last().unwrap(), 30.0);
        assert_eq!(result.power.nrows(), result.frequencies.len());
    }

    #[test]
    fn serde_round_trip_is_exact() {
        let estimator = SpectralEstimator::new(250.0).unwrap();
        let result = estimator
            .spectrogram(&sine(7.3, 1.7, 250.0, 3.0), 12.25)
            .unwrap();
        let text = serde_json::to_string(&result).unwrap();
        let back: SpectralResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn short_input_is_insufficient() {
        let estimator = SpectralEstimator::new(250.0).unwrap();
        assert!(estimator.spectrogram(&[0.0; 100], 0.0).unwrap_err().is_degraded());
        assert!(matches!(
            SpectralEstimator::new(0.0),
            Err(SignalError::InvalidSampleRate)
        ));
    }

    #[test]
    fn wavelet_below_one_hertz_nyquist_is_unavailable() {
        let estimator = SpectralEstimator::new(2.0).unwrap();
        assert!(matches!(
            estimator.wavelet(&[0.0; 200], 0.0),
            Err(SignalError::DataUnavailable { .. })
        ));
    }
}
