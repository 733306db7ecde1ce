//! Stimulation-response curve: band power around the center frequency as a
//! function of stimulation amplitude, summarised into classifier features.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::analysis::classifier::ResponseClassifier;
use crate::analysis::epochs::{samples_in_epochs, StimulationEpoch};
use crate::analysis::error::{Result, SignalError};
use crate::analysis::spectral::SpectralResult;
use crate::analysis::stats::{self, Polynomial};

pub const CENTER_HALF_BAND_HZ: f64 = 2.0;
pub const MIN_UNIQUE_AMPLITUDES: usize = 3;
pub const MAX_POLY_DEGREE: usize = 4;
pub const CURVE_POINTS: usize = 100;

/// Fitted response curve and the points it was fitted to.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseCurve {
    /// Unique amplitudes, ascending.
    pub amplitudes: Vec<f64>,
    /// Median log power per unique amplitude.
    pub powers: Vec<f64>,
    pub polynomial: Polynomial,
    pub grid: Vec<f64>,
    pub fitted: Vec<f64>,
}

impl ResponseCurve {
    pub fn amplitude_range(&self) -> (f64, f64) {
        (
            self.amplitudes.first().copied().unwrap_or(0.0),
            self.amplitudes.last().copied().unwrap_or(0.0),
        )
    }
}

/// Inputs to the classifier, its score, and the context needed for the
/// payload. This is the record kept per (recording, channel).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictionFeatures {
    pub center_frequency: f64,
    /// Correlation of amplitude with the fitted curve; its sign is the direction.
    pub correlation: f64,
    pub fitted_effect: f64,
    /// P85 - P15 of the fitted curve.
    pub changes_in_power: f64,
    /// P5 of the fitted curve.
    pub final_power: f64,
    /// Classifier probability in [0, 1].
    pub score: f64,
    pub predicted_amplitude: f64,
    pub amplitude_range: (f64, f64),
}

impl PredictionFeatures {
    /// Classifier input order.
    pub fn classifier_inputs(&self) -> [f64; 5] {
        [
            self.correlation,
            self.fitted_effect,
            self.changes_in_power,
            self.final_power,
            self.predicted_amplitude,
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Prediction {
    pub optimal_frequency: f64,
    pub changes_direction: f64,
    pub fitted_effect: f64,
    pub changes_in_power: f64,
    pub final_power: f64,
    pub score: f64,
    pub predicted_amplitude: f64,
    pub amplitude_range: [f64; 2],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredictionPayload {
    Prediction(Prediction),
    NoPrediction {
        #[serde(rename = "NoPrediction")]
        no_prediction: bool,
    },
}

impl From<&PredictionFeatures> for Prediction {
    fn from(features: &PredictionFeatures) -> Self {
        Prediction {
            optimal_frequency: features.center_frequency,
            changes_direction: features.correlation,
            fitted_effect: features.fitted_effect,
            changes_in_power: features.changes_in_power,
            final_power: features.final_power,
            score: features.score,
            predicted_amplitude: features.predicted_amplitude,
            amplitude_range: [features.amplitude_range.0, features.amplitude_range.1],
        }
    }
}

impl PredictionPayload {
    pub fn none() -> Self {
        PredictionPayload::NoPrediction { no_prediction: true }
    }

    pub fn from_features(features: Option<&PredictionFeatures>) -> Self {
        features.map_or_else(Self::none, |f| PredictionPayload::Prediction(f.into()))
    }

    pub fn prediction(&self) -> Option<&Prediction> {
        match self {
            PredictionPayload::Prediction(p) => Some(p),
            PredictionPayload::NoPrediction { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ResponsePredictor {
    pub half_band_hz: f64,
    pub min_unique_amplitudes: usize,
    pub max_degree: usize,
    pub curve_points: usize,
}

impl Default for ResponsePredictor {
    fn default() -> Self {
        Self {
            half_band_hz: CENTER_HALF_BAND_HZ,
            min_unique_amplitudes: MIN_UNIQUE_AMPLITUDES,
            max_degree: MAX_POLY_DEGREE,
            curve_points: CURVE_POINTS,
        }
    }
}

impl ResponsePredictor {
    /// `(amplitude, mean log power within ±half_band of center)` for every
    /// spectral column inside an epoch window.
    pub fn band_power_samples(
        &self,
        spectral: &SpectralResult,
        epochs: &[StimulationEpoch],
        center_frequency: f64,
    ) -> Result<Vec<(f64, f64)>> {
        let rows = spectral.frequency_indices(
            center_frequency - self.half_band_hz,
            center_frequency + self.half_band_hz,
        );
        if rows.is_empty() {
            return Err(SignalError::unavailable(format!(
                "spectral bins around {center_frequency} Hz"
            )));
        }
        let log_power = spectral.log_power();
        let samples: Vec<(f64, f64)> = samples_in_epochs(epochs, &spectral.times)
            .into_iter()
            .map(|(amplitude, col)| {
                let band: f64 = rows.iter().map(|&r| log_power[[r, col]]).sum();
                (amplitude, band / rows.len() as f64)
            })
            .collect();
        Ok(samples)
    }

    /// Median per unique amplitude, then a polynomial through the medians.
    pub fn fit(&self, samples: &[(f64, f64)]) -> Result<ResponseCurve> {
        let mut amplitudes: Vec<f64> = samples.iter().map(|(a, _)| *a).collect();
        amplitudes.sort_by(f64::total_cmp);
        amplitudes.dedup();
        if amplitudes.len() < self.min_unique_amplitudes {
            return Err(SignalError::InsufficientSamples {
                context: "unique stimulation amplitudes",
                required: self.min_unique_amplitudes,
                available: amplitudes.len(),
            });
        }
        let mut powers = Vec::with_capacity(amplitudes.len());
        for &level in &amplitudes {
            let at_level: Vec<f64> = samples
                .iter()
                .filter(|(a, _)| *a == level)
                .map(|(_, p)| *p)
                .collect();
            powers.push(stats::median(&at_level).ok_or(SignalError::NumericDegenerate {
                context: "median band power",
            })?);
        }
        if powers.iter().any(|p| !p.is_finite()) {
            return Err(SignalError::NumericDegenerate {
                context: "median band power",
            });
        }

        let degree = self.max_degree.min(amplitudes.len() - 1);
        let polynomial = stats::polyfit(&amplitudes, &powers, degree)?;
        let (low, high) = (amplitudes[0], amplitudes[amplitudes.len() - 1]);
        let grid = stats::linspace(low, high, self.curve_points);
        let fitted: Vec<f64> = grid.iter().map(|&x| polynomial.eval(x)).collect();
        debug!(
            "response fit: degree {degree} through {} levels spanning {low}..{high} mA",
            amplitudes.len()
        );
        Ok(ResponseCurve {
            amplitudes,
            powers,
            polynomial,
            grid,
            fitted,
        })
    }

    pub fn features(
        &self,
        curve: &ResponseCurve,
        center_frequency: f64,
        classifier: &ResponseClassifier,
    ) -> Result<PredictionFeatures> {
        let degenerate = |context| SignalError::NumericDegenerate { context };
        if curve.fitted.iter().any(|v| !v.is_finite()) {
            return Err(degenerate("fitted response curve"));
        }
        let (lo, hi) = curve
            .fitted
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if hi - lo <= 1e-9 * hi.abs().max(1.0) {
            return Err(degenerate("flat response curve"));
        }
        let correlation = stats::pearson(&curve.grid, &curve.fitted)
            .ok_or_else(|| degenerate("flat response curve"))?;
        let pct = |q| stats::percentile(&curve.fitted, q).ok_or_else(|| degenerate("empty response curve"));
        let changes_in_power = pct(85.0)? - pct(15.0)?;
        let final_power = pct(5.0)?;
        let floor = pct(10.0)?;
        // lower power is treated as the therapeutic target
        let predicted_amplitude = curve
            .grid
            .iter()
            .zip(&curve.fitted)
            .find(|(_, y)| **y <= floor)
            .map(|(&x, _)| x)
            .unwrap_or(curve.grid[0]);

        let mut features = PredictionFeatures {
            center_frequency,
            correlation,
            fitted_effect: correlation * correlation,
            changes_in_power,
            final_power,
            score: 0.0,
            predicted_amplitude,
            amplitude_range: curve.amplitude_range(),
        };
        features.score = classifier.predict_probability(&features.classifier_inputs())?;
        Ok(features)
    }

    /// Scored features, or `None` when a degraded condition rules out a
    /// prediction.
    pub fn evaluate(
        &self,
        spectral: &SpectralResult,
        epochs: &[StimulationEpoch],
        center_frequency: f64,
        classifier: &ResponseClassifier,
    ) -> Result<Option<PredictionFeatures>> {
        if !(center_frequency.is_finite() && center_frequency >= 0.0) {
            debug!("no center frequency; skipping prediction");
            return Ok(None);
        }
        let outcome = self
            .band_power_samples(spectral, epochs, center_frequency)
            .and_then(|samples| self.fit(&samples))
            .and_then(|curve| self.features(&curve, center_frequency, classifier));
        match outcome {
            Ok(features) => Ok(Some(features)),
            Err(err) if err.is_degraded() => {
                warn!("no prediction: {err}");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Full prediction; degraded conditions come back as `NoPrediction`.
    pub fn predict(
        &self,
        spectral: &SpectralResult,
        epochs: &[StimulationEpoch],
        center_frequency: f64,
        classifier: &ResponseClassifier,
    ) -> Result<PredictionPayload> {
        let features = self.evaluate(spectral, epochs, center_frequency, classifier)?;
        Ok(PredictionPayload::from_features(features.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::epochs::{EpochSegmenter, StimulationSeries};
    use ndarray::Array2;

    #[test]
    fn repeated_amplitudes_collapse_to_one_median_each() {
        let amps = [1.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 3.0, 3.0];
        let power = [5.0, 9.0, 4.0, 2.0, 3.0, 1.0, -7.0, 0.5, 0.0];
        let samples: Vec<(f64, f64)> = amps.iter().copied().zip(power.iter().copied()).collect();
        let curve = ResponsePredictor::default().fit(&samples).unwrap();
        assert_eq!(curve.amplitudes, vec![1.0, 2.0, 3.0]);
        assert_eq!(curve.powers, vec![5.0, 2.5, 0.25]);
        assert_eq!(curve.polynomial.degree(), 2);
        assert_eq!(curve.grid.len(), CURVE_POINTS);
        // exact interpolation through three medians
        for (a, p) in curve.amplitudes.iter().zip(&curve.powers) {
            assert!((curve.polynomial.eval(*a) - p).abs() < 1e-9);
        }
    }

    #[test]
    fn two_levels_are_insufficient() {
        let samples = vec![(0.0, 1.0), (0.0, 1.2), (1.0, 0.3)];
        let err = ResponsePredictor::default().fit(&samples).unwrap_err();
        assert!(err.is_degraded());
    }

    #[test]
    fn decreasing_power_gives_negative_direction() {
        let samples: Vec<(f64, f64)> = [0.0, 0.5, 1.0, 1.5, 2.0, 2.5]
            .iter()
            .map(|&a| (a, 10.0 - 3.0 * a))
            .collect();
        let predictor = ResponsePredictor::default();
        let curve = predictor.fit(&samples).unwrap();
        let classifier = ResponseClassifier::shared().unwrap();
        let features = predictor.features(&curve, 20.0, classifier).unwrap();
        assert!(features.correlation < -0.99);
        let expected = classifier.predict_probability(&features.classifier_inputs()).unwrap();
        assert_eq!(features.score, expected);
        assert!((0.0..=1.0).contains(&features.score));
        let payload = PredictionPayload::from_features(Some(&features));
        let prediction = payload.prediction().unwrap();
        assert_eq!(prediction.score, features.score);
        assert_eq!(prediction.changes_direction, features.correlation);
        assert!((features.fitted_effect - 1.0).abs() < 1e-6);
        assert!(features.changes_in_power > 0.0);
        // 10th percentile of a falling line is reached near the top amplitude
        assert!(features.predicted_amplitude > 2.2);
        assert_eq!(features.amplitude_range, (0.0, 2.5));
        assert!(features.final_power < 10.0 - 3.0 * 2.3);
    }

    #[test]
    fn flat_response_is_no_prediction() {
        let frequencies: Vec<f64> = (0..=80).map(|k| k as f64 * 0.5).collect();
        let times: Vec<f64> = (1..120).map(|k| k as f64 * 0.5).collect();
        let spectral = SpectralResult {
            power: Array2::from_elem((frequencies.len(), times.len()), 2.0),
            frequencies,
            times,
        };
        let series = StimulationSeries::from_change_points(&[0.0, 20.0, 40.0], &[0.0, 1.0, 2.0], 60.0).unwrap();
        let epochs = EpochSegmenter::default().segment(&series);
        let classifier = ResponseClassifier::shared().unwrap();
        let payload = ResponsePredictor::default()
            .predict(&spectral, &epochs, 20.0, classifier)
            .unwrap();
        assert_eq!(payload, PredictionPayload::none());
        assert_eq!(serde_json::to_string(&payload).unwrap(), r#"{"NoPrediction":true}"#);
    }

    #[test]
    fn missing_center_frequency_is_no_prediction() {
        let spectral = SpectralResult {
            frequencies: vec![0.0, 1.0],
            times: vec![0.0],
            power: Array2::zeros((2, 1)),
        };
        let classifier = ResponseClassifier::shared().unwrap();
        let payload = ResponsePredictor::default()
            .predict(&spectral, &[], -1.0, classifier)
            .unwrap();
        assert!(payload.prediction().is_none());
    }

    #[test]
    fn prediction_payload_uses_session_field_names() {
        let payload = PredictionPayload::Prediction(Prediction {
            optimal_frequency: 20.0,
            changes_direction: -0.9,
            fitted_effect: 0.81,
            changes_in_power: 3.0,
            final_power: -2.0,
            score: 0.7,
            predicted_amplitude: 2.0,
            amplitude_range: [0.0, 2.0],
        });
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["OptimalFrequency"], 20.0);
        assert_eq!(value["AmplitudeRange"][1], 2.0);
        let back: PredictionPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }
}
