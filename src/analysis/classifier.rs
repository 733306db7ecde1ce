use std::path::Path;

use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::analysis::error::{Result, SignalError};

pub const FEATURE_COUNT: usize = 5;

const DEFAULT_MODEL: &str = include_str!("../../models/response_classifier.json");

static SHARED: OnceCell<ResponseClassifier> = OnceCell::new();

/// Standardised logistic regression over the response-curve features.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseClassifier {
    #[serde(default)]
    pub features: Vec<String>,
    pub weights: [f64; FEATURE_COUNT],
    pub intercept: f64,
    pub means: [f64; FEATURE_COUNT],
    pub scales: [f64; FEATURE_COUNT],
}

impl ResponseClassifier {
    /// Bundled model, parsed on first use and shared read-only afterwards.
    pub fn shared() -> Result<&'static ResponseClassifier> {
        SHARED.get_or_try_init(|| {
            let model = Self::from_json_str(DEFAULT_MODEL)?;
            info!("response classifier loaded ({} features)", FEATURE_COUNT);
            Ok(model)
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let model: ResponseClassifier = serde_json::from_str(text)?;
        model.validate()?;
        Ok(model)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if !self.features.is_empty() && self.features.len() != FEATURE_COUNT {
            return Err(SignalError::Model(format!(
                "expected {FEATURE_COUNT} feature names, got {}",
                self.features.len()
            )));
        }
        let finite = self
            .weights
            .iter()
            .chain(&self.means)
            .chain(std::iter::once(&self.intercept))
            .all(|v| v.is_finite());
        if !finite {
            return Err(SignalError::Model("non-finite coefficient".into()));
        }
        if self.scales.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(SignalError::Model("feature scales must be positive".into()));
        }
        Ok(())
    }

    /// Probability that the response is therapeutically promising.
    pub fn predict_probability(&self, inputs: &[f64; FEATURE_COUNT]) -> Result<f64> {
        if inputs.iter().any(|v| !v.is_finite()) {
            return Err(SignalError::NumericDegenerate {
                context: "classifier inputs",
            });
        }
        let z = inputs
            .iter()
            .zip(&self.weights)
            .zip(self.means.iter().zip(&self.scales))
            .fold(self.intercept, |acc, ((x, w), (m, s))| acc + w * (x - m) / s);
        Ok(1.0 / (1.0 + (-z).exp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_model_loads_once() {
        let a = ResponseClassifier::shared().unwrap();
        let b = ResponseClassifier::shared().unwrap();
        assert!(std::ptr::eq(a, b));
        assert_eq!(a.features.len(), FEATURE_COUNT);
    }

    #[test]
    fn probability_follows_the_logit() {
        let model = ResponseClassifier {
            features: Vec::new(),
            weights: [1.0, 0.0, 0.0, 0.0, 0.0],
            intercept: 0.0,
            means: [0.0; FEATURE_COUNT],
            scales: [1.0; FEATURE_COUNT],
        };
        let p = model.predict_probability(&[0.0; FEATURE_COUNT]).unwrap();
        assert!((p - 0.5).abs() < 1e-12);
        let high = model.predict_probability(&[3.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(high > 0.95 && high < 1.0);
    }

    #[test]
    fn non_finite_inputs_are_degenerate() {
        let model = ResponseClassifier::shared().unwrap();
        let err = model
            .predict_probability(&[f64::NAN, 0.0, 0.0, 0.0, 0.0])
            .unwrap_err();
        assert!(err.is_degraded());
    }

    #[test]
    fn zero_scale_is_rejected() {
        let text = r#"{"weights":[1,1,1,1,1],"intercept":0,"means":[0,0,0,0,0],"scales":[1,0,1,1,1]}"#;
        assert!(matches!(
            ResponseClassifier::from_json_str(text),
            Err(SignalError::Model(_))
        ));
    }
}
