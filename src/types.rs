// src/types.rs
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::analysis::error::Result;

/// Time-frequency estimator used for continuous rendering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpectrogramMethod {
    Welch,
    #[default]
    Spectrogram,
    Wavelet,
}

/// How a single stimulation epoch is reduced to one PSD.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PsdMethod {
    #[default]
    Welch,
    #[serde(rename = "Time-Frequency Analysis")]
    TimeFrequency,
}

/// Brain lead side. Column 0 of the stimulation matrix is `Left`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Hemisphere {
    Left,
    Right,
}

impl Hemisphere {
    pub fn column(self) -> usize {
        match self {
            Hemisphere::Left => 0,
            Hemisphere::Right => 1,
        }
    }

    /// Side encoded in a channel name such as `ZERO_TWO_LEFT`.
    pub fn from_channel_name(name: &str) -> Option<Self> {
        let upper = name.to_ascii_uppercase();
        if upper.contains("LEFT") {
            Some(Hemisphere::Left)
        } else if upper.contains("RIGHT") {
            Some(Hemisphere::Right)
        } else {
            None
        }
    }
}

/// Session-level analysis options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct AnalysisConfig {
    pub spectrogram_method: SpectrogramMethod,
    #[serde(rename = "PSDMethod")]
    pub psd_method: PsdMethod,
    #[serde(rename = "NormalizedPSD")]
    pub normalized_psd: bool,
    pub cardiac_filter: bool,
    pub cardiac_band_hz: (f64, f64),
    pub cardiac_timeout_ms: Option<u64>,
    pub center_frequency_hz: Option<f64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            spectrogram_method: SpectrogramMethod::Spectrogram,
            psd_method: PsdMethod::Welch,
            normalized_psd: false,
            cardiac_filter: false,
            cardiac_band_hz: (1.0, 100.0),
            cardiac_timeout_ms: None,
            center_frequency_hz: None,
        }
    }
}

impl AnalysisConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_reads_session_option_names() {
        let config = AnalysisConfig::from_json_str(
            r#"{"SpectrogramMethod":"Wavelet","PSDMethod":"Time-Frequency Analysis","NormalizedPSD":true}"#,
        )
        .unwrap();
        assert_eq!(config.spectrogram_method, SpectrogramMethod::Wavelet);
        assert_eq!(config.psd_method, PsdMethod::TimeFrequency);
        assert!(config.normalized_psd);
        assert!(!config.cardiac_filter);
    }

    #[test]
    fn config_rejects_unknown_method() {
        assert!(AnalysisConfig::from_json_str(r#"{"SpectrogramMethod":"Hilbert"}"#).is_err());
    }

    #[test]
    fn hemisphere_from_channel_names() {
        assert_eq!(Hemisphere::from_channel_name("ZERO_TWO_LEFT"), Some(Hemisphere::Left));
        assert_eq!(Hemisphere::from_channel_name("one_three_right"), Some(Hemisphere::Right));
        assert_eq!(Hemisphere::from_channel_name("ACCELEROMETER"), None);
    }
}
