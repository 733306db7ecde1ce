use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::analysis::epochs::StimulationSeries;
use crate::analysis::error::{Result, SignalError};
use crate::types::Hemisphere;

/// One named time-domain channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelData {
    pub name: String,
    pub samples: Vec<f64>,
    /// `true` where the device dropped the sample.
    pub missing: Vec<bool>,
}

impl ChannelData {
    pub fn hemisphere(&self) -> Option<Hemisphere> {
        Hemisphere::from_channel_name(&self.name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TherapySettings {
    pub frequency_hz: f64,
    pub pulse_width_us: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Therapy {
    pub left: Option<TherapySettings>,
    pub right: Option<TherapySettings>,
}

impl Therapy {
    pub fn side(&self, hemisphere: Hemisphere) -> Option<&TherapySettings> {
        match hemisphere {
            Hemisphere::Left => self.left.as_ref(),
            Hemisphere::Right => self.right.as_ref(),
        }
    }
}

/// A streaming session with every channel on one time base.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub sampling_rate: u32,
    /// Absolute capture time of the first sample (epoch seconds).
    pub start_time: f64,
    /// Seconds from `start_time`, one per sample.
    pub time: Vec<f64>,
    pub channels: Vec<ChannelData>,
    /// samples x 2 stimulation amplitude (mA), left then right.
    pub stimulation: Option<Array2<f64>>,
    /// samples x 2 on-device band power, left then right.
    pub power_band: Option<Array2<f64>>,
    pub therapy: Therapy,
}

impl Recording {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.time.last().copied().unwrap_or(0.0)
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.name.as_str())
    }

    pub fn channel(&self, name: &str) -> Result<&ChannelData> {
        self.channels
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| SignalError::unavailable(format!("channel {name}")))
    }

    /// Every per-sample array must match the time vector.
    pub fn validate(&self) -> Result<()> {
        if self.sampling_rate == 0 {
            return Err(SignalError::InvalidSampleRate);
        }
        let expected = self.time.len();
        for channel in &self.channels {
            if channel.samples.len() != expected {
                return Err(SignalError::length_mismatch(&channel.name, expected, channel.samples.len()));
            }
            if channel.missing.len() != expected {
                return Err(SignalError::length_mismatch(
                    format!("{} missing mask", channel.name),
                    expected,
                    channel.missing.len(),
                ));
            }
        }
        for (label, matrix) in [("stimulation", &self.stimulation), ("power band", &self.power_band)] {
            if let Some(matrix) = matrix {
                if matrix.dim() != (expected, 2) {
                    return Err(SignalError::length_mismatch(label, expected, matrix.nrows()));
                }
            }
        }
        if self.time.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SignalError::Malformed("time vector must be strictly increasing".into()));
        }
        Ok(())
    }

    /// Stimulation amplitude of one side, sample by sample.
    pub fn stimulation_series(&self, hemisphere: Hemisphere) -> Result<StimulationSeries> {
        let stimulation = self
            .stimulation
            .as_ref()
            .ok_or_else(|| SignalError::unavailable("stimulation telemetry"))?;
        let amplitude = stimulation
            .index_axis(Axis(1), hemisphere.column())
            .to_vec();
        StimulationSeries::new(self.time.clone(), amplitude)
    }

    /// Parses a stored record and re-checks the shape invariant.
    pub fn from_json(text: &str) -> Result<Self> {
        let recording: Recording = serde_json::from_str(text)?;
        recording.validate()?;
        Ok(recording)
    }
}
