use std::collections::BTreeMap;

use log::{debug, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::analysis::error::{Result, SignalError};
use crate::analysis::recording::{ChannelData, Recording, Therapy};
use crate::analysis::stats;

/// Telemetry samples whose timestamps fall this far outside a capture still
/// anchor its interpolation.
const TELEMETRY_MARGIN_S: f64 = 1.0;

/// One decoded time-domain channel as captured by the device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelCapture {
    pub name: String,
    /// Absolute time of the first sample (epoch seconds).
    pub start_time: f64,
    pub sampling_rate: u32,
    pub samples: Vec<f64>,
    #[serde(default)]
    pub missing: Option<Vec<bool>>,
}

impl ChannelCapture {
    pub fn validate(&self) -> Result<()> {
        if self.sampling_rate == 0 {
            return Err(SignalError::InvalidSampleRate);
        }
        if let Some(missing) = &self.missing {
            if missing.len() != self.samples.len() {
                return Err(SignalError::length_mismatch(
                    format!("{} missing mask", self.name),
                    self.samples.len(),
                    missing.len(),
                ));
            }
        }
        Ok(())
    }

    fn missing_mask(&self) -> Vec<bool> {
        self.samples
            .iter()
            .enumerate()
            .map(|(i, v)| {
                !v.is_finite()
                    || self
                        .missing
                        .as_ref()
                        .and_then(|m| m.get(i).copied())
                        .unwrap_or(false)
            })
            .collect()
    }
}

/// Coarse power-channel packets: stimulation amplitude and band power per side.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerTelemetry {
    /// Absolute sample times (epoch seconds).
    pub timestamps: Vec<f64>,
    pub stimulation: Vec<[f64; 2]>,
    pub power_band: Vec<[f64; 2]>,
}

impl PowerTelemetry {
    pub fn validate(&self) -> Result<()> {
        let n = self.timestamps.len();
        if self.stimulation.len() != n {
            return Err(SignalError::length_mismatch("telemetry stimulation", n, self.stimulation.len()));
        }
        if self.power_band.len() != n {
            return Err(SignalError::length_mismatch("telemetry power band", n, self.power_band.len()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignerInput {
    pub channels: Vec<ChannelCapture>,
    pub telemetry: Vec<PowerTelemetry>,
    #[serde(default)]
    pub therapy: Therapy,
}

struct TelemetryRow {
    time: f64,
    stimulation: [f64; 2],
    power_band: [f64; 2],
}

/// Groups captures by exact start time and puts each group's channels and the
/// overlapping telemetry onto the group's sample clock.
pub fn align(input: &AlignerInput) -> Result<Vec<Recording>> {
    for capture in &input.channels {
        capture.validate()?;
    }
    let mut rows = Vec::new();
    for packet in &input.telemetry {
        packet.validate()?;
        for (i, &time) in packet.timestamps.iter().enumerate() {
            rows.push(TelemetryRow {
                time,
                stimulation: packet.stimulation[i],
                power_band: packet.power_band[i],
            });
        }
    }
    rows.sort_by(|a, b| a.time.total_cmp(&b.time));

    // BTreeMap on the bit pattern keeps exact-equality grouping; positive
    // timestamps sort the same way as their bits.
    let mut groups: BTreeMap<u64, Vec<&ChannelCapture>> = BTreeMap::new();
    for capture in &input.channels {
        groups
            .entry(capture.start_time.to_bits())
            .or_default()
            .push(capture);
    }

    let mut recordings = Vec::with_capacity(groups.len());
    for captures in groups.values() {
        recordings.push(align_group(captures, &rows, &input.therapy)?);
    }
    debug!("aligned {} recording(s)", recordings.len());
    Ok(recordings)
}

fn align_group(captures: &[&ChannelCapture], rows: &[TelemetryRow], therapy: &Therapy) -> Result<Recording> {
    let first = captures[0];
    let sampling_rate = first.sampling_rate;
    let len = first.samples.len();
    let mut channels: Vec<ChannelData> = Vec::with_capacity(captures.len());
    for capture in captures {
        if capture.sampling_rate != sampling_rate {
            return Err(SignalError::SampleRateMismatch {
                expected: sampling_rate as f64,
                actual: capture.sampling_rate as f64,
            });
        }
        if capture.samples.len() != len {
            return Err(SignalError::length_mismatch(&capture.name, len, capture.samples.len()));
        }
        if channels.iter().any(|c| c.name == capture.name) {
            warn!("duplicate channel {} in one capture; keeping the first", capture.name);
            continue;
        }
        channels.push(ChannelData {
            name: capture.name.clone(),
            // gaps stay flagged in the mask; the sample slot holds 0.0 so the
            // record serializes as plain JSON numbers
            samples: capture
                .samples
                .iter()
                .map(|v| if v.is_finite() { *v } else { 0.0 })
                .collect(),
            missing: capture.missing_mask(),
        });
    }

    let fs = sampling_rate as f64;
    let time: Vec<f64> = (0..len).map(|i| i as f64 / fs).collect();
    let start = first.start_time;
    let end = start + time.last().copied().unwrap_or(0.0);
    let overlapping: Vec<&TelemetryRow> = rows
        .iter()
        .filter(|r| r.time >= start - TELEMETRY_MARGIN_S && r.time <= end + TELEMETRY_MARGIN_S)
        .collect();

    let (stimulation, power_band) = if overlapping.is_empty() {
        warn!("no power telemetry overlaps capture starting at {start}");
        (None, None)
    } else {
        let xp: Vec<f64> = overlapping.iter().map(|r| r.time - start).collect();
        let resample = |values: Vec<f64>| -> Vec<f64> {
            time.iter().map(|&t| stats::interp(t, &xp, &values)).collect()
        };
        let stim = [
            resample(overlapping.iter().map(|r| r.stimulation[0]).collect()),
            resample(overlapping.iter().map(|r| r.stimulation[1]).collect()),
        ];
        let power = [
            resample(overlapping.iter().map(|r| r.power_band[0]).collect()),
            resample(overlapping.iter().map(|r| r.power_band[1]).collect()),
        ];
        (
            Some(Array2::from_shape_fn((len, 2), |(i, c)| stim[c][i])),
            Some(Array2::from_shape_fn((len, 2), |(i, c)| power[c][i])),
        )
    };

    let recording = Recording {
        sampling_rate,
        start_time: start,
        time,
        channels,
        stimulation,
        power_band,
        therapy: therapy.clone(),
    };
    recording.validate()?;
    Ok(recording)
}
