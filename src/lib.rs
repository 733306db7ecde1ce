//! Sensing-telemetry analysis for adaptive deep-brain stimulation: aligns
//! streamed LFP channels with stimulation telemetry, estimates spectra, picks
//! the stimulation-responsive frequency and predicts the dose-response curve.

pub mod analysis;
pub mod recorder;
pub mod types;
