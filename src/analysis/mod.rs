// src/analysis/mod.rs
pub mod admission;
pub mod aligner;
pub mod cardiac;
pub mod classifier;
pub mod epochs;
pub mod error;
pub mod filter;
pub mod frequency;
pub mod peaks;
pub mod pipeline;
pub mod plot;
pub mod recording;
pub mod response;
pub mod spectral;
pub mod stats;

pub use admission::{AdmissionGate, AdmissionPermit};
pub use aligner::{align, AlignerInput, ChannelCapture, PowerTelemetry};
pub use cardiac::{CancelToken, CardiacFilter, CardiacOutcome, Polarity};
pub use classifier::ResponseClassifier;
pub use epochs::{EpochSegmenter, StimulationEpoch, StimulationSeries};
pub use error::{Result, SignalError};
pub use filter::{FilterChain, FilterKind};
pub use frequency::{extract_frequency_of_interest, FrequencyOfInterest};
pub use pipeline::{ChannelRendering, ChannelReport, EpochPsd, RecordingAnalyzer, SpectrogramView};
pub use plot::{render_psd_png, render_response_png, PlotStyle};
pub use recording::{ChannelData, Recording, Therapy, TherapySettings};
pub use response::{Prediction, PredictionFeatures, PredictionPayload, ResponseCurve, ResponsePredictor};
pub use spectral::{Psd, SpectralEstimator, SpectralResult};
