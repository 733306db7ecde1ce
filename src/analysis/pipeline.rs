use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::analysis::cardiac::{CancelToken, CardiacFilter};
use crate::analysis::classifier::ResponseClassifier;
use crate::analysis::epochs::{EpochSegmenter, StimulationEpoch};
use crate::analysis::error::{Result, SignalError};
use crate::analysis::frequency::{select_from_epochs, FrequencyOfInterest, SEARCH_BAND_HZ};
use crate::analysis::recording::Recording;
use crate::analysis::response::{
    PredictionFeatures, PredictionPayload, ResponseCurve, ResponsePredictor, CENTER_HALF_BAND_HZ,
};
use crate::analysis::spectral::{to_decibels, Psd, SpectralEstimator, SpectralResult};
use crate::analysis::stats;
use crate::types::{AnalysisConfig, Hemisphere, PsdMethod, SpectrogramMethod};

/// Rendered spectrogram and epoch PSDs stop here.
pub const DISPLAY_MAX_HZ: f64 = 100.0;
const NORMALIZATION_BAND_HZ: (f64, f64) = (1.0, 100.0);

type CacheKey = (String, SpectrogramMethod);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpectrogramView {
    pub frequency: Vec<f64>,
    pub time: Vec<f64>,
    /// dB, one row per frequency.
    pub power: Vec<Vec<f64>>,
    /// P5 and P95 of `power`.
    pub color_range: [f64; 2],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EpochFeatures {
    /// Mean dB within ±2 Hz of the center frequency, if one was found.
    pub band_power: Option<f64>,
    /// Strongest bin inside the search band.
    pub peak_frequency: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EpochPsd {
    pub stimulation: f64,
    pub frequency: Vec<f64>,
    #[serde(rename = "PSD")]
    pub psd: Vec<f64>,
    pub center_frequency: f64,
    pub spectral_features: EpochFeatures,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChannelRendering {
    pub raw_data: Vec<f64>,
    pub spectrogram: SpectrogramView,
    #[serde(rename = "StimPSD")]
    pub stim_psd: Vec<EpochPsd>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelReport {
    pub channel: String,
    pub hemisphere: Hemisphere,
    pub frequency: FrequencyOfInterest,
    pub rendering: ChannelRendering,
    pub prediction: PredictionPayload,
    /// Scored features behind `prediction`, ready to be upserted.
    pub features: Option<PredictionFeatures>,
}

/// Runs the per-channel chain on one aligned recording and caches the
/// expensive intermediate results.
pub struct RecordingAnalyzer {
    recording: Recording,
    config: AnalysisConfig,
    estimator: SpectralEstimator,
    cardiac: CardiacFilter,
    segmenter: EpochSegmenter,
    predictor: ResponsePredictor,
    signals: Mutex<HashMap<String, Arc<Vec<f64>>>>,
    spectra: Mutex<HashMap<CacheKey, Arc<SpectralResult>>>,
}

impl RecordingAnalyzer {
    pub fn new(recording: Recording, config: AnalysisConfig) -> Result<Self> {
        recording.validate()?;
        let estimator = SpectralEstimator::new(recording.sampling_rate as f64)?;
        Ok(Self {
            recording,
            config,
            estimator,
            cardiac: CardiacFilter::default(),
            segmenter: EpochSegmenter::default(),
            predictor: ResponsePredictor::default(),
            signals: Mutex::new(HashMap::new()),
            spectra: Mutex::new(HashMap::new()),
        })
    }

    pub fn recording(&self) -> &Recording {
        &self.recording
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn hemisphere(&self, channel: &str) -> Result<Hemisphere> {
        let data = self.recording.channel(channel)?;
        data.hemisphere()
            .ok_or_else(|| SignalError::unavailable(format!("hemisphere of channel {channel}")))
    }

    /// Channel samples with non-finite values zeroed and, when configured,
    /// the cardiac artifact removed.
    pub fn prepared_signal(&self, channel: &str) -> Result<Arc<Vec<f64>>> {
        if let Some(hit) = self.lock_signals().get(channel) {
            return Ok(Arc::clone(hit));
        }
        let data = self.recording.channel(channel)?;
        let raw: Vec<f64> = data
            .samples
            .iter()
            .map(|v| if v.is_finite() { *v } else { 0.0 })
            .collect();
        let signal = if self.config.cardiac_filter {
            let cancel = match self.config.cardiac_timeout_ms {
                Some(ms) => CancelToken::with_timeout(Duration::from_millis(ms)),
                None => CancelToken::new(),
            };
            let fs = self.estimator.sample_rate();
            match self
                .cardiac
                .apply(&raw, fs, self.config.cardiac_band_hz, true, &cancel)
            {
                Ok((filtered, outcome)) => {
                    debug!("{channel}: cardiac filter {outcome:?}");
                    filtered
                }
                Err(SignalError::Cancelled) => {
                    warn!("{channel}: cardiac filter timed out; using unfiltered signal");
                    raw
                }
                Err(err) => return Err(err),
            }
        } else {
            raw
        };
        let signal = Arc::new(signal);
        self.lock_signals()
            .insert(channel.to_string(), Arc::clone(&signal));
        Ok(signal)
    }

    /// Cached time-frequency estimate for `(channel, method)`.
    pub fn spectral(&self, channel: &str, method: SpectrogramMethod) -> Result<Arc<SpectralResult>> {
        let key = (channel.to_string(), method);
        if let Some(hit) = self.lock_spectra().get(&key) {
            return Ok(Arc::clone(hit));
        }
        let signal = self.prepared_signal(channel)?;
        let start = self.recording.time.first().copied().unwrap_or(0.0);
        let result = Arc::new(self.estimator.compute(method, &signal, start)?);
        // a concurrent computation of the same key keeps whichever landed first
        let cached = self.lock_spectra().entry(key).or_insert(result).clone();
        Ok(cached)
    }

    /// Constant-stimulation epochs of one side, sorted by amplitude.
    pub fn epochs(&self, hemisphere: Hemisphere) -> Result<Vec<StimulationEpoch>> {
        if self.recording.therapy.side(hemisphere).is_none() {
            return Err(SignalError::unavailable(format!("{hemisphere:?} therapy settings")));
        }
        let series = self.recording.stimulation_series(hemisphere)?;
        Ok(self.segmenter.segment(&series))
    }

    pub fn frequency_of_interest(&self, channel: &str) -> Result<FrequencyOfInterest> {
        let epochs = self.epochs(self.hemisphere(channel)?)?;
        let spectral = self.spectral(channel, self.config.spectrogram_method)?;
        Ok(select_from_epochs(&spectral, &epochs))
    }

    pub fn predict(&self, channel: &str) -> Result<PredictionPayload> {
        let features = self.prediction_features(channel)?;
        Ok(PredictionPayload::from_features(features.as_ref()))
    }

    /// Scored classifier features, `None` when no prediction is possible.
    pub fn prediction_features(&self, channel: &str) -> Result<Option<PredictionFeatures>> {
        let foi = self.frequency_of_interest(channel)?;
        self.features_with(channel, &foi)
    }

    fn features_with(&self, channel: &str, foi: &FrequencyOfInterest) -> Result<Option<PredictionFeatures>> {
        let center = self.config.center_frequency_hz.unwrap_or(foi.center_frequency);
        let epochs = self.epochs(self.hemisphere(channel)?)?;
        let spectral = self.spectral(channel, self.config.spectrogram_method)?;
        let classifier = ResponseClassifier::shared()?;
        self.predictor.evaluate(&spectral, &epochs, center, classifier)
    }

    /// Fitted dose-response curve at the selected (or configured) frequency.
    pub fn response_curve(&self, channel: &str) -> Result<ResponseCurve> {
        let foi = self.frequency_of_interest(channel)?;
        let center = self.config.center_frequency_hz.unwrap_or(foi.center_frequency);
        if center < 0.0 {
            return Err(SignalError::unavailable(format!("center frequency for {channel}")));
        }
        let epochs = self.epochs(self.hemisphere(channel)?)?;
        let spectral = self.spectral(channel, self.config.spectrogram_method)?;
        let samples = self.predictor.band_power_samples(&spectral, &epochs, center)?;
        self.predictor.fit(&samples)
    }

    pub fn render(&self, channel: &str) -> Result<ChannelRendering> {
        let foi = self.frequency_of_interest(channel)?;
        self.render_with(channel, &foi)
    }

    fn render_with(&self, channel: &str, foi: &FrequencyOfInterest) -> Result<ChannelRendering> {
        let raw_data = self.recording.channel(channel)?.samples.clone();
        let spectral = self.spectral(channel, self.config.spectrogram_method)?;
        let mut display = (*spectral).clone();
        display.trim_frequencies(DISPLAY_MAX_HZ);
        let spectrogram = spectrogram_view(&display);

        let epochs = self.epochs(self.hemisphere(channel)?)?;
        let mut stim_psd = Vec::with_capacity(epochs.len());
        for epoch in &epochs {
            match self.epoch_psd(channel, &spectral, epoch) {
                Ok(psd) => stim_psd.push(self.describe_epoch(psd, epoch.amplitude, foi.center_frequency)),
                Err(err) => warn!("{channel}: skipping {} mA epoch: {err}", epoch.amplitude),
            }
        }
        Ok(ChannelRendering {
            raw_data,
            spectrogram,
            stim_psd,
        })
    }

    fn epoch_psd(&self, channel: &str, spectral: &SpectralResult, epoch: &StimulationEpoch) -> Result<Psd> {
        let (start, end) = epoch.window;
        let mut psd = match self.config.psd_method {
            PsdMethod::Welch => {
                let signal = self.prepared_signal(channel)?;
                let lo = self.recording.time.partition_point(|&t| t < start);
                let hi = self.recording.time.partition_point(|&t| t <= end);
                self.estimator.welch(&signal[lo..hi.max(lo)])?
            }
            PsdMethod::TimeFrequency => {
                let columns = spectral.time_indices(start, end);
                let power = spectral.mean_over_columns(&columns).ok_or(SignalError::InsufficientSamples {
                    context: "time-frequency epoch psd",
                    required: 1,
                    available: 0,
                })?;
                Psd {
                    frequencies: spectral.frequencies.clone(),
                    power,
                }
            }
        };
        let keep = psd.frequencies.partition_point(|&f| f <= DISPLAY_MAX_HZ);
        psd.frequencies.truncate(keep);
        psd.power.truncate(keep);
        if self.config.normalized_psd {
            normalize(&mut psd);
        }
        Ok(psd)
    }

    fn describe_epoch(&self, psd: Psd, amplitude: f64, center_frequency: f64) -> EpochPsd {
        let band_power = (center_frequency >= 0.0)
            .then(|| {
                let (lo, hi) = (center_frequency - CENTER_HALF_BAND_HZ, center_frequency + CENTER_HALF_BAND_HZ);
                let values: Vec<f64> = psd
                    .frequencies
                    .iter()
                    .zip(&psd.power)
                    .filter(|(f, _)| **f >= lo && **f <= hi)
                    .map(|(_, p)| to_decibels(*p))
                    .collect();
                (!values.is_empty()).then(|| stats::mean(&values))
            })
            .flatten();
        let (lo, hi) = SEARCH_BAND_HZ;
        let peak_frequency = psd
            .frequencies
            .iter()
            .zip(&psd.power)
            .filter(|(f, _)| **f >= lo && **f <= hi)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or(-1.0, |(f, _)| *f);
        EpochPsd {
            stimulation: amplitude,
            frequency: psd.frequencies,
            psd: psd.power,
            center_frequency,
            spectral_features: EpochFeatures {
                band_power,
                peak_frequency,
            },
        }
    }

    /// Selector, predictor and rendering for one channel.
    pub fn analyze_channel(&self, channel: &str) -> Result<ChannelReport> {
        let hemisphere = self.hemisphere(channel)?;
        let frequency = self.frequency_of_interest(channel)?;
        let features = self.features_with(channel, &frequency)?;
        let rendering = self.render_with(channel, &frequency)?;
        Ok(ChannelReport {
            channel: channel.to_string(),
            hemisphere,
            frequency,
            rendering,
            prediction: PredictionPayload::from_features(features.as_ref()),
            features,
        })
    }

    /// Every channel in parallel; a failing channel is logged and left out.
    pub fn analyze_all(&self) -> Vec<ChannelReport> {
        let names: Vec<String> = self.recording.channel_names().map(str::to_string).collect();
        let reports: Vec<ChannelReport> = names
            .par_iter()
            .filter_map(|name| match self.analyze_channel(name) {
                Ok(report) => Some(report),
                Err(err) => {
                    warn!("channel {name} skipped: {err}");
                    None
                }
            })
            .collect();
        info!("analyzed {}/{} channels", reports.len(), names.len());
        reports
    }

    fn lock_signals(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Vec<f64>>>> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_spectra(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Arc<SpectralResult>>> {
        self.spectra.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn spectrogram_view(spectral: &SpectralResult) -> SpectrogramView {
    let db = spectral.log_power();
    let flat: Vec<f64> = db.iter().copied().collect();
    let color_range = [
        stats::percentile(&flat, 5.0).unwrap_or(0.0),
        stats::percentile(&flat, 95.0).unwrap_or(0.0),
    ];
    SpectrogramView {
        frequency: spectral.frequencies.clone(),
        time: spectral.times.clone(),
        power: db.outer_iter().map(|row| row.to_vec()).collect(),
        color_range,
    }
}

/// Divide by the summed power inside the normalisation band.
fn normalize(psd: &mut Psd) {
    let (lo, hi) = NORMALIZATION_BAND_HZ;
    let total: f64 = psd
        .frequencies
        .iter()
        .zip(&psd.power)
        .filter(|(f, _)| **f >= lo && **f <= hi)
        .map(|(_, p)| *p)
        .sum();
    if total > 0.0 && total.is_finite() {
        psd.power.iter_mut().for_each(|p| *p /= total);
    }
}
