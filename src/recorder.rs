// src/recorder.rs
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::analysis::error::{Result, SignalError};
use crate::analysis::recording::Recording;
use crate::analysis::response::PredictionFeatures;
use crate::analysis::spectral::SpectralResult;
use crate::types::SpectrogramMethod;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Recording,
    Spectral(SpectrogramMethod),
    Features,
}

/// Identifies one stored artifact; saving under an existing key replaces it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub recording: String,
    pub channel: Option<String>,
    pub kind: RecordKind,
}

impl RecordKey {
    pub fn recording(id: &str) -> Self {
        Self {
            recording: id.to_string(),
            channel: None,
            kind: RecordKind::Recording,
        }
    }

    pub fn spectral(id: &str, channel: &str, method: SpectrogramMethod) -> Self {
        Self {
            recording: id.to_string(),
            channel: Some(channel.to_string()),
            kind: RecordKind::Spectral(method),
        }
    }

    pub fn features(id: &str, channel: &str) -> Self {
        Self {
            recording: id.to_string(),
            channel: Some(channel.to_string()),
            kind: RecordKind::Features,
        }
    }

    fn file_name(&self) -> String {
        let kind = match self.kind {
            RecordKind::Recording => "recording".to_string(),
            RecordKind::Spectral(method) => format!("spectral-{method:?}").to_lowercase(),
            RecordKind::Features => "features".to_string(),
        };
        // `~` never comes out of `encode`, so a whole-recording key cannot
        // meet a channel that happens to be named like the placeholder
        let channel = self.channel.as_deref().map_or_else(|| "~".to_string(), encode);
        format!("{}__{}__{}.json", encode(&self.recording), channel, kind)
    }
}

/// Percent-encodes every byte outside `[a-z0-9-]`. Upper case is escaped too
/// so keys stay distinct on case-insensitive filesystems, and `_` is escaped
/// so the `__` separator cannot appear inside a part.
fn encode(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for byte in part.bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' | b'-' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Persistence for computed artifacts. Values go through JSON so a reload
/// gives back bit-identical floats.
pub trait RecordStore: Send + Sync {
    fn put_raw(&self, key: &RecordKey, json: String) -> Result<()>;
    fn get_raw(&self, key: &RecordKey) -> Result<Option<String>>;

    fn save<T: Serialize>(&self, key: &RecordKey, value: &T) -> Result<()>
    where
        Self: Sized,
    {
        self.put_raw(key, serde_json::to_string(value)?)
    }

    fn load<T: DeserializeOwned>(&self, key: &RecordKey) -> Result<Option<T>>
    where
        Self: Sized,
    {
        match self.get_raw(key)? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn save_recording(&self, id: &str, recording: &Recording) -> Result<()>
    where
        Self: Sized,
    {
        recording.validate()?;
        if let Some(channel) = recording
            .channels
            .iter()
            .find(|c| c.samples.iter().any(|v| !v.is_finite()))
        {
            return Err(SignalError::Malformed(format!(
                "channel {} holds non-finite samples; zero them and flag them missing",
                channel.name
            )));
        }
        self.save(&RecordKey::recording(id), recording)
    }

    /// Missing recordings are `DataUnavailable`, never an empty record.
    fn load_recording(&self, id: &str) -> Result<Recording>
    where
        Self: Sized,
    {
        let text = self
            .get_raw(&RecordKey::recording(id))?
            .ok_or_else(|| SignalError::unavailable(format!("stored recording {id}")))?;
        Recording::from_json(&text)
    }

    fn save_spectral(&self, id: &str, channel: &str, method: SpectrogramMethod, result: &SpectralResult) -> Result<()>
    where
        Self: Sized,
    {
        self.save(&RecordKey::spectral(id, channel, method), result)
    }

    fn load_spectral(&self, id: &str, channel: &str, method: SpectrogramMethod) -> Result<Option<SpectralResult>>
    where
        Self: Sized,
    {
        self.load(&RecordKey::spectral(id, channel, method))
    }

    fn save_features(&self, id: &str, channel: &str, features: &PredictionFeatures) -> Result<()>
    where
        Self: Sized,
    {
        self.save(&RecordKey::features(id, channel), features)
    }

    fn load_features(&self, id: &str, channel: &str) -> Result<Option<PredictionFeatures>>
    where
        Self: Sized,
    {
        self.load(&RecordKey::features(id, channel))
    }
}

/// One JSON file per key under a root directory.
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path_for(&self, key: &RecordKey) -> PathBuf {
        self.root.join(key.file_name())
    }
}

impl RecordStore for JsonFileStore {
    fn put_raw(&self, key: &RecordKey, json: String) -> Result<()> {
        let path = self.path_for(key);
        // write-then-rename so readers never see a half-written record
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, json)?;
        fs::rename(&staging, &path)?;
        debug!("stored {}", path.display());
        Ok(())
    }

    fn get_raw(&self, key: &RecordKey) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<RecordKey, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryStore {
    fn put_raw(&self, key: &RecordKey, json: String) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), json);
        Ok(())
    }

    fn get_raw(&self, key: &RecordKey) -> Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::recording::tests::tiny_recording;
    use ndarray::Array2;

    fn spectral() -> SpectralResult {
        SpectralResult {
            frequencies: vec![0.0, 0.5, 1.0],
            times: vec![0.5, 1.0],
            power: Array2::from_shape_vec((3, 2), vec![1.0 / 3.0, 2e-12, 0.1 + 0.2, 7.0, 1e300, 5e-324]).unwrap(),
        }
    }

    #[test]
    fn file_store_round_trips_bit_for_bit() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let mut recording = tiny_recording();
        recording.channels[0].samples[1] = std::f64::consts::PI / 7.0;
        store.save_recording("patient-1/2024", &recording).unwrap();
        assert_eq!(store.load_recording("patient-1/2024").unwrap(), recording);

        let result = spectral();
        store
            .save_spectral("patient-1/2024", "ZERO_TWO_LEFT", SpectrogramMethod::Wavelet, &result)
            .unwrap();
        let back = store
            .load_spectral("patient-1/2024", "ZERO_TWO_LEFT", SpectrogramMethod::Wavelet)
            .unwrap()
            .unwrap();
        for (a, b) in back.power.iter().zip(result.power.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        assert_eq!(back, result);
    }

    #[test]
    fn saving_twice_replaces_the_record() {
        let store = MemoryStore::new();
        let features = PredictionFeatures {
            center_frequency: 20.0,
            correlation: -0.8,
            fitted_effect: 0.64,
            changes_in_power: 2.0,
            final_power: -3.0,
            score: 0.9,
            predicted_amplitude: 1.5,
            amplitude_range: (0.0, 2.0),
        };
        store.save_features("r1", "ZERO_TWO_LEFT", &features).unwrap();
        let updated = PredictionFeatures {
            center_frequency: 21.0,
            ..features
        };
        store.save_features("r1", "ZERO_TWO_LEFT", &updated).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.load_features("r1", "ZERO_TWO_LEFT").unwrap(), Some(updated));
    }

    #[test]
    fn absent_records_are_reported_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("nested")).unwrap();
        assert!(matches!(
            store.load_recording("nope"),
            Err(SignalError::DataUnavailable { .. })
        ));
        assert!(store
            .load_spectral("nope", "X", SpectrogramMethod::Welch)
            .unwrap()
            .is_none());
    }

    #[test]
    fn keys_map_to_distinct_files() {
        let a = RecordKey::spectral("r", "C_LEFT", SpectrogramMethod::Welch).file_name();
        let b = RecordKey::spectral("r", "C_LEFT", SpectrogramMethod::Wavelet).file_name();
        assert_ne!(a, b);
        assert_eq!(RecordKey::recording("a b").file_name(), "a%20b__~__recording.json");

        let pairs = [
            (RecordKey::recording("patient-1/2024"), RecordKey::recording("patient-1_2024")),
            (RecordKey::features("a__b", "c"), RecordKey::features("a", "b__c")),
            (RecordKey::recording("Case"), RecordKey::recording("case")),
            (
                RecordKey::recording("r"),
                RecordKey {
                    channel: Some("~".into()),
                    ..RecordKey::recording("r")
                },
            ),
        ];
        for (left, right) in &pairs {
            assert_ne!(left.file_name(), right.file_name(), "{left:?} vs {right:?}");
        }
    }

    #[test]
    fn similar_recording_ids_keep_separate_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let first = tiny_recording();
        let mut second = tiny_recording();
        second.channels[0].samples[0] = 2.0;
        store.save_recording("patient-1/2024", &first).unwrap();
        store.save_recording("patient-1_2024", &second).unwrap();
        assert_eq!(store.load_recording("patient-1/2024").unwrap(), first);
        assert_eq!(store.load_recording("patient-1_2024").unwrap(), second);
    }

    #[test]
    fn non_finite_samples_are_refused_before_writing() {
        let store = MemoryStore::new();
        let mut recording = tiny_recording();
        recording.channels[0].samples[2] = f64::NAN;
        assert!(matches!(
            store.save_recording("r1", &recording),
            Err(SignalError::Malformed(_))
        ));
        assert!(store.is_empty());
    }
}
