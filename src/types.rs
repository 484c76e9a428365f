use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use crate::pickle::PickleError;

/// Channels recorded by one device group, keyed by channel name (e.g. "ECG").
///
/// Each array has shape `[num_samples, num_components]`. Single-axis sensors
/// have one component, the accelerometer has three.
pub type DeviceSignals = BTreeMap<String, Array2<f64>>;

/// Name of the chest-worn device group (RespiBAN).
pub const CHEST_DEVICE: &str = "chest";

/// Name of the wrist-worn device group (Empatica E4).
pub const WRIST_DEVICE: &str = "wrist";

/// Label values defined in the WESAD readme that this crate segments on.
///
/// Other values in the raw label stream (0 = transient, 4 = meditation,
/// 5-7 = ignored) never start a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelCode {
    /// Neutral baseline condition
    Baseline = 1,
    /// Trier Social Stress Test
    Stress = 2,
    /// Amusement video clips
    Amusement = 3,
}

impl LabelCode {
    /// The three recognized codes in segment order.
    pub const ALL: [LabelCode; 3] = [LabelCode::Baseline, LabelCode::Stress, LabelCode::Amusement];

    /// Maps a raw label value onto a recognized code.
    pub fn from_code(code: i32) -> Option<LabelCode> {
        match code {
            1 => Some(LabelCode::Baseline),
            2 => Some(LabelCode::Stress),
            3 => Some(LabelCode::Amusement),
            _ => None,
        }
    }

    /// Raw value of this code as stored in the label stream.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for LabelCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            LabelCode::Baseline => "baseline",
            LabelCode::Stress => "stress",
            LabelCode::Amusement => "amusement",
        };
        f.pad(name)
    }
}

/// Identifies one channel inside one device group, written `device/channel`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelKey {
    /// Device group name (e.g. "chest")
    pub device: String,
    /// Channel name within the device (e.g. "ECG")
    pub channel: String,
}

impl ChannelKey {
    pub fn new(device: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            channel: channel.into(),
        }
    }

    /// The chest ECG channel, the only channel tracked by default.
    pub fn chest_ecg() -> Self {
        Self::new(CHEST_DEVICE, "ECG")
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.channel)
    }
}

impl FromStr for ChannelKey {
    type Err = WesadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((device, channel)) if !device.is_empty() && !channel.is_empty() => {
                Ok(ChannelKey::new(device, channel))
            }
            _ => Err(WesadError::Config(format!(
                "channel '{}' must be written as device/channel",
                s
            ))),
        }
    }
}

impl TryFrom<String> for ChannelKey {
    type Error = WesadError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ChannelKey> for String {
    fn from(key: ChannelKey) -> String {
        key.to_string()
    }
}

/// One subject's full capture: the label stream plus every device's channels.
///
/// All channels are expected to have as many samples as `label`. This is not
/// checked on load; extraction reports a channel that is too short.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    /// Subject name stored in the archive (e.g. "S2"), if present
    pub subject: Option<String>,
    /// Condition label for every sample
    pub label: Array1<i32>,
    /// Device group name to channels
    pub signal: BTreeMap<String, DeviceSignals>,
}

impl Recording {
    /// Number of labeled samples in the recording.
    pub fn num_samples(&self) -> usize {
        self.label.len()
    }

    /// Returns the channels of a device group.
    pub fn device(&self, device: &str) -> Option<&DeviceSignals> {
        self.signal.get(device)
    }

    /// Returns one channel's samples.
    pub fn channel(&self, key: &ChannelKey) -> Option<&Array2<f64>> {
        self.signal.get(&key.device)?.get(&key.channel)
    }

    /// Removes a device group in place.
    ///
    /// Removing a device that is already absent is a no-op and returns `None`.
    pub fn remove_device(&mut self, device: &str) -> Option<DeviceSignals> {
        self.signal.remove(device)
    }

    /// Counts how many samples carry each recognized label code.
    pub fn label_counts(&self) -> BTreeMap<LabelCode, usize> {
        let mut counts: BTreeMap<LabelCode, usize> =
            LabelCode::ALL.iter().map(|&code| (code, 0)).collect();
        for &value in self.label.iter() {
            if let Some(code) = LabelCode::from_code(value) {
                *counts.entry(code).or_insert(0) += 1;
            }
        }
        counts
    }
}

/// Samples of one channel taken at every index carrying one label code.
///
/// A segment owns its data; it is a copy, not a view into the recording.
/// Indices keep their original ascending order, so a segment is contiguous
/// by label but not necessarily by time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    /// Gathered samples, shape `[segment_len, num_components]`
    pub samples: Array2<f64>,
    /// Label code of every gathered sample (uniform)
    pub labels: Array1<i32>,
}

impl Segment {
    /// Number of samples in the segment.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Values of one component as a plain vector (component 0 for ECG).
    pub fn component(&self, index: usize) -> Vec<f64> {
        self.samples.column(index).to_vec()
    }

    /// Duration of the segment in seconds at the given sample rate.
    pub fn duration(&self, sample_rate: f64) -> f64 {
        self.len() as f64 / sample_rate
    }
}

/// Segments for every tracked channel under one label code.
pub type ChannelSegments = BTreeMap<ChannelKey, Segment>;

/// All segments extracted from one subject's recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectSegments {
    /// Subject id the segments were loaded for
    pub subject: u32,
    /// Baseline segments, one per tracked channel
    pub baseline: ChannelSegments,
    /// Stress segments, one per tracked channel
    pub stress: ChannelSegments,
    /// Amusement segments, one per tracked channel
    pub amusement: ChannelSegments,
}

impl SubjectSegments {
    /// Segments of every tracked channel for one label code.
    pub fn for_label(&self, code: LabelCode) -> &ChannelSegments {
        match code {
            LabelCode::Baseline => &self.baseline,
            LabelCode::Stress => &self.stress,
            LabelCode::Amusement => &self.amusement,
        }
    }

    /// Segment of one channel under one label code.
    pub fn segment(&self, code: LabelCode, key: &ChannelKey) -> Option<&Segment> {
        self.for_label(code).get(key)
    }
}

/// Errors raised while locating, decoding or segmenting a recording.
#[derive(Debug, thiserror::Error)]
pub enum WesadError {
    /// No archive exists where the subject's file should be
    #[error("Invalid subject: {subject} (no file at {path:?})")]
    MissingFile { subject: u32, path: PathBuf },

    /// The archive could not be opened or read
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The archive bytes are not a valid pickle stream
    #[error("Failed to decode archive: {0}")]
    Decode(#[from] PickleError),

    /// A required key is missing from the decoded archive
    #[error("Key not found in recording: {0}")]
    MissingKey(String),

    /// A decoded value does not have the expected shape or type
    #[error("Unexpected value for {field}: expected {expected}")]
    UnexpectedType { field: String, expected: String },

    /// A tracked device group is absent from the recording (or excluded)
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// A tracked channel is absent from its device group
    #[error("Channel not found: {0}")]
    ChannelNotFound(ChannelKey),

    /// A channel has fewer samples than the label stream
    #[error("Channel {key} has {samples} samples but index {index} was requested")]
    ChannelTooShort {
        key: ChannelKey,
        samples: usize,
        index: usize,
    },

    /// The loader configuration could not be read or is invalid
    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, WesadError>;
