//! Splitting a recording into per-label segments.
//!
//! Extraction never mutates the recording. Excluded device groups are hidden
//! through a [`RecordingView`], so the same recording can be segmented again
//! or inspected afterwards.

use ndarray::{Array1, Array2, Axis};

use crate::types::*;

/// A read-only view of a recording with some device groups hidden.
#[derive(Debug, Clone, Copy)]
pub struct RecordingView<'a> {
    recording: &'a Recording,
    excluded: &'a [String],
}

impl<'a> RecordingView<'a> {
    pub fn new(recording: &'a Recording, excluded: &'a [String]) -> Self {
        Self {
            recording,
            excluded,
        }
    }

    pub fn recording(&self) -> &'a Recording {
        self.recording
    }

    /// Whether the device group is visible through this view.
    pub fn has_device(&self, device: &str) -> bool {
        !self.is_excluded(device) && self.recording.signal.contains_key(device)
    }

    /// Names of the visible device groups.
    pub fn devices(self) -> impl Iterator<Item = &'a str> {
        let excluded = self.excluded;
        self.recording
            .signal
            .keys()
            .map(String::as_str)
            .filter(move |device| !excluded.iter().any(|d| d == device))
    }

    /// Looks up a channel, failing if its device is hidden or absent.
    pub fn channel(&self, key: &ChannelKey) -> Result<&'a Array2<f64>> {
        if self.is_excluded(&key.device) {
            return Err(WesadError::DeviceNotFound(key.device.clone()));
        }
        let device = self
            .recording
            .signal
            .get(&key.device)
            .ok_or_else(|| WesadError::DeviceNotFound(key.device.clone()))?;
        device
            .get(&key.channel)
            .ok_or_else(|| WesadError::ChannelNotFound(key.clone()))
    }

    fn is_excluded(&self, device: &str) -> bool {
        self.excluded.iter().any(|d| d == device)
    }
}

/// Indices where the label stream equals `code`, in ascending order.
pub fn label_indices(labels: &Array1<i32>, code: LabelCode) -> Vec<usize> {
    labels
        .iter()
        .enumerate()
        .filter(|&(_, &value)| value == code.code())
        .map(|(index, _)| index)
        .collect()
}

/// Copies the rows of `samples` and `labels` at `indices` into a new segment.
///
/// Fails if the channel is shorter than the largest index instead of
/// panicking inside ndarray.
pub fn gather(
    key: &ChannelKey,
    samples: &Array2<f64>,
    labels: &Array1<i32>,
    indices: &[usize],
) -> Result<Segment> {
    if let Some(&last) = indices.last() {
        if last >= samples.nrows() {
            return Err(WesadError::ChannelTooShort {
                key: key.clone(),
                samples: samples.nrows(),
                index: last,
            });
        }
    }

    if indices.is_empty() {
        return Ok(Segment {
            samples: Array2::zeros((0, samples.ncols())),
            labels: Array1::zeros(0),
        });
    }

    Ok(Segment {
        samples: samples.select(Axis(0), indices),
        labels: labels.select(Axis(0), indices),
    })
}

/// Extracts baseline, stress and amusement segments for every channel.
///
/// Each channel gets its own entry; nothing is overwritten when several
/// channels are tracked. A label code with no samples yields an empty segment.
pub fn extract(view: &RecordingView, channels: &[ChannelKey], subject: u32) -> Result<SubjectSegments> {
    let recording = view.recording();
    let mut segments = SubjectSegments {
        subject,
        baseline: ChannelSegments::new(),
        stress: ChannelSegments::new(),
        amusement: ChannelSegments::new(),
    };

    for code in LabelCode::ALL {
        let indices = label_indices(&recording.label, code);
        if indices.is_empty() {
            log::warn!("S{}: no {} samples in recording", subject, code);
        }

        let target = match code {
            LabelCode::Baseline => &mut segments.baseline,
            LabelCode::Stress => &mut segments.stress,
            LabelCode::Amusement => &mut segments.amusement,
        };
        for key in channels {
            let samples = view.channel(key)?;
            let segment = gather(key, samples, &recording.label, &indices)?;
            log::debug!("S{}: {} {} segment has {} samples", subject, key, code, segment.len());
            target.insert(key.clone(), segment);
        }
    }

    Ok(segments)
}
