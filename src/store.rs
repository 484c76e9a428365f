use serde::Serialize;

use crate::types::*;

/// One subject's segments for one label code, as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredSegments {
    /// Subject the segments came from
    pub subject: u32,
    /// Segment of every tracked channel
    pub segments: ChannelSegments,
}

/// Accumulates baseline, stress and amusement segments across subjects.
///
/// Every call to [`SegmentStore::append`] adds exactly one entry to each of
/// the three collections, in call order. Entries are never deduplicated or
/// removed, so loading a subject twice stores it twice.
///
/// The store is plain owned state. Callers sharing it between threads wrap it
/// in a `Mutex`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SegmentStore {
    baseline: Vec<StoredSegments>,
    stress: Vec<StoredSegments>,
    amusement: Vec<StoredSegments>,
}

impl SegmentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one subject's segments to all three collections.
    pub fn append(&mut self, segments: &SubjectSegments) {
        for code in LabelCode::ALL {
            let entry = StoredSegments {
                subject: segments.subject,
                segments: segments.for_label(code).clone(),
            };
            self.collection_mut(code).push(entry);
        }
        log::debug!(
            "Stored segments for S{} ({} entries per label)",
            segments.subject,
            self.len()
        );
    }

    pub fn baseline(&self) -> &[StoredSegments] {
        &self.baseline
    }

    pub fn stress(&self) -> &[StoredSegments] {
        &self.stress
    }

    pub fn amusement(&self) -> &[StoredSegments] {
        &self.amusement
    }

    /// Entries collected for one label code.
    pub fn for_label(&self, code: LabelCode) -> &[StoredSegments] {
        match code {
            LabelCode::Baseline => &self.baseline,
            LabelCode::Stress => &self.stress,
            LabelCode::Amusement => &self.amusement,
        }
    }

    /// Number of appends so far (the length of each collection).
    pub fn len(&self) -> usize {
        self.baseline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baseline.is_empty()
    }

    /// Subject ids in append order, repeats included.
    pub fn subjects(&self) -> Vec<u32> {
        self.baseline.iter().map(|entry| entry.subject).collect()
    }

    /// Iterates over one channel's segments for one label code, in append order.
    pub fn channel_segments<'a>(
        &'a self,
        code: LabelCode,
        key: &'a ChannelKey,
    ) -> impl Iterator<Item = (u32, &'a Segment)> + 'a {
        self.for_label(code)
            .iter()
            .filter_map(move |entry| entry.segments.get(key).map(|segment| (entry.subject, segment)))
    }

    /// Total samples stored for one channel under one label code.
    pub fn total_samples(&self, code: LabelCode, key: &ChannelKey) -> usize {
        self.channel_segments(code, key)
            .map(|(_, segment)| segment.len())
            .sum()
    }

    fn collection_mut(&mut self, code: LabelCode) -> &mut Vec<StoredSegments> {
        match code {
            LabelCode::Baseline => &mut self.baseline,
            LabelCode::Stress => &mut self.stress,
            LabelCode::Amusement => &mut self.amusement,
        }
    }
}
