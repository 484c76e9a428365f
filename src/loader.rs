use std::path::PathBuf;

use crate::config::LoaderConfig;
use crate::reader;
use crate::segment::{self, RecordingView};
use crate::store::SegmentStore;
use crate::types::*;

/// Loads subject archives and splits them into labeled segments.
///
/// # Examples
///
/// ```no_run
/// use wesad_importer::{LoaderConfig, SegmentLoader, SegmentStore};
///
/// let loader = SegmentLoader::new(LoaderConfig::new().with_root_path("data/WESAD"));
/// let mut store = SegmentStore::new();
///
/// let segments = loader.load_subject(2, &mut store).unwrap();
/// println!("Stress segments: {}", segments.stress.len());
/// ```
#[derive(Debug, Clone, Default)]
pub struct SegmentLoader {
    config: LoaderConfig,
}

impl SegmentLoader {
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Returns `<root>/S<id>/S<id><ext>` if a file exists there.
    ///
    /// Logs a progress line naming the subject before checking the path.
    pub fn resolve_path(&self, subject: u32) -> Result<PathBuf> {
        let name = format!("S{}", subject);
        let path = self
            .config
            .root_path
            .join(&name)
            .join(format!("{}{}", name, self.config.file_extension));

        log::info!("Loading data for {}", name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(WesadError::MissingFile { subject, path })
        }
    }

    /// Reads and decodes one subject's archive.
    pub fn load_recording(&self, subject: u32) -> Result<Recording> {
        let path = self.resolve_path(subject)?;
        reader::load_file(&path, self.config.text_decoding)
    }

    /// Extracts every tracked channel's segments and appends them to `store`.
    ///
    /// The recording is left untouched; the wrist group is only hidden from
    /// the lookup when `ignore_wrist` is set. The segments are appended even
    /// when some are empty, and even when this subject was stored before.
    pub fn extract_segments(
        &self,
        recording: &Recording,
        subject: u32,
        store: &mut SegmentStore,
    ) -> Result<SubjectSegments> {
        let excluded = self.config.excluded_devices();
        let view = RecordingView::new(recording, &excluded);

        let segments = segment::extract(&view, &self.config.channels, subject)?;
        store.append(&segments);

        Ok(segments)
    }

    /// Loads a subject's recording and extracts its segments into `store`.
    ///
    /// Nothing is appended when the archive cannot be found or decoded.
    pub fn load_subject(&self, subject: u32, store: &mut SegmentStore) -> Result<SubjectSegments> {
        let recording = self.load_recording(subject)?;
        self.extract_segments(&recording, subject, store)
    }

    /// Loads every configured subject in order, stopping at the first failure.
    pub fn load_all(&self, store: &mut SegmentStore) -> Result<Vec<SubjectSegments>> {
        let mut loaded = Vec::with_capacity(self.config.subjects.len());
        for (i, &subject) in self.config.subjects.iter().enumerate() {
            log::debug!("Subject {}/{}", i + 1, self.config.subjects.len());
            loaded.push(self.load_subject(subject, store)?);
        }

        log::info!("Successfully loaded {} subjects", loaded.len());
        Ok(loaded)
    }
}
