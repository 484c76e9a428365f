//! Loader configuration
//!
//! Every field has a default matching the WESAD layout, so a config file only
//! needs to name what differs:
//!
//! ```toml
//! root_path = "/data/WESAD"
//! ignore_wrist = true
//! channels = ["chest/ECG", "chest/EDA"]
//! text_decoding = "latin1"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::pickle::TextDecoding;
use crate::types::{ChannelKey, Result, WesadError, WRIST_DEVICE};

/// Subject ids in the dataset (S1 and S12 were dropped by the dataset authors).
pub const DEFAULT_SUBJECTS: [u32; 15] = [2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 14, 15, 16, 17];

/// Extension of the per-subject archive files.
pub const DEFAULT_FILE_EXTENSION: &str = ".pkl";

/// Configuration for the segment loader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Dataset root holding one `S<id>` directory per subject
    pub root_path: PathBuf,

    /// Archive extension including the dot
    pub file_extension: String,

    /// Subjects processed by `SegmentLoader::load_all`, in order
    pub subjects: Vec<u32>,

    /// Exclude the wrist device group (Empatica E4) before extraction
    pub ignore_wrist: bool,

    /// Channels segmented for every subject
    pub channels: Vec<ChannelKey>,

    /// How Python 2 byte strings in the archives are decoded
    pub text_decoding: TextDecoding,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("WESAD"),
            file_extension: DEFAULT_FILE_EXTENSION.to_string(),
            subjects: DEFAULT_SUBJECTS.to_vec(),
            ignore_wrist: true,
            channels: vec![ChannelKey::chest_ecg()],
            text_decoding: TextDecoding::Latin1,
        }
    }
}

impl LoaderConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dataset root directory
    pub fn with_root_path(mut self, root_path: impl Into<PathBuf>) -> Self {
        self.root_path = root_path.into();
        self
    }

    /// Set the archive extension (e.g. ".pkl")
    pub fn with_file_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = extension.into();
        self
    }

    pub fn with_subjects(mut self, subjects: Vec<u32>) -> Self {
        self.subjects = subjects;
        self
    }

    /// Enable or disable excluding the wrist device group
    pub fn with_ignore_wrist(mut self, ignore: bool) -> Self {
        self.ignore_wrist = ignore;
        self
    }

    /// Replace the tracked channels
    pub fn with_channels(mut self, channels: Vec<ChannelKey>) -> Self {
        self.channels = channels;
        self
    }

    /// Track one more channel
    pub fn add_channel(mut self, channel: ChannelKey) -> Self {
        if !self.channels.contains(&channel) {
            self.channels.push(channel);
        }
        self
    }

    pub fn with_text_decoding(mut self, decoding: TextDecoding) -> Self {
        self.text_decoding = decoding;
        self
    }

    /// Device groups hidden from extraction.
    pub fn excluded_devices(&self) -> Vec<String> {
        if self.ignore_wrist {
            vec![WRIST_DEVICE.to_string()]
        } else {
            Vec::new()
        }
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: LoaderConfig =
            toml::from_str(text).map_err(|e| WesadError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        log::info!("Loading loader configuration: {:?}", path);
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(WesadError::Config(
                "at least one channel must be tracked".to_string(),
            ));
        }
        if self.file_extension.contains(['/', '\\']) {
            return Err(WesadError::Config(format!(
                "file extension '{}' must not contain a path separator",
                self.file_extension
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LoaderConfig::new();

        assert_eq!(config.file_extension, ".pkl");
        assert_eq!(config.subjects.len(), 15);
        assert!(!config.subjects.contains(&1));
        assert!(!config.subjects.contains(&12));
        assert!(config.ignore_wrist);
        assert_eq!(config.channels, vec![ChannelKey::chest_ecg()]);
        assert_eq!(config.text_decoding, TextDecoding::Latin1);
        assert_eq!(config.excluded_devices(), vec!["wrist".to_string()]);
    }

    #[test]
    fn test_builder() {
        let config = LoaderConfig::new()
            .with_root_path("/tmp/wesad")
            .with_ignore_wrist(false)
            .add_channel(ChannelKey::new("chest", "EDA"))
            .add_channel(ChannelKey::chest_ecg())
            .with_subjects(vec![2, 3]);

        assert_eq!(config.root_path, PathBuf::from("/tmp/wesad"));
        assert!(config.excluded_devices().is_empty());
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.subjects, vec![2, 3]);
    }

    #[test]
    fn test_from_toml_str() {
        let config = LoaderConfig::from_toml_str(
            r#"
root_path = "/data/WESAD"
ignore_wrist = false
channels = ["chest/ECG", "wrist/BVP"]
text_decoding = "bytes"
"#,
        )
        .unwrap();

        assert_eq!(config.root_path, PathBuf::from("/data/WESAD"));
        assert!(!config.ignore_wrist);
        assert_eq!(
            config.channels,
            vec![ChannelKey::chest_ecg(), ChannelKey::new("wrist", "BVP")]
        );
        assert_eq!(config.text_decoding, TextDecoding::Bytes);
        // Unset fields keep their defaults
        assert_eq!(config.file_extension, ".pkl");
        assert_eq!(config.subjects, DEFAULT_SUBJECTS.to_vec());
    }

    #[test]
    fn test_invalid_channel_in_toml() {
        let result = LoaderConfig::from_toml_str(r#"channels = ["ECG"]"#);
        assert!(matches!(result, Err(WesadError::Config(_))));
    }

    #[test]
    fn test_empty_channel_list_is_rejected() {
        let result = LoaderConfig::from_toml_str("channels = []");
        assert!(matches!(result, Err(WesadError::Config(_))));
    }
}
