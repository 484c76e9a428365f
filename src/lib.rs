//! Loads WESAD subject recordings and splits them into baseline, stress and
//! amusement segments.

pub mod config;
pub mod loader;
pub mod pickle;
mod reader;
pub mod segment;
pub mod store;
pub mod types;

use std::path::Path;

// Re-export types
pub use config::LoaderConfig;
pub use loader::SegmentLoader;
pub use pickle::TextDecoding;
pub use reader::recording_from_value;
pub use store::{SegmentStore, StoredSegments};
pub use types::*;

/// Loads a WESAD archive and returns a struct representation
///
/// Python 2 byte strings in the archive are decoded as Latin-1.
///
/// # Examples
///
/// ```no_run
/// use wesad_importer::load;
///
/// let result = load("data/WESAD/S2/S2.pkl");
/// match result {
///     Ok(recording) => println!("Samples: {}", recording.num_samples()),
///     Err(e) => println!("Error loading file: {}", e),
/// }
/// ```
pub fn load<P: AsRef<Path>>(file_path: P) -> Result<Recording> {
    reader::load_file(file_path, TextDecoding::Latin1)
}
