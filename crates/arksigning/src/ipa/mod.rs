//! IPA archive handling: extraction and repacking.

pub mod archive;
pub mod extract;

pub use archive::{create_ipa, CompressionLevel};
pub use extract::{extract_archive, is_zip_file, validate_archive};
