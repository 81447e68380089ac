//! IPA creation.
//!
//! Packs a signed `.app` bundle under the standard `Payload/` prefix.
//! Symlinks and Unix permissions survive the trip, which matters for
//! framework layouts.

use crate::{Error, Result};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// ZIP deflate level for IPA output, clamped to 0-9. Level 0 stores entries
/// uncompressed.
#[derive(Debug, Clone, Copy)]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    pub const NONE: CompressionLevel = CompressionLevel(0);
    pub const DEFAULT: CompressionLevel = CompressionLevel(6);
    pub const MAX: CompressionLevel = CompressionLevel(9);

    #[must_use]
    pub fn new(level: u32) -> Self {
        CompressionLevel(level.min(9))
    }

    #[must_use]
    pub fn level(&self) -> u32 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u32> for CompressionLevel {
    fn from(level: u32) -> Self {
        CompressionLevel::new(level)
    }
}

/// Create an IPA from a signed `.app` bundle.
pub fn create_ipa(
    app_bundle_path: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    compression_level: CompressionLevel,
) -> Result<()> {
    let app_bundle_path = app_bundle_path.as_ref();
    let output_path = output_path.as_ref();

    if !app_bundle_path.is_dir() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not an app bundle directory: {}", app_bundle_path.display()),
        )));
    }

    let app_name = app_bundle_path
        .file_name()
        .ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid app bundle path",
            ))
        })?
        .to_string_lossy();

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(output_path)?;
    let mut zip = ZipWriter::new(file);

    let options = if compression_level.level() == 0 {
        SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
    } else {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(compression_level.level() as i64))
    };

    zip.add_directory("Payload/", options)?;

    for entry in WalkDir::new(app_bundle_path).follow_links(false) {
        let entry =
            entry.map_err(|e| Error::Io(io::Error::other(format!("walk failed: {}", e))))?;

        let path = entry.path();
        let relative_path = path.strip_prefix(app_bundle_path).map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "failed to compute relative path",
            ))
        })?;

        let archive_path = if relative_path.as_os_str().is_empty() {
            format!("Payload/{}/", app_name)
        } else {
            format!("Payload/{}/{}", app_name, relative_path.display())
        };

        let metadata = fs::symlink_metadata(path)?;

        if metadata.is_dir() {
            let dir_path = if archive_path.ends_with('/') {
                archive_path
            } else {
                format!("{}/", archive_path)
            };
            zip.add_directory(&dir_path, options)?;
        } else if metadata.file_type().is_symlink() {
            let target = fs::read_link(path)?;
            zip.add_symlink(&archive_path, target.to_string_lossy(), options)?;
        } else {
            #[cfg(unix)]
            let options = {
                use std::os::unix::fs::PermissionsExt;
                options.unix_permissions(metadata.permissions().mode())
            };

            zip.start_file(&archive_path, options)?;
            let mut file = File::open(path)?;
            let mut buffer = Vec::new();
            file.read_to_end(&mut buffer)?;
            zip.write_all(&buffer)?;
        }
    }

    zip.finish()?;
    Ok(())
}
