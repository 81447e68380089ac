//! IPA extraction.
//!
//! Unpacks `.ipa` archives (plain ZIP files with a `Payload/` directory)
//! into a working directory. Locating the `.app` folder afterwards is the
//! bundle engine's job, so damaged archives with unusual layouts still work
//! as long as an app folder exists somewhere inside.

use crate::{Error, Result};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use zip::ZipArchive;

/// True when the file starts with the local-file ZIP signature `PK\x03\x04`.
pub fn is_zip_file(path: impl AsRef<Path>) -> bool {
    let Ok(mut file) = File::open(path.as_ref()) else {
        return false;
    };
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() {
        return false;
    }
    magic == [0x50, 0x4b, 0x03, 0x04]
}

/// Extract an archive into `dest_dir`, preserving Unix permissions.
pub fn extract_archive(archive_path: impl AsRef<Path>, dest_dir: impl AsRef<Path>) -> Result<()> {
    let archive_path = archive_path.as_ref();
    let dest_dir = dest_dir.as_ref();

    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;

    fs::create_dir_all(dest_dir)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;

        let outpath = match entry.enclosed_name() {
            Some(path) => dest_dir.join(path),
            // Entries escaping the destination are dropped.
            None => continue,
        };

        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                if !parent.exists() {
                    fs::create_dir_all(parent)?;
                }
            }

            let mut outfile = File::create(&outpath)?;
            io::copy(&mut entry, &mut outfile)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    fs::set_permissions(&outpath, fs::Permissions::from_mode(mode))?;
                }
            }
        }
    }

    Ok(())
}

/// Check that a path exists and carries the ZIP signature.
pub fn validate_archive(archive_path: impl AsRef<Path>) -> Result<()> {
    let archive_path = archive_path.as_ref();
    if !archive_path.exists() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("archive not found: {}", archive_path.display()),
        )));
    }
    if !is_zip_file(archive_path) {
        return Err(Error::Zip(zip::result::ZipError::InvalidArchive(
            "not a ZIP/IPA file",
        )));
    }
    Ok(())
}
