//! Error types for arksigning operations.
//!
//! This module defines the [`enum@Error`] enum covering all failure cases
//! in code signing operations: I/O, identity loading, bundle layout,
//! Mach-O rewriting, and CMS generation.

use thiserror::Error;

/// Error type for arksigning operations.
///
/// All public functions in this crate return [`crate::Result<T>`], which uses
/// this error type. Every error is fatal for the signing task that raised it;
/// the batch driver records the failure and continues with other tasks.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Signing identity could not be loaded.
    ///
    /// The certificate, private key, or provisioning profile cannot be
    /// parsed, the password is wrong, or the certificate carries no Team ID.
    #[error("Invalid identity: {0}")]
    Identity(String),

    /// The app bundle is malformed.
    ///
    /// Missing Info.plist, missing executable, or no `.app`/`.appex`
    /// directory under the input folder.
    #[error("Malformed bundle: {0}")]
    Bundle(String),

    /// Invalid or unsupported Mach-O binary.
    #[error("Invalid Mach-O: {0}")]
    MachO(String),

    /// The Mach-O cputype is outside the supported set.
    #[error("Unsupported architecture: cputype {0:#x}")]
    UnsupportedArch(u32),

    /// Not enough room between the load commands and the first `__TEXT`
    /// section to append another load command.
    #[error("No space left in load commands area")]
    NoLoadCommandSpace,

    /// CMS construction or another cryptographic step failed.
    #[error("Signing failed: {0}")]
    Signing(String),

    /// OpenSSL primitive failed.
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    /// Property list parsing or serialization failed.
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    /// Cache serialization failed.
    #[error("Cache error: {0}")]
    Json(#[from] serde_json::Error),

    /// ZIP archive operation failed during IPA extraction or creation.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}
