//! iOS app bundle code signing.
//!
//! arksigning rewrites every Mach-O inside an app bundle with a fresh
//! embedded signature (CodeDirectory pair, requirements, entitlements, CMS),
//! regenerates the `_CodeSignature/CodeResources` manifests, optionally
//! injects dylibs into the main executable, and repackages the result.
//!
//! The [`bundle`] module drives a single app; [`batch`] fans a directory of
//! inputs out across a worker pool sharing one [`crypto::SigningIdentity`].

pub mod batch;
pub mod bundle;
pub mod codesign;
pub mod crypto;
pub mod error;
pub mod ipa;
pub mod macho;
pub mod util;

pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
