//! Embedded code signature data structures: CodeDirectory, requirements,
//! entitlements blobs, and the SuperBlob container.

pub mod code_directory;
pub mod constants;
pub mod der;
pub mod requirements;
pub mod superblob;
