//! Signing identity loading and CMS signature generation.

pub mod cms;
mod cms_ffi;
pub mod identity;

pub use cms::generate_cms;
pub use identity::SigningIdentity;
