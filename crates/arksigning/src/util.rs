//! Hash and Base64 primitives shared by all signing components.
//!
//! Every helper here is pure and reentrant; the batch driver and the
//! CodeResources builder call them concurrently from rayon workers.

use crate::Result;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// SHA-1 digest of a byte slice.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 digest of a byte slice.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Both digests of a byte slice in one pass.
pub fn sha_pair(data: &[u8]) -> ([u8; 20], [u8; 32]) {
    (sha1(data), sha256(data))
}

/// Both digests of a file, streamed once through both hash contexts.
pub fn sha_pair_file(path: impl AsRef<Path>) -> Result<([u8; 20], [u8; 32])> {
    let mut file = File::open(path.as_ref())?;
    let mut sha1_hasher = Sha1::new();
    let mut sha256_hasher = Sha256::new();

    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sha1_hasher.update(&buf[..n]);
        sha256_hasher.update(&buf[..n]);
    }

    Ok((sha1_hasher.finalize().into(), sha256_hasher.finalize().into()))
}

/// Both digests of a file as Base64 strings.
pub fn sha_pair_base64_file(path: impl AsRef<Path>) -> Result<(String, String)> {
    let (d1, d2) = sha_pair_file(path)?;
    Ok((base64_encode(&d1), base64_encode(&d2)))
}

/// Lowercase hex SHA-1 of a string; used to key the incremental cache.
pub fn sha1_hex(text: &str) -> String {
    let digest = sha1(text.as_bytes());
    let mut out = String::with_capacity(40);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Standard-alphabet Base64 with `=` padding and no line breaks.
pub fn base64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Forgiving Base64 decode: accepts padded or unpadded input and skips any
/// character outside the standard alphabet.
pub fn base64_decode(text: &str) -> Vec<u8> {
    let filtered: String = text
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '+' || *c == '/')
        .collect();
    STANDARD_NO_PAD.decode(filtered).unwrap_or_default()
}
