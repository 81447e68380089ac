//! CodeDirectory blob builder.
//!
//! The CodeDirectory is the signed heart of an embedded code signature: it
//! records the bundle identity, per-page hashes of the binary up to
//! `codeLimit`, and the "special slot" hashes covering Info.plist, the
//! requirements blob, CodeResources, and both entitlements blobs.
//!
//! Two directories are emitted per slice: SHA-1 for legacy verification and
//! SHA-256 as the alternate directory modern iOS actually checks.

use super::constants::*;
use crate::util::{sha1, sha256};

// Special slots, most negative first (the order they are stored in):
// -6 DER entitlements, -5 XML entitlements, -4 application (zero),
// -3 CodeResources, -2 requirements, -1 Info.plist

/// Header size for version 0x20400 (through execSegFlags).
const CODEDIRECTORY_HEADER_SIZE: u32 = 88;

/// Builder for one CodeDirectory blob.
///
/// Code bytes are borrowed, not copied; `build_sha1`/`build_sha256` hash the
/// pages on demand so both directories can be produced from one borrow.
pub struct CodeDirectoryBuilder<'a> {
    /// Signing identifier (bundle id, or file stem for loose dylibs)
    identifier: String,
    team_id: Option<String>,
    /// Bytes in `[0, codeLimit)` of the slice being signed
    code: &'a [u8],
    /// Slot -1
    info_hash: Option<(Vec<u8>, Vec<u8>)>,
    /// Slot -2
    requirements_hash: Option<(Vec<u8>, Vec<u8>)>,
    /// Slot -3
    resources_hash: Option<(Vec<u8>, Vec<u8>)>,
    /// Slot -5
    entitlements_hash: Option<(Vec<u8>, Vec<u8>)>,
    /// Slot -6
    der_entitlements_hash: Option<(Vec<u8>, Vec<u8>)>,
    /// __TEXT vmsize, written to execSegLimit
    exec_seg_limit: u64,
    /// execSegFlags; CS_EXECSEG_MAIN_BINARY for executables
    exec_seg_flags: u64,
}

impl<'a> CodeDirectoryBuilder<'a> {
    pub fn new(identifier: impl Into<String>, code: &'a [u8]) -> Self {
        Self {
            identifier: identifier.into(),
            team_id: None,
            code,
            info_hash: None,
            requirements_hash: None,
            resources_hash: None,
            entitlements_hash: None,
            der_entitlements_hash: None,
            exec_seg_limit: 0,
            exec_seg_flags: 0,
        }
    }

    /// Team identifier from the signing certificate's OU.
    pub fn team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    /// Info.plist digests for slot -1, as a (SHA-1, SHA-256) pair.
    pub fn info_hash(mut self, sha1: Vec<u8>, sha256: Vec<u8>) -> Self {
        self.info_hash = Some((sha1, sha256));
        self
    }

    /// Requirements blob digests for slot -2.
    pub fn requirements_hash(mut self, sha1: Vec<u8>, sha256: Vec<u8>) -> Self {
        self.requirements_hash = Some((sha1, sha256));
        self
    }

    /// Serialized CodeResources digests for slot -3.
    pub fn resources_hash(mut self, sha1: Vec<u8>, sha256: Vec<u8>) -> Self {
        self.resources_hash = Some((sha1, sha256));
        self
    }

    /// XML entitlements blob digests for slot -5.
    pub fn entitlements_hash(mut self, sha1: Vec<u8>, sha256: Vec<u8>) -> Self {
        self.entitlements_hash = Some((sha1, sha256));
        self
    }

    /// DER entitlements blob digests for slot -6.
    pub fn der_entitlements_hash(mut self, sha1: Vec<u8>, sha256: Vec<u8>) -> Self {
        self.der_entitlements_hash = Some((sha1, sha256));
        self
    }

    /// __TEXT segment vmsize for the execSegLimit field.
    pub fn exec_seg_limit(mut self, limit: u64) -> Self {
        self.exec_seg_limit = limit;
        self
    }

    pub fn exec_seg_flags(mut self, flags: u64) -> Self {
        self.exec_seg_flags = flags;
        self
    }

    /// Build the SHA-1 CodeDirectory (hashType 1, primary slot).
    pub fn build_sha1(&self) -> Vec<u8> {
        self.build_internal(CS_HASHTYPE_SHA1, CS_SHA1_LEN)
    }

    /// Build the SHA-256 CodeDirectory (hashType 2, alternate slot).
    pub fn build_sha256(&self) -> Vec<u8> {
        self.build_internal(CS_HASHTYPE_SHA256, CS_SHA256_LEN)
    }

    fn build_internal(&self, hash_type: u8, hash_size: usize) -> Vec<u8> {
        let code_limit = self.code.len() as u32;
        let n_code_slots = self.code.len().div_ceil(PAGE_SIZE);
        let n_special_slots = self.count_special_slots();

        let ident_offset = CODEDIRECTORY_HEADER_SIZE;
        let ident_len = self.identifier.len() as u32 + 1; // null-terminated

        let team_offset = if self.team_id.is_some() {
            ident_offset + ident_len
        } else {
            0
        };
        let team_len = self
            .team_id
            .as_ref()
            .map(|t| t.len() as u32 + 1)
            .unwrap_or(0);

        // Special slots sit between the strings and hashOffset; hashOffset
        // points at code slot 0.
        let hash_offset =
            ident_offset + ident_len + team_len + (n_special_slots as u32 * hash_size as u32);
        let total_len = hash_offset + (n_code_slots as u32 * hash_size as u32);

        let mut buf = Vec::with_capacity(total_len as usize);

        buf.extend(&CSMAGIC_CODEDIRECTORY.to_be_bytes());
        buf.extend(&total_len.to_be_bytes());
        buf.extend(&CODEDIRECTORY_VERSION.to_be_bytes());
        buf.extend(&0u32.to_be_bytes()); // flags
        buf.extend(&hash_offset.to_be_bytes());
        buf.extend(&ident_offset.to_be_bytes());
        buf.extend(&(n_special_slots as u32).to_be_bytes());
        buf.extend(&(n_code_slots as u32).to_be_bytes());
        buf.extend(&code_limit.to_be_bytes());
        buf.push(hash_size as u8);
        buf.push(hash_type);
        buf.push(0); // platform
        buf.push(PAGE_SIZE_LOG2);
        buf.extend(&0u32.to_be_bytes()); // spare2
        buf.extend(&0u32.to_be_bytes()); // scatterOffset
        buf.extend(&team_offset.to_be_bytes());
        buf.extend(&0u32.to_be_bytes()); // spare3
        buf.extend(&0u64.to_be_bytes()); // codeLimit64
        buf.extend(&0u64.to_be_bytes()); // execSegBase
        buf.extend(&self.exec_seg_limit.to_be_bytes());
        buf.extend(&self.exec_seg_flags.to_be_bytes());

        buf.extend(self.identifier.as_bytes());
        buf.push(0);
        if let Some(ref team) = self.team_id {
            buf.extend(team.as_bytes());
            buf.push(0);
        }

        buf.extend(&self.build_special_slots(hash_type, hash_size));
        buf.extend(&self.hash_code_pages(hash_type));

        buf
    }

    /// Logical slot contents in reverse index order (-6 .. -1).
    fn slot_presence(&self) -> [bool; 6] {
        [
            self.der_entitlements_hash.is_some(),
            self.entitlements_hash.is_some(),
            false, // -4 application, always empty
            self.resources_hash.is_some(),
            self.requirements_hash.is_some(),
            self.info_hash.is_some(),
        ]
    }

    /// Trailing empty slots (the most negative indices) are trimmed; at
    /// least the -1..-3 group is always present.
    fn count_special_slots(&self) -> usize {
        let slots = self.slot_presence();
        match slots.iter().position(|present| *present) {
            Some(idx) => slots.len() - idx,
            None => 3,
        }
    }

    fn build_special_slots(&self, hash_type: u8, hash_size: usize) -> Vec<u8> {
        let pick = |pair: &Option<(Vec<u8>, Vec<u8>)>| -> Vec<u8> {
            match pair {
                Some((h1, h2)) => {
                    if hash_type == CS_HASHTYPE_SHA1 {
                        h1.clone()
                    } else {
                        h2.clone()
                    }
                }
                None => vec![0u8; hash_size],
            }
        };

        let n_slots = self.count_special_slots();
        let mut slots = Vec::with_capacity(n_slots * hash_size);

        if n_slots >= 6 {
            slots.extend(pick(&self.der_entitlements_hash));
        }
        if n_slots >= 5 {
            slots.extend(pick(&self.entitlements_hash));
        }
        if n_slots >= 4 {
            slots.extend(vec![0u8; hash_size]); // -4 application
        }
        slots.extend(pick(&self.resources_hash));
        slots.extend(pick(&self.requirements_hash));
        slots.extend(pick(&self.info_hash));

        slots
    }

    fn hash_code_pages(&self, hash_type: u8) -> Vec<u8> {
        let mut result = Vec::new();
        for chunk in self.code.chunks(PAGE_SIZE) {
            match hash_type {
                CS_HASHTYPE_SHA1 => result.extend(sha1(chunk)),
                _ => result.extend(sha256(chunk)),
            }
        }
        result
    }
}

/// SHA-1 CDHash of a CodeDirectory blob; referenced by the CMS attributes.
pub fn cdhash_sha1(code_directory: &[u8]) -> [u8; 20] {
    sha1(code_directory)
}

/// SHA-256 CDHash of a CodeDirectory blob.
pub fn cdhash_sha256(code_directory: &[u8]) -> [u8; 32] {
    sha256(code_directory)
}
