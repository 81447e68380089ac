//! SuperBlob assembly.
//!
//! The SuperBlob is the container written into `LC_CODE_SIGNATURE`: a
//! 12-byte header (magic `0xfade0cc0`, total length, blob count) followed by
//! (slot type, offset) index entries and the concatenated blobs.
//!
//! Index entries are emitted in ascending slot-type order:
//! CodeDirectory (0x0), Requirements (0x2), Entitlements (0x5),
//! DER entitlements (0x7), alternate CodeDirectory (0x1000), CMS (0x10000).

use super::constants::*;

const SUPERBLOB_HEADER_SIZE: u32 = 12;
const INDEX_ENTRY_SIZE: u32 = 8;

/// One typed blob destined for the SuperBlob index.
#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub slot_type: u32,
    /// Raw blob bytes including the blob's own magic/length header.
    pub data: Vec<u8>,
}

impl BlobEntry {
    pub fn new(slot_type: u32, data: Vec<u8>) -> Self {
        Self { slot_type, data }
    }
}

/// Serialize index entries and blob data into a SuperBlob.
pub fn build_superblob(entries: Vec<BlobEntry>) -> Vec<u8> {
    let count = entries.len() as u32;
    let header_size = SUPERBLOB_HEADER_SIZE + count * INDEX_ENTRY_SIZE;

    let mut offsets = Vec::with_capacity(entries.len());
    let mut current_offset = header_size;
    for entry in &entries {
        offsets.push(current_offset);
        current_offset += entry.data.len() as u32;
    }
    let total_length = current_offset;

    let mut buf = Vec::with_capacity(total_length as usize);
    buf.extend(&CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
    buf.extend(&total_length.to_be_bytes());
    buf.extend(&count.to_be_bytes());

    for (i, entry) in entries.iter().enumerate() {
        buf.extend(&entry.slot_type.to_be_bytes());
        buf.extend(&offsets[i].to_be_bytes());
    }
    for entry in entries {
        buf.extend(&entry.data);
    }

    buf
}

/// Entitlements blob: `0xfade7171` header over the raw XML plist bytes.
pub fn build_entitlements_blob(plist_data: &[u8]) -> Vec<u8> {
    let total_len = 8 + plist_data.len() as u32;
    let mut buf = Vec::with_capacity(total_len as usize);
    buf.extend(&CSMAGIC_EMBEDDED_ENTITLEMENTS.to_be_bytes());
    buf.extend(&total_len.to_be_bytes());
    buf.extend(plist_data);
    buf
}

/// DER entitlements blob: `0xfade7172` header over the DER encoding.
pub fn build_der_entitlements_blob(der_data: &[u8]) -> Vec<u8> {
    let total_len = 8 + der_data.len() as u32;
    let mut buf = Vec::with_capacity(total_len as usize);
    buf.extend(&CSMAGIC_EMBEDDED_DER_ENTITLEMENTS.to_be_bytes());
    buf.extend(&total_len.to_be_bytes());
    buf.extend(der_data);
    buf
}

/// CMS wrapper blob: `0xfade0b01` header over the DER `ContentInfo`.
pub fn build_signature_blob(cms_data: &[u8]) -> Vec<u8> {
    let total_len = 8 + cms_data.len() as u32;
    let mut buf = Vec::with_capacity(total_len as usize);
    buf.extend(&CSMAGIC_BLOBWRAPPER.to_be_bytes());
    buf.extend(&total_len.to_be_bytes());
    buf.extend(cms_data);
    buf
}

/// Builder assembling the standard slot set in index order.
#[derive(Debug, Default)]
pub struct SuperBlobBuilder {
    code_directory_sha1: Option<Vec<u8>>,
    code_directory_sha256: Option<Vec<u8>>,
    requirements: Option<Vec<u8>>,
    entitlements: Option<Vec<u8>>,
    der_entitlements: Option<Vec<u8>>,
    cms_signature: Option<Vec<u8>>,
}

impl SuperBlobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// SHA-1 CodeDirectory for the primary slot (0x0).
    pub fn code_directory_sha1(mut self, cd: Vec<u8>) -> Self {
        self.code_directory_sha1 = Some(cd);
        self
    }

    /// SHA-256 CodeDirectory for the alternate slot (0x1000).
    pub fn code_directory_sha256(mut self, cd: Vec<u8>) -> Self {
        self.code_directory_sha256 = Some(cd);
        self
    }

    pub fn requirements(mut self, blob: Vec<u8>) -> Self {
        self.requirements = Some(blob);
        self
    }

    pub fn entitlements(mut self, blob: Vec<u8>) -> Self {
        self.entitlements = Some(blob);
        self
    }

    pub fn der_entitlements(mut self, blob: Vec<u8>) -> Self {
        self.der_entitlements = Some(blob);
        self
    }

    pub fn cms_signature(mut self, blob: Vec<u8>) -> Self {
        self.cms_signature = Some(blob);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut entries = Vec::new();

        if let Some(cd) = self.code_directory_sha1 {
            entries.push(BlobEntry::new(CSSLOT_CODEDIRECTORY, cd));
        }
        if let Some(req) = self.requirements {
            entries.push(BlobEntry::new(CSSLOT_REQUIREMENTS, req));
        }
        if let Some(ent) = self.entitlements {
            entries.push(BlobEntry::new(CSSLOT_ENTITLEMENTS, ent));
        }
        if let Some(der) = self.der_entitlements {
            entries.push(BlobEntry::new(CSSLOT_DER_ENTITLEMENTS, der));
        }
        if let Some(cd) = self.code_directory_sha256 {
            entries.push(BlobEntry::new(CSSLOT_ALTERNATE_CODEDIRECTORIES, cd));
        }
        if let Some(sig) = self.cms_signature {
            entries.push(BlobEntry::new(CSSLOT_SIGNATURESLOT, sig));
        }

        build_superblob(entries)
    }
}
