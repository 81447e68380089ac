//! Apple code signing constants and magic numbers.
//!
//! These values define the on-disk format of embedded signatures:
//! SuperBlob containers, CodeDirectory records, requirement expressions,
//! and hash identifiers. All multi-byte fields are big-endian.

// =============================================================================
// Blob magic numbers
// =============================================================================

/// SuperBlob containing all signature components (embedded signature)
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;

/// CodeDirectory blob magic
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;

/// Requirements set blob magic
pub const CSMAGIC_REQUIREMENTS: u32 = 0xfade0c01;

/// Single requirement blob magic
pub const CSMAGIC_REQUIREMENT: u32 = 0xfade0c00;

/// Embedded entitlements (XML plist format)
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade7171;

/// Embedded DER entitlements (ASN.1 DER format)
pub const CSMAGIC_EMBEDDED_DER_ENTITLEMENTS: u32 = 0xfade7172;

/// CMS signature wrapper blob
pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade0b01;

// =============================================================================
// SuperBlob index slot types
// =============================================================================

/// Primary code directory slot (SHA-1)
pub const CSSLOT_CODEDIRECTORY: u32 = 0x0000;

/// Code requirements slot
pub const CSSLOT_REQUIREMENTS: u32 = 0x0002;

/// Entitlements slot (XML format)
pub const CSSLOT_ENTITLEMENTS: u32 = 0x0005;

/// DER entitlements slot
pub const CSSLOT_DER_ENTITLEMENTS: u32 = 0x0007;

/// Alternate code directories start (SHA-256 variant lives here)
pub const CSSLOT_ALTERNATE_CODEDIRECTORIES: u32 = 0x1000;

/// CMS signature slot
pub const CSSLOT_SIGNATURESLOT: u32 = 0x10000;

// =============================================================================
// CodeDirectory special slot indices (negative, stored in reverse order)
// =============================================================================

/// Info.plist hash
pub const CSSLOT_SPECIAL_INFOSLOT: i32 = -1;

/// Requirements blob hash
pub const CSSLOT_SPECIAL_REQUIREMENTS: i32 = -2;

/// CodeResources hash
pub const CSSLOT_SPECIAL_RESOURCEDIR: i32 = -3;

/// Application-specific slot (unused, always zero)
pub const CSSLOT_SPECIAL_APPLICATION: i32 = -4;

/// XML entitlements blob hash
pub const CSSLOT_SPECIAL_ENTITLEMENTS: i32 = -5;

/// DER entitlements blob hash
pub const CSSLOT_SPECIAL_DER_ENTITLEMENTS: i32 = -6;

// =============================================================================
// Hash types and sizes
// =============================================================================

/// SHA-1 hash (20 bytes)
pub const CS_HASHTYPE_SHA1: u8 = 1;

/// SHA-256 hash (32 bytes)
pub const CS_HASHTYPE_SHA256: u8 = 2;

/// SHA-1 digest size in bytes
pub const CS_SHA1_LEN: usize = 20;

/// SHA-256 digest size in bytes
pub const CS_SHA256_LEN: usize = 32;

// =============================================================================
// CodeDirectory header
// =============================================================================

/// CodeDirectory version with exec-segment support; the version we emit.
pub const CODEDIRECTORY_VERSION: u32 = 0x20400;

/// Executable segment is the main binary
pub const CS_EXECSEG_MAIN_BINARY: u64 = 0x0001;

/// Code signing page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// Log2 of the code signing page size (CodeDirectory header field)
pub const PAGE_SIZE_LOG2: u8 = 12;

// =============================================================================
// Requirement expression opcodes and match operations
// =============================================================================

/// Requirement expression form (the only kind we emit)
pub const REQUIREMENT_KIND_EXPR: u32 = 1;

/// Designated requirement entry type in a requirements set
pub const CSREQ_DESIGNATED: u32 = 0x0003;

/// Expression: bundle identifier equals
pub const OP_IDENT: u32 = 2;

/// Expression: logical AND of the two following expressions
pub const OP_AND: u32 = 6;

/// Expression: named certificate field comparison
pub const OP_CERT_FIELD: u32 = 11;

/// Expression: certificate extension by OID
pub const OP_CERT_GENERIC: u32 = 14;

/// Expression: anchor apple generic
pub const OP_APPLE_GENERIC_ANCHOR: u32 = 15;

/// Match suffix: field exists
pub const MATCH_EXISTS: u32 = 0;

/// Match suffix: field equals the following data
pub const MATCH_EQUAL: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_numbers_match_format() {
        assert_eq!(CSMAGIC_EMBEDDED_SIGNATURE, 0xfade0cc0);
        assert_eq!(CSMAGIC_CODEDIRECTORY, 0xfade0c02);
        assert_eq!(CSMAGIC_REQUIREMENTS, 0xfade0c01);
        assert_eq!(CSMAGIC_EMBEDDED_ENTITLEMENTS, 0xfade7171);
        assert_eq!(CSMAGIC_EMBEDDED_DER_ENTITLEMENTS, 0xfade7172);
        assert_eq!(CSMAGIC_BLOBWRAPPER, 0xfade0b01);
    }

    #[test]
    fn page_size_consistent() {
        assert_eq!(1usize << PAGE_SIZE_LOG2, PAGE_SIZE);
    }

    #[test]
    fn special_slot_indices() {
        assert_eq!(CSSLOT_SPECIAL_INFOSLOT, -1);
        assert_eq!(CSSLOT_SPECIAL_REQUIREMENTS, -2);
        assert_eq!(CSSLOT_SPECIAL_RESOURCEDIR, -3);
        assert_eq!(CSSLOT_SPECIAL_APPLICATION, -4);
        assert_eq!(CSSLOT_SPECIAL_ENTITLEMENTS, -5);
        assert_eq!(CSSLOT_SPECIAL_DER_ENTITLEMENTS, -6);
    }
}
