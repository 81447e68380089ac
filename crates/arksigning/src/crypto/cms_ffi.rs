//! Raw FFI declarations for OpenSSL CMS functions not exposed by rust-openssl.
//!
//! rust-openssl wraps `CMS_sign` but none of the SignerInfo attribute calls,
//! which the Apple CDHash attributes require. The declarations here are kept
//! to the minimum the [`super::cms`] module needs.

use openssl_sys::*;
use std::ffi::{c_int, c_uint, c_void};

// CMS_SignerInfo is opaque; only the pointer is used.
#[repr(C)]
pub struct CMS_SignerInfo {
    _private: [u8; 0],
}

// CMS operation flags
pub const CMS_PARTIAL: u32 = 0x4000;
pub const CMS_DETACHED: u32 = 0x40;
pub const CMS_BINARY: u32 = 0x80;
pub const CMS_NOSMIMECAP: u32 = 0x200;

// ASN.1 value types for CMS_signed_add1_attr_by_OBJ
pub const V_ASN1_OCTET_STRING: c_int = 4;
pub const V_ASN1_SEQUENCE: c_int = 16;

extern "C" {
    pub fn CMS_sign(
        signcert: *mut X509,
        pkey: *mut EVP_PKEY,
        certs: *mut stack_st_X509,
        data: *mut BIO,
        flags: c_uint,
    ) -> *mut CMS_ContentInfo;

    pub fn CMS_add1_signer(
        cms: *mut CMS_ContentInfo,
        signer: *mut X509,
        pk: *mut EVP_PKEY,
        md: *const EVP_MD,
        flags: c_uint,
    ) -> *mut CMS_SignerInfo;

    pub fn CMS_add1_cert(cms: *mut CMS_ContentInfo, cert: *mut X509) -> c_int;

    pub fn CMS_signed_add1_attr_by_OBJ(
        si: *mut CMS_SignerInfo,
        obj: *const ASN1_OBJECT,
        type_: c_int,
        bytes: *const c_void,
        len: c_int,
    ) -> c_int;

    pub fn CMS_final(
        cms: *mut CMS_ContentInfo,
        data: *mut BIO,
        dcont: *mut BIO,
        flags: c_uint,
    ) -> c_int;

    pub fn i2d_CMS_bio(bio: *mut BIO, cms: *mut CMS_ContentInfo) -> c_int;
}

/// Apple signed attribute carrying the CDHashes plist.
pub const APPLE_CDHASH_PLIST_OID: &str = "1.2.840.113635.100.9.1";

/// Apple signed attribute carrying (digest algorithm, CDHash) pairs.
pub const APPLE_CDHASH_PAIR_OID: &str = "1.2.840.113635.100.9.2";
