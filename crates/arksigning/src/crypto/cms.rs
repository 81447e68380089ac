//! CMS SignedData generation with Apple CDHash attributes.
//!
//! The signature slot of the SuperBlob carries a DER `ContentInfo` binding
//! both CodeDirectory hashes to the signing identity:
//!
//! - detached `id-data` content: the CDHashes plist (so `messageDigest` is
//!   its SHA-256, and `CMS_final` stamps `signingTime`);
//! - attribute `1.2.840.113635.100.9.1`: the same plist as an octet string;
//! - attribute `1.2.840.113635.100.9.2`: one `SEQUENCE { digest OID,
//!   OCTET STRING hash }` value per CodeDirectory (SHA-1 and SHA-256);
//! - one SignerInfo, digest SHA-256.

use crate::{Error, Result};
use openssl::pkey::{PKeyRef, Private};
use openssl::x509::X509Ref;
use openssl_sys::{
    ASN1_OBJECT_free, BIO_free_all, BIO_new, BIO_new_mem_buf, BIO_s_mem, CMS_ContentInfo_free,
    EVP_sha256, OBJ_txt2obj, BIO, EVP_PKEY, X509 as X509_sys,
};
use plist::{Dictionary, Value};
use std::ffi::{c_int, CString};
use std::ptr;

use super::cms_ffi::{
    i2d_CMS_bio, CMS_SignerInfo, CMS_add1_cert, CMS_add1_signer, CMS_final, CMS_sign,
    CMS_signed_add1_attr_by_OBJ, APPLE_CDHASH_PAIR_OID, APPLE_CDHASH_PLIST_OID, CMS_BINARY,
    CMS_DETACHED, CMS_NOSMIMECAP, CMS_PARTIAL, V_ASN1_OCTET_STRING, V_ASN1_SEQUENCE,
};
use super::identity::SigningIdentity;

// DER-encoded digest algorithm OIDs for the 9.2 attribute values.
const SHA1_OID_DER: [u8; 5] = [0x2b, 0x0e, 0x03, 0x02, 0x1a];
const SHA256_OID_DER: [u8; 9] = [0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];

extern "C" {
    fn BIO_ctrl(bp: *mut BIO, cmd: c_int, larg: isize, parg: *mut std::ffi::c_void) -> isize;
}

const BIO_CTRL_INFO: c_int = 3;

unsafe fn bio_get_mem_data(bio: *mut BIO, pp: *mut *mut u8) -> isize {
    BIO_ctrl(bio, BIO_CTRL_INFO, 0, pp as *mut std::ffi::c_void)
}

/// Raw X509 pointer from an X509Ref.
///
/// # Safety
/// Valid only while the X509Ref is alive; X509Ref is a zero-sized wrapper
/// whose reference is the underlying pointer.
unsafe fn x509_as_ptr(x509: &X509Ref) -> *mut X509_sys {
    x509 as *const X509Ref as *const X509_sys as *mut X509_sys
}

/// Raw EVP_PKEY pointer from a PKeyRef.
///
/// # Safety
/// Valid only while the PKeyRef is alive.
unsafe fn pkey_as_ptr(pkey: &PKeyRef<Private>) -> *mut EVP_PKEY {
    pkey as *const PKeyRef<Private> as *const EVP_PKEY as *mut EVP_PKEY
}

/// Scoped cleanup for the raw CMS/BIO handles; releases on every exit path.
struct CmsHandles {
    cms: *mut openssl_sys::CMS_ContentInfo,
    data_bio: *mut BIO,
    out_bio: *mut BIO,
}

impl Drop for CmsHandles {
    fn drop(&mut self) {
        unsafe {
            if !self.cms.is_null() {
                CMS_ContentInfo_free(self.cms);
            }
            if !self.data_bio.is_null() {
                BIO_free_all(self.data_bio);
            }
            if !self.out_bio.is_null() {
                BIO_free_all(self.out_bio);
            }
        }
    }
}

/// Generate the CMS SignedData over a CodeDirectory hash pair.
///
/// `cdhash_sha1` is the SHA-1 of the primary CodeDirectory; `cdhash_sha256`
/// the SHA-256 of the alternate one. Returns DER `ContentInfo` bytes.
pub fn generate_cms(
    identity: &SigningIdentity,
    cdhash_sha1: &[u8; 20],
    cdhash_sha256: &[u8; 32],
) -> Result<Vec<u8>> {
    let cdhashes_plist = build_cdhashes_plist(cdhash_sha1, cdhash_sha256);

    unsafe {
        let cert_ptr = x509_as_ptr(&identity.certificate);
        let pkey_ptr = pkey_as_ptr(&identity.private_key);

        let mut handles = CmsHandles {
            cms: ptr::null_mut(),
            data_bio: ptr::null_mut(),
            out_bio: ptr::null_mut(),
        };

        handles.data_bio =
            BIO_new_mem_buf(cdhashes_plist.as_ptr() as *const _, cdhashes_plist.len() as c_int);
        if handles.data_bio.is_null() {
            return Err(Error::Signing("failed to create data BIO".into()));
        }

        let flags = CMS_PARTIAL | CMS_DETACHED | CMS_BINARY | CMS_NOSMIMECAP;
        handles.cms = CMS_sign(
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
            flags,
        );
        if handles.cms.is_null() {
            return Err(Error::Signing("CMS_sign failed".into()));
        }

        let signer_info = CMS_add1_signer(handles.cms, cert_ptr, pkey_ptr, EVP_sha256(), flags);
        if signer_info.is_null() {
            return Err(Error::Signing("CMS_add1_signer failed".into()));
        }

        // CMS_add1_signer fills signerInfos but not the certificates field.
        if CMS_add1_cert(handles.cms, cert_ptr) != 1 {
            return Err(Error::Signing("failed to add signing cert to CMS".into()));
        }

        add_signed_attr(
            signer_info,
            APPLE_CDHASH_PLIST_OID,
            V_ASN1_OCTET_STRING,
            &cdhashes_plist,
        )?;

        add_signed_attr(
            signer_info,
            APPLE_CDHASH_PAIR_OID,
            V_ASN1_SEQUENCE,
            &build_cdhash_pair(&SHA1_OID_DER, cdhash_sha1),
        )?;
        add_signed_attr(
            signer_info,
            APPLE_CDHASH_PAIR_OID,
            V_ASN1_SEQUENCE,
            &build_cdhash_pair(&SHA256_OID_DER, cdhash_sha256),
        )?;

        if CMS_final(handles.cms, handles.data_bio, ptr::null_mut(), flags) != 1 {
            return Err(Error::Signing("CMS_final failed".into()));
        }

        handles.out_bio = BIO_new(BIO_s_mem());
        if handles.out_bio.is_null() {
            return Err(Error::Signing("failed to create output BIO".into()));
        }
        if i2d_CMS_bio(handles.out_bio, handles.cms) != 1 {
            return Err(Error::Signing("failed to serialize CMS".into()));
        }

        let mut buf_ptr: *mut u8 = ptr::null_mut();
        let len = bio_get_mem_data(handles.out_bio, &mut buf_ptr);
        if buf_ptr.is_null() || len <= 0 {
            return Err(Error::Signing("empty CMS output".into()));
        }
        let der = std::slice::from_raw_parts(buf_ptr, len as usize).to_vec();

        Ok(der)
    }
}

/// CDHashes plist for the detached content and the 9.1 attribute.
///
/// `{cdhashes: [<SHA-1 of CD1>, <SHA-256 of CD2 truncated to 20 bytes>]}`
/// with a trailing newline after `</plist>`.
pub fn build_cdhashes_plist(cdhash_sha1: &[u8; 20], cdhash_sha256: &[u8; 32]) -> Vec<u8> {
    let mut dict = Dictionary::new();
    dict.insert(
        "cdhashes".to_string(),
        Value::Array(vec![
            Value::Data(cdhash_sha1.to_vec()),
            Value::Data(cdhash_sha256[..20].to_vec()),
        ]),
    );

    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, &Value::Dictionary(dict))
        .expect("plist serialization cannot fail for an in-memory dictionary");
    buf.push(b'\n');
    buf
}

/// One 9.2 attribute value: `SEQUENCE { OBJECT alg, OCTET STRING hash }`.
fn build_cdhash_pair(alg_oid_der: &[u8], hash: &[u8]) -> Vec<u8> {
    let mut oid = Vec::with_capacity(2 + alg_oid_der.len());
    oid.push(0x06);
    oid.push(alg_oid_der.len() as u8);
    oid.extend_from_slice(alg_oid_der);

    let mut octets = Vec::with_capacity(2 + hash.len());
    octets.push(0x04);
    octets.push(hash.len() as u8);
    octets.extend_from_slice(hash);

    let mut seq = Vec::with_capacity(2 + oid.len() + octets.len());
    seq.push(0x30);
    seq.push((oid.len() + octets.len()) as u8);
    seq.extend(oid);
    seq.extend(octets);
    seq
}

unsafe fn add_signed_attr(
    signer_info: *mut CMS_SignerInfo,
    oid: &str,
    asn1_type: c_int,
    data: &[u8],
) -> Result<()> {
    let oid_cstr = CString::new(oid).map_err(|_| Error::Signing("invalid OID string".into()))?;

    let obj = OBJ_txt2obj(oid_cstr.as_ptr(), 1);
    if obj.is_null() {
        return Err(Error::Signing(format!("failed to create OID {}", oid)));
    }

    let ret = CMS_signed_add1_attr_by_OBJ(
        signer_info,
        obj,
        asn1_type,
        data.as_ptr() as *const _,
        data.len() as c_int,
    );
    ASN1_OBJECT_free(obj);

    if ret != 1 {
        return Err(Error::Signing(format!("failed to add attribute {}", oid)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::identity::test_support::{generate_test_cert, generate_test_key};

    fn test_identity() -> SigningIdentity {
        let key = generate_test_key();
        let cert = generate_test_cert(&key, "TESTTEAM01", "Test Signer");
        SigningIdentity {
            certificate: cert,
            private_key: key,
            subject_cn: "Test Signer".into(),
            team_id: "TESTTEAM01".into(),
            provision_data: Vec::new(),
            entitlements_data: b"<plist version=\"1.0\"><dict/></plist>".to_vec(),
        }
    }

    #[test]
    fn cdhashes_plist_structure() {
        let sha1 = [0x11u8; 20];
        let sha256 = [0x22u8; 32];
        let data = build_cdhashes_plist(&sha1, &sha256);

        assert!(data.ends_with(b"\n"));

        let parsed: Value = plist::from_bytes(&data).unwrap();
        let dict = parsed.as_dictionary().unwrap();
        let hashes = dict.get("cdhashes").unwrap().as_array().unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0].as_data().unwrap(), &sha1);
        // The alternate CDHash is truncated to SHA-1 length.
        assert_eq!(hashes[1].as_data().unwrap(), &sha256[..20]);
    }

    #[test]
    fn cdhash_pair_encoding() {
        let pair = build_cdhash_pair(&SHA256_OID_DER, &[0xaa; 32]);
        assert_eq!(pair[0], 0x30);
        assert_eq!(pair[1] as usize, pair.len() - 2);
        assert_eq!(pair[2], 0x06);
        assert_eq!(pair[3] as usize, SHA256_OID_DER.len());
        let octet_off = 4 + SHA256_OID_DER.len();
        assert_eq!(pair[octet_off], 0x04);
        assert_eq!(pair[octet_off + 1], 32);
    }

    #[test]
    fn generate_cms_produces_der_sequence() {
        let identity = test_identity();
        let der = generate_cms(&identity, &[0x01; 20], &[0x02; 32]).unwrap();

        // DER ContentInfo starts with a constructed SEQUENCE tag.
        assert_eq!(der[0], 0x30);
        assert!(der.len() > 500);
    }

    #[test]
    fn generate_cms_carries_cdhashes_attribute() {
        let identity = test_identity();
        let der = generate_cms(&identity, &[0x01; 20], &[0x02; 32]).unwrap();

        // The 9.1 signed attribute embeds the cdhashes plist verbatim.
        let needle = b"cdhashes";
        assert!(der.windows(needle.len()).any(|w| w == needle));
    }
}
