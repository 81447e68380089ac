//! Slice signing: assembles the signature SuperBlob and installs it.
//!
//! Each slice is processed independently: the old signature is stripped, the
//! code end padded to 16-byte alignment, an `LC_CODE_SIGNATURE` command
//! reserved, and the blob set (requirements, entitlements, DER entitlements,
//! both CodeDirectories, CMS) written into the reserved region.
//!
//! The region is sized from a probe pass. Everything but the CMS has a
//! deterministic length; the CMS is measured by generating a throwaway
//! signature over zero hashes, plus a small guard for signature-length
//! variation between the probe and the real pass.

use super::parser::{align_to, slice_facts, MachOFile, SliceFacts};
use super::writer::{append_signature_command, strip_signature};
use crate::codesign::code_directory::{cdhash_sha1, cdhash_sha256, CodeDirectoryBuilder};
use crate::codesign::constants::{
    CSMAGIC_CODEDIRECTORY, CSMAGIC_EMBEDDED_SIGNATURE, CSSLOT_CODEDIRECTORY,
    CS_EXECSEG_MAIN_BINARY,
};
use crate::codesign::der;
use crate::codesign::requirements::{build_empty_requirements, build_requirements};
use crate::codesign::superblob::{
    build_der_entitlements_blob, build_entitlements_blob, build_signature_blob, SuperBlobBuilder,
};
use crate::crypto::{generate_cms, SigningIdentity};
use crate::util::{sha1, sha_pair};
use crate::{Error, Result};
use tracing::debug;

/// SuperBlob header plus six index entries; upper bound for the index area.
const SUPERBLOB_INDEX_ESTIMATE: usize = 12 + 6 * 8;

/// Guard bytes added to the probed region for CMS length variation.
const REGION_SLACK: usize = 16;

/// Per-binary signing inputs supplied by the bundle engine.
pub struct SignContext<'a> {
    pub identity: &'a SigningIdentity,
    /// Bundle identifier; `None` for loose dylibs outside any bundle.
    pub bundle_id: Option<&'a str>,
    /// Raw digests of the owning bundle's Info.plist.
    pub info_plist_sha1: Option<Vec<u8>>,
    pub info_plist_sha256: Option<Vec<u8>>,
    /// Serialized CodeResources XML of the owning bundle.
    pub code_resources: Option<Vec<u8>>,
}

impl MachOFile {
    /// Sign every slice and write the binary back.
    ///
    /// Without `force`, a binary whose embedded resource-directory hash
    /// already matches the supplied CodeResources is left untouched.
    /// Returns whether the binary was rewritten.
    pub fn sign(&mut self, ctx: &SignContext<'_>, force: bool) -> Result<bool> {
        if !force && self.is_unchanged(ctx) {
            debug!(path = %self.path().display(), "signature up to date, skipping");
            return Ok(false);
        }

        let identifier = match ctx.bundle_id {
            Some(bid) => bid.to_string(),
            None => self
                .path()
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".to_string()),
        };

        for slice in &mut self.slices {
            sign_slice(&mut slice.data, ctx, &identifier)?;
        }

        self.write()?;
        Ok(true)
    }

    /// True when every slice's existing resource-directory slot hash matches
    /// the CodeResources we are about to sign with.
    fn is_unchanged(&self, ctx: &SignContext<'_>) -> bool {
        let Some(ref resources) = ctx.code_resources else {
            return false;
        };
        let expected = sha1(resources).to_vec();
        self.slices
            .iter()
            .all(|slice| existing_resource_digest(&slice.data).as_deref() == Some(&expected))
    }
}

fn sign_slice(data: &mut Vec<u8>, ctx: &SignContext<'_>, identifier: &str) -> Result<()> {
    strip_signature(data)?;

    // Pre-align so the signature region starts on a 16-byte boundary and
    // codeLimit equals the signature offset.
    let code_limit = align_to(data.len(), 16);
    data.resize(code_limit, 0);

    let facts = slice_facts(data)?;

    let requirements = match ctx.bundle_id {
        Some(bid) => build_requirements(bid, &ctx.identity.subject_cn),
        None => build_empty_requirements(),
    };
    let entitlements_blob = build_entitlements_blob(&ctx.identity.entitlements_data);
    let der_entitlements_blob = der::plist_to_der(&ctx.identity.entitlements_data)
        .map(|der| build_der_entitlements_blob(&der));

    // Probe pass: the CodeDirectory lengths are stable once codeLimit is
    // fixed, and the CMS length depends only on the identity.
    let probe = code_directory_builder(
        &data[..code_limit],
        &facts,
        ctx,
        identifier,
        &requirements,
        &entitlements_blob,
        der_entitlements_blob.as_deref(),
    );
    let cd_lengths = probe.build_sha1().len() + probe.build_sha256().len();
    let probe_cms = generate_cms(ctx.identity, &[0u8; 20], &[0u8; 32])?;

    let estimate = SUPERBLOB_INDEX_ESTIMATE
        + requirements.len()
        + entitlements_blob.len()
        + der_entitlements_blob.as_ref().map_or(0, |b| b.len())
        + cd_lengths
        + probe_cms.len()
        + 8; // CMS wrapper blob header
    let region = align_to(estimate + REGION_SLACK, 16);

    append_signature_command(data, code_limit as u32, region as u32)?;

    // The load commands are final; hash for real.
    let builder = code_directory_builder(
        &data[..code_limit],
        &facts,
        ctx,
        identifier,
        &requirements,
        &entitlements_blob,
        der_entitlements_blob.as_deref(),
    );
    let cd_sha1 = builder.build_sha1();
    let cd_sha256 = builder.build_sha256();

    let cms = generate_cms(
        ctx.identity,
        &cdhash_sha1(&cd_sha1),
        &cdhash_sha256(&cd_sha256),
    )?;

    let mut superblob = SuperBlobBuilder::new()
        .code_directory_sha1(cd_sha1)
        .code_directory_sha256(cd_sha256)
        .requirements(requirements)
        .entitlements(entitlements_blob)
        .cms_signature(build_signature_blob(&cms));
    if let Some(der_blob) = der_entitlements_blob {
        superblob = superblob.der_entitlements(der_blob);
    }
    let blob = superblob.build();

    if blob.len() > region {
        return Err(Error::Signing(format!(
            "signature blob ({} bytes) exceeds reserved region ({} bytes)",
            blob.len(),
            region
        )));
    }
    data[code_limit..code_limit + blob.len()].copy_from_slice(&blob);

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn code_directory_builder<'a>(
    code: &'a [u8],
    facts: &SliceFacts,
    ctx: &SignContext<'_>,
    identifier: &str,
    requirements: &[u8],
    entitlements_blob: &[u8],
    der_entitlements_blob: Option<&[u8]>,
) -> CodeDirectoryBuilder<'a> {
    let (req1, req2) = sha_pair(requirements);
    let (ent1, ent2) = sha_pair(entitlements_blob);

    let mut builder = CodeDirectoryBuilder::new(identifier, code)
        .team_id(ctx.identity.team_id.as_str())
        .requirements_hash(req1.to_vec(), req2.to_vec())
        .entitlements_hash(ent1.to_vec(), ent2.to_vec())
        .exec_seg_limit(facts.text_vmsize);

    if facts.is_executable {
        builder = builder.exec_seg_flags(CS_EXECSEG_MAIN_BINARY);
    }
    if let Some(der_blob) = der_entitlements_blob {
        let (der1, der2) = sha_pair(der_blob);
        builder = builder.der_entitlements_hash(der1.to_vec(), der2.to_vec());
    }
    if let (Some(h1), Some(h2)) = (&ctx.info_plist_sha1, &ctx.info_plist_sha256) {
        builder = builder.info_hash(h1.clone(), h2.clone());
    }
    if let Some(ref resources) = ctx.code_resources {
        let (res1, res2) = sha_pair(resources);
        builder = builder.resources_hash(res1.to_vec(), res2.to_vec());
    }

    builder
}

fn be32(data: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_be_bytes(
        data.get(offset..offset + 4)?.try_into().ok()?,
    ))
}

/// SHA-1 resource-directory slot stored in a slice's existing signature.
pub fn existing_resource_digest(data: &[u8]) -> Option<Vec<u8>> {
    let facts = slice_facts(data).ok()?;
    let cs = facts.code_signature?;
    let blob = data.get(cs.dataoff as usize..(cs.dataoff as usize + cs.datasize as usize))?;

    if be32(blob, 0)? != CSMAGIC_EMBEDDED_SIGNATURE {
        return None;
    }
    let count = be32(blob, 8)? as usize;
    for i in 0..count {
        let slot_type = be32(blob, 12 + i * 8)?;
        if slot_type != CSSLOT_CODEDIRECTORY {
            continue;
        }
        let cd_offset = be32(blob, 16 + i * 8)? as usize;
        let cd = blob.get(cd_offset..)?;
        if be32(cd, 0)? != CSMAGIC_CODEDIRECTORY {
            return None;
        }
        let hash_offset = be32(cd, 16)? as usize;
        let n_special = be32(cd, 24)? as usize;
        let hash_size = *cd.get(36)? as usize;
        if n_special < 3 {
            return None;
        }
        let slot = hash_offset.checked_sub(3 * hash_size)?;
        return cd.get(slot..slot + hash_size).map(|h| h.to_vec());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::identity::test_support::{generate_test_cert, generate_test_key};
    use crate::macho::test_support::minimal_executable;
    use crate::util::sha256 as sha256_digest;
    use std::io::Write;

    fn test_identity() -> SigningIdentity {
        let key = generate_test_key();
        let cert = generate_test_cert(&key, "TESTTEAM01", "Test Signer");
        SigningIdentity {
            certificate: cert,
            private_key: key,
            subject_cn: "Test Signer".into(),
            team_id: "TESTTEAM01".into(),
            provision_data: Vec::new(),
            entitlements_data: br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>get-task-allow</key><true/></dict></plist>"#
                .to_vec(),
        }
    }

    fn write_minimal(path: &std::path::Path) {
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(&minimal_executable()).unwrap();
    }

    fn context<'a>(identity: &'a SigningIdentity, resources: &str) -> SignContext<'a> {
        let info = b"<plist><dict/></plist>";
        let (i1, i2) = sha_pair(info);
        SignContext {
            identity,
            bundle_id: Some("com.example.hello"),
            info_plist_sha1: Some(i1.to_vec()),
            info_plist_sha256: Some(i2.to_vec()),
            code_resources: Some(resources.as_bytes().to_vec()),
        }
    }

    #[test]
    fn sign_installs_trailing_signature() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("hello");
        write_minimal(&bin);

        let identity = test_identity();
        let ctx = context(&identity, "<resources/>");

        let mut macho = MachOFile::read(&bin).unwrap();
        assert!(macho.sign(&ctx, true).unwrap());

        let signed = std::fs::read(&bin).unwrap();
        let facts = slice_facts(&signed).unwrap();
        let cs = facts.code_signature.expect("signature installed");

        assert!(cs.is_last_command);
        assert_eq!(cs.dataoff % 16, 0);
        assert_eq!(cs.dataoff as usize + cs.datasize as usize, signed.len());
    }

    #[test]
    fn code_slots_match_rehashed_pages() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("hello");
        write_minimal(&bin);

        let identity = test_identity();
        let ctx = context(&identity, "<resources/>");
        MachOFile::read(&bin).unwrap().sign(&ctx, true).unwrap();

        let signed = std::fs::read(&bin).unwrap();
        let facts = slice_facts(&signed).unwrap();
        let cs = facts.code_signature.unwrap();
        let blob = &signed[cs.dataoff as usize..];

        // Locate the alternate (SHA-256) CodeDirectory.
        let count = u32::from_be_bytes(blob[8..12].try_into().unwrap()) as usize;
        let mut cd = None;
        for i in 0..count {
            let slot = u32::from_be_bytes(blob[12 + i * 8..16 + i * 8].try_into().unwrap());
            if slot == crate::codesign::constants::CSSLOT_ALTERNATE_CODEDIRECTORIES {
                let off =
                    u32::from_be_bytes(blob[16 + i * 8..20 + i * 8].try_into().unwrap()) as usize;
                cd = Some(&blob[off..]);
            }
        }
        let cd = cd.expect("alternate CodeDirectory present");

        let hash_offset = u32::from_be_bytes(cd[16..20].try_into().unwrap()) as usize;
        let n_code = u32::from_be_bytes(cd[28..32].try_into().unwrap()) as usize;
        let code_limit = u32::from_be_bytes(cd[32..36].try_into().unwrap()) as usize;
        assert_eq!(code_limit, cs.dataoff as usize);

        for (i, page) in signed[..code_limit].chunks(4096).enumerate() {
            let expected = sha256_digest(page);
            let stored = &cd[hash_offset + i * 32..hash_offset + (i + 1) * 32];
            assert_eq!(stored, expected, "page {} hash mismatch", i);
        }
        assert_eq!(signed[..code_limit].chunks(4096).count(), n_code);
    }

    #[test]
    fn resign_without_force_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("hello");
        write_minimal(&bin);

        let identity = test_identity();
        let ctx = context(&identity, "<resources/>");

        assert!(MachOFile::read(&bin).unwrap().sign(&ctx, true).unwrap());
        let first = std::fs::read(&bin).unwrap();

        // Same CodeResources: nothing to do.
        assert!(!MachOFile::read(&bin).unwrap().sign(&ctx, false).unwrap());
        assert_eq!(std::fs::read(&bin).unwrap(), first);

        // Changed CodeResources: re-signed even without force.
        let ctx2 = context(&identity, "<resources version='2'/>");
        assert!(MachOFile::read(&bin).unwrap().sign(&ctx2, false).unwrap());
    }

    #[test]
    fn resign_with_force_replaces_signature() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("hello");
        write_minimal(&bin);

        let identity = test_identity();
        let ctx = context(&identity, "<resources/>");

        assert!(MachOFile::read(&bin).unwrap().sign(&ctx, true).unwrap());
        let once = std::fs::read(&bin).unwrap();
        assert!(MachOFile::read(&bin).unwrap().sign(&ctx, true).unwrap());
        let twice = std::fs::read(&bin).unwrap();

        // Stable layout: stripping and re-signing lands at the same offsets.
        assert_eq!(once.len(), twice.len());
        let f1 = slice_facts(&once).unwrap().code_signature.unwrap();
        let f2 = slice_facts(&twice).unwrap().code_signature.unwrap();
        assert_eq!(f1.dataoff, f2.dataoff);
        assert_eq!(f1.datasize, f2.datasize);
    }

    #[test]
    fn existing_resource_digest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("hello");
        write_minimal(&bin);

        assert_eq!(existing_resource_digest(&minimal_executable()), None);

        let identity = test_identity();
        let resources = "<resources/>";
        let ctx = context(&identity, resources);
        MachOFile::read(&bin).unwrap().sign(&ctx, true).unwrap();

        let signed = std::fs::read(&bin).unwrap();
        assert_eq!(
            existing_resource_digest(&signed),
            Some(sha1(resources.as_bytes()).to_vec())
        );
    }

    #[test]
    fn loose_dylib_context_signs_with_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("helper.dylib");
        write_minimal(&bin);

        let identity = test_identity();
        let ctx = SignContext {
            identity: &identity,
            bundle_id: None,
            info_plist_sha1: None,
            info_plist_sha256: None,
            code_resources: None,
        };

        assert!(MachOFile::read(&bin).unwrap().sign(&ctx, false).unwrap());
        let signed = std::fs::read(&bin).unwrap();
        let text = String::from_utf8_lossy(&signed);
        assert!(text.contains("helper"));
    }
}
