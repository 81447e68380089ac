//! Signing identity: certificate, private key, provisioning profile,
//! entitlements.
//!
//! An identity is loaded once per run and shared immutably across all
//! signing tasks. Certificates and keys are accepted as PEM or DER
//! (auto-detected), or combined in a PKCS#12 container; the provisioning
//! profile is a CMS-wrapped XML plist whose payload supplies the
//! entitlements when no explicit entitlements file is given.

use crate::util::sha_pair;
use crate::{Error, Result};
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use secrecy::{ExposeSecret, SecretString};
use std::fs;
use std::path::Path;

/// Immutable signing identity shared by all workers.
pub struct SigningIdentity {
    /// X.509 leaf certificate
    pub certificate: X509,
    /// Private key matching the certificate
    pub private_key: PKey<Private>,
    /// Certificate subject CN, referenced by the designated requirement
    pub subject_cn: String,
    /// Team ID: subject OU truncated at the first whitespace
    pub team_id: String,
    /// Raw provisioning profile bytes (still CMS-wrapped), written verbatim
    /// to `embedded.mobileprovision`
    pub provision_data: Vec<u8>,
    /// Entitlements as XML plist bytes
    pub entitlements_data: Vec<u8>,
}

impl SigningIdentity {
    /// Load an identity from files.
    ///
    /// With `cert_file` absent, `key_file` is parsed as PKCS#12 and supplies
    /// both the leaf certificate and the key. `entitlements_file` overrides
    /// the profile-derived entitlements when given.
    pub fn load(
        cert_file: Option<&Path>,
        key_file: &Path,
        provisioning_file: &Path,
        entitlements_file: Option<&Path>,
        password: Option<&SecretString>,
    ) -> Result<Self> {
        let (certificate, private_key) = match cert_file {
            Some(cert_path) => {
                let cert_data = fs::read(cert_path)?;
                let certificate = X509::from_pem(&cert_data)
                    .or_else(|_| X509::from_der(&cert_data))
                    .map_err(|e| Error::Identity(format!("failed to load certificate: {}", e)))?;
                let private_key = load_private_key(key_file, password)?;
                (certificate, private_key)
            }
            None => load_pkcs12(key_file, password)?,
        };

        validate_key_pair(&certificate, &private_key)?;

        let team_id = extract_team_id(&certificate)
            .ok_or_else(|| Error::Identity("certificate subject carries no Team ID (OU)".into()))?;
        let subject_cn = extract_subject_cn(&certificate)
            .ok_or_else(|| Error::Identity("certificate subject carries no CN".into()))?;

        let provision_data = fs::read(provisioning_file)?;
        let provision_plist = extract_profile_plist(&provision_data)?;

        let entitlements_data = match entitlements_file {
            Some(path) => fs::read(path)?,
            None => entitlements_from_profile(&provision_plist)?,
        };

        Ok(Self {
            certificate,
            private_key,
            subject_cn,
            team_id,
            provision_data,
            entitlements_data,
        })
    }

    /// Both digests of the entitlements plist (Base64-free, raw bytes).
    pub fn entitlements_digests(&self) -> ([u8; 20], [u8; 32]) {
        sha_pair(&self.entitlements_data)
    }
}

fn load_private_key(key_file: &Path, password: Option<&SecretString>) -> Result<PKey<Private>> {
    let key_data = fs::read(key_file)?;

    let loaded = if let Some(pass) = password {
        PKey::private_key_from_pem_passphrase(&key_data, pass.expose_secret().as_bytes())
    } else {
        PKey::private_key_from_pem(&key_data)
            .or_else(|_| PKey::private_key_from_der(&key_data))
    };

    loaded.map_err(|e| Error::Identity(format!("failed to load private key: {}", e)))
}

fn load_pkcs12(
    p12_file: &Path,
    password: Option<&SecretString>,
) -> Result<(X509, PKey<Private>)> {
    let p12_data = fs::read(p12_file)?;
    let pkcs12 = Pkcs12::from_der(&p12_data)
        .map_err(|e| Error::Identity(format!("invalid PKCS#12: {}", e)))?;

    let pass = password.map(|s| s.expose_secret().as_str()).unwrap_or("");
    let parsed = pkcs12
        .parse2(pass)
        .map_err(|_| Error::Identity("wrong PKCS#12 password or corrupt container".into()))?;

    let certificate = parsed
        .cert
        .ok_or_else(|| Error::Identity("no certificate in PKCS#12".into()))?;
    let private_key = parsed
        .pkey
        .ok_or_else(|| Error::Identity("no private key in PKCS#12".into()))?;

    Ok((certificate, private_key))
}

fn validate_key_pair(cert: &X509, private_key: &PKey<Private>) -> Result<()> {
    let cert_public_key = cert
        .public_key()
        .map_err(|e| Error::Identity(format!("failed to read certificate public key: {}", e)))?;

    if !private_key.public_eq(&cert_public_key) {
        return Err(Error::Identity(
            "private key does not match certificate public key".into(),
        ));
    }
    Ok(())
}

/// Subject OU attribute, truncated at the first whitespace.
fn extract_team_id(cert: &X509) -> Option<String> {
    let entry = cert
        .subject_name()
        .entries_by_nid(Nid::ORGANIZATIONALUNITNAME)
        .next()?;
    let value = entry.data().as_utf8().ok()?.to_string();
    let team = value.split_whitespace().next()?.to_string();
    if team.is_empty() {
        None
    } else {
        Some(team)
    }
}

fn extract_subject_cn(cert: &X509) -> Option<String> {
    let entry = cert
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()?;
    Some(entry.data().as_utf8().ok()?.to_string())
}

/// Pull the XML plist payload out of a provisioning profile.
///
/// Profiles are CMS SignedData wrapping the plist; rather than undoing the
/// ASN.1 framing we locate the embedded `<?xml ... </plist>` span, which is
/// stable across every profile Apple issues. Unwrapped plist files pass
/// through untouched.
fn extract_profile_plist(data: &[u8]) -> Result<Vec<u8>> {
    let start = data
        .windows(5)
        .position(|w| w == b"<?xml")
        .ok_or_else(|| Error::Identity("no plist payload in provisioning profile".into()))?;

    let end = data[start..]
        .windows(8)
        .position(|w| w == b"</plist>")
        .map(|p| start + p + 8)
        .ok_or_else(|| Error::Identity("truncated plist in provisioning profile".into()))?;

    Ok(data[start..end].to_vec())
}

/// Serialize the profile's `Entitlements` dictionary back to XML plist.
fn entitlements_from_profile(profile_plist: &[u8]) -> Result<Vec<u8>> {
    let plist: plist::Value = plist::from_bytes(profile_plist)
        .map_err(|e| Error::Identity(format!("failed to parse provisioning plist: {}", e)))?;

    let dict = plist
        .as_dictionary()
        .ok_or_else(|| Error::Identity("provisioning profile is not a dictionary".into()))?;

    let entitlements = dict
        .get("Entitlements")
        .ok_or_else(|| Error::Identity("no Entitlements in provisioning profile".into()))?;

    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, entitlements)
        .map_err(|e| Error::Identity(format!("failed to serialize entitlements: {}", e)))?;
    Ok(buf)
}
