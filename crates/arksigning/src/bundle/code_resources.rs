//! `_CodeSignature/CodeResources` manifest generation.
//!
//! The manifest carries two file maps: `files` (legacy, SHA-1 only) and
//! `files2` (SHA-1 + SHA-256), plus the fixed `rules`/`rules2` policy
//! dictionaries. The main executable and the manifest itself are never
//! listed; `Info.plist` and `PkgInfo` appear in `files` but not `files2`;
//! `*.lproj/` entries are optional; `.DS_Store` and
//! `*.lproj/locversion.plist` are dropped from `files2`.

use crate::util::sha_pair_file;
use crate::{Error, Result};
use plist::{Dictionary, Value};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

fn is_lproj_entry(key: &str) -> bool {
    key.contains(".lproj/")
}

fn omitted_from_files(key: &str) -> bool {
    key.ends_with(".lproj/locversion.plist")
}

fn omitted_from_files2(key: &str) -> bool {
    key == "Info.plist"
        || key == "PkgInfo"
        || key.ends_with(".DS_Store")
        || key.ends_with(".lproj/locversion.plist")
}

fn rules() -> Dictionary {
    let mut rules = Dictionary::new();
    rules.insert("^.*".into(), Value::Boolean(true));

    let mut lproj = Dictionary::new();
    lproj.insert("optional".into(), Value::Boolean(true));
    lproj.insert("weight".into(), Value::Real(1000.0));
    rules.insert("^.*\\.lproj/".into(), Value::Dictionary(lproj));

    let mut locversion = Dictionary::new();
    locversion.insert("omit".into(), Value::Boolean(true));
    locversion.insert("weight".into(), Value::Real(1100.0));
    rules.insert(
        "^.*\\.lproj/locversion.plist$".into(),
        Value::Dictionary(locversion),
    );

    let mut base_lproj = Dictionary::new();
    base_lproj.insert("weight".into(), Value::Real(1010.0));
    rules.insert("^Base\\.lproj/".into(), Value::Dictionary(base_lproj));

    rules.insert("^version.plist$".into(), Value::Boolean(true));
    rules
}

fn rules2() -> Dictionary {
    let mut rules2 = Dictionary::new();
    rules2.insert("^.*".into(), Value::Boolean(true));

    let mut dsym = Dictionary::new();
    dsym.insert("weight".into(), Value::Real(11.0));
    rules2.insert(".*\\.dSYM($|/)".into(), Value::Dictionary(dsym));

    let mut ds_store = Dictionary::new();
    ds_store.insert("omit".into(), Value::Boolean(true));
    ds_store.insert("weight".into(), Value::Real(2000.0));
    rules2.insert("^(.*/)?\\.DS_Store$".into(), Value::Dictionary(ds_store));

    let mut lproj = Dictionary::new();
    lproj.insert("optional".into(), Value::Boolean(true));
    lproj.insert("weight".into(), Value::Real(1000.0));
    rules2.insert("^.*\\.lproj/".into(), Value::Dictionary(lproj));

    let mut locversion = Dictionary::new();
    locversion.insert("omit".into(), Value::Boolean(true));
    locversion.insert("weight".into(), Value::Real(1100.0));
    rules2.insert(
        "^.*\\.lproj/locversion.plist$".into(),
        Value::Dictionary(locversion),
    );

    let mut base_lproj = Dictionary::new();
    base_lproj.insert("weight".into(), Value::Real(1010.0));
    rules2.insert("^Base\\.lproj/".into(), Value::Dictionary(base_lproj));

    let mut info_plist = Dictionary::new();
    info_plist.insert("omit".into(), Value::Boolean(true));
    info_plist.insert("weight".into(), Value::Real(20.0));
    rules2.insert("^Info\\.plist$".into(), Value::Dictionary(info_plist));

    let mut pkg_info = Dictionary::new();
    pkg_info.insert("omit".into(), Value::Boolean(true));
    pkg_info.insert("weight".into(), Value::Real(20.0));
    rules2.insert("^PkgInfo$".into(), Value::Dictionary(pkg_info));

    let mut provision = Dictionary::new();
    provision.insert("weight".into(), Value::Real(20.0));
    rules2.insert(
        "^embedded\\.provisionprofile$".into(),
        Value::Dictionary(provision),
    );

    let mut version_plist = Dictionary::new();
    version_plist.insert("weight".into(), Value::Real(20.0));
    rules2.insert("^version\\.plist$".into(), Value::Dictionary(version_plist));

    rules2
}

/// Scan a bundle folder and build both manifests from scratch.
///
/// Every regular file is hashed (in parallel), except the main executable
/// and the manifest itself.
pub fn build_code_resources(folder: &Path) -> Result<Value> {
    let exec_name = fs::read(folder.join("Info.plist"))
        .ok()
        .and_then(|raw| plist::from_bytes::<Value>(&raw).ok())
        .and_then(|v| {
            v.as_dictionary()
                .and_then(|d| d.get("CFBundleExecutable"))
                .and_then(|v| v.as_string())
                .map(|s| s.to_string())
        })
        .unwrap_or_default();

    let mut keys: Vec<String> = WalkDir::new(folder)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(folder)
                .ok()
                .map(|p| p.to_string_lossy().into_owned())
        })
        .collect();
    keys.retain(|k| k != &exec_name && k != "_CodeSignature/CodeResources");
    keys.sort();

    let hashed: Vec<(String, [u8; 20], [u8; 32])> = keys
        .par_iter()
        .map(|key| {
            let (sha1, sha256) = sha_pair_file(folder.join(key))?;
            Ok((key.clone(), sha1, sha256))
        })
        .collect::<Result<Vec<_>>>()?;

    let entries: BTreeMap<String, ([u8; 20], [u8; 32])> = hashed
        .into_iter()
        .map(|(k, d1, d2)| (k, (d1, d2)))
        .collect();

    let mut files = Dictionary::new();
    let mut files2 = Dictionary::new();

    for (key, (sha1, sha256)) in &entries {
        if !omitted_from_files(key) {
            if is_lproj_entry(key) {
                let mut entry = Dictionary::new();
                entry.insert("hash".into(), Value::Data(sha1.to_vec()));
                entry.insert("optional".into(), Value::Boolean(true));
                files.insert(key.clone(), Value::Dictionary(entry));
            } else {
                files.insert(key.clone(), Value::Data(sha1.to_vec()));
            }
        }

        if !omitted_from_files2(key) {
            let mut entry = Dictionary::new();
            entry.insert("hash".into(), Value::Data(sha1.to_vec()));
            entry.insert("hash2".into(), Value::Data(sha256.to_vec()));
            if is_lproj_entry(key) {
                entry.insert("optional".into(), Value::Boolean(true));
            }
            files2.insert(key.clone(), Value::Dictionary(entry));
        }
    }

    let mut root = Dictionary::new();
    root.insert("files".into(), Value::Dictionary(files));
    root.insert("files2".into(), Value::Dictionary(files2));
    root.insert("rules".into(), Value::Dictionary(rules()));
    root.insert("rules2".into(), Value::Dictionary(rules2()));
    Ok(Value::Dictionary(root))
}

/// Load a previously written manifest, if one exists and parses.
pub fn load_code_resources(path: &Path) -> Option<Value> {
    let raw = fs::read(path).ok()?;
    plist::from_bytes(&raw).ok()
}

/// Refresh one entry of an existing manifest in place.
///
/// `files2` entries keep their other keys (notably `optional`).
pub fn update_entry(resources: &mut Value, key: &str, sha1: &[u8; 20], sha256: &[u8; 32]) -> Result<()> {
    let root = resources
        .as_dictionary_mut()
        .ok_or_else(|| Error::Bundle("CodeResources is not a dictionary".into()))?;

    if let Some(files) = root.get_mut("files").and_then(|v| v.as_dictionary_mut()) {
        files.insert(key.to_string(), Value::Data(sha1.to_vec()));
    }

    if let Some(files2) = root.get_mut("files2").and_then(|v| v.as_dictionary_mut()) {
        if !files2.contains_key(key) {
            files2.insert(key.to_string(), Value::Dictionary(Dictionary::new()));
        }
        if let Some(dict) = files2.get_mut(key).and_then(|v| v.as_dictionary_mut()) {
            dict.insert("hash".into(), Value::Data(sha1.to_vec()));
            dict.insert("hash2".into(), Value::Data(sha256.to_vec()));
        }
    }

    Ok(())
}

/// Serialize a manifest to the XML plist form written to disk and hashed
/// into special slot -3.
pub fn serialize_code_resources(resources: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, resources)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::sha_pair;
    use std::fs;

    fn scaffold_bundle(dir: &Path) {
        fs::write(
            dir.join("Info.plist"),
            br#"<?xml version="1.0"?><plist version="1.0"><dict>
<key>CFBundleIdentifier</key><string>com.example.demo</string>
<key>CFBundleExecutable</key><string>Demo</string>
</dict></plist>"#,
        )
        .unwrap();
        fs::write(dir.join("Demo"), b"the executable").unwrap();
        fs::write(dir.join("PkgInfo"), b"APPL????").unwrap();
        fs::write(dir.join("asset.png"), b"png bytes").unwrap();

        fs::create_dir_all(dir.join("en.lproj")).unwrap();
        fs::write(dir.join("en.lproj/Main.strings"), b"strings").unwrap();
        fs::write(dir.join("en.lproj/locversion.plist"), b"loc").unwrap();
        fs::write(dir.join(".DS_Store"), b"junk").unwrap();

        fs::create_dir_all(dir.join("_CodeSignature")).unwrap();
        fs::write(dir.join("_CodeSignature/CodeResources"), b"old").unwrap();
    }

    fn dict<'a>(value: &'a Value, key: &str) -> &'a Dictionary {
        value
            .as_dictionary()
            .unwrap()
            .get(key)
            .unwrap()
            .as_dictionary()
            .unwrap()
    }

    #[test]
    fn executable_and_manifest_are_excluded() {
        let tmp = tempfile::tempdir().unwrap();
        scaffold_bundle(tmp.path());

        let res = build_code_resources(tmp.path()).unwrap();
        let files = dict(&res, "files");
        let files2 = dict(&res, "files2");

        assert!(!files.contains_key("Demo"));
        assert!(!files.contains_key("_CodeSignature/CodeResources"));
        assert!(!files2.contains_key("Demo"));
    }

    #[test]
    fn files_and_files2_omissions_differ() {
        let tmp = tempfile::tempdir().unwrap();
        scaffold_bundle(tmp.path());

        let res = build_code_resources(tmp.path()).unwrap();
        let files = dict(&res, "files");
        let files2 = dict(&res, "files2");

        // Info.plist and PkgInfo: legacy map only.
        assert!(files.contains_key("Info.plist"));
        assert!(files.contains_key("PkgInfo"));
        assert!(!files2.contains_key("Info.plist"));
        assert!(!files2.contains_key("PkgInfo"));

        // .DS_Store: legacy map only; locversion.plist: neither.
        assert!(files.contains_key(".DS_Store"));
        assert!(!files2.contains_key(".DS_Store"));
        assert!(!files.contains_key("en.lproj/locversion.plist"));
        assert!(!files2.contains_key("en.lproj/locversion.plist"));
    }

    #[test]
    fn lproj_entries_are_optional() {
        let tmp = tempfile::tempdir().unwrap();
        scaffold_bundle(tmp.path());

        let res = build_code_resources(tmp.path()).unwrap();
        let files = dict(&res, "files");
        let files2 = dict(&res, "files2");

        let legacy = files.get("en.lproj/Main.strings").unwrap();
        let legacy = legacy.as_dictionary().unwrap();
        assert_eq!(legacy.get("optional"), Some(&Value::Boolean(true)));
        assert!(legacy.get("hash").is_some());

        let modern = files2.get("en.lproj/Main.strings").unwrap();
        let modern = modern.as_dictionary().unwrap();
        assert_eq!(modern.get("optional"), Some(&Value::Boolean(true)));

        // Plain entries are bare hashes in the legacy map.
        assert!(matches!(files.get("asset.png"), Some(Value::Data(_))));
    }

    #[test]
    fn hashes_match_file_content() {
        let tmp = tempfile::tempdir().unwrap();
        scaffold_bundle(tmp.path());

        let res = build_code_resources(tmp.path()).unwrap();
        let files2 = dict(&res, "files2");
        let entry = files2.get("asset.png").unwrap().as_dictionary().unwrap();

        let (d1, d2) = sha_pair(b"png bytes");
        assert_eq!(entry.get("hash"), Some(&Value::Data(d1.to_vec())));
        assert_eq!(entry.get("hash2"), Some(&Value::Data(d2.to_vec())));
    }

    #[test]
    fn rules_dictionaries_are_complete() {
        let tmp = tempfile::tempdir().unwrap();
        scaffold_bundle(tmp.path());

        let res = build_code_resources(tmp.path()).unwrap();
        let rules = dict(&res, "rules");
        let rules2 = dict(&res, "rules2");

        assert!(rules.contains_key("^.*"));
        assert!(rules.contains_key("^.*\\.lproj/"));
        assert!(rules.contains_key("^.*\\.lproj/locversion.plist$"));
        assert!(rules.contains_key("^Base\\.lproj/"));
        assert!(rules.contains_key("^version.plist$"));

        assert!(rules2.contains_key("^.*"));
        assert!(rules2.contains_key(".*\\.dSYM($|/)"));
        assert!(rules2.contains_key("^(.*/)?\\.DS_Store$"));
        assert!(rules2.contains_key("^Info\\.plist$"));
        assert!(rules2.contains_key("^PkgInfo$"));
        assert!(rules2.contains_key("^embedded\\.provisionprofile$"));
        assert!(rules2.contains_key("^version\\.plist$"));

        let lproj = rules2.get("^.*\\.lproj/").unwrap().as_dictionary().unwrap();
        assert_eq!(lproj.get("weight"), Some(&Value::Real(1000.0)));
    }

    #[test]
    fn update_entry_touches_only_its_key() {
        let tmp = tempfile::tempdir().unwrap();
        scaffold_bundle(tmp.path());

        let mut res = build_code_resources(tmp.path()).unwrap();
        let before_other = dict(&res, "files2")
            .get("en.lproj/Main.strings")
            .unwrap()
            .clone();

        let (d1, d2) = sha_pair(b"new content");
        update_entry(&mut res, "asset.png", &d1, &d2).unwrap();

        let files2 = dict(&res, "files2");
        let entry = files2.get("asset.png").unwrap().as_dictionary().unwrap();
        assert_eq!(entry.get("hash"), Some(&Value::Data(d1.to_vec())));
        assert_eq!(entry.get("hash2"), Some(&Value::Data(d2.to_vec())));

        // Untouched entries keep their exact value, optional flag included.
        assert_eq!(
            files2.get("en.lproj/Main.strings"),
            Some(&before_other)
        );
    }

    #[test]
    fn serialized_manifest_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        scaffold_bundle(tmp.path());

        let res = build_code_resources(tmp.path()).unwrap();
        let xml = serialize_code_resources(&res).unwrap();
        assert!(xml.starts_with(b"<?xml"));

        let back: Value = plist::from_bytes(&xml).unwrap();
        let back_files2 = dict(&back, "files2");
        let orig_files2 = dict(&res, "files2");
        assert_eq!(
            back_files2.keys().collect::<Vec<_>>(),
            orig_files2.keys().collect::<Vec<_>>()
        );
        assert_eq!(
            back_files2.get("asset.png"),
            orig_files2.get("asset.png")
        );
    }
}
