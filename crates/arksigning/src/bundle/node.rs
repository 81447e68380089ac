//! Bundle discovery and the signable-node tree.
//!
//! A [`BundleNode`] describes one signable directory (`.app`, `.appex`,
//! `.framework`, `.xctest`): its identity read from `Info.plist`, the loose
//! dylibs it owns, its child sub-bundles, and the change-set used for
//! incremental CodeResources rebuilds. The root node tree is what gets
//! serialized to the incremental cache.

use crate::util::sha_pair;
use crate::util::base64_encode;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Directory suffixes that form signable sub-bundles.
const BUNDLE_SUFFIXES: [&str; 4] = [".app", ".appex", ".framework", ".xctest"];

/// One signable directory in the app tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleNode {
    /// Path relative to the app root; `/` for the root itself.
    pub path: String,
    /// Absolute app folder; present on the root node only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    pub bundle_id: String,
    pub bundle_version: String,
    pub exec_name: String,
    #[serde(default)]
    pub display_name: String,
    /// Base64 SHA-1 of the raw Info.plist bytes.
    pub info_plist_sha1: String,
    /// Base64 SHA-256 of the raw Info.plist bytes.
    pub info_plist_sha256: String,
    /// Child sub-bundles.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub folders: Vec<BundleNode>,
    /// Loose dylibs owned by this node, app-root relative.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    /// Files whose hashes must be refreshed on an incremental rebuild,
    /// app-root relative.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<String>,
}

/// Identity of one bundle folder, read from its `Info.plist`.
pub struct FolderInfo {
    pub bundle_id: String,
    pub bundle_version: String,
    pub exec_name: String,
    pub display_name: String,
    pub info_plist_sha1: String,
    pub info_plist_sha256: String,
}

fn has_bundle_suffix(name: &str) -> bool {
    BUNDLE_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Descend from `root` to the first directory named `*.app` or `*.appex`,
/// skipping `__MACOSX` droppings.
pub fn find_app_folder(root: impl AsRef<Path>) -> Result<PathBuf> {
    fn descend(folder: &Path) -> Option<PathBuf> {
        let name = folder.file_name()?.to_string_lossy();
        if name.ends_with(".app") || name.ends_with(".appex") {
            return Some(folder.to_path_buf());
        }

        let mut entries: Vec<_> = fs::read_dir(folder)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        entries.sort();

        for entry in entries {
            if !entry.is_dir() {
                continue;
            }
            if entry.file_name().map(|n| n == "__MACOSX").unwrap_or(false) {
                continue;
            }
            if let Some(found) = descend(&entry) {
                return Some(found);
            }
        }
        None
    }

    let root = root.as_ref();
    descend(root).ok_or_else(|| {
        Error::Bundle(format!(
            "no .app or .appex folder under {}",
            root.display()
        ))
    })
}

/// Read a bundle folder's identity from its `Info.plist`.
///
/// Fails when the plist is missing or lacks `CFBundleIdentifier` /
/// `CFBundleExecutable`.
pub fn folder_info(folder: &Path) -> Result<FolderInfo> {
    let plist_path = folder.join("Info.plist");
    let raw = fs::read(&plist_path)
        .map_err(|_| Error::Bundle(format!("missing Info.plist in {}", folder.display())))?;

    let value: plist::Value = plist::from_bytes(&raw)?;
    let dict = value
        .as_dictionary()
        .ok_or_else(|| Error::Bundle(format!("{} is not a dictionary", plist_path.display())))?;

    let string_key = |key: &str| -> String {
        dict.get(key)
            .and_then(|v| v.as_string())
            .unwrap_or_default()
            .to_string()
    };

    let bundle_id = string_key("CFBundleIdentifier");
    let exec_name = string_key("CFBundleExecutable");
    if bundle_id.is_empty() || exec_name.is_empty() {
        return Err(Error::Bundle(format!(
            "no CFBundleIdentifier or CFBundleExecutable in {}",
            plist_path.display()
        )));
    }

    let mut display_name = string_key("CFBundleDisplayName");
    if display_name.is_empty() {
        display_name = string_key("CFBundleName");
    }

    let (sha1, sha256) = sha_pair(&raw);

    Ok(FolderInfo {
        bundle_id,
        bundle_version: string_key("CFBundleVersion"),
        exec_name,
        display_name,
        info_plist_sha1: base64_encode(&sha1),
        info_plist_sha256: base64_encode(&sha256),
    })
}

impl BundleNode {
    fn from_info(path: String, info: FolderInfo) -> Self {
        Self {
            path,
            root: None,
            bundle_id: info.bundle_id,
            bundle_version: info.bundle_version,
            exec_name: info.exec_name,
            display_name: info.display_name,
            info_plist_sha1: info.info_plist_sha1,
            info_plist_sha256: info.info_plist_sha256,
            folders: Vec::new(),
            files: Vec::new(),
            changed: Vec::new(),
        }
    }
}

/// Build the signable-node tree for an app folder.
pub fn collect_sign_tree(app_root: &Path) -> Result<BundleNode> {
    let info = folder_info(app_root)?;
    let mut root = BundleNode::from_info("/".to_string(), info);
    root.root = Some(app_root.to_string_lossy().into_owned());

    walk(app_root, app_root, &mut root)?;
    Ok(root)
}

fn walk(folder: &Path, app_root: &Path, node: &mut BundleNode) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(folder)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();

    for entry in entries {
        let relative = entry
            .strip_prefix(app_root)
            .map_err(|_| Error::Bundle("path escapes app root".into()))?
            .to_string_lossy()
            .into_owned();
        let name = entry
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let metadata = fs::symlink_metadata(&entry)?;
        if metadata.is_dir() {
            if has_bundle_suffix(&name) {
                // A sub-bundle without a usable Info.plist is not signable;
                // skip it the way the discovery walk always has.
                if let Ok(info) = folder_info(&entry) {
                    let mut child = BundleNode::from_info(relative, info);
                    walk(&entry, app_root, &mut child)?;
                    node.folders.push(child);
                }
            } else {
                walk(&entry, app_root, node)?;
            }
        } else if metadata.is_file() && name.ends_with(".dylib") {
            node.files.push(relative);
        }
    }

    Ok(())
}

/// Files in a node's subtree that an incremental rebuild must re-hash:
/// every loose dylib, plus each descendant bundle's CodeResources and
/// main executable.
fn collect_subtree_changes(node: &BundleNode, out: &mut Vec<String>) {
    out.extend(node.files.iter().cloned());
    for child in &node.folders {
        collect_subtree_changes(child, out);
        out.push(format!("{}/_CodeSignature/CodeResources", child.path));
        out.push(format!("{}/{}", child.path, child.exec_name));
    }
}

/// Populate every node's change-set, post-order. The root additionally
/// tracks `embedded.mobileprovision` when the profile is embedded.
pub fn mark_changed(node: &mut BundleNode, embed_profile: bool) {
    for child in &mut node.folders {
        mark_changed(child, embed_profile);
    }

    let mut changed = Vec::new();
    collect_subtree_changes(node, &mut changed);
    node.changed = changed;

    if node.path == "/" && embed_profile {
        node.changed.push("embedded.mobileprovision".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_info_plist(dir: &Path, bundle_id: &str, exec: &str) {
        let plist = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
<key>CFBundleIdentifier</key><string>{}</string>
<key>CFBundleExecutable</key><string>{}</string>
<key>CFBundleVersion</key><string>1.0</string>
<key>CFBundleDisplayName</key><string>Demo</string>
</dict></plist>"#,
            bundle_id, exec
        );
        fs::write(dir.join("Info.plist"), plist).unwrap();
    }

    fn scaffold_app(root: &Path) -> PathBuf {
        let app = root.join("Payload/Demo.app");
        fs::create_dir_all(&app).unwrap();
        write_info_plist(&app, "com.example.demo", "Demo");
        fs::write(app.join("Demo"), b"exec").unwrap();

        let framework = app.join("Frameworks/Helper.framework");
        fs::create_dir_all(&framework).unwrap();
        write_info_plist(&framework, "com.example.helper", "Helper");
        fs::write(framework.join("Helper"), b"lib").unwrap();

        fs::write(app.join("Frameworks/loose.dylib"), b"dylib").unwrap();
        app
    }

    #[test]
    fn find_app_folder_descends_and_skips_macosx() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("__MACOSX/Fake.app")).unwrap();
        let app = scaffold_app(tmp.path());

        let found = find_app_folder(tmp.path()).unwrap();
        assert_eq!(found, app);
    }

    #[test]
    fn find_app_folder_errors_when_absent() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            find_app_folder(tmp.path()),
            Err(Error::Bundle(_))
        ));
    }

    #[test]
    fn folder_info_reads_identity_and_hashes() {
        let tmp = tempfile::tempdir().unwrap();
        let app = scaffold_app(tmp.path());

        let info = folder_info(&app).unwrap();
        assert_eq!(info.bundle_id, "com.example.demo");
        assert_eq!(info.exec_name, "Demo");
        assert_eq!(info.bundle_version, "1.0");
        assert_eq!(info.display_name, "Demo");
        // Base64 digests of the raw plist bytes
        let raw = fs::read(app.join("Info.plist")).unwrap();
        let (d1, _) = sha_pair(&raw);
        assert_eq!(info.info_plist_sha1, base64_encode(&d1));
    }

    #[test]
    fn folder_info_requires_id_and_exec() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("Info.plist"),
            br#"<plist version="1.0"><dict><key>CFBundleIdentifier</key><string>x</string></dict></plist>"#,
        )
        .unwrap();
        assert!(folder_info(tmp.path()).is_err());
    }

    #[test]
    fn sign_tree_collects_children_and_dylibs() {
        let tmp = tempfile::tempdir().unwrap();
        let app = scaffold_app(tmp.path());

        let tree = collect_sign_tree(&app).unwrap();
        assert_eq!(tree.path, "/");
        assert!(tree.root.is_some());
        assert_eq!(tree.folders.len(), 1);
        assert_eq!(tree.folders[0].path, "Frameworks/Helper.framework");
        assert_eq!(tree.folders[0].bundle_id, "com.example.helper");
        assert_eq!(tree.files, vec!["Frameworks/loose.dylib".to_string()]);
    }

    #[test]
    fn change_sets_cover_children_and_profile() {
        let tmp = tempfile::tempdir().unwrap();
        let app = scaffold_app(tmp.path());

        let mut tree = collect_sign_tree(&app).unwrap();
        mark_changed(&mut tree, true);

        assert!(tree
            .changed
            .contains(&"Frameworks/Helper.framework/_CodeSignature/CodeResources".to_string()));
        assert!(tree
            .changed
            .contains(&"Frameworks/Helper.framework/Helper".to_string()));
        assert!(tree.changed.contains(&"Frameworks/loose.dylib".to_string()));
        assert!(tree
            .changed
            .contains(&"embedded.mobileprovision".to_string()));

        // Child node carries its own (empty-subtree) change set, no profile.
        assert!(!tree.folders[0]
            .changed
            .contains(&"embedded.mobileprovision".to_string()));
    }

    #[test]
    fn change_sets_skip_profile_when_not_embedding() {
        let tmp = tempfile::tempdir().unwrap();
        let app = scaffold_app(tmp.path());

        let mut tree = collect_sign_tree(&app).unwrap();
        mark_changed(&mut tree, false);
        assert!(!tree
            .changed
            .contains(&"embedded.mobileprovision".to_string()));
    }

    #[test]
    fn node_tree_survives_json_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let app = scaffold_app(tmp.path());

        let mut tree = collect_sign_tree(&app).unwrap();
        mark_changed(&mut tree, true);

        let json = serde_json::to_string_pretty(&tree).unwrap();
        let back: BundleNode = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bundle_id, tree.bundle_id);
        assert_eq!(back.folders.len(), tree.folders.len());
        assert_eq!(back.changed, tree.changed);
    }
}
