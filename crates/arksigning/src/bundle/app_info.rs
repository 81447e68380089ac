//! App information report: bundle identity, nested components, and the app
//! icon as Base64. Backs the CLI `--info` mode.

use super::node::{find_app_folder, folder_info};
use crate::util::base64_encode;
use crate::Result;
use serde_json::{json, Value as Json};
use std::fs;
use std::path::{Path, PathBuf};

/// Describe the app bundle under `root` as a JSON document.
pub fn app_info(root: &Path) -> Result<Json> {
    let app_folder = find_app_folder(root)?;
    let info = folder_info(&app_folder)?;

    let mut doc = json!({
        "path": app_folder.to_string_lossy(),
        "bundle_id": info.bundle_id,
        "bundle_version": info.bundle_version,
        "exec_name": info.exec_name,
        "appname": info.display_name,
        "sha1": info.info_plist_sha1,
        "sha2": info.info_plist_sha256,
        "has_provisioning_profile": app_folder.join("embedded.mobileprovision").exists(),
    });

    let mut components = Vec::new();
    collect_components(&app_folder, &mut components);
    if !components.is_empty() {
        doc["components"] = Json::Array(components);
    }

    if let Some(icon) = find_app_icon(&app_folder) {
        doc["icon_base64"] = Json::String(icon);
    }

    Ok(doc)
}

fn component_type(name: &str) -> Option<&'static str> {
    if name.ends_with(".framework") {
        Some("framework")
    } else if name.ends_with(".appex") {
        Some("extension")
    } else if name.ends_with(".app") {
        Some("application")
    } else {
        None
    }
}

fn collect_components(folder: &Path, out: &mut Vec<Json>) {
    let Ok(entries) = fs::read_dir(folder) else {
        return;
    };
    let mut paths: Vec<_> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    paths.sort();

    for path in paths {
        if !path.is_dir() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let Some(kind) = component_type(&name) {
            if let Ok(info) = folder_info(&path) {
                out.push(json!({
                    "type": kind,
                    "bundle_id": info.bundle_id,
                    "bundle_version": info.bundle_version,
                    "exec_name": info.exec_name,
                    "appname": info.display_name,
                }));
            }
        }
        collect_components(&path, out);
    }
}

/// Locate the app icon, trying the Info.plist icon keys first and common
/// fallback names after, and return its bytes Base64-encoded.
fn find_app_icon(app_folder: &Path) -> Option<String> {
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Ok(raw) = fs::read(app_folder.join("Info.plist")) {
        if let Ok(plist::Value::Dictionary(info)) = plist::from_bytes::<plist::Value>(&raw) {
            if let Some(icon_files) = info
                .get("CFBundleIcons")
                .and_then(|v| v.as_dictionary())
                .and_then(|d| d.get("CFBundlePrimaryIcon"))
                .and_then(|v| v.as_dictionary())
                .and_then(|d| d.get("CFBundleIconFiles"))
                .and_then(|v| v.as_array())
            {
                for name in icon_files.iter().filter_map(|v| v.as_string()) {
                    candidates.push(app_folder.join(format!("{}.png", name)));
                    candidates.push(app_folder.join(format!("{}@2x.png", name)));
                    candidates.push(app_folder.join(format!("{}@3x.png", name)));
                }
            }

            if let Some(icon_files) = info.get("CFBundleIconFiles").and_then(|v| v.as_array()) {
                for name in icon_files.iter().filter_map(|v| v.as_string()) {
                    candidates.push(app_folder.join(name));
                    candidates.push(app_folder.join(format!("{}.png", name)));
                }
            }

            if let Some(name) = info.get("CFBundleIconFile").and_then(|v| v.as_string()) {
                candidates.push(app_folder.join(name));
                candidates.push(app_folder.join(format!("{}.png", name)));
            }
        }
    }

    candidates.push(app_folder.join("AppIcon.png"));
    candidates.push(app_folder.join("Icon.png"));
    candidates.push(app_folder.join("Icon@2x.png"));

    // Compiled asset catalogs keep AppIcon*.png sets in Assets.xcassets.
    if let Ok(entries) = fs::read_dir(app_folder.join("Assets.xcassets")) {
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains("AppIcon") && entry.path().is_dir() {
                if let Ok(icons) = fs::read_dir(entry.path()) {
                    for icon in icons.filter_map(|e| e.ok()) {
                        if icon.file_name().to_string_lossy().ends_with(".png") {
                            candidates.push(icon.path());
                        }
                    }
                }
            }
        }
    }

    for candidate in candidates {
        if let Ok(bytes) = fs::read(&candidate) {
            return Some(base64_encode(&bytes));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scaffold(root: &Path) -> PathBuf {
        let app = root.join("Payload/Demo.app");
        fs::create_dir_all(&app).unwrap();
        fs::write(
            app.join("Info.plist"),
            br#"<?xml version="1.0"?><plist version="1.0"><dict>
<key>CFBundleIdentifier</key><string>com.example.demo</string>
<key>CFBundleExecutable</key><string>Demo</string>
<key>CFBundleVersion</key><string>7</string>
<key>CFBundleName</key><string>Demo</string>
<key>CFBundleIconFile</key><string>Icon</string>
</dict></plist>"#,
        )
        .unwrap();
        fs::write(app.join("Demo"), b"exec").unwrap();
        app
    }

    #[test]
    fn report_covers_identity_and_profile() {
        let tmp = tempfile::tempdir().unwrap();
        let app = scaffold(tmp.path());
        fs::write(app.join("embedded.mobileprovision"), b"profile").unwrap();

        let info = app_info(tmp.path()).unwrap();
        assert_eq!(info["bundle_id"], "com.example.demo");
        assert_eq!(info["bundle_version"], "7");
        assert_eq!(info["appname"], "Demo");
        assert_eq!(info["has_provisioning_profile"], true);
        assert!(info.get("icon_base64").is_none());
    }

    #[test]
    fn icon_resolved_via_info_plist_key() {
        let tmp = tempfile::tempdir().unwrap();
        let app = scaffold(tmp.path());
        fs::write(app.join("Icon.png"), b"PNGDATA").unwrap();

        let info = app_info(tmp.path()).unwrap();
        assert_eq!(
            info["icon_base64"],
            base64_encode(b"PNGDATA")
        );
    }

    #[test]
    fn components_include_nested_framework() {
        let tmp = tempfile::tempdir().unwrap();
        let app = scaffold(tmp.path());

        let framework = app.join("Frameworks/Helper.framework");
        fs::create_dir_all(&framework).unwrap();
        fs::write(
            framework.join("Info.plist"),
            br#"<plist version="1.0"><dict>
<key>CFBundleIdentifier</key><string>com.example.helper</string>
<key>CFBundleExecutable</key><string>Helper</string>
</dict></plist>"#,
        )
        .unwrap();

        let info = app_info(tmp.path()).unwrap();
        let components = info["components"].as_array().unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0]["type"], "framework");
        assert_eq!(components[0]["bundle_id"], "com.example.helper");
    }
}
