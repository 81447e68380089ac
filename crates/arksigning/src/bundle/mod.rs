//! Bundle engine: discovery, CodeResources, the depth-first signing
//! traversal, and the incremental cache.
//!
//! Children are fully signed (their CodeResources written, their executable
//! rewritten) before the parent manifest is computed, because the parent
//! hashes the children's signed files.

pub mod app_info;
pub mod code_resources;
pub mod node;

pub use app_info::app_info;
pub use node::{find_app_folder, BundleNode};

use crate::crypto::SigningIdentity;
use crate::macho::{MachOFile, SignContext};
use crate::util::{base64_decode, sha1_hex, sha_pair_file};
use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory holding the per-app incremental cache files.
const CACHE_DIR: &str = "./.arksigning_cache";

/// Knobs for one bundle signing run.
#[derive(Debug, Clone)]
pub struct SignOptions {
    /// Ignore the cache and rebuild every manifest from scratch.
    pub force: bool,
    /// Inject dylibs as `LC_LOAD_WEAK_DYLIB`.
    pub weak_inject: bool,
    /// Dylib files to copy next to the root executable and inject.
    pub dylibs: Vec<PathBuf>,
    /// Write `embedded.mobileprovision`; when false the file is removed.
    pub embed_profile: bool,
    /// Persist the node tree for incremental re-signing.
    pub enable_cache: bool,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            force: false,
            weak_inject: false,
            dylibs: Vec::new(),
            embed_profile: true,
            enable_cache: true,
        }
    }
}

/// Signs one app bundle tree with a shared identity.
pub struct BundleSigner<'a> {
    identity: &'a SigningIdentity,
    options: SignOptions,
    app_folder: PathBuf,
    /// Install names queued for injection into the root executable.
    inject_names: Vec<String>,
    force: bool,
}

impl<'a> BundleSigner<'a> {
    pub fn new(identity: &'a SigningIdentity, options: SignOptions) -> Self {
        let force = options.force;
        Self {
            identity,
            options,
            app_folder: PathBuf::new(),
            inject_names: Vec::new(),
            force,
        }
    }

    /// Sign the app bundle under `folder` in place.
    ///
    /// Returns the resolved app folder so the caller can repackage it.
    pub fn sign_folder(mut self, folder: &Path) -> Result<PathBuf> {
        self.app_folder = find_app_folder(folder)?;

        self.place_provisioning_profile()?;
        self.stage_dylibs()?;

        let cache_path = self.cache_path();
        if !cache_path.exists() {
            self.force = true;
        }

        let mut root = if self.force {
            let mut tree = node::collect_sign_tree(&self.app_folder)?;
            node::mark_changed(&mut tree, self.options.embed_profile);
            tree
        } else {
            match fs::read(&cache_path)
                .ok()
                .and_then(|raw| serde_json::from_slice::<BundleNode>(&raw).ok())
            {
                Some(tree) => tree,
                None => {
                    self.force = true;
                    let mut tree = node::collect_sign_tree(&self.app_folder)?;
                    node::mark_changed(&mut tree, self.options.embed_profile);
                    tree
                }
            }
        };
        if root.display_name.is_empty() {
            root.display_name = root.bundle_id.clone();
        }

        info!(app = %self.app_folder.display(), "signing");
        info!(name = %root.display_name, bundle_id = %root.bundle_id, version = %root.bundle_version, "bundle");
        info!(team_id = %self.identity.team_id, subject_cn = %self.identity.subject_cn, "identity");
        info!(cache = !self.force, embed_profile = self.options.embed_profile, "mode");

        self.sign_node(&root)?;

        if self.options.enable_cache {
            fs::create_dir_all(CACHE_DIR)?;
            fs::write(&cache_path, serde_json::to_string_pretty(&root)?)?;
        }

        Ok(self.app_folder)
    }

    fn cache_path(&self) -> PathBuf {
        let absolute = fs::canonicalize(&self.app_folder)
            .unwrap_or_else(|_| self.app_folder.clone());
        let key = sha1_hex(&absolute.to_string_lossy());
        Path::new(CACHE_DIR).join(format!("{}.json", key))
    }

    fn place_provisioning_profile(&self) -> Result<()> {
        let profile_path = self.app_folder.join("embedded.mobileprovision");
        if self.options.embed_profile {
            fs::write(&profile_path, &self.identity.provision_data)?;
        } else if profile_path.exists() {
            fs::remove_file(&profile_path)?;
            info!("removed embedded.mobileprovision");
        }
        Ok(())
    }

    /// Copy each `-l` dylib next to the root executable and queue its
    /// `@executable_path` install name.
    fn stage_dylibs(&mut self) -> Result<()> {
        for dylib in &self.options.dylibs {
            let data = fs::read(dylib)?;
            let name = dylib
                .file_name()
                .ok_or_else(|| Error::Bundle(format!("invalid dylib path {}", dylib.display())))?
                .to_string_lossy()
                .into_owned();
            fs::write(self.app_folder.join(&name), data)?;
            self.inject_names.push(format!("@executable_path/{}", name));
        }
        Ok(())
    }

    fn sign_node(&self, node: &BundleNode) -> Result<()> {
        for child in &node.folders {
            self.sign_node(child)?;
        }

        for file in &node.files {
            info!(file = %file, "signing loose dylib");
            let ctx = SignContext {
                identity: self.identity,
                bundle_id: None,
                info_plist_sha1: None,
                info_plist_sha256: None,
                code_resources: None,
            };
            MachOFile::read(self.app_folder.join(file))?.sign(&ctx, self.force)?;
        }

        let base_folder = if node.path == "/" {
            self.app_folder.clone()
        } else {
            self.app_folder.join(&node.path)
        };

        let info_sha1 = base64_decode(&node.info_plist_sha1);
        let info_sha256 = base64_decode(&node.info_plist_sha256);
        if node.bundle_id.is_empty()
            || node.exec_name.is_empty()
            || info_sha1.is_empty()
            || info_sha256.is_empty()
        {
            return Err(Error::Bundle(format!(
                "incomplete Info.plist identity for {}",
                base_folder.display()
            )));
        }

        info!(folder = %node.path, exec = %node.exec_name, "signing bundle folder");

        fs::create_dir_all(base_folder.join("_CodeSignature"))?;
        let manifest_path = base_folder.join("_CodeSignature/CodeResources");

        let existing = if self.force {
            None
        } else {
            code_resources::load_code_resources(&manifest_path)
        };

        let manifest = match existing {
            None => code_resources::build_code_resources(&base_folder)?,
            Some(mut manifest) => {
                for changed in &node.changed {
                    let real_path = self.app_folder.join(changed);
                    let (sha1, sha256) = sha_pair_file(&real_path).map_err(|_| {
                        Error::Bundle(format!("cannot hash changed file {}", changed))
                    })?;

                    let key = if node.path == "/" {
                        changed.clone()
                    } else {
                        changed
                            .strip_prefix(&format!("{}/", node.path))
                            .unwrap_or(changed)
                            .to_string()
                    };
                    debug!(key = %key, "refreshed changed file");
                    code_resources::update_entry(&mut manifest, &key, &sha1, &sha256)?;
                }
                manifest
            }
        };

        let manifest_xml = code_resources::serialize_code_resources(&manifest)?;
        fs::write(&manifest_path, &manifest_xml)?;

        let exec_path = base_folder.join(&node.exec_name);
        let mut macho = MachOFile::read(&exec_path)
            .map_err(|e| Error::Bundle(format!("cannot parse bundle executable: {}", e)))?;

        let mut force = self.force;
        if node.path == "/" {
            for install_name in &self.inject_names {
                if macho.inject_dylib(install_name, self.options.weak_inject)? {
                    force = true;
                }
            }
        }

        let ctx = SignContext {
            identity: self.identity,
            bundle_id: Some(&node.bundle_id),
            info_plist_sha1: Some(info_sha1),
            info_plist_sha256: Some(info_sha256),
            code_resources: Some(manifest_xml),
        };
        macho.sign(&ctx, force)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_embed_and_cache() {
        let opts = SignOptions::default();
        assert!(!opts.force);
        assert!(opts.embed_profile);
        assert!(opts.enable_cache);
        assert!(opts.dylibs.is_empty());
    }
}
