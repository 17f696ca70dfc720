// src/assets.rs

//! Kernel/initrd asset manager
//!
//! Boot entries reference kernel and initrd images under a
//! machine-id/kernel-version keyed directory on the boot partition. Several
//! boot environments built from the same kernel share one such directory,
//! so it is reference counted: created on first use, deleted when the last
//! referencing environment goes away. Counts are durable (association
//! store) and every count mutation happens under one mutex; concurrent
//! package-manager hooks must not race on the same kernel.

use crate::boot::BootEntry;
use crate::config::EntryTemplate;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::template::referenced_fields;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// One file copy required to materialize an asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyPlan {
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// Fields whose value is constant for a machine; a path templated only on
/// these points at a file that never has to be copied per snapshot.
const CONSTANT_FIELDS: [&str; 2] = ["architecture", "machine_id"];

/// Derive the copy plan for a resolved entry.
///
/// A template path referencing any non-constant field (kernel version,
/// snapshot number, ...) denotes a per-version image: its source is the
/// plain file of the same name on the boot partition and its destination is
/// the resolved path below the mount point. With `boot_on_root`, the root
/// subvolume prefix and the mount point are stripped from the resolved path
/// first; the loader needs them to find the file, the copy does not.
pub fn copy_plan(
    template: &EntryTemplate,
    resolved: &BootEntry,
    mount_point: &Path,
    boot_on_root: bool,
    root_subvol: Option<&Path>,
) -> Vec<CopyPlan> {
    let templates = std::iter::once(template.linux.as_str()).chain(template.initrd.iter().map(String::as_str));
    let resolved_paths =
        std::iter::once(resolved.linux.as_str()).chain(resolved.initrd.iter().map(String::as_str));

    let mut plan = Vec::new();

    for (template_path, resolved_path) in templates.zip(resolved_paths) {
        let variable = referenced_fields(template_path)
            .iter()
            .any(|field| !CONSTANT_FIELDS.contains(&field.as_str()));

        if !variable {
            continue;
        }

        let mut relative = Path::new(resolved_path);

        if boot_on_root {
            if let Some(subvol) = root_subvol
                && let Ok(stripped) = relative.strip_prefix(subvol)
            {
                relative = stripped;
            }
            if let Ok(mount_relative) = mount_point.strip_prefix("/")
                && let Ok(stripped) = relative.strip_prefix(Path::new("/").join(mount_relative))
            {
                relative = stripped;
            }
        }

        let relative = relative.strip_prefix("/").unwrap_or(relative);
        let Some(file_name) = relative.file_name() else {
            continue;
        };

        plan.push(CopyPlan {
            source: mount_point.join(file_name),
            destination: mount_point.join(relative),
        });
    }

    plan
}

/// Reference-counted kernel/initrd asset directories
pub struct AssetManager {
    mount_point: PathBuf,
    store: Arc<Store>,
    /// Serializes every refcount mutation across snapshots
    lock: Mutex<()>,
}

impl AssetManager {
    pub fn new(mount_point: PathBuf, store: Arc<Store>) -> Self {
        Self { mount_point, store, lock: Mutex::new(()) }
    }

    /// Asset key for a machine id and kernel version.
    pub fn key(machine_id: &str, kernel_version: &str) -> String {
        format!("{}/{}", machine_id, kernel_version)
    }

    /// Make sure the asset exists: copy on first reference, bump the count
    /// otherwise. Returns whether the asset directory was created. A failed
    /// copy rolls the count back and leaves no partial destination files.
    pub fn ensure(&self, key: &str, plan: &[CopyPlan]) -> Result<bool> {
        let _guard = self.lock.lock().unwrap();

        let destinations: Vec<PathBuf> = plan.iter().map(|copy| copy.destination.clone()).collect();
        let (refcount, created) = self.store.asset_acquire(key, &destinations)?;

        if !created {
            debug!(key, refcount, "Asset already present, reference added");
            return Ok(false);
        }

        if let Err(e) = self.copy_all(plan) {
            // Undo both the partial copies and the count.
            self.remove_files(&destinations);
            self.store.asset_release(key)?;
            return Err(e);
        }

        info!(key, files = plan.len(), "Copied kernel/initrd asset");
        Ok(true)
    }

    /// Drop one reference; deletes the asset files when the count reaches
    /// zero. Unknown keys are ignored (double release during crash
    /// recovery). Returns whether the files were deleted.
    pub fn release(&self, key: &str) -> Result<bool> {
        let _guard = self.lock.lock().unwrap();

        match self.store.asset_release(key)? {
            Some(files) => {
                self.remove_files(&files);
                info!(key, "Removed kernel/initrd asset");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn copy_all(&self, plan: &[CopyPlan]) -> Result<()> {
        for copy in plan {
            if copy.destination.exists() {
                continue;
            }

            if let Some(parent) = copy.destination.parent() {
                fs::create_dir_all(parent)?;
            }

            fs::copy(&copy.source, &copy.destination).map_err(|e| {
                Error::ExternalFailure(format!(
                    "Failed to copy {} to {}: {}",
                    copy.source.display(),
                    copy.destination.display(),
                    e
                ))
            })?;
        }

        Ok(())
    }

    /// Delete files individually, then prune emptied directories up to the
    /// mount point. Directories are never removed wholesale; they may hold
    /// files that are not ours.
    fn remove_files(&self, files: &[PathBuf]) {
        let mut parents = Vec::new();

        for file in files {
            match fs::remove_file(file) {
                Ok(()) => {
                    if let Some(parent) = file.parent() {
                        if !parents.contains(&parent.to_path_buf()) {
                            parents.push(parent.to_path_buf());
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(file = %file.display(), "Failed to delete asset file: {}", e),
            }
        }

        for parent in parents {
            let mut current = parent;

            while current != self.mount_point && current.starts_with(&self.mount_point) {
                // Fails silently while the directory is non-empty.
                if fs::remove_dir(&current).is_err() {
                    break;
                }

                match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                }
            }
        }
    }
}
