// src/bootenv.rs

//! Boot environment manager
//!
//! A boot environment is a writable Btrfs subvolume cloned from a snapshot's
//! read-only subvolume, living under the boot environment directory and
//! named by its snapshot number. Removal has three outcomes: `Removed`,
//! `NotFound` (already gone, success for deletion paths) and `Deferred`.
//! The subvolume currently backing `/` must never be deleted from under the
//! running system and is left for the next startup's purge instead.

use crate::block::FileSystemFacts;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

/// Outcome of a boot environment removal attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// The environment is the active root; removal is deferred to next boot
    Deferred,
    NotFound,
}

/// Btrfs subvolume operations, pluggable for tests
pub trait SubvolumeOps: Send + Sync {
    /// Create a writable snapshot of `source` at `dest`.
    fn snapshot(&self, source: &Path, dest: &Path) -> Result<()>;

    /// Delete the subvolume at `path` recursively.
    fn delete(&self, path: &Path) -> Result<()>;

    /// The subvolume currently mounted as `/`, if the root is a subvolume.
    ///
    /// Best effort: bind mounts and chroots can misreport this, in which
    /// case the failure mode is a spurious `Deferred`, never a deletion.
    fn active_subvolume(&self) -> Result<Option<PathBuf>>;
}

/// Subvolume operations via the btrfs(8) command line tool
pub struct BtrfsCli;

impl BtrfsCli {
    fn run(args: &[&str]) -> Result<()> {
        let output = Command::new("btrfs")
            .args(args)
            .output()
            .map_err(|e| Error::ExternalFailure(format!("Failed to run btrfs: {}", e)))?;

        if !output.status.success() {
            return Err(Error::ExternalFailure(format!(
                "btrfs {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(())
    }
}

impl SubvolumeOps for BtrfsCli {
    fn snapshot(&self, source: &Path, dest: &Path) -> Result<()> {
        Self::run(&[
            "subvolume",
            "snapshot",
            &source.display().to_string(),
            &dest.display().to_string(),
        ])
    }

    fn delete(&self, path: &Path) -> Result<()> {
        Self::run(&["subvolume", "delete", &path.display().to_string()])
    }

    fn active_subvolume(&self) -> Result<Option<PathBuf>> {
        Ok(FileSystemFacts::probe(Path::new("/"))?.subvol)
    }
}

/// Creates and removes boot environments under the configured directory
pub struct BootEnvManager {
    directory: PathBuf,
    snapshots: PathBuf,
    ops: Box<dyn SubvolumeOps>,
}

impl BootEnvManager {
    pub fn new(directory: PathBuf, snapshots: PathBuf, ops: Box<dyn SubvolumeOps>) -> Self {
        Self { directory, snapshots, ops }
    }

    /// Identity of the boot environment for a snapshot number. Also its
    /// directory name, so removal after a restart needs nothing but the id.
    pub fn id(&self, number: u64) -> String {
        number.to_string()
    }

    /// Filesystem path of a boot environment by id.
    pub fn path(&self, id: &str) -> PathBuf {
        self.directory.join(id)
    }

    /// Clone snapshot `number`'s subvolume into a new boot environment.
    pub fn create_from(&self, number: u64) -> Result<String> {
        let id = self.id(number);
        let dest = self.path(&id);

        if dest.exists() {
            return Err(Error::ResourceConflict(format!(
                "Boot environment {} already exists",
                dest.display()
            )));
        }

        let source = self.snapshots.join(number.to_string()).join("snapshot");

        if !source.exists() {
            return Err(Error::NotFound(format!(
                "Snapshot subvolume {} does not exist",
                source.display()
            )));
        }

        self.ops.snapshot(&source, &dest)?;
        info!(number, path = %dest.display(), "Created boot environment");
        Ok(id)
    }

    /// Remove a boot environment, deferring when it is the active root.
    pub fn remove(&self, id: &str) -> Result<Removal> {
        let path = self.path(id);

        if !path.exists() {
            return Ok(Removal::NotFound);
        }

        if self.is_active(&path)? {
            warn!(path = %path.display(), "Boot environment in use, deferring removal");
            return Ok(Removal::Deferred);
        }

        self.ops.delete(&path)?;
        info!(path = %path.display(), "Removed boot environment");
        Ok(Removal::Removed)
    }

    /// Whether the boot environment at `path` backs the running root.
    fn is_active(&self, path: &Path) -> Result<bool> {
        Ok(self.ops.active_subvolume()?.is_some_and(|subvol| subvol == *path))
    }

    /// Ids of all boot environments currently present on disk.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();

        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            // Only numeric names are ours.
            if name.parse::<u64>().is_ok() {
                ids.push(name.into_owned());
            }
        }

        ids.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Plain-directory stand-in for btrfs subvolumes
    struct FakeSubvolumes {
        active: Mutex<Option<PathBuf>>,
    }

    impl FakeSubvolumes {
        fn new() -> Self {
            Self { active: Mutex::new(None) }
        }
    }

    impl SubvolumeOps for FakeSubvolumes {
        fn snapshot(&self, source: &Path, dest: &Path) -> Result<()> {
            if !source.exists() {
                return Err(Error::ExternalFailure("source missing".to_string()));
            }
            fs::create_dir_all(dest)?;
            Ok(())
        }

        fn delete(&self, path: &Path) -> Result<()> {
            fs::remove_dir_all(path)?;
            Ok(())
        }

        fn active_subvolume(&self) -> Result<Option<PathBuf>> {
            Ok(self.active.lock().unwrap().clone())
        }
    }

    fn manager(root: &Path) -> BootEnvManager {
        let directory = root.join("bootenvs");
        let snapshots = root.join("snapshots");
        fs::create_dir_all(&directory).unwrap();
        fs::create_dir_all(snapshots.join("5").join("snapshot")).unwrap();
        BootEnvManager::new(directory, snapshots, Box::new(FakeSubvolumes::new()))
    }

    #[test]
    fn creates_boot_environment_from_snapshot() {
        let root = TempDir::new().unwrap();
        let manager = manager(root.path());

        let id = manager.create_from(5).unwrap();
        assert_eq!(id, "5");
        assert!(manager.path(&id).exists());
    }

    #[test]
    fn existing_boot_environment_is_a_conflict() {
        let root = TempDir::new().unwrap();
        let manager = manager(root.path());

        manager.create_from(5).unwrap();
        assert!(matches!(manager.create_from(5), Err(Error::ResourceConflict(_))));
    }

    #[test]
    fn missing_snapshot_subvolume_is_not_found() {
        let root = TempDir::new().unwrap();
        let manager = manager(root.path());
        assert!(matches!(manager.create_from(99), Err(Error::NotFound(_))));
    }

    #[test]
    fn removes_inactive_boot_environment() {
        let root = TempDir::new().unwrap();
        let manager = manager(root.path());
        let id = manager.create_from(5).unwrap();

        assert_eq!(manager.remove(&id).unwrap(), Removal::Removed);
        assert!(!manager.path(&id).exists());
    }

    #[test]
    fn active_boot_environment_is_deferred() {
        let root = TempDir::new().unwrap();
        let directory = root.path().join("bootenvs");
        let snapshots = root.path().join("snapshots");
        fs::create_dir_all(&directory).unwrap();
        fs::create_dir_all(snapshots.join("5").join("snapshot")).unwrap();

        let ops = FakeSubvolumes::new();
        *ops.active.lock().unwrap() = Some(directory.join("5"));
        let manager = BootEnvManager::new(directory, snapshots, Box::new(ops));

        let id = manager.create_from(5).unwrap();
        assert_eq!(manager.remove(&id).unwrap(), Removal::Deferred);
        assert!(manager.path(&id).exists());
    }

    #[test]
    fn removing_absent_boot_environment_is_not_found() {
        let root = TempDir::new().unwrap();
        let manager = manager(root.path());
        assert_eq!(manager.remove("99").unwrap(), Removal::NotFound);
    }

    #[test]
    fn list_reports_only_numeric_directories() {
        let root = TempDir::new().unwrap();
        let manager = manager(root.path());
        manager.create_from(5).unwrap();
        fs::create_dir_all(root.path().join("bootenvs").join("lost+found")).unwrap();

        assert_eq!(manager.list().unwrap(), vec!["5".to_string()]);
    }
}
