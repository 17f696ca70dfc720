// src/config.rs

//! Configuration types for snapboot
//!
//! The configuration is a JSON file named `snapboot.conf` looked up in the
//! first `XDG_CONFIG_DIRS` entry (falling back on `/etc/xdg`). Validation
//! beyond shape (which serde enforces) happens at startup: the boot entry
//! template is resolved once against a dummy context so an invalid
//! replacement field is reported before any snapshot is touched.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Boot loader settings and the entry template
    pub boot: BootSection,

    /// Boot environment directory (a Btrfs subvolume container, e.g. `/.bootenvs`)
    pub bootenv: PathBuf,

    /// Machine ID file
    #[serde(default = "default_machine_id")]
    pub machine_id: PathBuf,

    /// Package database settings
    pub package: PackageSection,

    /// Snapper settings
    pub snapper: SnapperSection,

    /// Snapshot directory (e.g. `/.snapshots`)
    pub snapshots: PathBuf,

    /// Directory for the association store database and lock file
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

/// Boot loader configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct BootSection {
    /// Boot entry template with replacement fields
    pub entry: EntryTemplate,

    /// Boot loader backend name ("grub" or "systemd-boot")
    pub loader: String,

    /// Boot partition mount point (e.g. `/boot` or `/efi`)
    pub mount_point: PathBuf,

    /// Whether /boot lives on the root filesystem rather than its own partition
    #[serde(default)]
    pub boot_on_root: bool,
}

/// Boot entry template. Every string may contain replacement fields.
#[derive(Debug, Clone, Deserialize)]
pub struct EntryTemplate {
    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub machine_id: Option<String>,

    /// Kernel command line, order-preserving mix of bare words and name/value pairs
    #[serde(default)]
    pub options: Vec<EntryOption>,

    #[serde(default)]
    pub architecture: Option<String>,

    /// Kernel image path (relative to the boot mount point once resolved)
    pub linux: String,

    /// Initrd image paths
    #[serde(default)]
    pub initrd: Vec<String>,
}

/// One kernel command line item: either a bare string or name/value pairs.
/// The distinction and the list order are preserved through resolution.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EntryOption {
    Bare(String),
    Pair(BTreeMap<String, String>),
}

/// Package database configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct PackageSection {
    /// Package database backend name ("alpm" or "dpkg")
    pub database: String,

    /// Packages whose presence in a transaction marks the snapshot important
    #[serde(default)]
    pub important: Vec<String>,

    /// Kernel package name (e.g. "linux" or "linux-image-amd64")
    pub linux: String,
}

/// Snapper configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct SnapperSection {
    /// Cleanup algorithm tag passed to snapper ("number", "timeline", ...)
    pub cleanup_algorithm: String,

    /// Description for created snapshots
    pub description: String,

    /// Snapper configuration name (usually "root")
    pub name: String,
}

fn default_machine_id() -> PathBuf {
    PathBuf::from("/etc/machine-id")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/snapboot")
}

impl Config {
    /// Load the configuration from the default XDG location.
    pub fn load() -> Result<Self> {
        let xdg = std::env::var("XDG_CONFIG_DIRS").unwrap_or_default();
        let dir = xdg.split(':').next().filter(|s| !s.is_empty()).unwrap_or("/etc/xdg");
        Self::load_from(&Path::new(dir).join("snapboot").join("snapboot.conf"))
    }

    /// Load the configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let buffer = fs::read_to_string(path).map_err(|e| {
            Error::InitError(format!("Configuration file {} not readable: {}", path.display(), e))
        })?;

        let config: Config = serde_json::from_str(&buffer)
            .map_err(|e| Error::InitError(format!("Invalid configuration: {}", e)))?;

        Ok(config)
    }

    /// Path of the association store database.
    pub fn state_db(&self) -> PathBuf {
        self.state_dir.join("snapboot.db")
    }

    /// Path of the reconciler lock file.
    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join("snapboot.lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "boot": {
            "entry": {
                "title": "Arch Linux (snapshot {snapshot.number})",
                "version": "{linux.version}",
                "machine_id": "{machine_id}",
                "options": [
                    {"root": "UUID={root_file_system.uuid}"},
                    {"rootflags": "subvol=/.bootenvs/{snapshot.number}"},
                    "rw"
                ],
                "architecture": "{architecture}",
                "linux": "/{machine_id}/{linux.version}/vmlinuz-linux",
                "initrd": ["/{machine_id}/{linux.version}/initramfs-linux.img"]
            },
            "loader": "systemd-boot",
            "mount_point": "/efi"
        },
        "bootenv": "/.bootenvs",
        "package": {
            "database": "alpm",
            "important": ["linux", "systemd"],
            "linux": "linux"
        },
        "snapper": {
            "cleanup_algorithm": "number",
            "description": "snapboot",
            "name": "root"
        },
        "snapshots": "/.snapshots"
    }"#;

    #[test]
    fn parses_sample_configuration() {
        let config: Config = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(config.boot.loader, "systemd-boot");
        assert!(!config.boot.boot_on_root);
        assert_eq!(config.boot.entry.initrd.len(), 1);
        assert_eq!(config.machine_id, PathBuf::from("/etc/machine-id"));
        assert_eq!(config.state_db(), PathBuf::from("/var/lib/snapboot/snapboot.db"));
    }

    #[test]
    fn options_keep_bare_and_pair_distinction() {
        let config: Config = serde_json::from_str(SAMPLE).unwrap();
        let options = &config.boot.entry.options;
        assert_eq!(options.len(), 3);
        assert!(matches!(options[0], EntryOption::Pair(_)));
        assert!(matches!(options[2], EntryOption::Bare(ref s) if s == "rw"));
    }

    #[test]
    fn missing_required_section_is_rejected() {
        let result: std::result::Result<Config, _> = serde_json::from_str(r#"{"bootenv": "/x"}"#);
        assert!(result.is_err());
    }
}
