// src/boot/mod.rs

//! Boot loader backends
//!
//! One boot entry per boot environment. Backends persist entries in their
//! loader's native mechanism (an entry file for systemd-boot, a generated
//! config fragment for GRUB) and guarantee two things: the entry identity is
//! derivable from the snapshot number alone (so removal works across
//! restarts), and removing an absent entry reports `NotFound` instead of
//! failing.

mod grub;
mod systemd_boot;

pub use grub::GrubLoader;
pub use systemd_boot::SystemdBootLoader;

use crate::config::{EntryOption, EntryTemplate};
use crate::error::{Error, Result};
use crate::template::{resolve, ResolveContext};
use std::path::Path;

/// A fully resolved boot entry, ready to be written by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub title: Option<String>,
    pub version: Option<String>,
    pub machine_id: Option<String>,
    /// Kernel command line, order preserved, bare-vs-pair preserved
    pub options: Vec<ResolvedOption>,
    pub architecture: Option<String>,
    /// Kernel image path as the loader sees it
    pub linux: String,
    pub initrd: Vec<String>,
}

/// One resolved kernel command line item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedOption {
    Bare(String),
    Pair { name: String, value: String },
}

impl BootEntry {
    /// Resolve an entry template against a fact context. Fails with
    /// `UnresolvedField` before anything is written anywhere.
    pub fn from_template(template: &EntryTemplate, context: &ResolveContext<'_>) -> Result<Self> {
        let resolve_opt = |field: &Option<String>| -> Result<Option<String>> {
            field.as_deref().map(|value| resolve(value, context)).transpose()
        };

        let mut options = Vec::with_capacity(template.options.len());

        for option in &template.options {
            match option {
                EntryOption::Bare(word) => {
                    options.push(ResolvedOption::Bare(resolve(word, context)?));
                }
                EntryOption::Pair(pairs) => {
                    // Names are literal, values carry replacement fields.
                    for (name, value) in pairs {
                        options.push(ResolvedOption::Pair {
                            name: name.clone(),
                            value: resolve(value, context)?,
                        });
                    }
                }
            }
        }

        Ok(Self {
            title: resolve_opt(&template.title)?,
            version: resolve_opt(&template.version)?,
            machine_id: resolve_opt(&template.machine_id)?,
            options,
            architecture: resolve_opt(&template.architecture)?,
            linux: resolve(&template.linux, context)?,
            initrd: template
                .initrd
                .iter()
                .map(|initrd| resolve(initrd, context))
                .collect::<Result<Vec<_>>>()?,
        })
    }

    /// Kernel command line as a flat word list.
    pub fn option_words(&self) -> Vec<String> {
        self.options
            .iter()
            .map(|option| match option {
                ResolvedOption::Bare(word) => word.clone(),
                ResolvedOption::Pair { name, value } => format!("{}={}", name, value),
            })
            .collect()
    }
}

/// Outcome of removing a boot entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryRemoval {
    Removed,
    /// The entry was already gone; deletion paths treat this as success
    NotFound,
}

/// Boot loader capability set
pub trait BootLoader: Send + Sync {
    /// Stable entry identity for a snapshot number. `remove_entry` accepts
    /// this id even after a restart.
    fn entry_id(&self, number: u64) -> String;

    /// Persist the entry, returning its id.
    fn create_entry(&self, number: u64, entry: &BootEntry) -> Result<String>;

    /// Remove the entry with the given id.
    fn remove_entry(&self, entry_id: &str) -> Result<EntryRemoval>;
}

/// Open the configured boot loader backend.
pub fn open_loader(name: &str, mount_point: &Path, boot_on_root: bool) -> Result<Box<dyn BootLoader>> {
    match name {
        "grub" => Ok(Box::new(GrubLoader::open(mount_point, boot_on_root)?)),
        "systemd-boot" => Ok(Box::new(SystemdBootLoader::open(mount_point)?)),
        _ => Err(Error::InitError(format!("Boot loader module {} not found", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{FileSystemFacts, PartitionFacts};
    use crate::packages::Package;
    use crate::snapshot::{Snapshot, SnapshotKind};
    use std::collections::BTreeMap;

    fn template() -> EntryTemplate {
        serde_json::from_str(
            r#"{
                "title": "Snapshot {snapshot.number}",
                "version": "{linux.version}",
                "machine_id": "{machine_id}",
                "options": [
                    {"root": "UUID={root_file_system.uuid}"},
                    {"rootflags": "subvol=/.bootenvs/{snapshot.number}"},
                    "rw"
                ],
                "linux": "/{machine_id}/{linux.version}/vmlinuz-linux",
                "initrd": ["/{machine_id}/{linux.version}/initramfs-linux.img"]
            }"#,
        )
        .unwrap()
    }

    fn facts() -> (Snapshot, Package, FileSystemFacts, PartitionFacts) {
        (
            Snapshot {
                number: 7,
                kind: SnapshotKind::Single,
                pre_number: None,
                date: None,
                user: "root".to_string(),
                description: String::new(),
                cleanup_algorithm: "number".to_string(),
                userdata: BTreeMap::new(),
            },
            Package { name: "linux".to_string(), version: "6.8.2".to_string() },
            FileSystemFacts {
                fstype: "btrfs".to_string(),
                subvol: None,
                uuid: Some("aaaa-bbbb".to_string()),
            },
            PartitionFacts::default(),
        )
    }

    #[test]
    fn resolves_template_preserving_option_shape() {
        let (snapshot, linux, file_system, partition) = facts();
        let context = ResolveContext {
            snapshot: &snapshot,
            linux: &linux,
            machine_id: "m-id",
            architecture: Some("X64"),
            root_file_system: &file_system,
            root_partition: &partition,
        };

        let entry = BootEntry::from_template(&template(), &context).unwrap();
        assert_eq!(entry.title.as_deref(), Some("Snapshot 7"));
        assert_eq!(entry.linux, "/m-id/6.8.2/vmlinuz-linux");
        assert_eq!(entry.options.len(), 3);
        assert!(matches!(entry.options[2], ResolvedOption::Bare(ref word) if word == "rw"));
        assert_eq!(
            entry.option_words(),
            vec![
                "root=UUID=aaaa-bbbb".to_string(),
                "rootflags=subvol=/.bootenvs/7".to_string(),
                "rw".to_string()
            ]
        );
    }

    #[test]
    fn unresolved_field_aborts_whole_entry() {
        let (snapshot, linux, mut file_system, partition) = facts();
        file_system.uuid = None;
        let context = ResolveContext {
            snapshot: &snapshot,
            linux: &linux,
            machine_id: "m-id",
            architecture: None,
            root_file_system: &file_system,
            root_partition: &partition,
        };

        assert!(matches!(
            BootEntry::from_template(&template(), &context),
            Err(Error::UnresolvedField(_))
        ));
    }

    #[test]
    fn unknown_loader_name_is_rejected() {
        let result = open_loader("lilo", Path::new("/boot"), false);
        assert!(matches!(result, Err(Error::InitError(_))));
    }
}
