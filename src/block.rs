// src/block.rs

//! Block device facts for the boot entry context
//!
//! Queries `findmnt` and `lsblk` (JSON output) for the facts the entry
//! template can reference: root filesystem type/subvolume/UUID and root
//! partition path/UUID/partition table type. Both tools are queried once per
//! lifecycle operation and the results frozen into the resolve context, so a
//! template never sees two different answers for the same field.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Facts about a mounted filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemFacts {
    pub fstype: String,
    /// Btrfs subvolume mounted here, if any (`subvol=` mount option)
    pub subvol: Option<PathBuf>,
    pub uuid: Option<String>,
}

/// Facts about the partition backing a mounted filesystem
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionFacts {
    pub path: Option<String>,
    pub uuid: Option<String>,
    pub table_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FindmntOutput {
    filesystems: Vec<FindmntFilesystem>,
}

#[derive(Debug, Deserialize)]
struct FindmntFilesystem {
    fstype: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    options: String,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    pttype: Option<String>,
    #[serde(default, rename = "type")]
    device_type: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

fn run_json_tool(tool: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| Error::InitError(format!("Failed to run {}: {}", tool, e)))?;

    if !output.status.success() {
        return Err(Error::ExternalFailure(format!(
            "{} failed: {}",
            tool,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl FileSystemFacts {
    /// Query `findmnt` for the filesystem mounted at `mount_point`.
    pub fn probe(mount_point: &Path) -> Result<Self> {
        let buffer = run_json_tool(
            "findmnt",
            &[
                &mount_point.display().to_string(),
                "-J",
                "-o",
                "TARGET,FSTYPE,UUID,OPTIONS",
            ],
        )?;
        let facts = Self::parse(&buffer)?;
        debug!(mount_point = %mount_point.display(), fstype = %facts.fstype, "Probed filesystem");
        Ok(facts)
    }

    fn parse(buffer: &str) -> Result<Self> {
        let output: FindmntOutput = serde_json::from_str(buffer)?;
        let fs = output
            .filesystems
            .into_iter()
            .next()
            .ok_or_else(|| Error::ParseError("findmnt returned no filesystems".to_string()))?;

        let subvol = fs
            .options
            .split(',')
            .find_map(|option| option.strip_prefix("subvol="))
            .map(PathBuf::from);

        Ok(Self { fstype: fs.fstype, subvol, uuid: fs.uuid })
    }
}

impl PartitionFacts {
    /// Query `lsblk` for the partition backing the filesystem at `mount_point`.
    ///
    /// With Btrfs subvolumes lsblk cannot be trusted to report mount points,
    /// so the partition is located by matching the filesystem UUID instead.
    pub fn probe(mount_point: &Path) -> Result<Self> {
        let file_system = FileSystemFacts::probe(mount_point)?;
        let Some(uuid) = file_system.uuid else {
            return Ok(Self::default());
        };

        let buffer = run_json_tool("lsblk", &["-J", "-o", "NAME,PATH,UUID,PTTYPE,TYPE"])?;
        Self::parse(&buffer, &uuid)
    }

    fn parse(buffer: &str, file_system_uuid: &str) -> Result<Self> {
        let output: LsblkOutput = serde_json::from_str(buffer)?;
        let mut found: Option<&LsblkDevice> = None;

        for device in &output.blockdevices {
            if let Some(partition) = find_partition(device, file_system_uuid, None) {
                found = Some(partition);
                break;
            }
        }

        Ok(match found {
            Some(partition) => Self {
                path: partition.path.clone(),
                uuid: partition.uuid.clone(),
                table_type: partition.pttype.clone(),
            },
            None => Self::default(),
        })
    }
}

/// Depth-first search for the partition whose subtree contains the device
/// with the given filesystem UUID. The most recently seen `part` node on the
/// path down is the answer (the UUID may belong to the partition itself or to
/// a device stacked on top of it).
fn find_partition<'a>(
    device: &'a LsblkDevice,
    file_system_uuid: &str,
    inherited: Option<&'a LsblkDevice>,
) -> Option<&'a LsblkDevice> {
    let current = if device.device_type.as_deref() == Some("part") {
        Some(device)
    } else {
        inherited
    };

    if device.uuid.as_deref() == Some(file_system_uuid) {
        return current;
    }

    for child in &device.children {
        if let Some(partition) = find_partition(child, file_system_uuid, current) {
            return Some(partition);
        }
    }

    None
}

/// EFI architecture identifier for the running machine, per the UEFI
/// specification's short names.
pub fn efi_architecture() -> Option<&'static str> {
    match std::env::consts::ARCH {
        "x86_64" => Some("X64"),
        "x86" => Some("IA32"),
        "aarch64" => Some("AA64"),
        "arm" => Some("ARM"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_findmnt_output_with_subvolume() {
        let buffer = r#"{
            "filesystems": [
                {"target": "/", "fstype": "btrfs", "uuid": "aaaa-bbbb",
                 "options": "rw,relatime,subvol=/@"}
            ]
        }"#;
        let facts = FileSystemFacts::parse(buffer).unwrap();
        assert_eq!(facts.fstype, "btrfs");
        assert_eq!(facts.subvol, Some(PathBuf::from("/@")));
        assert_eq!(facts.uuid.as_deref(), Some("aaaa-bbbb"));
    }

    #[test]
    fn parses_findmnt_output_without_subvolume() {
        let buffer = r#"{
            "filesystems": [
                {"target": "/boot", "fstype": "vfat", "uuid": "CCCC-DDDD", "options": "rw"}
            ]
        }"#;
        let facts = FileSystemFacts::parse(buffer).unwrap();
        assert_eq!(facts.fstype, "vfat");
        assert!(facts.subvol.is_none());
    }

    #[test]
    fn finds_partition_by_filesystem_uuid() {
        let buffer = r#"{
            "blockdevices": [
                {"name": "nvme0n1", "path": "/dev/nvme0n1", "uuid": null,
                 "pttype": "gpt", "type": "disk", "children": [
                    {"name": "nvme0n1p1", "path": "/dev/nvme0n1p1", "uuid": "CCCC-DDDD",
                     "pttype": "gpt", "type": "part"},
                    {"name": "nvme0n1p2", "path": "/dev/nvme0n1p2", "uuid": "aaaa-bbbb",
                     "pttype": "gpt", "type": "part"}
                 ]}
            ]
        }"#;
        let facts = PartitionFacts::parse(buffer, "aaaa-bbbb").unwrap();
        assert_eq!(facts.path.as_deref(), Some("/dev/nvme0n1p2"));
        assert_eq!(facts.table_type.as_deref(), Some("gpt"));
    }

    #[test]
    fn finds_partition_under_stacked_device() {
        // UUID lives on a crypt device stacked on the partition
        let buffer = r#"{
            "blockdevices": [
                {"name": "sda", "path": "/dev/sda", "uuid": null, "pttype": "dos",
                 "type": "disk", "children": [
                    {"name": "sda1", "path": "/dev/sda1", "uuid": "luks-uuid",
                     "pttype": "dos", "type": "part", "children": [
                        {"name": "root", "path": "/dev/mapper/root", "uuid": "aaaa-bbbb",
                         "pttype": null, "type": "crypt"}
                     ]}
                 ]}
            ]
        }"#;
        let facts = PartitionFacts::parse(buffer, "aaaa-bbbb").unwrap();
        assert_eq!(facts.path.as_deref(), Some("/dev/sda1"));
    }

    #[test]
    fn unknown_uuid_yields_empty_facts() {
        let buffer = r#"{"blockdevices": []}"#;
        let facts = PartitionFacts::parse(buffer, "nope").unwrap();
        assert!(facts.path.is_none());
        assert!(facts.uuid.is_none());
    }
}
