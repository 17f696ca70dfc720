// src/boot/systemd_boot.rs

//! systemd-boot backend
//!
//! One entry file per boot environment under `<mount>/loader/entries`.
//! Generated file names start with `zz` followed by the snapshot number
//! subtracted from `u64::MAX`: systemd-boot sorts entries by file name, so
//! the standard entries stay on top and the generated ones follow in reverse
//! chronological order.

use crate::boot::{BootEntry, BootLoader, EntryRemoval};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct SystemdBootLoader {
    path: PathBuf,
}

impl SystemdBootLoader {
    /// Open the loader for an ESP mounted at `mount_point`.
    pub fn open(mount_point: &Path) -> Result<Self> {
        let path = mount_point.join("loader").join("entries");

        if !path.exists() {
            return Err(Error::InitError(format!(
                "Directory {} does not exist",
                path.display()
            )));
        }

        Ok(Self { path })
    }

    fn render(entry: &BootEntry) -> String {
        let mut fields: Vec<(String, String)> = Vec::new();

        if let Some(title) = &entry.title {
            fields.push(("title".to_string(), title.clone()));
        }
        if let Some(version) = &entry.version {
            fields.push(("version".to_string(), version.clone()));
        }
        if let Some(machine_id) = &entry.machine_id {
            fields.push(("machine-id".to_string(), machine_id.clone()));
        }
        fields.push(("linux".to_string(), entry.linux.clone()));
        for initrd in &entry.initrd {
            fields.push(("initrd".to_string(), initrd.clone()));
        }
        let options = entry.option_words();
        if !options.is_empty() {
            fields.push(("options".to_string(), options.join(" ")));
        }
        if let Some(architecture) = &entry.architecture {
            fields.push(("architecture".to_string(), architecture.to_lowercase()));
        }

        let width = fields.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
        fields
            .iter()
            .map(|(name, value)| format!("{:<width$} {}", name, value, width = width))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn file_name(&self, number: u64, entry: &BootEntry) -> String {
        let mut components = vec![self.entry_id(number)];

        if let Some(machine_id) = &entry.machine_id {
            components.push(machine_id.clone());
        }
        if let Some(version) = &entry.version {
            components.push(version.clone());
        }
        if let Some(architecture) = &entry.architecture {
            components.push(architecture.clone());
        }

        format!("{}.conf", components.join("-"))
    }
}

impl BootLoader for SystemdBootLoader {
    fn entry_id(&self, number: u64) -> String {
        format!("zz-{:016x}", u64::MAX - number)
    }

    fn create_entry(&self, number: u64, entry: &BootEntry) -> Result<String> {
        let file = self.path.join(self.file_name(number, entry));
        fs::write(&file, Self::render(entry))?;
        info!(number, file = %file.display(), "Added systemd-boot entry");
        Ok(self.entry_id(number))
    }

    fn remove_entry(&self, entry_id: &str) -> Result<EntryRemoval> {
        let mut removed = false;

        for dir_entry in fs::read_dir(&self.path)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let name = name.to_string_lossy();

            if name.starts_with(entry_id) && name.ends_with(".conf") {
                fs::remove_file(dir_entry.path())?;
                debug!(file = %name, "Removed systemd-boot entry file");
                removed = true;
            }
        }

        Ok(if removed { EntryRemoval::Removed } else { EntryRemoval::NotFound })
    }
}
