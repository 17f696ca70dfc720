// src/boot/grub.rs

//! GRUB backend
//!
//! Entries live in a generated `grub-snapboot.cfg` fragment under
//! `<mount>/grub`, one `### BEGIN ... ###`/`### END ... ###` block per
//! snapshot inside a `submenu 'Snapshots'`. The fragment is expected to be
//! sourced from the main grub.cfg. GRUB cannot locate the kernel without
//! device coordinates, so opening the backend derives the boot partition's
//! GRUB device name (`hd0,gpt2` style) and the module list once.

use crate::block::{FileSystemFacts, PartitionFacts};
use crate::boot::{BootEntry, BootLoader, EntryRemoval};
use crate::error::{Error, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONFIG_FILE: &str = "grub-snapboot.cfg";

pub struct GrubLoader {
    path: PathBuf,
    /// GRUB device of the boot partition, e.g. "hd0,gpt2"
    root: String,
    /// Bare metal hint variant, e.g. "ahci0,gpt2"
    baremetal_root: String,
    modules: Vec<String>,
    root_file_system_uuid: String,
    boot_file_system_uuid: String,
}

/// Controller kind, drive index and partition number from a kernel block
/// device name (`sda2`, `hdb1`, `nvme0n1p3`).
fn parse_block_device(name: &str) -> Result<(&'static str, u32, u32)> {
    let ata = Regex::new(r"^(?P<controller>[hs])d(?P<drive>[a-z])(?P<partition>\d+)$").unwrap();
    let nvme = Regex::new(r"^nvme\d+n(?P<drive>\d+)p(?P<partition>\d+)$").unwrap();

    if let Some(capture) = ata.captures(name) {
        let controller = if &capture["controller"] == "h" { "ata" } else { "ahci" };
        let drive = capture["drive"].chars().next().unwrap() as u32 - 'a' as u32;
        let partition = capture["partition"].parse().unwrap();
        return Ok((controller, drive, partition));
    }

    if let Some(capture) = nvme.captures(name) {
        let drive: u32 = capture["drive"].parse().unwrap();
        let partition = capture["partition"].parse().unwrap();
        return Ok(("ahci", drive.saturating_sub(1), partition));
    }

    Err(Error::InitError(format!("Unable to determine type of device {}", name)))
}

fn partition_suffix(table_type: &str, partition: u32) -> Result<String> {
    match table_type {
        "gpt" => Ok(format!("gpt{}", partition)),
        "dos" => Ok(format!("msdos{}", partition)),
        _ => Err(Error::InitError(format!("Unrecognized partition table type {}", table_type))),
    }
}

impl GrubLoader {
    /// Open the loader for a boot partition mounted at `mount_point`.
    pub fn open(mount_point: &Path, boot_on_root: bool) -> Result<Self> {
        let path = mount_point.join("grub");

        if !path.exists() {
            return Err(Error::InitError(format!("Directory {} does not exist", path.display())));
        }

        let probe_target = if boot_on_root { Path::new("/") } else { mount_point };
        let boot_partition = PartitionFacts::probe(probe_target)?;

        let device_path = boot_partition.path.as_deref().ok_or_else(|| {
            Error::InitError(format!("No partition found for {}", probe_target.display()))
        })?;
        let device_name = device_path.rsplit('/').next().unwrap_or(device_path);
        let table_type = boot_partition.table_type.as_deref().ok_or_else(|| {
            Error::InitError(format!("No partition table type for {}", device_path))
        })?;

        let (controller, drive, partition) = parse_block_device(device_name)?;
        let suffix = partition_suffix(table_type, partition)?;

        let root_file_system = FileSystemFacts::probe(Path::new("/"))?;
        let boot_file_system = if boot_on_root {
            root_file_system.clone()
        } else {
            FileSystemFacts::probe(mount_point)?
        };

        let mut modules = vec!["gzio".to_string()];
        if table_type == "gpt" {
            modules.push("part_gpt".to_string());
        }
        match boot_file_system.fstype.as_str() {
            "btrfs" => modules.push("btrfs".to_string()),
            "vfat" => modules.push("fat".to_string()),
            _ => {}
        }

        let root_file_system_uuid = root_file_system
            .uuid
            .ok_or_else(|| Error::InitError("Root filesystem has no UUID".to_string()))?;
        let boot_file_system_uuid = boot_file_system
            .uuid
            .ok_or_else(|| Error::InitError("Boot filesystem has no UUID".to_string()))?;

        Ok(Self {
            path,
            root: format!("hd{},{}", drive, suffix),
            baremetal_root: format!("{}{},{}", controller, drive, suffix),
            modules,
            root_file_system_uuid,
            boot_file_system_uuid,
        })
    }

    fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    /// The `### ... ###` entries block from the current config, if any.
    fn read_entries(&self) -> String {
        let Ok(buffer) = fs::read_to_string(self.config_path()) else {
            return String::new();
        };

        Regex::new("(?s)###.*###")
            .unwrap()
            .find(&buffer)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    }

    fn write_entries(&self, entries: &str) -> Result<()> {
        fs::write(
            self.config_path(),
            format!("submenu 'Snapshots' {{\n    {}\n}}", entries.trim()),
        )?;
        Ok(())
    }

    fn render(&self, number: u64, entry: &BootEntry) -> String {
        let insmods = self
            .modules
            .iter()
            .map(|module| format!("        insmod {}", module))
            .collect::<Vec<_>>()
            .join("\n");
        let title = entry.title.as_deref().unwrap_or("Snapshot");
        let options = entry.option_words().join(" ");
        let initrd = entry.initrd.join(" ");

        format!(
            "    ### BEGIN Boot loader entry for snapshot {number} ###\n\
             \x20   menuentry '{title}' --class snapshots --class gnu-linux --class gnu \
             --class os $menuentry_id_option 'gnulinux-snapshots-{fs_uuid}' {{\n\
             \x20       load_video\n\
             \x20       set gfxpayload=keep\n\
             {insmods}\n\
             \x20       set root='{root}'\n\
             \x20       if [ x$feature_platform_search_hint = xy ]; then\n\
             \x20         search --no-floppy --fs-uuid --set=root --hint-bios={root} \
             --hint-efi={root} --hint-baremetal={baremetal} {boot_uuid}\n\
             \x20       else\n\
             \x20         search --no-floppy --fs-uuid --set=root {boot_uuid}\n\
             \x20       fi\n\
             \x20       echo 'Loading Linux kernel ...'\n\
             \x20       linux {linux} {options}\n\
             \x20       echo 'Loading initial ramdisk ...'\n\
             \x20       initrd {initrd}\n\
             \x20   }}\n\
             \x20   ### END Boot loader entry for snapshot {number} ###\n\n    ",
            number = number,
            title = title,
            fs_uuid = self.root_file_system_uuid,
            insmods = insmods,
            root = self.root,
            baremetal = self.baremetal_root,
            boot_uuid = self.boot_file_system_uuid,
            linux = entry.linux,
            options = options,
            initrd = initrd,
        )
    }
}

impl BootLoader for GrubLoader {
    fn entry_id(&self, number: u64) -> String {
        number.to_string()
    }

    fn create_entry(&self, number: u64, entry: &BootEntry) -> Result<String> {
        // Newest entry first, existing block appended behind it.
        let entries = format!("{}{}", self.render(number, entry), self.read_entries());
        self.write_entries(&entries)?;
        info!(number, file = %self.config_path().display(), "Added GRUB entry");
        Ok(self.entry_id(number))
    }

    fn remove_entry(&self, entry_id: &str) -> Result<EntryRemoval> {
        let file = self.config_path();

        if !file.exists() {
            return Ok(EntryRemoval::NotFound);
        }

        let entries = self.read_entries();
        let pattern = format!(
            "(?s)### BEGIN Boot loader entry for snapshot {id} ###.*### END Boot loader entry for snapshot {id} ###",
            id = regex::escape(entry_id)
        );
        let re = Regex::new(&pattern)
            .map_err(|e| Error::ParseError(format!("Invalid entry id {}: {}", entry_id, e)))?;

        if !re.is_match(&entries) {
            return Ok(EntryRemoval::NotFound);
        }

        let remaining = re.replace(&entries, "").into_owned();

        if remaining.contains("### BEGIN") {
            self.write_entries(&remaining)?;
        } else {
            fs::remove_file(&file)?;
            debug!(file = %file.display(), "Removed empty GRUB fragment");
        }

        Ok(EntryRemoval::Removed)
    }
}
