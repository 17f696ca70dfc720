// src/packages/alpm.rs

//! ALPM (pacman) local database backend
//!
//! Reads `<root>/var/lib/pacman/local/<name>-<version>/desc` files directly.
//! No pacman invocation: the database of a boot environment has to be
//! readable without chrooting into it.

use crate::error::{Error, Result};
use crate::packages::{important_and_installed, Package, PackageDatabase};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct AlpmDatabase {
    path: PathBuf,
    kernel_package: String,
    important: BTreeSet<String>,
}

impl AlpmDatabase {
    /// Open the local pacman database under `root`.
    pub fn open(root: &Path, kernel_package: &str, important: BTreeSet<String>) -> Result<Self> {
        let path = root.join("var/lib/pacman/local");

        if !path.exists() {
            return Err(Error::InitError(format!(
                "Local ALPM package database {} does not exist",
                path.display()
            )));
        }

        Ok(Self { path, kernel_package: kernel_package.to_string(), important })
    }
}

/// Extract a `%FIELD%` value from a pacman desc file.
fn desc_field<'a>(buffer: &'a str, field: &str) -> Option<&'a str> {
    let mut lines = buffer.lines();

    while let Some(line) = lines.next() {
        if line.trim() == field {
            return lines.next().map(str::trim).filter(|value| !value.is_empty());
        }
    }

    None
}

impl PackageDatabase for AlpmDatabase {
    fn packages_by_name(&self, name: &str) -> Result<Vec<Package>> {
        let mut result = Vec::new();
        let prefix = format!("{}-", name);

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let dir_name = entry.file_name();
            let dir_name = dir_name.to_string_lossy();

            // Directory names are <name>-<version>-<release>; the prefix
            // check is a cheap filter, %NAME% is authoritative ("linux-"
            // also matches "linux-firmware-...").
            if !dir_name.starts_with(&prefix) {
                continue;
            }

            let desc = entry.path().join("desc");
            let buffer = match fs::read_to_string(&desc) {
                Ok(buffer) => buffer,
                Err(_) => continue,
            };

            if desc_field(&buffer, "%NAME%") != Some(name) {
                continue;
            }

            match desc_field(&buffer, "%VERSION%") {
                Some(version) => {
                    result.push(Package { name: name.to_string(), version: version.to_string() })
                }
                None => {
                    return Err(Error::ParseError(format!(
                        "Package {} has no version in {}",
                        name,
                        desc.display()
                    )));
                }
            }
        }

        if result.is_empty() {
            return Err(Error::NotFound(format!("Package {} not found in ALPM database", name)));
        }

        debug!(name, count = result.len(), "Queried ALPM database");
        Ok(result)
    }

    fn kernel_info(&self) -> Result<Package> {
        let mut packages = self.packages_by_name(&self.kernel_package)?;
        packages.sort_by(|a, b| a.version.cmp(&b.version));
        packages.pop().ok_or_else(|| {
            Error::NotFound(format!("Kernel package {} not installed", self.kernel_package))
        })
    }

    fn is_important(&self, package: &str) -> bool {
        important_and_installed(self, &self.important, package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_package(root: &Path, dir: &str, name: &str, version: &str) {
        let package_dir = root.join("var/lib/pacman/local").join(dir);
        fs::create_dir_all(&package_dir).unwrap();
        fs::write(
            package_dir.join("desc"),
            format!("%NAME%\n{}\n\n%VERSION%\n{}\n\n%ARCH%\nx86_64\n", name, version),
        )
        .unwrap();
    }

    fn database(root: &Path) -> AlpmDatabase {
        fs::create_dir_all(root.join("var/lib/pacman/local")).unwrap();
        AlpmDatabase::open(root, "linux", ["linux".to_string()].into_iter().collect()).unwrap()
    }

    #[test]
    fn missing_database_directory_fails_open() {
        let root = TempDir::new().unwrap();
        let result =
            AlpmDatabase::open(root.path(), "linux", BTreeSet::new());
        assert!(matches!(result, Err(Error::InitError(_))));
    }

    #[test]
    fn finds_package_by_exact_name() {
        let root = TempDir::new().unwrap();
        write_package(root.path(), "linux-6.8.2.arch1-1", "linux", "6.8.2.arch1-1");
        write_package(root.path(), "linux-firmware-20240409-1", "linux-firmware", "20240409-1");

        let database = database(root.path());
        let packages = database.packages_by_name("linux").unwrap();
        assert_eq!(packages, vec![Package {
            name: "linux".to_string(),
            version: "6.8.2.arch1-1".to_string()
        }]);
    }

    #[test]
    fn kernel_info_returns_newest_version() {
        let root = TempDir::new().unwrap();
        write_package(root.path(), "linux-6.8.1-1", "linux", "6.8.1-1");
        write_package(root.path(), "linux-6.8.2-1", "linux", "6.8.2-1");

        let database = database(root.path());
        assert_eq!(database.kernel_info().unwrap().version, "6.8.2-1");
    }

    #[test]
    fn unknown_package_is_not_found() {
        let root = TempDir::new().unwrap();
        let database = database(root.path());
        assert!(matches!(database.packages_by_name("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn missing_version_is_a_parse_error() {
        let root = TempDir::new().unwrap();
        let package_dir = root.path().join("var/lib/pacman/local/linux-1");
        fs::create_dir_all(&package_dir).unwrap();
        fs::write(package_dir.join("desc"), "%NAME%\nlinux\n").unwrap();

        let database = database(root.path());
        assert!(matches!(database.packages_by_name("linux"), Err(Error::ParseError(_))));
    }

    #[test]
    fn important_requires_configured_and_installed() {
        let root = TempDir::new().unwrap();
        write_package(root.path(), "linux-6.8.2-1", "linux", "6.8.2-1");
        write_package(root.path(), "systemd-255.4-1", "systemd", "255.4-1");

        let database = database(root.path());
        assert!(database.is_important("linux"));
        // installed but not configured
        assert!(!database.is_important("systemd"));
        // configured set only contains "linux"; "nope" is neither
        assert!(!database.is_important("nope"));
    }
}
