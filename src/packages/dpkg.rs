// src/packages/dpkg.rs

//! dpkg status database backend
//!
//! Reads `<root>/var/lib/dpkg/status` directly. Debian kernel packages are
//! versioned in the package name (`linux-image-6.1.0-9-amd64`), so a query
//! for the configured kernel name also matches name-with-version variants.

use crate::error::{Error, Result};
use crate::packages::{important_and_installed, Package, PackageDatabase};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct DpkgDatabase {
    path: PathBuf,
    kernel_package: String,
    important: BTreeSet<String>,
}

impl DpkgDatabase {
    /// Open the dpkg database under `root`.
    pub fn open(root: &Path, kernel_package: &str, important: BTreeSet<String>) -> Result<Self> {
        let path = root.join("var/lib/dpkg");

        if !path.exists() {
            return Err(Error::InitError(format!(
                "Local dpkg package database {} does not exist",
                path.display()
            )));
        }

        Ok(Self { path, kernel_package: kernel_package.to_string(), important })
    }

    fn matches(&self, buffer: &str, name: &str) -> Result<Vec<Package>> {
        // `name` itself or `name-<version suffix>` (e.g. linux-image-6.1.0-9-amd64)
        let pattern = format!(
            r"(?s)Package: (?P<name>{}(-\d[\w\-\.]+)?)\s+Status: (?P<status>[\w ]+)\s+.*?Version: (?P<version>[\w\-\.\+~:]+)\s+",
            regex::escape(name)
        );
        let re = Regex::new(&pattern)
            .map_err(|e| Error::ParseError(format!("Invalid package name pattern: {}", e)))?;

        let mut result = Vec::new();

        for capture in re.captures_iter(buffer) {
            let status = &capture["status"];

            if status.split(' ').any(|word| word == "installed") {
                result.push(Package {
                    name: capture["name"].to_string(),
                    version: capture["version"].to_string(),
                });
            }
        }

        Ok(result)
    }
}

impl PackageDatabase for DpkgDatabase {
    fn packages_by_name(&self, name: &str) -> Result<Vec<Package>> {
        let status = self.path.join("status");
        let buffer = fs::read_to_string(&status)?;

        let result = self.matches(&buffer, name)?;

        if result.is_empty() {
            return Err(Error::NotFound(format!("Package {} not found in dpkg database", name)));
        }

        debug!(name, count = result.len(), "Queried dpkg database");
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

    const STATUS: &str = "\
Package: linux-image-amd64
Status: install ok installed
Priority: optional
Section: kernel
Maintainer: Debian Kernel Team
Architecture: amd64
Version: 6.1.76-1

Package: linux-image-6.1.0-9-amd64
Status: install ok installed
Priority: optional
Section: kernel
Architecture: amd64
Version: 6.1.27-1

Package: removed-kernel
Status: deinstall ok config-files
Section: kernel
Version: 5.10.0-1

Package: systemd
Status: install ok installed
Section: admin
Version: 252.22-1~deb12u1
";

    fn database(root: &Path, status: &str) -> DpkgDatabase {
        let dir = root.join("var/lib/dpkg");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("status"), status).unwrap();
        DpkgDatabase::open(root, "linux-image-amd64", ["linux-image-amd64".to_string()].into_iter().collect())
            .unwrap()
    }

    #[test]
    fn missing_database_directory_fails_open() {
        let root = TempDir::new().unwrap();
        let result = DpkgDatabase::open(root.path(), "linux-image-amd64", BTreeSet::new());
        assert!(matches!(result, Err(Error::InitError(_))));
    }

    #[test]
    fn matches_name_and_versioned_variants() {
        let root = TempDir::new().unwrap();
        let database = database(root.path(), STATUS);

        let packages = database.packages_by_name("linux-image-amd64").unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].version, "6.1.76-1");

        let versioned = database.packages_by_name("linux-image").unwrap();
        assert_eq!(versioned.len(), 1);
        assert_eq!(versioned[0].name, "linux-image-6.1.0-9-amd64");
    }

    #[test]
    fn deinstalled_packages_are_ignored() {
        let root = TempDir::new().unwrap();
        let database = database(root.path(), STATUS);
        assert!(matches!(database.packages_by_name("removed-kernel"), Err(Error::NotFound(_))));
    }

    #[test]
    fn kernel_info_uses_configured_package() {
        let root = TempDir::new().unwrap();
        let database = database(root.path(), STATUS);
        let kernel = database.kernel_info().unwrap();
        assert_eq!(kernel.name, "linux-image-amd64");
        assert_eq!(kernel.version, "6.1.76-1");
    }

    #[test]
    fn important_requires_configured_and_installed() {
        let root = TempDir::new().unwrap();
        let database = database(root.path(), STATUS);
        assert!(database.is_important("linux-image-amd64"));
        assert!(!database.is_important("systemd"));
    }
}
