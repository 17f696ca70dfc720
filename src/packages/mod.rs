// src/packages/mod.rs

//! Package database backends
//!
//! The engine needs two answers from the host's package database: which
//! kernel package (name and version) is installed, and whether a given
//! package counts as important. Backends read the native database files
//! under an arbitrary root so that the database inside a boot environment
//! can be inspected the same way as the running system's.

mod alpm;
mod dpkg;

pub use alpm::AlpmDatabase;
pub use dpkg::DpkgDatabase;

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::path::Path;

/// An installed package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub version: String,
}

/// Read-only package database interface
pub trait PackageDatabase: Send + Sync {
    /// All installed packages matching `name`. Kernel packages may carry a
    /// version suffix in their name (dpkg), so more than one can match.
    /// Fails with `NotFound` when nothing matches.
    fn packages_by_name(&self, name: &str) -> Result<Vec<Package>>;

    /// The installed kernel package (name and version).
    fn kernel_info(&self) -> Result<Package>;

    /// Whether `package` is in the configured important set and installed.
    fn is_important(&self, package: &str) -> bool;
}

/// Shared important-set check used by both backends.
pub(crate) fn important_and_installed(
    database: &dyn PackageDatabase,
    important: &BTreeSet<String>,
    package: &str,
) -> bool {
    important.contains(package) && database.packages_by_name(package).is_ok()
}

/// Open the configured package database backend.
pub fn open_database(
    name: &str,
    root: &Path,
    kernel_package: &str,
    important: &[String],
) -> Result<Box<dyn PackageDatabase>> {
    let important: BTreeSet<String> = important.iter().cloned().collect();

    match name {
        "alpm" => Ok(Box::new(AlpmDatabase::open(root, kernel_package, important)?)),
        "dpkg" => Ok(Box::new(DpkgDatabase::open(root, kernel_package, important)?)),
        _ => Err(Error::InitError(format!("Package database module {} not found", name))),
    }
}
