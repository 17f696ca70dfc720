// src/commands.rs

//! Command implementations
//!
//! Every mutating command runs under the process lock, opens the
//! association store and finishes deferred removals before doing its own
//! work, so the first command after a rollback reboot cleans up the
//! previously active boot environment as a side effect.

use crate::assets::AssetManager;
use crate::boot::open_loader;
use crate::bootenv::{BootEnvManager, BtrfsCli};
use crate::config::Config;
use crate::error::Result;
use crate::lock::ProcessLock;
use crate::packages::{open_database, PackageDatabase};
use crate::reconciler::{Facts, Reconciler};
use crate::snapshot::{SnapperCli, SnapshotKind, SnapshotSource};
use crate::store::Store;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Fully wired application: lock held, store migrated, facts gathered.
pub struct App {
    reconciler: Reconciler,
    snapper: SnapperCli,
    database: Arc<dyn PackageDatabase>,
    _lock: ProcessLock,
}

impl App {
    pub fn build(config: &Config) -> Result<Self> {
        let lock = ProcessLock::acquire(&config.lock_file())?;
        let store = Arc::new(Store::open(&config.state_db())?);
        let facts = Facts::gather(&config.machine_id)?;

        let database: Arc<dyn PackageDatabase> = open_database(
            &config.package.database,
            Path::new("/"),
            &config.package.linux,
            &config.package.important,
        )?
        .into();

        let loader = open_loader(
            &config.boot.loader,
            &config.boot.mount_point,
            config.boot.boot_on_root,
        )?;

        let bootenvs =
            BootEnvManager::new(config.bootenv.clone(), config.snapshots.clone(), Box::new(BtrfsCli));
        let assets = AssetManager::new(config.boot.mount_point.clone(), store.clone());

        let reconciler = Reconciler::new(
            store,
            bootenvs,
            assets,
            loader,
            database.clone(),
            facts,
            config.boot.entry.clone(),
            config.boot.mount_point.clone(),
            config.boot.boot_on_root,
        );
        reconciler.check_template()?;

        let snapper = SnapperCli::new(
            &config.snapper.name,
            &config.snapper.cleanup_algorithm,
            &config.snapper.description,
        );

        Ok(Self { reconciler, snapper, database, _lock: lock })
    }
}

/// Validate the configuration end to end and set up the state directory.
pub fn init(config: &Config) -> Result<()> {
    App::build(config)?;
    println!("Configuration valid, state directory ready at {}", config.state_dir.display());
    Ok(())
}

/// Create a snapshot, then materialize its boot environment, kernel/initrd
/// asset and boot entry. `packages` is the package-manager transaction's
/// package list; the snapshot is marked important when it touches a
/// configured important package. Post snapshots inherit importance from
/// their pre instead.
pub fn create(config: &Config, kind: SnapshotKind, packages: &[String]) -> Result<()> {
    let app = App::build(config)?;
    app.reconciler.purge_pending()?;

    let important = kind != SnapshotKind::Post
        && packages.iter().any(|package| app.database.is_important(package));

    let number = app.snapper.create(kind, important)?;
    let snapshot = app.snapper.get(number)?;
    let record = app.reconciler.create(&snapshot)?;

    info!(number, important, "Created snapshot");
    println!("Created snapshot {} (boot entry {})", number, record.boot_entry_id);
    Ok(())
}

/// Sweep both directions: drop tracked associations whose snapshot is gone,
/// track snapshots that have none.
pub fn reconcile(config: &Config) -> Result<()> {
    let app = App::build(config)?;
    let purged = app.reconciler.purge_pending()?;
    let known = app.snapper.list()?;
    let removed = app.reconciler.reconcile(&known)?;

    println!(
        "Reconciled {} snapshots ({} removed, {} purged)",
        known.len(),
        removed.len(),
        purged.len()
    );
    Ok(())
}

/// Print tracked associations. Read-only, no lock or probing needed.
pub fn list(config: &Config) -> Result<()> {
    let store = Store::open(&config.state_db())?;
    let records = store.list()?;

    if records.is_empty() {
        println!("No tracked snapshots");
        return Ok(());
    }

    println!(
        "{:<10} {:<12} {:<24} {:<40} {}",
        "SNAPSHOT", "BOOTENV", "BOOT ENTRY", "ASSET", "STATE"
    );
    for record in records {
        println!(
            "{:<10} {:<12} {:<24} {:<40} {}",
            record.snapshot_number,
            record.bootenv_id,
            record.boot_entry_id,
            record.asset_key,
            record.state.as_str()
        );
    }
    Ok(())
}
