// src/reconciler.rs

//! Lifecycle reconciler
//!
//! The orchestrator that keeps snapshots, boot environments, boot entries
//! and kernel/initrd assets in correspondence. Creation runs environment,
//! asset, entry, record and rolls completed steps back on failure, so an
//! interrupted chain leaves no record and is simply retried by the next
//! sweep. Deletion runs entry, environment, asset, record, where the
//! environment step may defer (active root), in which case the asset and
//! record steps defer with it: an asset pinned by a pending environment is
//! never released, and a record is only deleted once the environment is
//! actually gone.
//!
//! Crash recovery is the dual-direction sweep itself. Every step is
//! individually idempotent and the store is the single source of truth, so
//! no journal is needed.

use crate::assets::{copy_plan, AssetManager};
use crate::block::{self, FileSystemFacts, PartitionFacts};
use crate::boot::{BootEntry, BootLoader};
use crate::bootenv::{BootEnvManager, Removal};
use crate::config::EntryTemplate;
use crate::error::{Error, Result};
use crate::packages::PackageDatabase;
use crate::snapshot::{Snapshot, SnapshotKind};
use crate::store::{AssociationRecord, RecordState, Store};
use crate::template::ResolveContext;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Machine facts frozen at startup, the non-snapshot half of every resolve
/// context
#[derive(Debug, Clone)]
pub struct Facts {
    pub machine_id: String,
    pub architecture: Option<String>,
    pub root_file_system: FileSystemFacts,
    pub root_partition: PartitionFacts,
}

impl Facts {
    /// Gather machine facts: machine id file, EFI architecture, root
    /// filesystem and partition.
    pub fn gather(machine_id_path: &Path) -> Result<Self> {
        let machine_id = std::fs::read_to_string(machine_id_path)
            .map_err(|e| {
                Error::InitError(format!(
                    "Machine ID file {} not readable: {}",
                    machine_id_path.display(),
                    e
                ))
            })?
            .trim()
            .to_string();

        Ok(Self {
            machine_id,
            architecture: block::efi_architecture().map(str::to_string),
            root_file_system: FileSystemFacts::probe(Path::new("/"))?,
            root_partition: PartitionFacts::probe(Path::new("/"))?,
        })
    }
}

/// Outcome of one deletion cleanup
#[derive(Debug, Clone, PartialEq, Eq)]
enum Cleanup {
    Removed(AssociationRecord),
    Deferred,
}

pub struct Reconciler {
    store: Arc<Store>,
    bootenvs: BootEnvManager,
    assets: AssetManager,
    loader: Box<dyn BootLoader>,
    database: Arc<dyn PackageDatabase>,
    facts: Facts,
    template: EntryTemplate,
    mount_point: PathBuf,
    boot_on_root: bool,
    /// Snapshot numbers with a lifecycle operation in flight
    in_flight: Mutex<HashSet<u64>>,
}

/// Removes its snapshot number from the in-flight set on drop
struct InFlight<'a> {
    set: &'a Mutex<HashSet<u64>>,
    number: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.number);
    }
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        bootenvs: BootEnvManager,
        assets: AssetManager,
        loader: Box<dyn BootLoader>,
        database: Arc<dyn PackageDatabase>,
        facts: Facts,
        template: EntryTemplate,
        mount_point: PathBuf,
        boot_on_root: bool,
    ) -> Self {
        Self {
            store,
            bootenvs,
            assets,
            loader,
            database,
            facts,
            template,
            mount_point,
            boot_on_root,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// At most one lifecycle operation per snapshot number.
    fn begin(&self, number: u64) -> Result<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap();

        if !set.insert(number) {
            return Err(Error::ResourceConflict(format!(
                "Lifecycle operation for snapshot {} already in flight",
                number
            )));
        }

        Ok(InFlight { set: &self.in_flight, number })
    }

    fn context<'a>(
        &'a self,
        snapshot: &'a Snapshot,
        linux: &'a crate::packages::Package,
    ) -> ResolveContext<'a> {
        ResolveContext {
            snapshot,
            linux,
            machine_id: &self.facts.machine_id,
            architecture: self.facts.architecture.as_deref(),
            root_file_system: &self.facts.root_file_system,
            root_partition: &self.facts.root_partition,
        }
    }

    /// Resolve the configured entry template against a dummy snapshot so an
    /// invalid replacement field surfaces at startup, not mid-operation.
    pub fn check_template(&self) -> Result<()> {
        let dummy = Snapshot {
            number: 0,
            kind: SnapshotKind::Single,
            pre_number: Some(0),
            date: Some(chrono::NaiveDateTime::default()),
            user: String::new(),
            description: String::new(),
            cleanup_algorithm: String::new(),
            userdata: BTreeMap::new(),
        };
        let linux = self.database.kernel_info()?;

        BootEntry::from_template(&self.template, &self.context(&dummy, &linux)).map_err(|e| {
            Error::InitError(format!("Invalid replacement field in boot entry configuration: {}", e))
        })?;
        Ok(())
    }

    /// Materialize boot environment, asset and boot entry for a snapshot
    /// and persist the association. Any failure after the first mutation
    /// rolls the completed steps back; no record is written for an
    /// incomplete chain.
    pub fn create(&self, snapshot: &Snapshot) -> Result<AssociationRecord> {
        let number = snapshot.number;
        let _guard = self.begin(number)?;

        if let Some(existing) = self.store.get(number)? {
            debug!(number, "Snapshot already tracked");
            return Ok(existing);
        }

        // Resolve everything before the first mutation.
        let linux = self.database.kernel_info()?;
        let context = self.context(snapshot, &linux);
        let entry = BootEntry::from_template(&self.template, &context)?;
        let plan = copy_plan(
            &self.template,
            &entry,
            &self.mount_point,
            self.boot_on_root,
            self.facts.root_file_system.subvol.as_deref(),
        );
        let asset_key = AssetManager::key(&self.facts.machine_id, &linux.version);

        // Step 1: boot environment. A conflict means a previous interrupted
        // run already created it; adopt it instead of failing.
        let (bootenv_id, bootenv_created) = match self.bootenvs.create_from(number) {
            Ok(id) => (id, true),
            Err(Error::ResourceConflict(_)) => {
                warn!(number, "Adopting existing boot environment");
                (self.bootenvs.id(number), false)
            }
            Err(e) => return Err(e),
        };

        // Step 2: kernel/initrd asset.
        if let Err(e) = self.assets.ensure(&asset_key, &plan) {
            self.rollback(number, None, None, bootenv_created.then_some(bootenv_id.as_str()));
            return Err(e);
        }

        // Step 3: boot entry.
        let boot_entry_id = match self.loader.create_entry(number, &entry) {
            Ok(id) => id,
            Err(e) => {
                self.rollback(
                    number,
                    None,
                    Some(asset_key.as_str()),
                    bootenv_created.then_some(bootenv_id.as_str()),
                );
                return Err(e);
            }
        };

        // Step 4: the association record, last.
        let record = AssociationRecord {
            snapshot_number: number,
            bootenv_id,
            boot_entry_id,
            asset_key,
            state: RecordState::Alive,
        };

        if let Err(e) = self.store.insert(&record) {
            self.rollback(
                number,
                Some(record.boot_entry_id.as_str()),
                Some(record.asset_key.as_str()),
                bootenv_created.then_some(record.bootenv_id.as_str()),
            );
            return Err(e);
        }

        info!(number, asset = %record.asset_key, "Snapshot tracked");
        Ok(record)
    }

    /// Undo completed creation steps, newest first: entry, asset reference,
    /// boot environment. Rollback failures are logged, never propagated;
    /// the sweep retries the snapshot either way.
    fn rollback(
        &self,
        number: u64,
        boot_entry_id: Option<&str>,
        asset_key: Option<&str>,
        bootenv_id: Option<&str>,
    ) {
        warn!(number, "Rolling back partial snapshot tracking");

        if let Some(id) = boot_entry_id
            && let Err(e) = self.loader.remove_entry(id)
        {
            error!(number, "Rollback of boot entry failed: {}", e);
        }

        if let Some(key) = asset_key
            && let Err(e) = self.assets.release(key)
        {
            error!(number, "Rollback of asset reference failed: {}", e);
        }

        if let Some(id) = bootenv_id {
            match self.bootenvs.remove(id) {
                Ok(Removal::Removed) | Ok(Removal::NotFound) => {}
                Ok(Removal::Deferred) => {
                    // Freshly created, cannot be the active root.
                    error!(number, "Rollback of boot environment deferred unexpectedly");
                }
                Err(e) => error!(number, "Rollback of boot environment failed: {}", e),
            }
        }
    }

    /// Deletion cleanup for one stale record: entry, then environment (or
    /// defer), then asset and record.
    fn cleanup(&self, record: &AssociationRecord) -> Result<Cleanup> {
        let number = record.snapshot_number;
        let _guard = self.begin(number)?;

        // Entry first; already-gone is success.
        self.loader.remove_entry(&record.boot_entry_id)?;

        match self.bootenvs.remove(&record.bootenv_id)? {
            Removal::Removed | Removal::NotFound => {
                self.assets.release(&record.asset_key)?;
                self.store.delete(number)?;
                info!(number, "Snapshot untracked");
                Ok(Cleanup::Removed(record.clone()))
            }
            Removal::Deferred => {
                // The environment still needs its kernel; keep the asset
                // reference and the record until the next startup purge.
                if record.state != RecordState::Pending {
                    self.store.mark_pending(number)?;
                    info!(number, "Snapshot removal deferred to next startup");
                }
                Ok(Cleanup::Deferred)
            }
        }
    }

    /// The dual-direction sweep: tear down every stored association whose
    /// snapshot is gone, create one for every known snapshot that has none.
    /// Individual failures are logged and retried on the next pass; nothing
    /// tracked is ever silently dropped.
    pub fn reconcile(&self, known: &[Snapshot]) -> Result<Vec<AssociationRecord>> {
        let by_number: BTreeMap<u64, &Snapshot> =
            known.iter().map(|snapshot| (snapshot.number, snapshot)).collect();
        let mut removed = Vec::new();

        for record in self.store.list()? {
            if by_number.contains_key(&record.snapshot_number) {
                continue;
            }

            match self.cleanup(&record) {
                Ok(Cleanup::Removed(record)) => removed.push(record),
                Ok(Cleanup::Deferred) => {}
                Err(e) => {
                    error!(number = record.snapshot_number, "Cleanup failed, will retry: {}", e);
                }
            }
        }

        for snapshot in known {
            if self.store.get(snapshot.number)?.is_some() {
                continue;
            }

            if let Err(e) = self.create(snapshot) {
                error!(number = snapshot.number, "Tracking failed, will retry: {}", e);
            }
        }

        self.sweep_orphan_bootenvs()?;

        Ok(removed)
    }

    /// Delete boot environments no record references. Interrupted creation
    /// chains are usually adopted by `create`; anything left over here has
    /// neither a snapshot nor a record behind it.
    fn sweep_orphan_bootenvs(&self) -> Result<()> {
        let tracked: HashSet<String> =
            self.store.list()?.into_iter().map(|record| record.bootenv_id).collect();

        for id in self.bootenvs.list()? {
            if tracked.contains(&id) {
                continue;
            }

            match self.bootenvs.remove(&id) {
                Ok(Removal::Removed) => warn!(id = %id, "Removed orphan boot environment"),
                Ok(Removal::NotFound) => {}
                Ok(Removal::Deferred) => {
                    warn!(id = %id, "Orphan boot environment is the active root, leaving it");
                }
                Err(e) => error!(id = %id, "Orphan boot environment removal failed: {}", e),
            }
        }

        Ok(())
    }

    /// Finish deferred removals. Run once per startup, before any other
    /// reconciliation: every pending boot environment that is no longer the
    /// active root is deleted, its asset reference dropped and its record
    /// removed.
    pub fn purge_pending(&self) -> Result<Vec<AssociationRecord>> {
        let mut removed = Vec::new();

        for record in self.store.list_pending()? {
            let number = record.snapshot_number;
            let _guard = self.begin(number)?;

            match self.bootenvs.remove(&record.bootenv_id) {
                Ok(Removal::Removed) | Ok(Removal::NotFound) => {
                    if let Err(e) = self.assets.release(&record.asset_key) {
                        error!(number, "Deferred asset release failed, will retry: {}", e);
                        continue;
                    }
                    self.store.delete(number)?;
                    info!(number, "Purged pending boot environment");
                    removed.push(record);
                }
                Ok(Removal::Deferred) => {
                    debug!(number, "Boot environment still active, keeping pending");
                }
                Err(e) => {
                    error!(number, "Deferred removal failed, will retry: {}", e);
                }
            }
        }

        Ok(removed)
    }
}
