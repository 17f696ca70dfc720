// src/lib.rs

//! Bootable Btrfs snapshots with reconciled boot loader entries
//!
//! Snapboot turns read-only snapper snapshots into bootable systems: for
//! every snapshot it clones a writable boot environment subvolume, copies
//! the matching kernel and initrd images to the boot partition and writes a
//! boot loader entry. A durable association store records what belongs to
//! which snapshot, and a reconciler keeps the two worlds in sync in both
//! directions, rolling partial creations back and deferring deletions that
//! would pull the running root out from under the system.
//!
//! # Architecture
//!
//! - Store-first: all associations and asset reference counts in SQLite
//! - Idempotent steps: crash recovery is re-running the sweep, no journal
//! - Pluggable edges: boot loaders, package databases and subvolume
//!   operations behind traits

pub mod assets;
pub mod block;
pub mod boot;
pub mod bootenv;
pub mod cli;
pub mod commands;
pub mod config;
mod error;
pub mod lock;
pub mod packages;
pub mod reconciler;
pub mod snapshot;
pub mod store;
pub mod template;

pub use config::Config;
pub use error::{Error, Result};
pub use reconciler::{Facts, Reconciler};
pub use snapshot::{Snapshot, SnapshotKind, SnapshotSource};
pub use store::{AssociationRecord, RecordState, Store};
