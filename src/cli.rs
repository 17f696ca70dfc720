// src/cli.rs

//! Command-line interface definitions
//!
//! Command implementations live in the `commands` module. The binary is
//! meant to be driven by package-manager hooks (`create --type pre` /
//! `--type post` with the transaction's package list on stdin) but every
//! command works interactively too.

use crate::snapshot::SnapshotKind;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "snapboot")]
#[command(version)]
#[command(about = "Bootable Btrfs snapshots with reconciled boot loader entries", long_about = None)]
pub struct Cli {
    /// Configuration file (default: <XDG_CONFIG_DIRS>/snapboot/snapboot.conf)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration and set up the state directory
    Init,

    /// Create a snapshot with its boot environment and boot entry
    Create {
        /// Snapshot type
        #[arg(short = 't', long = "type", value_enum, default_value_t = KindArg::Single)]
        kind: KindArg,
    },

    /// Reconcile boot environments against the current snapshot set
    Reconcile,

    /// List tracked snapshot associations
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Pre,
    Post,
    Single,
}

impl From<KindArg> for SnapshotKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Pre => SnapshotKind::Pre,
            KindArg::Post => SnapshotKind::Post,
            KindArg::Single => SnapshotKind::Single,
        }
    }
}
