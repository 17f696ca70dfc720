// src/store.rs

//! Association store
//!
//! The only state this engine persists outside the resources it manages:
//! one record per tracked snapshot linking it to its boot environment, boot
//! entry and asset key, plus the durable per-asset reference counts. Every
//! update is a single-row SQLite statement, so a crash can never corrupt an
//! unrelated record; anything interrupted mid-chain is healed by the
//! reconciler's dual-direction sweep, not by a journal.

use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info};

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

/// Lifecycle state of an association record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// All three resources exist
    Alive,
    /// Entry removed, environment in use; purge finishes the job next boot
    Pending,
}

impl RecordState {
    pub fn as_str(&self) -> &str {
        match self {
            RecordState::Alive => "alive",
            RecordState::Pending => "pending",
        }
    }
}

impl FromStr for RecordState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "alive" => Ok(RecordState::Alive),
            "pending" => Ok(RecordState::Pending),
            _ => Err(Error::ParseError(format!("Invalid record state: {}", s))),
        }
    }
}

/// The durable linkage between a snapshot and its derived resources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationRecord {
    pub snapshot_number: u64,
    pub bootenv_id: String,
    pub boot_entry_id: String,
    pub asset_key: String,
    pub state: RecordState,
}

/// SQLite-backed association store
pub struct Store {
    conn: Mutex<Connection>,
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current + 1)..=SCHEMA_VERSION {
        info!(version, "Applying association store migration");
        match version {
            1 => migrate_v1(conn)?,
            _ => {
                return Err(Error::InitError(format!("Unknown schema version {}", version)));
            }
        }
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- One record per tracked snapshot
        CREATE TABLE associations (
            snapshot_number INTEGER PRIMARY KEY,
            bootenv_id      TEXT NOT NULL,
            boot_entry_id   TEXT NOT NULL,
            asset_key       TEXT NOT NULL,
            state           TEXT NOT NULL DEFAULT 'alive'
                            CHECK(state IN ('alive', 'pending')),
            created_at      TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX idx_associations_asset ON associations(asset_key);
        CREATE INDEX idx_associations_state ON associations(state);

        -- Shared kernel/initrd assets, reference counted
        CREATE TABLE assets (
            key      TEXT PRIMARY KEY,
            refcount INTEGER NOT NULL CHECK(refcount >= 0),
            files    TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(u64, String, String, String, String)> {
    Ok((
        row.get::<_, i64>(0)? as u64,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn into_record(raw: (u64, String, String, String, String)) -> Result<AssociationRecord> {
    Ok(AssociationRecord {
        snapshot_number: raw.0,
        bootenv_id: raw.1,
        boot_entry_id: raw.2,
        asset_key: raw.3,
        state: raw.4.parse()?,
    })
}

impl Store {
    /// Open (and migrate) the store at `path`, creating parents as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;

        debug!(path = %path.display(), "Opened association store");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Write a new association record (state `alive`).
    pub fn insert(&self, record: &AssociationRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO associations
                 (snapshot_number, bootenv_id, boot_entry_id, asset_key, state)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.snapshot_number as i64,
                record.bootenv_id,
                record.boot_entry_id,
                record.asset_key,
                record.state.as_str(),
            ],
        )?;

        if inserted == 0 {
            return Err(Error::ResourceConflict(format!(
                "Association record for snapshot {} already exists",
                record.snapshot_number
            )));
        }

        Ok(())
    }

    /// Look up the record for a snapshot number.
    pub fn get(&self, snapshot_number: u64) -> Result<Option<AssociationRecord>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                "SELECT snapshot_number, bootenv_id, boot_entry_id, asset_key, state
                 FROM associations WHERE snapshot_number = ?1",
                [snapshot_number as i64],
                row_to_record,
            )
            .optional()?;

        raw.map(into_record).transpose()
    }

    /// All records, ordered by snapshot number.
    pub fn list(&self) -> Result<Vec<AssociationRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT snapshot_number, bootenv_id, boot_entry_id, asset_key, state
             FROM associations ORDER BY snapshot_number",
        )?;
        let rows = statement.query_map([], row_to_record)?;

        rows.map(|raw| into_record(raw?)).collect()
    }

    /// All records currently marked pending-deletion.
    pub fn list_pending(&self) -> Result<Vec<AssociationRecord>> {
        Ok(self.list()?.into_iter().filter(|r| r.state == RecordState::Pending).collect())
    }

    /// Flip a record to pending-deletion.
    pub fn mark_pending(&self, snapshot_number: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE associations SET state = 'pending' WHERE snapshot_number = ?1",
            [snapshot_number as i64],
        )?;

        if updated == 0 {
            return Err(Error::NotFound(format!(
                "No association record for snapshot {}",
                snapshot_number
            )));
        }

        Ok(())
    }

    /// Delete a record. Deleting an absent record is a no-op (idempotent
    /// deletion paths).
    pub fn delete(&self, snapshot_number: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM associations WHERE snapshot_number = ?1",
            [snapshot_number as i64],
        )?;
        Ok(())
    }

    /// Record one more reference to an asset, creating it with the given
    /// file list on first reference. Returns (refcount, was_created).
    pub fn asset_acquire(&self, key: &str, files: &[PathBuf]) -> Result<(i64, bool)> {
        let files_json = serde_json::to_string(
            &files.iter().map(|file| file.display().to_string()).collect::<Vec<_>>(),
        )?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO assets (key, refcount, files) VALUES (?1, 1, ?2)
             ON CONFLICT(key) DO UPDATE SET refcount = refcount + 1",
            params![key, files_json],
        )?;

        let refcount: i64 =
            conn.query_row("SELECT refcount FROM assets WHERE key = ?1", [key], |row| row.get(0))?;

        Ok((refcount, refcount == 1))
    }

    /// Drop one reference. Returns the file list when the count reached
    /// zero (the caller deletes the files), `Ok(None)` otherwise. Releasing
    /// an unknown key is a no-op.
    pub fn asset_release(&self, key: &str) -> Result<Option<Vec<PathBuf>>> {
        let conn = self.conn.lock().unwrap();

        let row: Option<(i64, String)> = conn
            .query_row("SELECT refcount, files FROM assets WHERE key = ?1", [key], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;

        let Some((refcount, files_json)) = row else {
            debug!(key, "Releasing unknown asset key, ignoring");
            return Ok(None);
        };

        if refcount <= 1 {
            conn.execute("DELETE FROM assets WHERE key = ?1", [key])?;
            let files: Vec<String> = serde_json::from_str(&files_json)?;
            Ok(Some(files.into_iter().map(PathBuf::from).collect()))
        } else {
            conn.execute("UPDATE assets SET refcount = refcount - 1 WHERE key = ?1", [key])?;
            Ok(None)
        }
    }

    /// Current reference count for an asset key, if tracked.
    pub fn asset_refcount(&self, key: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row("SELECT refcount FROM assets WHERE key = ?1", [key], |row| row.get(0))
            .optional()?)
    }
}
