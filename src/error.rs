// src/error.rs

//! Crate-wide error type for snapboot
//!
//! The lifecycle engine distinguishes a small taxonomy: conflicts and
//! missing targets (both treated as idempotent success where safe),
//! unresolved template fields (fatal for that operation), and failures of
//! external collaborators (package database, boot loader tooling, btrfs).
//! "Boot environment is in use" is deliberately *not* an error; it is the
//! `Removal::Deferred` outcome in the bootenv module.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Target already exists (e.g. boot environment subvolume)
    #[error("Resource conflict: {0}")]
    ResourceConflict(String),

    /// Target absent (treated as success on deletion paths)
    #[error("Not found: {0}")]
    NotFound(String),

    /// A template references a field the context cannot supply
    #[error("Unresolved replacement field: {0}")]
    UnresolvedField(String),

    /// A call into an external collaborator failed
    #[error("External failure: {0}")]
    ExternalFailure(String),

    /// Startup/configuration problem
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Malformed data from an external source
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
