use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

use crate::db::migrate::RowError;

#[derive(Error, Debug)]
pub enum AniTrackError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into AniTrackError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Metadata error: {0}")]
    MetadataError(#[from] serde_json::Error), // Malformed metadata payloads

    /// Idempotency violation on the ledger. Recoverable: the runner treats
    /// this as "another writer already applied the transition" and moves on.
    #[error("Schema version {version} is already recorded in the ledger")]
    DuplicateVersion { version: u32 },

    /// The ledger does not match the transition's expected starting version.
    /// Fatal: signals a missing or out-of-order upgrade script.
    #[error("Ledger is at v{current} but the transition to v{to} expects v{from}")]
    VersionGap { current: u32, from: u32, to: u32 },

    /// DDL failure while applying a structural batch. Fatal for the
    /// transition; the ledger is left unchanged.
    #[error("Structural migration v{from} -> v{to} failed: {source}")]
    StructuralMigration {
        from: u32,
        to: u32,
        #[source]
        source: RusqliteError,
    },

    /// Strict-mode escalation of row-level failures. In the default mode,
    /// failed rows are skip-and-log data on the step result instead.
    #[error("Data migration v{from} -> v{to} aborted in strict mode: {} row(s) failed", errors.len())]
    RowMigration {
        from: u32,
        to: u32,
        errors: Vec<RowError>,
    },

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}
