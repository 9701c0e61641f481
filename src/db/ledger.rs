//! The schema version ledger.
//!
//! A single append-only table, `schema_version`, records which schema
//! generation is currently applied, when, and why. The current version is
//! always `MAX(version)`; entries are never mutated or deleted. The ledger is
//! the only contract the migration engine exposes to operators.

use chrono::{NaiveDateTime, Utc};
use log::debug;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::db::Database;
use crate::error::AniTrackError;

pub const LEDGER_TABLE: &str = "schema_version";

const APPLIED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One row of the `schema_version` ledger.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub version: u32,
    pub applied_at: NaiveDateTime, // UTC
    pub description: String,
}

pub struct VersionLedger;

impl VersionLedger {
    /// Highest recorded version, or `None` if the database is uninitialized
    /// (the ledger table does not exist yet, or holds no entries).
    pub fn current_version(conn: &Connection) -> Result<Option<u32>, AniTrackError> {
        if !Database::table_exists(conn, LEDGER_TABLE)? {
            return Ok(None);
        }

        let version: Option<u32> = conn.query_row(
            "SELECT MAX(version) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    /// Append a new ledger entry. Fails with `DuplicateVersion` if the
    /// version is already recorded — the idempotency guard that makes
    /// re-running a migration detectable before any structural change.
    ///
    /// Must be the last action of a successful transition, inside the same
    /// transaction as the schema change itself.
    pub fn record_version(
        conn: &Connection,
        version: u32,
        description: &str,
    ) -> Result<(), AniTrackError> {
        let existing: Option<u32> = conn
            .query_row(
                "SELECT version FROM schema_version WHERE version = ?",
                params![version],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(AniTrackError::DuplicateVersion { version });
        }

        let applied_at = Utc::now().naive_utc().format(APPLIED_AT_FORMAT).to_string();
        conn.execute(
            "INSERT INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
            params![version, applied_at, description],
        )
        .map_err(|err| match err {
            // The PRIMARY KEY constraint is the safety net against a second
            // concurrent writer recording the same version.
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
                AniTrackError::DuplicateVersion { version }
            }
            other => other.into(),
        })?;

        debug!("Ledger: recorded version {version} ({description})");
        Ok(())
    }

    /// All ledger entries, oldest first.
    pub fn history(conn: &Connection) -> Result<Vec<LedgerEntry>, AniTrackError> {
        if !Database::table_exists(conn, LEDGER_TABLE)? {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(
            "SELECT version, applied_at, description FROM schema_version ORDER BY version ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (version, applied_at_raw, description) = row?;
            let applied_at = NaiveDateTime::parse_from_str(&applied_at_raw, APPLIED_AT_FORMAT)
                .map_err(|err| {
                    AniTrackError::Error(format!(
                        "ledger entry v{version} has an unreadable applied_at '{applied_at_raw}': {err}"
                    ))
                })?;
            entries.push(LedgerEntry {
                version,
                applied_at,
                description,
            });
        }
        Ok(entries)
    }
}
