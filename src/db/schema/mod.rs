//! Schema script set.
//!
//! One module per schema script, following the `v{N}` / `v{A}_to_v{B}` naming
//! convention: a create script holds the full schema for its generation, an
//! upgrade script holds the incremental structural batch for one version
//! transition plus, when the transition carries data, its data migration
//! step. The runner consumes scripts through [`TRANSITIONS`] by version pair,
//! never by parsing names.

mod v1;
mod v1_to_v2;
mod v2_to_v3;

use rusqlite::Connection;

use crate::db::ledger::VersionLedger;
use crate::db::migrate::{MigrationContext, StepResult};
use crate::error::AniTrackError;

pub use v1::V1_CREATE_SCHEMA_SQL;
use v1_to_v2::UPGRADE_1_TO_2_SQL;
use v2_to_v3::UPGRADE_2_TO_3_SQL;

/// Latest schema generation shipped with this build.
pub const LATEST_VERSION: u32 = 3;

/// Function type for per-transition data migration steps.
pub type DataFn = fn(&Connection, &MigrationContext) -> Result<StepResult, AniTrackError>;

/// A schema transition addressed by its `(from, to)` version pair.
/// `from == None` marks a create script applied to an empty database.
pub struct Transition {
    pub from: Option<u32>,
    pub to: u32,
    pub description: &'static str,
    pub structural_sql: &'static str,
    pub data_fn: Option<DataFn>,
}

/// Outcome of the pre-flight ledger check for one transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Ready,
    AlreadyApplied,
}

impl Transition {
    /// Raw structural statements are not inherently idempotent, so every
    /// script re-checks the ledger before touching the schema: applying a
    /// transition whose target the ledger already shows is a no-op, and a
    /// starting version that does not match the ledger is a gap.
    pub fn guard(&self, conn: &Connection) -> Result<Guard, AniTrackError> {
        let current = VersionLedger::current_version(conn)?;

        if current.is_some_and(|v| v >= self.to) {
            return Ok(Guard::AlreadyApplied);
        }
        if current != self.from {
            return Err(AniTrackError::VersionGap {
                current: current.unwrap_or(0),
                from: self.from.unwrap_or(0),
                to: self.to,
            });
        }
        Ok(Guard::Ready)
    }

    /// Starting version for display purposes; 0 stands for "empty database".
    pub fn from_label(&self) -> u32 {
        self.from.unwrap_or(0)
    }
}

/// Ordered registry of every transition from the empty database to
/// [`LATEST_VERSION`].
pub const TRANSITIONS: &[Transition] = &[
    Transition {
        from: None,
        to: 1,
        description: "create baseline schema",
        structural_sql: V1_CREATE_SCHEMA_SQL,
        data_fn: None,
    },
    Transition {
        from: Some(1),
        to: 2,
        description: "normalize anime into season, episode and genre relations",
        structural_sql: UPGRADE_1_TO_2_SQL,
        data_fn: Some(v1_to_v2::migrate_anime_rows),
    },
    Transition {
        from: Some(2),
        to: 3,
        description: "introduce stream services and per-user records",
        structural_sql: UPGRADE_2_TO_3_SQL,
        data_fn: Some(v2_to_v3::migrate_v2_data),
    },
];

/// Validate that the registry forms a complete, gapless chain from the empty
/// database to [`LATEST_VERSION`]. Called before any migration begins.
pub fn validate_registry() -> Result<(), AniTrackError> {
    let mut reached: Option<u32> = None;

    for transition in TRANSITIONS {
        let expected_to = reached.unwrap_or(0) + 1;
        if transition.from != reached || transition.to != expected_to {
            return Err(AniTrackError::VersionGap {
                current: reached.unwrap_or(0),
                from: transition.from_label(),
                to: transition.to,
            });
        }
        reached = Some(transition.to);
    }

    if reached != Some(LATEST_VERSION) {
        return Err(AniTrackError::Error(format!(
            "migration registry ends at v{} but the latest version is v{}",
            reached.unwrap_or(0),
            LATEST_VERSION
        )));
    }
    Ok(())
}

/// True when the backup table still has exactly as many rows as its live
/// counterpart — the precondition for dropping it.
pub fn backup_parity(
    conn: &Connection,
    live_table: &str,
    backup_table: &str,
) -> Result<bool, AniTrackError> {
    let live: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {live_table}"), [], |row| {
        row.get(0)
    })?;
    let backup: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {backup_table}"),
        [],
        |row| row.get(0),
    )?;
    Ok(live == backup)
}
