pub mod ledger;
pub mod migrate;
pub mod schema;

use std::fs;
use std::path::Path;

use log::info;
use rusqlite::Connection;

use crate::error::AniTrackError;

pub const DB_FILENAME: &str = "anitrack.db";

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database file. A directory path gets the default
    /// filename appended.
    pub fn open(db_path: &Path) -> Result<Self, AniTrackError> {
        let db_file = if db_path.is_dir() {
            db_path.join(DB_FILENAME)
        } else {
            db_path.to_path_buf()
        };

        if let Some(parent) = db_file.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&db_file)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        info!("Database opened at: {}", db_file.display());

        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, AniTrackError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction, committing on success
    /// and rolling back on error.
    pub fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, AniTrackError>
    where
        F: FnOnce(&Connection) -> Result<T, AniTrackError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE;")?;
        match f(conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT;")?;
                Ok(value)
            }
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK;");
                Err(err)
            }
        }
    }

    pub fn table_exists(conn: &Connection, name: &str) -> Result<bool, AniTrackError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Count of `PRAGMA foreign_key_check` violations across the whole
    /// database. Works regardless of whether enforcement is currently on.
    pub fn foreign_key_violations(conn: &Connection) -> Result<usize, AniTrackError> {
        let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |_row| Ok(()))?;
        let mut violations = 0;
        for row in rows {
            row?;
            violations += 1;
        }
        Ok(violations)
    }
}
