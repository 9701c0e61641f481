use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::migrate::{MigrationContext, StepResult};
use crate::db::schema;
use crate::error::AniTrackError;
use crate::utils;

pub const UPGRADE_2_TO_3_SQL: &str = r#"
--
-- Schema Upgrade: Version 2 → 3
--
-- Renames watch_history.progress to eps_watched, converts the legacy
-- anime.service text into a stream_service lookup, and introduces per-user
-- records (status and reviews) that are cascade-deleted with their user.
--
-- Restructured tables are renamed (not dropped) and retained as backups
-- until the data migration step has verified the copy. The backup names are
-- version-qualified because a lossy v1 -> v2 run may have left anime_old in
-- place. Row ids are preserved by the copy, so the foreign keys in season,
-- episode and anime_genre stay valid.
--

ALTER TABLE anime RENAME TO anime_v2_old;
ALTER TABLE watch_history RENAME TO watch_history_v2_old;

-- Named indexes stay attached to the renamed table under their old names;
-- drop them so the rebuilt table can recreate them.
DROP INDEX idx_watch_history_anime;

CREATE TABLE anime (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    season_count INTEGER NOT NULL DEFAULT 0,
    episode_count INTEGER NOT NULL DEFAULT 0,
    synopsis TEXT
);

CREATE TABLE stream_service (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    domain_url TEXT
);

CREATE TABLE anime_stream_service (
    anime_id INTEGER NOT NULL,
    stream_service_id INTEGER NOT NULL,
    PRIMARY KEY (anime_id, stream_service_id),
    FOREIGN KEY (anime_id) REFERENCES anime(id) ON DELETE CASCADE,
    FOREIGN KEY (stream_service_id) REFERENCES stream_service(id)
);

CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TIMESTAMP NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE content_status (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE user_anime_status (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    anime_id INTEGER NOT NULL,
    status_id INTEGER NOT NULL,
    score INTEGER CHECK (score BETWEEN 1 AND 10),
    updated_at TIMESTAMP,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (anime_id) REFERENCES anime(id) ON DELETE CASCADE,
    FOREIGN KEY (status_id) REFERENCES content_status(id),
    UNIQUE (user_id, anime_id)
);

CREATE TABLE review (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    anime_id INTEGER NOT NULL,
    season_id INTEGER,
    score INTEGER NOT NULL CHECK (score BETWEEN 1 AND 10),
    body TEXT,
    created_at TIMESTAMP NOT NULL DEFAULT (datetime('now')),
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (anime_id) REFERENCES anime(id) ON DELETE CASCADE,
    FOREIGN KEY (season_id) REFERENCES season(id) ON DELETE CASCADE
);

CREATE TABLE watch_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    anime_id INTEGER NOT NULL,
    season_id INTEGER NOT NULL,
    user_id INTEGER,                       -- NULL for rows predating user ownership
    watch_date TEXT,
    eps_watched INTEGER NOT NULL DEFAULT 0,
    completion_percentage REAL,
    FOREIGN KEY (anime_id) REFERENCES anime(id) ON DELETE CASCADE,
    FOREIGN KEY (season_id) REFERENCES season(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX idx_watch_history_anime ON watch_history (anime_id);
CREATE INDEX idx_anime_stream_service_service ON anime_stream_service (stream_service_id);
CREATE INDEX idx_user_anime_status_user ON user_anime_status (user_id);
"#;

/// Stream service lookup rows with their landing pages.
const STREAM_SERVICES: &[(&str, Option<&str>)] = &[
    ("AnimeLab", Some("https://www.animelab.com")),
    ("Crunchyroll", Some("https://www.crunchyroll.com")),
    ("Funimation", Some("https://www.funimation.com")),
    ("HiDive", Some("https://www.hidive.com")),
    ("Netflix", Some("https://www.netflix.com")),
    ("Other", None),
];

const CONTENT_STATUSES: &[&str] = &["Completed", "Dropped", "Queue"];

struct V2Anime {
    id: i64,
    name: String,
    display_name: String,
    season_count: i64,
    episode_count: i64,
    synopsis: Option<String>,
    service: Option<String>,
}

struct V2WatchHistory {
    id: i64,
    anime_id: i64,
    season_id: i64,
    watch_date: Option<String>,
    progress: i64,
    completion_percentage: Option<f64>,
}

/// Data migration step for v2 → v3: seeds the new lookup tables, then copies
/// anime_v2_old and watch_history_v2_old one row at a time, preserving ids.
///
/// The anime copy itself is mechanical; the only lossy mapping is the legacy
/// service text. An unknown service name is recorded as a row failure while
/// the row is still copied — flagged, never guessed, never dropped.
pub(super) fn migrate_v2_data(
    conn: &Connection,
    ctx: &MigrationContext,
) -> Result<StepResult, AniTrackError> {
    seed_lookup_tables(conn)?;

    let mut result = StepResult::default();

    // Sanitised service names resolved once, matched per row
    let services: Vec<(i64, String)> = {
        let mut stmt = conn.prepare("SELECT id, name FROM stream_service")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut services = Vec::new();
        for row in rows {
            let (id, name) = row?;
            services.push((id, utils::sanitise_name(&name)));
        }
        services
    };

    {
        let mut stmt = conn.prepare(
            "SELECT id, name, display_name, season_count, episode_count, synopsis, service
             FROM anime_v2_old ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(V2Anime {
                id: row.get(0)?,
                name: row.get(1)?,
                display_name: row.get(2)?,
                season_count: row.get(3)?,
                episode_count: row.get(4)?,
                synopsis: row.get(5)?,
                service: row.get(6)?,
            })
        })?;

        for row in rows {
            let row = row?;
            conn.execute_batch("SAVEPOINT migrate_row;")?;
            match migrate_one_v2_anime(conn, &services, &row) {
                Ok(None) => {
                    conn.execute_batch("RELEASE migrate_row;")?;
                    result.record_migrated();
                }
                Ok(Some(lossy_reason)) => {
                    // Keep the copied row; only the mapping was lossy
                    conn.execute_batch("RELEASE migrate_row;")?;
                    result.record_failure(row.id, lossy_reason);
                    if ctx.strict {
                        break;
                    }
                }
                Err(err) => {
                    conn.execute_batch("ROLLBACK TO migrate_row; RELEASE migrate_row;")?;
                    result.record_failure(row.id, err.to_string());
                    if ctx.strict {
                        break;
                    }
                }
            }
        }
    }

    if !(ctx.strict && result.failed > 0) {
        migrate_watch_history(conn, ctx, &mut result)?;
    }

    // Backups are dropped per table, and only when every row made it across
    for (live, backup) in [
        ("anime", "anime_v2_old"),
        ("watch_history", "watch_history_v2_old"),
    ] {
        if result.failed == 0 && schema::backup_parity(conn, live, backup)? {
            conn.execute_batch(&format!("DROP TABLE {backup};"))?;
            info!("Migration 2 -> 3: {backup} verified and dropped");
        } else {
            warn!("Migration 2 -> 3: {backup} retained for manual review");
        }
    }

    Ok(result)
}

/// Copy one anime row, preserving its id, and convert the carried service
/// text into an anime_stream_service reference. Returns the lossy-mapping
/// reason when the service name has no lookup row.
fn migrate_one_v2_anime(
    conn: &Connection,
    services: &[(i64, String)],
    row: &V2Anime,
) -> Result<Option<String>, AniTrackError> {
    let already_copied: Option<i64> = conn
        .query_row(
            "SELECT id FROM anime WHERE id = ?",
            params![row.id],
            |r| r.get(0),
        )
        .optional()?;
    if already_copied.is_none() {
        conn.execute(
            "INSERT INTO anime (id, name, display_name, season_count, episode_count, synopsis)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.id,
                row.name,
                row.display_name,
                row.season_count,
                row.episode_count,
                row.synopsis
            ],
        )?;
    }

    let Some(service_raw) = row.service.as_deref().map(str::trim).filter(|s| !s.is_empty())
    else {
        return Ok(None);
    };

    let wanted = utils::sanitise_name(service_raw);
    match services.iter().find(|(_, name)| *name == wanted) {
        Some((service_id, _)) => {
            conn.execute(
                "INSERT OR IGNORE INTO anime_stream_service (anime_id, stream_service_id)
                 VALUES (?1, ?2)",
                params![row.id, service_id],
            )?;
            Ok(None)
        }
        None => Ok(Some(format!(
            "unknown streaming service '{service_raw}'"
        ))),
    }
}

/// Copy watch_history_v2_old into the rebuilt table, renaming progress to
/// eps_watched. Ids are preserved so re-invocation never duplicates rows.
fn migrate_watch_history(
    conn: &Connection,
    ctx: &MigrationContext,
    result: &mut StepResult,
) -> Result<(), AniTrackError> {
    let mut stmt = conn.prepare(
        "SELECT id, anime_id, season_id, watch_date, progress, completion_percentage
         FROM watch_history_v2_old ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(V2WatchHistory {
            id: row.get(0)?,
            anime_id: row.get(1)?,
            season_id: row.get(2)?,
            watch_date: row.get(3)?,
            progress: row.get(4)?,
            completion_percentage: row.get(5)?,
        })
    })?;

    for row in rows {
        let row = row?;
        conn.execute_batch("SAVEPOINT migrate_row;")?;
        match copy_watch_row(conn, &row) {
            Ok(()) => {
                conn.execute_batch("RELEASE migrate_row;")?;
                result.record_migrated();
            }
            Err(err) => {
                conn.execute_batch("ROLLBACK TO migrate_row; RELEASE migrate_row;")?;
                result.record_failure(row.id, format!("watch_history: {err}"));
                if ctx.strict {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn copy_watch_row(conn: &Connection, row: &V2WatchHistory) -> Result<(), AniTrackError> {
    let already_copied: Option<i64> = conn
        .query_row(
            "SELECT id FROM watch_history WHERE id = ?",
            params![row.id],
            |r| r.get(0),
        )
        .optional()?;
    if already_copied.is_some() {
        return Ok(());
    }

    conn.execute(
        "INSERT INTO watch_history
            (id, anime_id, season_id, watch_date, eps_watched, completion_percentage)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            row.id,
            row.anime_id,
            row.season_id,
            row.watch_date,
            row.progress,
            row.completion_percentage
        ],
    )?;
    Ok(())
}

fn seed_lookup_tables(conn: &Connection) -> Result<(), AniTrackError> {
    for (name, domain_url) in STREAM_SERVICES {
        conn.execute(
            "INSERT OR IGNORE INTO stream_service (name, domain_url) VALUES (?1, ?2)",
            params![name, domain_url],
        )?;
    }
    for status in CONTENT_STATUSES {
        conn.execute(
            "INSERT OR IGNORE INTO content_status (name) VALUES (?)",
            params![status],
        )?;
    }
    Ok(())
}
