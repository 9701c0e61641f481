use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::migrate::{MigrationContext, StepResult};
use crate::db::schema;
use crate::error::AniTrackError;
use crate::metadata::SeriesInfo;
use crate::utils;

pub const UPGRADE_1_TO_2_SQL: &str = r#"
--
-- Schema Upgrade: Version 1 → 2
--
-- Decomposes the denormalized anime table into normalized relations:
-- seasons, episodes, genres (many-to-many) and per-season watch history.
--
-- Following SQLite's guidance for table restructuring:
-- https://www.sqlite.org/lang_altertable.html
--
-- The old table is renamed (not dropped) and retained as a backup until the
-- data migration step has verified the copy. The runner owns the enclosing
-- transaction and the ledger update.
--

ALTER TABLE anime RENAME TO anime_old;

CREATE TABLE anime (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,         -- Sanitised lookup key
    display_name TEXT NOT NULL,
    season_count INTEGER NOT NULL DEFAULT 0,
    episode_count INTEGER NOT NULL DEFAULT 0,
    synopsis TEXT,
    service TEXT                       -- Legacy free-text service, converted to a lookup in v3
);

CREATE TABLE genre (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE anime_genre (
    anime_id INTEGER NOT NULL,
    genre_id INTEGER NOT NULL,
    PRIMARY KEY (anime_id, genre_id),
    FOREIGN KEY (anime_id) REFERENCES anime(id) ON DELETE CASCADE,
    FOREIGN KEY (genre_id) REFERENCES genre(id)
);

CREATE TABLE season (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    anime_id INTEGER NOT NULL,
    number INTEGER NOT NULL,
    episode_count INTEGER NOT NULL DEFAULT 0,
    summary TEXT,
    FOREIGN KEY (anime_id) REFERENCES anime(id) ON DELETE CASCADE,
    UNIQUE (anime_id, number)
);

CREATE TABLE episode (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    anime_id INTEGER NOT NULL,
    season_id INTEGER NOT NULL,
    number INTEGER NOT NULL,
    FOREIGN KEY (anime_id) REFERENCES anime(id) ON DELETE CASCADE,
    FOREIGN KEY (season_id) REFERENCES season(id) ON DELETE CASCADE,
    UNIQUE (season_id, number)
);

CREATE TABLE watch_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    anime_id INTEGER NOT NULL,
    season_id INTEGER NOT NULL,
    watch_date TEXT,
    progress INTEGER NOT NULL DEFAULT 0,   -- Episodes watched in this sitting
    completion_percentage REAL,
    FOREIGN KEY (anime_id) REFERENCES anime(id) ON DELETE CASCADE,
    FOREIGN KEY (season_id) REFERENCES season(id) ON DELETE CASCADE
);

CREATE INDEX idx_anime_genre_genre ON anime_genre (genre_id);
CREATE INDEX idx_watch_history_anime ON watch_history (anime_id);
"#;

/// Canonical genre lookup rows. Legacy and metadata rows may still introduce
/// genres beyond this list.
const GENRES: &[&str] = &[
    "Action",
    "Adventure",
    "Comedy",
    "Drama",
    "Ecchi",
    "Fan Service",
    "Fantasy",
    "Gore",
    "Harem",
    "Historical",
    "Horror",
    "Isekai",
    "Magic",
    "Martial Arts",
    "Mecha",
    "Methodology",
    "Mystery",
    "Psychological",
    "Reincarnation",
    "Romance",
    "School",
    "Sci-Fi",
    "Shonen",
    "Slice of Life",
    "Supernatural",
    "Super Power",
    "Suspense",
    "Survival",
];

const MAX_EPISODES_PER_SEASON: i64 = 10_000;
const MAX_SYNOPSIS_CHARS: usize = 20_000;
const MAX_GENRE_CHARS: usize = 64;

struct LegacyAnime {
    id: i64,
    name: String,
    season: i64,
    episode: i64,
    times_watched: i64,
    service: Option<String>,
    watch_date: Option<String>,
    genres: Option<String>,
}

/// Data migration step for v1 → v2: one legacy row at a time from anime_old,
/// each under its own savepoint so a malformed row is skipped and logged
/// instead of aborting the whole transition.
pub(super) fn migrate_anime_rows(
    conn: &Connection,
    ctx: &MigrationContext,
) -> Result<StepResult, AniTrackError> {
    seed_genres(conn)?;

    let mut result = StepResult::default();

    {
        let mut stmt = conn.prepare(
            "SELECT id, name, season, episode, times_watched, service, watch_date, genres
             FROM anime_old ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(LegacyAnime {
                id: row.get(0)?,
                name: row.get(1)?,
                season: row.get(2)?,
                episode: row.get(3)?,
                times_watched: row.get(4)?,
                service: row.get(5)?,
                watch_date: row.get(6)?,
                genres: row.get(7)?,
            })
        })?;

        for row in rows {
            let row = row?;
            conn.execute_batch("SAVEPOINT migrate_row;")?;
            match migrate_one_anime(conn, ctx, &row) {
                Ok(()) => {
                    conn.execute_batch("RELEASE migrate_row;")?;
                    result.record_migrated();
                }
                Err(err) => {
                    conn.execute_batch("ROLLBACK TO migrate_row; RELEASE migrate_row;")?;
                    result.record_failure(row.id, err.to_string());
                    if ctx.strict {
                        // The runner aborts the transition; no point going on
                        break;
                    }
                }
            }
        }
    }

    // Drop the backup only once the copy is verified; any shortfall keeps
    // anime_old in place so nothing is lost.
    if result.failed == 0 && schema::backup_parity(conn, "anime", "anime_old")? {
        conn.execute_batch("DROP TABLE anime_old;")?;
        info!("Migration 1 -> 2: anime_old verified and dropped");
    } else {
        warn!(
            "Migration 1 -> 2: anime_old retained, {} row(s) were not migrated",
            result.failed
        );
    }

    Ok(result)
}

fn migrate_one_anime(
    conn: &Connection,
    ctx: &MigrationContext,
    row: &LegacyAnime,
) -> Result<(), AniTrackError> {
    let display_name = row.name.trim();
    if display_name.is_empty() {
        return Err(AniTrackError::Error("anime name is empty".to_string()));
    }
    let name = utils::sanitise_name(display_name);

    // Re-run safety: an earlier interrupted run may already have migrated
    // this row. A name collision between two distinct legacy rows is flagged
    // instead of silently merging them.
    let existing: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, display_name FROM anime WHERE name = ?",
            params![name],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    if let Some((_, existing_display)) = existing {
        if existing_display == display_name {
            return Ok(());
        }
        return Err(AniTrackError::Error(format!(
            "sanitised name '{name}' collides with already-migrated anime '{existing_display}'"
        )));
    }

    let genres = match row.genres.as_deref() {
        None => Vec::new(),
        Some(raw) => utils::split_genres(raw)?,
    };

    // Enrichment comes from an external metadata source and is untrusted:
    // every field is validated before it touches the database, exactly like
    // the legacy columns.
    let meta = ctx.metadata.series_info(&name);
    let synopsis = meta.as_ref().and_then(|info| validated_synopsis(&name, info));

    conn.execute(
        "INSERT INTO anime (name, display_name, season_count, episode_count, synopsis, service)
         VALUES (?1, ?2, 0, 0, ?3, ?4)",
        params![name, display_name, synopsis, row.service],
    )?;
    let anime_id = conn.last_insert_rowid();

    for genre in &genres {
        link_genre(conn, anime_id, genre)?;
    }
    if let Some(info) = &meta {
        for genre in validated_genres(&name, info) {
            link_genre(conn, anime_id, &genre)?;
        }
    }

    let season_total = row.season.max(1);
    let plan = season_episode_plan(&name, season_total, row.episode.max(0), meta.as_ref());

    let mut remaining = row.episode.max(0);
    for (index, episode_count) in plan.iter().enumerate() {
        let number = index as i64 + 1;
        conn.execute(
            "INSERT INTO season (anime_id, number, episode_count) VALUES (?1, ?2, ?3)",
            params![anime_id, number, episode_count],
        )?;
        let season_id = conn.last_insert_rowid();

        for episode_number in 1..=*episode_count {
            conn.execute(
                "INSERT INTO episode (anime_id, season_id, number) VALUES (?1, ?2, ?3)",
                params![anime_id, season_id, episode_number],
            )?;
        }

        let watched = remaining.min(*episode_count);
        remaining -= watched;
        if watched > 0 {
            let completion =
                (watched as f64 / *episode_count as f64 * 100.0).round() / 100.0;
            for _ in 0..row.times_watched.max(0) {
                conn.execute(
                    "INSERT INTO watch_history
                        (anime_id, season_id, watch_date, progress, completion_percentage)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![anime_id, season_id, row.watch_date, watched, completion],
                )?;
            }
        }
    }

    // Decomposition invariant: the scalar counts must equal the owned rows
    conn.execute(
        "UPDATE anime SET
            season_count = (SELECT COUNT(*) FROM season WHERE anime_id = ?1),
            episode_count = (SELECT COUNT(*) FROM episode WHERE anime_id = ?1)
         WHERE id = ?1",
        params![anime_id],
    )?;

    Ok(())
}

fn seed_genres(conn: &Connection) -> Result<(), AniTrackError> {
    for genre in GENRES {
        conn.execute("INSERT OR IGNORE INTO genre (name) VALUES (?)", params![genre])?;
    }
    Ok(())
}

fn link_genre(conn: &Connection, anime_id: i64, genre: &str) -> Result<(), AniTrackError> {
    conn.execute("INSERT OR IGNORE INTO genre (name) VALUES (?)", params![genre])?;
    let genre_id: i64 = conn.query_row(
        "SELECT id FROM genre WHERE name = ?",
        params![genre],
        |r| r.get(0),
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO anime_genre (anime_id, genre_id) VALUES (?1, ?2)",
        params![anime_id, genre_id],
    )?;
    Ok(())
}

/// Episode counts per season: validated metadata counts when they cover every
/// recorded season, otherwise an even split of the legacy total.
fn season_episode_plan(
    name: &str,
    seasons: i64,
    total_episodes: i64,
    meta: Option<&SeriesInfo>,
) -> Vec<i64> {
    if let Some(info) = meta {
        let counts = &info.season_episodes;
        if !counts.is_empty() {
            let usable = counts.len() >= seasons as usize
                && counts
                    .iter()
                    .take(seasons as usize)
                    .all(|count| (1..=MAX_EPISODES_PER_SEASON).contains(count));
            if usable {
                return counts.iter().take(seasons as usize).copied().collect();
            }
            warn!("Metadata episode counts for '{name}' rejected, using an even split");
        }
    }

    let base = total_episodes / seasons;
    let remainder = total_episodes % seasons;
    (0..seasons)
        .map(|index| base + i64::from(index < remainder))
        .collect()
}

fn validated_synopsis(name: &str, info: &SeriesInfo) -> Option<String> {
    let raw = info.synopsis.as_deref()?.trim();
    if raw.is_empty() || raw.chars().count() > MAX_SYNOPSIS_CHARS {
        warn!("Metadata synopsis for '{name}' rejected");
        return None;
    }
    Some(raw.to_string())
}

fn validated_genres(name: &str, info: &SeriesInfo) -> Vec<String> {
    let mut genres = Vec::new();
    for raw in &info.genres {
        let genre = raw.trim();
        if genre.is_empty()
            || genre.chars().count() > MAX_GENRE_CHARS
            || genre.contains(utils::AMBIGUOUS_GENRE_DELIMITERS)
        {
            warn!("Metadata genre '{raw}' for '{name}' rejected");
            continue;
        }
        genres.push(utils::canonical_genre(genre).to_string());
    }
    genres
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_even_split_plan() {
        assert_eq!(season_episode_plan("x", 2, 25, None), vec![13, 12]);
        assert_eq!(season_episode_plan("x", 3, 36, None), vec![12, 12, 12]);
        assert_eq!(season_episode_plan("x", 1, 0, None), vec![0]);
    }

    #[test]
    fn test_plan_prefers_valid_metadata() {
        let info = SeriesInfo {
            season_episodes: vec![12, 13, 24],
            ..SeriesInfo::default()
        };
        assert_eq!(season_episode_plan("x", 2, 25, Some(&info)), vec![12, 13]);
    }

    #[test]
    fn test_plan_rejects_invalid_metadata() {
        // Negative counts cannot come from a real season listing
        let info = SeriesInfo {
            season_episodes: vec![-3, 13],
            ..SeriesInfo::default()
        };
        assert_eq!(season_episode_plan("x", 2, 25, Some(&info)), vec![13, 12]);

        // Too few seasons covered
        let info = SeriesInfo {
            season_episodes: vec![12],
            ..SeriesInfo::default()
        };
        assert_eq!(season_episode_plan("x", 2, 25, Some(&info)), vec![13, 12]);
    }

    #[test]
    fn test_validated_genres_filters_junk() {
        let info = SeriesInfo {
            genres: vec![
                "Action".to_string(),
                "  ".to_string(),
                "Sci Fi".to_string(),
                "a;b".to_string(),
            ],
            ..SeriesInfo::default()
        };
        assert_eq!(
            validated_genres("x", &info),
            vec!["Action".to_string(), "Sci-Fi".to_string()]
        );
    }

    #[test]
    fn test_seed_genres_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();
        conn.execute_batch(
            "CREATE TABLE genre (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL UNIQUE);",
        )
        .unwrap();

        seed_genres(conn).unwrap();
        let first: i64 = conn
            .query_row("SELECT COUNT(*) FROM genre", [], |r| r.get(0))
            .unwrap();
        seed_genres(conn).unwrap();
        let second: i64 = conn
            .query_row("SELECT COUNT(*) FROM genre", [], |r| r.get(0))
            .unwrap();

        assert_eq!(first, GENRES.len() as i64);
        assert_eq!(first, second);
    }
}
