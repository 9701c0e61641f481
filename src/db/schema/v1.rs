pub const V1_CREATE_SCHEMA_SQL: &str = r#"
--
-- Schema Create: Version 1
--
-- Baseline generation: the schema_version ledger plus a single denormalized
-- anime table. Seasons, episodes, genres and streaming services all live in
-- scalar or free-text columns; later generations decompose them into
-- relations.
--

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL,
    description TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS anime (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    season INTEGER NOT NULL DEFAULT 1,       -- Count of seasons watched
    episode INTEGER NOT NULL DEFAULT 0,      -- Total episodes watched across seasons
    times_watched INTEGER NOT NULL DEFAULT 1,
    service TEXT,                            -- Free-text streaming service name
    watch_date TEXT,
    genres TEXT                              -- Comma-separated genre list
);
"#;
