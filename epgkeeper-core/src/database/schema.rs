// Timestamps are stored as milliseconds since the UNIX epoch.
pub(super) const SCHEMA_SQL: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS epg (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    scraper_name TEXT NOT NULL,
    client_id INTEGER,
    channel_uid INTEGER,
    last_scan INTEGER
);

CREATE TABLE IF NOT EXISTS epg_tags (
    epg_id INTEGER NOT NULL REFERENCES epg(id) ON DELETE CASCADE,
    broadcast_id INTEGER NOT NULL,
    client_id INTEGER NOT NULL,
    channel_uid INTEGER NOT NULL,
    title TEXT NOT NULL,
    plot_outline TEXT,
    plot TEXT,
    episode_name TEXT,
    genre_type INTEGER NOT NULL DEFAULT 0,
    genre_sub_type INTEGER NOT NULL DEFAULT 0,
    series_number INTEGER,
    episode_number INTEGER,
    icon_path TEXT,
    start_at INTEGER NOT NULL,
    end_at INTEGER NOT NULL,
    PRIMARY KEY (epg_id, broadcast_id)
);

CREATE INDEX IF NOT EXISTS epg_tags_end_at ON epg_tags (end_at);
"#;
