use std::path::PathBuf;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use rusqlite::params;
use rusqlite::Connection;
use rusqlite::Row;

use super::schema::SCHEMA_SQL;
use super::EpgDatabase;
use super::EpgRecord;
use crate::error::Error;
use crate::models::ChannelKey;
use crate::models::EpgTag;
use crate::models::TableId;
use crate::sync_ext::MutexExt;

/// An `EpgDatabase` backed by SQLite.
pub struct SqliteDatabase {
    // An in-memory database is used if None.
    path: Option<PathBuf>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    conn: Option<Connection>,
    lock_depth: usize,
}

impl SqliteDatabase {
    pub fn new(path: Option<PathBuf>) -> Self {
        SqliteDatabase {
            path,
            state: Default::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    fn with_conn<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Connection) -> Result<T, Error>,
    {
        let mut state = self.state.locked();
        match state.conn.as_mut() {
            Some(conn) => f(conn),
            None => Err(Error::DatabaseNotOpen),
        }
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<EpgRecord> {
        let client_id: Option<i32> = row.get(3)?;
        let channel_uid: Option<i32> = row.get(4)?;
        let last_scan: Option<i64> = row.get(5)?;
        Ok(EpgRecord {
            id: row.get::<_, i32>(0)?.into(),
            name: row.get(1)?,
            scraper_name: row.get(2)?,
            channel: match (client_id, channel_uid) {
                (Some(client_id), Some(channel_uid)) => {
                    Some(ChannelKey::new(client_id.into(), channel_uid.into()))
                }
                _ => None,
            },
            last_scan: match last_scan {
                Some(ms) => Some(from_millis(5, ms)?),
                None => None,
            },
        })
    }

    fn row_to_tag(row: &Row, id: TableId) -> rusqlite::Result<EpgTag> {
        let channel = ChannelKey::new(
            row.get::<_, i32>(1)?.into(),
            row.get::<_, i32>(2)?.into(),
        );
        let start_at = from_millis(12, row.get(12)?)?;
        let end_at = from_millis(13, row.get(13)?)?;
        let mut tag = EpgTag::new(row.get::<_, u32>(0)?.into(), channel, start_at, end_at);
        tag.table_id = Some(id);
        tag.title = row.get(3)?;
        tag.plot_outline = row.get(4)?;
        tag.plot = row.get(5)?;
        tag.episode_name = row.get(6)?;
        tag.genre_type = row.get(7)?;
        tag.genre_sub_type = row.get(8)?;
        tag.series_number = row.get(9)?;
        tag.episode_number = row.get(10)?;
        tag.icon_path = row.get(11)?;
        Ok(tag)
    }
}

impl EpgDatabase for SqliteDatabase {
    fn open(&self) -> Result<(), Error> {
        let mut state = self.state.locked();
        if state.conn.is_some() {
            return Ok(());
        }
        let conn = match self.path {
            Some(ref path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(SCHEMA_SQL)?;
        match self.path {
            Some(ref path) => tracing::debug!(database.path = %path.display(), "Opened"),
            None => tracing::debug!("Opened in-memory database"),
        }
        state.conn = Some(conn);
        state.lock_depth = 0;
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.locked();
        if let Some(conn) = state.conn.take() {
            if state.lock_depth > 0 {
                if let Err(err) = conn.execute_batch("COMMIT") {
                    tracing::error!(%err, "Failed to commit before closing");
                }
            }
            if let Err((_, err)) = conn.close() {
                tracing::error!(%err, "Failed to close the database");
            }
            tracing::debug!("Closed");
        }
        state.lock_depth = 0;
    }

    fn is_open(&self) -> bool {
        self.state.locked().conn.is_some()
    }

    fn lock(&self) -> Result<(), Error> {
        let mut state = self.state.locked();
        let conn = state.conn.as_ref().ok_or(Error::DatabaseNotOpen)?;
        if state.lock_depth == 0 {
            conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        state.lock_depth += 1;
        Ok(())
    }

    fn unlock(&self) -> Result<(), Error> {
        let mut state = self.state.locked();
        let conn = state.conn.as_ref().ok_or(Error::DatabaseNotOpen)?;
        match state.lock_depth {
            0 => Ok(()),
            1 => {
                conn.execute_batch("COMMIT")?;
                state.lock_depth = 0;
                Ok(())
            }
            _ => {
                state.lock_depth -= 1;
                Ok(())
            }
        }
    }

    fn last_epg_id(&self) -> Result<i32, Error> {
        self.with_conn(|conn| {
            let id = conn.query_row("SELECT COALESCE(MAX(id), 0) FROM epg", [], |row| {
                row.get::<_, i32>(0)
            })?;
            Ok(id)
        })
    }

    fn delete_epg_entries(&self, before: DateTime<Utc>) -> Result<usize, Error> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM epg_tags WHERE end_at < ?1",
                params![before.timestamp_millis()],
            )?;
            Ok(n)
        })
    }

    fn get_all(&self) -> Result<Vec<EpgRecord>, Error> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, scraper_name, client_id, channel_uid, last_scan
                 FROM epg ORDER BY id",
            )?;
            let records = stmt
                .query_map([], Self::row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
    }

    fn load_tags(&self, id: TableId) -> Result<Vec<EpgTag>, Error> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT broadcast_id, client_id, channel_uid, title, plot_outline, plot,
                        episode_name, genre_type, genre_sub_type, series_number,
                        episode_number, icon_path, start_at, end_at
                 FROM epg_tags WHERE epg_id = ?1 ORDER BY start_at",
            )?;
            let tags = stmt
                .query_map(params![id.value()], |row| Self::row_to_tag(row, id))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tags)
        })
    }

    fn persist(&self, record: &EpgRecord, tags: &[EpgTag]) -> Result<(), Error> {
        self.with_conn(|conn| {
            let sp = conn.savepoint()?;
            sp.execute(
                "INSERT INTO epg (id, name, scraper_name, client_id, channel_uid, last_scan)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   scraper_name = excluded.scraper_name,
                   client_id = excluded.client_id,
                   channel_uid = excluded.channel_uid,
                   last_scan = excluded.last_scan",
                params![
                    record.id.value(),
                    record.name,
                    record.scraper_name,
                    record.channel.map(|key| key.client_id.value()),
                    record.channel.map(|key| key.channel_uid.value()),
                    record.last_scan.map(|time| time.timestamp_millis()),
                ],
            )?;
            sp.execute(
                "DELETE FROM epg_tags WHERE epg_id = ?1",
                params![record.id.value()],
            )?;
            {
                let mut stmt = sp.prepare_cached(
                    "INSERT INTO epg_tags (
                        epg_id, broadcast_id, client_id, channel_uid, title, plot_outline,
                        plot, episode_name, genre_type, genre_sub_type, series_number,
                        episode_number, icon_path, start_at, end_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                )?;
                for tag in tags.iter() {
                    stmt.execute(params![
                        record.id.value(),
                        tag.broadcast_id.value(),
                        tag.client_id.value(),
                        tag.channel_uid.value(),
                        tag.title,
                        tag.plot_outline,
                        tag.plot,
                        tag.episode_name,
                        tag.genre_type,
                        tag.genre_sub_type,
                        tag.series_number,
                        tag.episode_number,
                        tag.icon_path,
                        tag.start_at.timestamp_millis(),
                        tag.end_at.timestamp_millis(),
                    ])?;
                }
            }
            sp.commit()?;
            Ok(())
        })
    }

    fn delete(&self, id: TableId) -> Result<(), Error> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM epg WHERE id = ?1", params![id.value()])?;
            Ok(())
        })
    }

    fn delete_all(&self) -> Result<(), Error> {
        self.with_conn(|conn| {
            conn.execute_batch("DELETE FROM epg_tags; DELETE FROM epg;")?;
            Ok(())
        })
    }
}

fn from_millis(index: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(index, ms))
}
