mod schema;
mod sqlite;
#[cfg(test)]
pub(crate) mod stub;

use chrono::DateTime;
use chrono::Utc;

use crate::error::Error;
use crate::models::ChannelKey;
use crate::models::EpgTag;
use crate::models::TableId;

pub use sqlite::SqliteDatabase;

/// A persisted schedule table without its tags.
#[derive(Clone, Debug, PartialEq)]
pub struct EpgRecord {
    pub id: TableId,
    pub name: String,
    pub scraper_name: String,
    // None until the table gets bound to a channel.
    pub channel: Option<ChannelKey>,
    pub last_scan: Option<DateTime<Utc>>,
}

/// The persistence boundary of the container.
///
/// Operations other than `open()` fail with `Error::DatabaseNotOpen` while
/// the database is closed.  `lock()` and `unlock()` bracket a batch of
/// operations so that it is applied at once.
pub trait EpgDatabase: Send + Sync {
    fn open(&self) -> Result<(), Error>;
    fn close(&self);
    fn is_open(&self) -> bool;
    fn lock(&self) -> Result<(), Error>;
    fn unlock(&self) -> Result<(), Error>;

    /// Returns the largest table id ever persisted, or 0.
    fn last_epg_id(&self) -> Result<i32, Error>;

    /// Deletes tags which end before `before`.
    fn delete_epg_entries(&self, before: DateTime<Utc>) -> Result<usize, Error>;

    fn get_all(&self) -> Result<Vec<EpgRecord>, Error>;
    fn load_tags(&self, id: TableId) -> Result<Vec<EpgTag>, Error>;

    /// Replaces the record and all tags of a table.
    fn persist(&self, record: &EpgRecord, tags: &[EpgTag]) -> Result<(), Error>;

    fn delete(&self, id: TableId) -> Result<(), Error>;
    fn delete_all(&self) -> Result<(), Error>;
}

/// Holds the database lock until dropped.
pub struct DatabaseLock<'a> {
    database: &'a dyn EpgDatabase,
}

impl<'a> DatabaseLock<'a> {
    pub fn new(database: &'a dyn EpgDatabase) -> Result<Self, Error> {
        database.lock()?;
        Ok(DatabaseLock { database })
    }
}

impl Drop for DatabaseLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.database.unlock() {
            tracing::error!(%err, "Failed to unlock the database");
        }
    }
}
