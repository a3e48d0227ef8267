use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use super::*;
use crate::sync_ext::MutexExt;

// An in-memory database counting writes.
pub(crate) struct DatabaseStub {
    inner: SqliteDatabase,
    persist_count: AtomicUsize,
    failing: AtomicBool,
    unavailable: AtomicBool,
    get_all_delay: Mutex<Duration>,
}

impl DatabaseStub {
    pub(crate) fn new() -> Self {
        DatabaseStub {
            inner: SqliteDatabase::in_memory(),
            persist_count: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            get_all_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub(crate) fn persist_count(&self) -> usize {
        self.persist_count.load(Ordering::SeqCst)
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    // open() fails while unavailable.
    pub(crate) fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub(crate) fn set_get_all_delay(&self, delay: Duration) {
        *self.get_all_delay.locked() = delay;
    }
}

impl EpgDatabase for DatabaseStub {
    fn open(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("unable to open").into());
        }
        self.inner.open()
    }

    fn close(&self) {
        // Keep the in-memory data alive over restarts.
    }

    fn is_open(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst) && self.inner.is_open()
    }

    fn lock(&self) -> Result<(), Error> {
        self.inner.lock()
    }

    fn unlock(&self) -> Result<(), Error> {
        self.inner.unlock()
    }

    fn last_epg_id(&self) -> Result<i32, Error> {
        self.inner.last_epg_id()
    }

    fn delete_epg_entries(&self, before: DateTime<Utc>) -> Result<usize, Error> {
        self.inner.delete_epg_entries(before)
    }

    fn get_all(&self) -> Result<Vec<EpgRecord>, Error> {
        let delay = *self.get_all_delay.locked();
        if !delay.is_zero() {
            // Blocks like a slow disk.
            std::thread::sleep(delay);
        }
        self.inner.get_all()
    }

    fn load_tags(&self, id: TableId) -> Result<Vec<EpgTag>, Error> {
        self.inner.load_tags(id)
    }

    fn persist(&self, record: &EpgRecord, tags: &[EpgTag]) -> Result<(), Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("disk full").into());
        }
        self.persist_count.fetch_add(1, Ordering::SeqCst);
        self.inner.persist(record, tags)
    }

    fn delete(&self, id: TableId) -> Result<(), Error> {
        self.inner.delete(id)
    }

    fn delete_all(&self) -> Result<(), Error> {
        self.inner.delete_all()
    }
}
