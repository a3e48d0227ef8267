mod queue;
mod table;

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::database::DatabaseLock;
use crate::database::EpgDatabase;
use crate::datetime_ext::DateTimeExt;
use crate::error::Error;
use crate::events::*;
use crate::jobs::JobQueue;
use crate::models::*;
use crate::provider::EpgSink;
use crate::provider::Providers;
use crate::sync_ext::MutexExt;

pub use queue::TagChangeQueue;
pub use queue::TagStateChange;
pub use queue::UpdateRequest;
pub use queue::UpdateRequestQueue;
pub use table::Epg;
pub use table::UpdateParams;

use queue::DeferredTagChange;

const CYCLE_INTERVAL: Duration = Duration::from_secs(1);

/// The registry of schedule tables and the background task keeping them up to
/// date.
///
/// Foreground callers and provider callbacks share the container through an
/// `Arc`.  Three separate locks are used: the registry lock, the update
/// request queue lock and the tag change queue lock.  Pushing into the queues
/// never waits for the background task.
pub struct EpgContainer {
    inner: Arc<Inner>,
}

impl EpgContainer {
    pub fn new(
        config: Arc<Config>,
        database: Arc<dyn EpgDatabase>,
        providers: Providers,
        jobs: Arc<JobQueue>,
    ) -> Self {
        let (update_finished, _) = watch::channel(0);
        EpgContainer {
            inner: Arc::new(Inner {
                config,
                database,
                providers,
                jobs,
                registry: Mutex::new(Registry::new()),
                loaded: Default::default(),
                update_requests: Default::default(),
                tag_changes: Default::default(),
                deferred: Default::default(),
                pending_changes: Default::default(),
                emitters: Default::default(),
                update_finished,
                playing: AtomicBool::new(false),
                worker: Default::default(),
            }),
        }
    }

    // lifecycle

    /// Starts the background task.
    ///
    /// When `asynchronous` is true, the start is submitted to the job queue
    /// and this returns immediately.  Starting a running container restarts
    /// it.
    pub async fn start(&self, asynchronous: bool) {
        if asynchronous {
            let inner = self.inner.clone();
            self.inner.jobs.submit(
                "epg-start",
                async move {
                    inner.start_sync().await;
                },
                None,
            );
        } else {
            self.inner.start_sync().await;
        }
    }

    /// Stops the background task and closes the database.
    ///
    /// Does nothing if not started.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Removes all tables and restarts the background task if it was running.
    pub async fn clear(&self) {
        self.inner.clear().await;
    }

    /// Deletes all persisted data and then clears the container.
    pub async fn reset(&self) -> Result<(), Error> {
        self.inner.reset().await
    }

    pub fn is_started(&self) -> bool {
        self.inner.registry.locked().started
    }

    /// True until the first full update pass completes.
    pub fn is_initialising(&self) -> bool {
        self.inner.registry.locked().is_initialising
    }

    /// Playback state consulted when `prevent-updates-while-playing` is set.
    pub fn set_playing(&self, playing: bool) {
        self.inner.playing.store(playing, Ordering::SeqCst);
    }

    // tables

    /// Returns the table for `channel`, creating it if needed.
    ///
    /// An existing table is returned if `epg_id` is valid and registered.
    /// Otherwise, a new table is created with `epg_id`, or with a newly
    /// allocated id if `epg_id` is not valid.
    pub async fn create_channel_epg(
        &self,
        epg_id: TableId,
        scraper_name: &str,
        channel: Option<EpgChannelData>,
    ) -> Arc<Epg> {
        self.inner
            .create_channel_epg(epg_id, scraper_name, channel)
            .await
    }

    /// Returns `false` if `table` is not registered.
    pub fn delete_epg(&self, table: &Epg, delete_from_db: bool) -> bool {
        self.inner.delete_epg(table, delete_from_db)
    }

    pub fn get_by_id(&self, id: TableId) -> Option<Arc<Epg>> {
        self.inner.get_by_id(id)
    }

    pub fn get_by_channel_uid(
        &self,
        client_id: ClientId,
        channel_uid: ChannelUid,
    ) -> Option<Arc<Epg>> {
        self.inner
            .get_by_channel_key(ChannelKey::new(client_id, channel_uid))
    }

    /// Looks up a tag in `table`, or in all tables if `table` is `None`.
    pub fn get_tag_by_id(&self, table: Option<&Epg>, id: BroadcastId) -> Option<Arc<EpgTag>> {
        match table {
            Some(table) => table.tag_by_broadcast_id(id),
            None => self
                .inner
                .snapshot_tables()
                .iter()
                .find_map(|table| table.tag_by_broadcast_id(id)),
        }
    }

    pub fn get_all_tags(&self) -> Vec<Arc<EpgTag>> {
        self.inner
            .snapshot_tables()
            .iter()
            .flat_map(|table| table.tags())
            .collect()
    }

    pub fn tables(&self) -> Vec<Arc<Epg>> {
        self.inner.snapshot_tables()
    }

    pub fn get_first_epg_date(&self) -> Option<DateTime<Utc>> {
        self.inner
            .snapshot_tables()
            .iter()
            .filter_map(|table| table.first_date())
            .min()
    }

    pub fn get_last_epg_date(&self) -> Option<DateTime<Utc>> {
        self.inner
            .snapshot_tables()
            .iter()
            .filter_map(|table| table.last_date())
            .max()
    }

    /// Tags currently on air in channel-bound tables.
    pub fn get_epg_now(&self) -> Vec<Arc<EpgTag>> {
        let now = Utc::now();
        self.inner
            .snapshot_tables()
            .iter()
            .filter(|table| table.is_bound())
            .filter_map(|table| table.playing_tag(now))
            .collect()
    }

    /// Tags following the current ones in channel-bound tables.
    pub fn get_epg_next(&self) -> Vec<Arc<EpgTag>> {
        let now = Utc::now();
        self.inner
            .snapshot_tables()
            .iter()
            .filter(|table| table.is_bound())
            .filter_map(|table| table.next_tag(now))
            .collect()
    }

    /// Tags matching `filter` ordered by start time.
    pub fn search(&self, filter: &EpgSearchFilter) -> Vec<Arc<EpgTag>> {
        let now = Utc::now();
        let mut tags: Vec<_> = self
            .get_all_tags()
            .into_iter()
            .filter(|tag| filter.matches(tag, now))
            .collect();
        tags.sort_by_key(|tag| (tag.start_at, tag.client_id, tag.channel_uid));
        tags
    }

    // requests

    /// Requests a refresh of the table of a channel.
    pub fn update_request(&self, client_id: ClientId, channel_uid: ChannelUid) {
        tracing::debug!(client.id = %client_id, channel.uid = %channel_uid, "Update requested");
        self.inner.update_requests.push(UpdateRequest {
            client_id,
            channel_uid,
        });
    }

    /// Queues a tag change pushed by a provider.
    pub fn update_from_client(&self, tag: EpgTag, state: EpgEventState) {
        self.inner.tag_changes.push(TagStateChange { tag, state });
    }

    pub fn set_has_pending_updates(&self, has_pending_updates: bool) {
        self.inner.set_has_pending_updates(has_pending_updates);
    }

    /// Blocks until the running update pass finishes.
    ///
    /// Further updates are prevented until a table is created.
    pub async fn wait_for_update_finish(&self) {
        self.inner.wait_for_update_finish().await;
    }

    /// Persists dirty tables.  Returns `false` if any of them failed.
    pub async fn persist_all(&self) -> bool {
        self.inner.persist_all().await
    }

    /// Removes tags older than the look-back window.
    pub fn remove_old_entries(&self) {
        self.inner.remove_old_entries(Utc::now());
    }

    // events

    pub fn register_emitter(&self, msg: RegisterEmitter) -> EmitterId {
        let emitters = &self.inner.emitters;
        let id = match msg {
            RegisterEmitter::TablesChanged(emitter) => {
                EmitterId::TablesChanged(emitters.tables_changed.register(emitter))
            }
            RegisterEmitter::ActiveItemChanged(emitter) => {
                EmitterId::ActiveItemChanged(emitters.active_item_changed.register(emitter))
            }
            RegisterEmitter::ContainerReset(emitter) => {
                EmitterId::ContainerReset(emitters.container_reset.register(emitter))
            }
            RegisterEmitter::UpdateProgress(emitter) => {
                EmitterId::UpdateProgress(emitters.update_progress.register(emitter))
            }
            RegisterEmitter::UpdateFinished(emitter) => {
                EmitterId::UpdateFinished(emitters.update_finished.register(emitter))
            }
            RegisterEmitter::PersistFailed(emitter) => {
                EmitterId::PersistFailed(emitters.persist_failed.register(emitter))
            }
        };
        tracing::debug!(?id, "Registered emitter");
        id
    }

    pub fn unregister_emitter(&self, id: EmitterId) -> bool {
        let emitters = &self.inner.emitters;
        let removed = match id {
            EmitterId::TablesChanged(id) => emitters.tables_changed.unregister(id),
            EmitterId::ActiveItemChanged(id) => emitters.active_item_changed.unregister(id),
            EmitterId::ContainerReset(id) => emitters.container_reset.unregister(id),
            EmitterId::UpdateProgress(id) => emitters.update_progress.unregister(id),
            EmitterId::UpdateFinished(id) => emitters.update_finished.unregister(id),
            EmitterId::PersistFailed(id) => emitters.persist_failed.unregister(id),
        };
        tracing::debug!(?id, removed, "Unregistered emitter");
        removed
    }

    #[cfg(test)]
    async fn run_cycle(&self) {
        let token = self.inner.registry.locked().stop_token.clone();
        self.inner.process_cycle(&token).await;
    }
}

impl EpgSink for EpgContainer {
    fn update_from_client(&self, tag: EpgTag, state: EpgEventState) {
        EpgContainer::update_from_client(self, tag, state);
    }

    fn update_request(&self, client_id: ClientId, channel_uid: ChannelUid) {
        EpgContainer::update_request(self, client_id, channel_uid);
    }
}

impl Drop for EpgContainer {
    fn drop(&mut self) {
        // The background task holds its own reference to the inner state.
        self.inner.registry.locked().stop_token.cancel();
    }
}

pub enum RegisterEmitter {
    TablesChanged(Emitter<EpgTablesChanged>),
    ActiveItemChanged(Emitter<EpgActiveItemChanged>),
    ContainerReset(Emitter<EpgContainerReset>),
    UpdateProgress(Emitter<EpgUpdateProgress>),
    UpdateFinished(Emitter<EpgUpdateFinished>),
    PersistFailed(Emitter<EpgPersistFailed>),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EmitterId {
    TablesChanged(usize),
    ActiveItemChanged(usize),
    ContainerReset(usize),
    UpdateProgress(usize),
    UpdateFinished(usize),
    PersistFailed(usize),
}

// inner

struct Inner {
    config: Arc<Config>,
    database: Arc<dyn EpgDatabase>,
    providers: Providers,
    jobs: Arc<JobQueue>,
    registry: Mutex<Registry>,
    // Held while loading so that ids are allocated after persisted tables
    // have been registered.
    loaded: tokio::sync::Mutex<bool>,
    update_requests: UpdateRequestQueue,
    tag_changes: TagChangeQueue,
    // Only touched by the background task.
    deferred: Mutex<Vec<DeferredTagChange>>,
    // Tables changed since the last notification.
    pending_changes: Mutex<BTreeSet<TableId>>,
    emitters: Emitters,
    // Incremented each time an update pass finishes.
    update_finished: watch::Sender<u64>,
    playing: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Registry {
    tables: IndexMap<TableId, Arc<Epg>>,
    channels: HashMap<ChannelKey, TableId>,
    last_epg_id: i32,
    // Survives clear() so that ids are never reused in a process.
    max_issued_id: i32,
    next_full_update_time: DateTime<Utc>,
    last_cleanup: DateTime<Utc>,
    next_active_tag_check: DateTime<Utc>,
    is_initialising: bool,
    pending_updates: usize,
    prevent_updates: bool,
    is_updating: bool,
    started: bool,
    stop_token: CancellationToken,
}

impl Registry {
    fn new() -> Self {
        let now = Utc::now();
        Registry {
            tables: Default::default(),
            channels: Default::default(),
            last_epg_id: 0,
            max_issued_id: 0,
            next_full_update_time: DateTime::<Utc>::MIN_UTC,
            last_cleanup: now,
            next_active_tag_check: DateTime::<Utc>::MIN_UTC,
            is_initialising: true,
            pending_updates: 0,
            prevent_updates: false,
            is_updating: false,
            started: false,
            stop_token: CancellationToken::new(),
        }
    }

    fn reset_timing(&mut self, now: DateTime<Utc>) {
        self.next_full_update_time = DateTime::<Utc>::MIN_UTC;
        self.last_cleanup = now;
        self.next_active_tag_check = DateTime::<Utc>::MIN_UTC;
        self.is_initialising = true;
        self.pending_updates = 0;
        self.prevent_updates = false;
    }

    fn next_epg_id(&mut self) -> TableId {
        self.last_epg_id = self.last_epg_id.max(self.max_issued_id) + 1;
        self.max_issued_id = self.last_epg_id;
        self.last_epg_id.into()
    }

    fn insert(&mut self, table: Arc<Epg>) {
        let id = table.id();
        self.last_epg_id = self.last_epg_id.max(id.value());
        self.max_issued_id = self.max_issued_id.max(id.value());
        self.tables.insert(id, table);
    }
}

#[derive(Default)]
struct Emitters {
    tables_changed: EmitterRegistry<EpgTablesChanged>,
    active_item_changed: EmitterRegistry<EpgActiveItemChanged>,
    container_reset: EmitterRegistry<EpgContainerReset>,
    update_progress: EmitterRegistry<EpgUpdateProgress>,
    update_finished: EmitterRegistry<EpgUpdateFinished>,
    persist_failed: EmitterRegistry<EpgPersistFailed>,
}

impl Inner {
    // lifecycle

    async fn start_sync(self: &Arc<Self>) {
        self.stop().await;

        let now = Utc::now();
        let token = {
            let mut registry = self.registry.locked();
            registry.reset_timing(now);
            registry.stop_token = CancellationToken::new();
            registry.started = true;
            registry.stop_token.clone()
        };

        self.load_from_db().await;
        self.check_playing_events(Utc::now()).await;

        let handle = tokio::spawn(self.clone().run(token));
        *self.worker.locked() = Some(handle);
        tracing::info!("Started");
    }

    async fn stop(&self) {
        let handle = {
            let registry = self.registry.locked();
            registry.stop_token.cancel();
            self.worker.locked().take()
        };
        let handle = match handle {
            Some(handle) => handle,
            None => return,
        };
        if let Err(err) = handle.await {
            tracing::error!(%err, "Background task failed");
        }
        self.database.close();
        {
            let mut registry = self.registry.locked();
            registry.started = false;
            registry.is_updating = false;
        }
        *self.loaded.lock().await = false;
        tracing::info!("Stopped");
    }

    async fn clear(self: &Arc<Self>) {
        let was_started = self.registry.locked().started;
        if was_started {
            self.stop().await;
        }

        {
            let mut registry = self.registry.locked();
            registry.tables.clear();
            registry.channels.clear();
            registry.last_epg_id = 0;
            registry.reset_timing(Utc::now());
        }
        *self.loaded.lock().await = false;
        self.update_requests.clear();
        self.tag_changes.clear();
        self.deferred.locked().clear();
        self.pending_changes.locked().clear();
        tracing::info!("Cleared");

        self.emitters.container_reset.emit(EpgContainerReset).await;

        if was_started {
            self.start_sync().await;
        }
    }

    async fn reset(self: &Arc<Self>) -> Result<(), Error> {
        let was_started = self.registry.locked().started;
        if was_started {
            self.stop().await;
        }
        if !self.config.epg.ignore_database {
            self.database.open()?;
            self.database.delete_all()?;
            self.database.close();
            tracing::info!("Deleted all persisted data");
        }
        self.clear().await;
        if was_started {
            self.start_sync().await;
        }
        Ok(())
    }

    /// Returns `None` if persistence is disabled.
    fn database(&self) -> Result<Option<&dyn EpgDatabase>, Error> {
        if self.config.epg.ignore_database {
            return Ok(None);
        }
        if !self.database.is_open() {
            self.database.open()?;
        }
        Ok(Some(self.database.as_ref()))
    }

    // Does nothing if persistence is disabled.
    fn with_database<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Default,
        F: FnOnce(&dyn EpgDatabase) -> Result<T, Error>,
    {
        match self.database()? {
            Some(database) => f(database),
            None => Ok(T::default()),
        }
    }

    // Loads persisted tables once.  A failed load is retried on the next call.
    async fn load_from_db(&self) {
        let mut loaded = self.loaded.lock().await;
        if *loaded {
            return;
        }
        let database = match self.database() {
            Ok(Some(database)) => database,
            Ok(None) => {
                *loaded = true;
                return;
            }
            Err(err) => {
                tracing::error!(%err, "Failed to open the database");
                return;
            }
        };

        let start = Instant::now();
        let before = Utc::now().sub_days(self.config.epg.past_days_to_display);
        match read_tables(database, before) {
            Ok((last_epg_id, tables)) => {
                let n = tables.len();
                let mut registry = self.registry.locked();
                registry.last_epg_id = registry.last_epg_id.max(last_epg_id);
                for table in tables.into_iter() {
                    if registry.tables.contains_key(&table.id()) {
                        tracing::debug!(epg.id = %table.id(), "Already registered, skip");
                        continue;
                    }
                    registry.insert(table);
                }
                *loaded = true;
                let elapsed = humantime::format_duration(start.elapsed());
                tracing::info!(tables = n, %elapsed, "Loaded");
            }
            Err(err) => {
                tracing::error!(%err, "Failed to load tables from the database");
            }
        }
    }

    // tables

    async fn create_channel_epg(
        &self,
        epg_id: TableId,
        scraper_name: &str,
        channel: Option<EpgChannelData>,
    ) -> Arc<Epg> {
        self.wait_for_update_finish().await;
        self.load_from_db().await;

        let mut registry = self.registry.locked();
        let key = channel.as_ref().map(EpgChannelData::key);

        let existing = if epg_id.is_valid() {
            registry.tables.get(&epg_id).cloned()
        } else if let Some(key) = key {
            // A table already bound to the channel, or a rehydrated one which
            // was persisted for the channel.
            registry
                .channels
                .get(&key)
                .and_then(|id| registry.tables.get(id))
                .or_else(|| {
                    registry
                        .tables
                        .values()
                        .find(|table| !table.is_bound() && table.channel_key() == Some(key))
                })
                .cloned()
        } else {
            None
        };

        let table = match existing {
            Some(table) => table,
            None => {
                let id = if epg_id.is_valid() {
                    epg_id
                } else {
                    registry.next_epg_id()
                };
                let table = Arc::new(Epg::new(id, scraper_name, None));
                registry.insert(table.clone());
                tracing::info!(epg.id = %id, scraper = scraper_name, "Created");
                table
            }
        };

        if let Some(channel) = channel {
            let key = channel.key();
            if let Some(old_key) = table.channel_key().filter(|old_key| *old_key != key) {
                if registry.channels.get(&old_key) == Some(&table.id()) {
                    registry.channels.remove(&old_key);
                }
            }
            table.bind_channel(channel);
            registry.channels.insert(key, table.id());
        }

        registry.prevent_updates = false;
        registry.next_full_update_time = Utc::now();
        table
    }

    fn delete_epg(&self, table: &Epg, delete_from_db: bool) -> bool {
        let id = table.id();
        if !id.is_valid() {
            return false;
        }
        {
            let mut registry = self.registry.locked();
            if registry.tables.shift_remove(&id).is_none() {
                return false;
            }
            registry.channels.retain(|_, table_id| *table_id != id);
        }

        if delete_from_db {
            if let Err(err) = self.with_database(|database| database.delete(id)) {
                tracing::error!(epg.id = %id, %err, "Failed to delete from the database");
            }
        }

        self.pending_changes.locked().insert(id);
        tracing::info!(epg.id = %id, "Deleted");
        true
    }

    fn get_by_id(&self, id: TableId) -> Option<Arc<Epg>> {
        self.registry.locked().tables.get(&id).cloned()
    }

    fn get_by_channel_key(&self, key: ChannelKey) -> Option<Arc<Epg>> {
        let registry = self.registry.locked();
        registry
            .channels
            .get(&key)
            .and_then(|id| registry.tables.get(id))
            .cloned()
    }

    fn snapshot_tables(&self) -> Vec<Arc<Epg>> {
        self.registry.locked().tables.values().cloned().collect()
    }

    // requests

    fn set_has_pending_updates(&self, has_pending_updates: bool) {
        let mut registry = self.registry.locked();
        if has_pending_updates {
            registry.pending_updates += 1;
        } else {
            registry.pending_updates = 0;
        }
    }

    async fn wait_for_update_finish(&self) {
        let mut receiver = {
            let mut registry = self.registry.locked();
            registry.prevent_updates = true;
            if !registry.is_updating {
                return;
            }
            self.update_finished.subscribe()
        };
        tracing::debug!("Waiting for the update pass to finish...");
        let _ = receiver.changed().await;
    }

    async fn persist_all(&self) -> bool {
        // Dirty tables are reported as failed if the database cannot be opened.
        let database = match self.database() {
            Ok(Some(database)) => Ok(database),
            Ok(None) => return true,
            Err(err) => {
                tracing::error!(%err, "Failed to open the database");
                Err(err.to_string())
            }
        };

        let tables = self.snapshot_tables();
        let mut failures = vec![];
        for table in tables.iter().filter(|table| table.needs_save()) {
            let result = match &database {
                Ok(database) => table.persist(*database).map_err(|err| err.to_string()),
                Err(reason) => Err(reason.clone()),
            };
            if let Err(reason) = result {
                tracing::error!(epg.id = %table.id(), %reason, "Failed to persist");
                failures.push(EpgPersistFailed {
                    table_id: table.id(),
                    reason,
                });
            }
        }
        let result = database.is_ok() && failures.is_empty();
        for msg in failures.into_iter() {
            self.emitters.persist_failed.emit(msg).await;
        }
        result
    }

    fn remove_old_entries(&self, now: DateTime<Utc>) {
        let before = now.sub_days(self.config.epg.past_days_to_display);
        for table in self.snapshot_tables().iter() {
            if table.cleanup(before) > 0 {
                self.pending_changes.locked().insert(table.id());
            }
        }
        match self.with_database(|database| database.delete_epg_entries(before)) {
            Ok(n) => tracing::debug!(removed = n, "Removed old entries from the database"),
            Err(err) => tracing::error!(%err, "Failed to remove old entries"),
        }
    }

    // background

    async fn run(self: Arc<Self>, token: CancellationToken) {
        tracing::debug!("Background task started");
        let mut last_persist = Instant::now();
        while !token.is_cancelled() {
            self.process_cycle(&token).await;

            if last_persist.elapsed() >= self.config.epg.persist_interval {
                self.persist_all().await;
                last_persist = Instant::now();
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(CYCLE_INTERVAL) => (),
            }
        }
        self.persist_all().await;
        tracing::debug!("Background task stopped");
    }

    async fn process_cycle(&self, token: &CancellationToken) {
        let config = &self.config.epg;

        // full update
        let now = Utc::now();
        let due = {
            let registry = self.registry.locked();
            !token.is_cancelled()
                && !registry.prevent_updates
                && now >= registry.next_full_update_time
                && !registry.channels.is_empty()
        };
        if due && self.update_epg(false, token).await {
            self.registry.locked().is_initialising = false;
        }

        // cleanup
        let now = Utc::now();
        let due = {
            let registry = self.registry.locked();
            now >= registry.last_cleanup.add_std(config.cleanup_interval)
        };
        if due {
            self.remove_old_entries(now);
            self.registry.locked().last_cleanup = now;
        }

        self.process_update_requests();
        self.process_tag_changes(Utc::now());

        // pending updates
        let pending = !token.is_cancelled() && self.registry.locked().pending_updates > 0;
        if pending && self.update_epg(true, token).await {
            self.registry.locked().pending_updates = 0;
        }

        // active tags
        let now = Utc::now();
        let due = now >= self.registry.locked().next_active_tag_check;
        if due {
            self.check_playing_events(now).await;
            let next = now
                .add_std(config.active_tag_check_interval)
                .trunc_to_minute();
            let next = if next > now {
                next
            } else {
                now.add_std(config.active_tag_check_interval)
            };
            self.registry.locked().next_active_tag_check = next;
        }

        self.flush_pending_changes().await;
    }

    fn is_interrupted(&self, registry: &Registry, token: &CancellationToken) -> bool {
        token.is_cancelled()
            || registry.prevent_updates
            || (self.config.epg.prevent_updates_while_playing
                && self.playing.load(Ordering::SeqCst))
    }

    /// Runs an update pass.  Returns `false` if interrupted.
    async fn update_epg(&self, only_pending: bool, token: &CancellationToken) -> bool {
        let config = &self.config.epg;
        let now = Utc::now();

        let (tables, show_progress) = {
            let mut registry = self.registry.locked();
            if self.is_interrupted(&registry, token) {
                if !only_pending {
                    registry.next_full_update_time =
                        now.add_std(config.retry_interrupted_update_interval);
                }
                tracing::debug!(only_pending, "Update interrupted before starting");
                return false;
            }
            registry.is_updating = true;
            let show_progress = config.display_update_popup
                && (registry.is_initialising || config.display_incremental_update_popup);
            let tables: Vec<_> = registry.tables.values().cloned().collect();
            (tables, show_progress)
        };

        tracing::debug!(only_pending, tables = tables.len(), "Updating...");
        let start = Instant::now();
        let params = UpdateParams {
            now,
            start: now.sub_days(config.past_days_to_display),
            end: now.add_days(config.future_days_to_display),
            refresh_interval: config.update_interval,
            past_days: config.past_days_to_display,
            only_pending,
        };

        let total = tables.len();
        let mut interrupted = false;
        let mut invalid = vec![];
        for (i, table) in tables.iter().enumerate() {
            let stop = {
                let registry = self.registry.locked();
                self.is_interrupted(&registry, token)
            };
            if stop {
                interrupted = true;
                break;
            }

            if show_progress {
                let msg = EpgUpdateProgress {
                    current: i + 1,
                    total,
                    table_name: table.name(),
                };
                self.emitters.update_progress.emit(msg).await;
            }

            if let Some(channel) = table.channel() {
                match self.providers.get(channel.client_id) {
                    Ok(provider) => match table.update(&params, provider.as_ref(), false).await {
                        Ok(true) => {
                            self.pending_changes.locked().insert(table.id());
                        }
                        Ok(false) => (),
                        Err(err) => {
                            tracing::error!(epg.id = %table.id(), %err, "Failed to update");
                        }
                    },
                    Err(err) => {
                        tracing::warn!(epg.id = %table.id(), %err, "Skip");
                    }
                }
            }

            if !table.is_valid() {
                invalid.push(table.clone());
            }
        }

        for table in invalid.iter() {
            tracing::info!(epg.id = %table.id(), "Deleting invalid table");
            self.delete_epg(table, true);
        }

        {
            let mut registry = self.registry.locked();
            registry.is_updating = false;
            if !only_pending {
                registry.next_full_update_time = if interrupted {
                    now.add_std(config.retry_interrupted_update_interval)
                } else {
                    now.add_std(config.update_interval)
                };
            }
        }
        self.update_finished.send_modify(|n| *n = n.wrapping_add(1));

        let elapsed = start.elapsed();
        tracing::info!(
            only_pending,
            interrupted,
            elapsed = %humantime::format_duration(elapsed),
            "Update pass done"
        );
        self.emitters
            .update_finished
            .emit(EpgUpdateFinished { interrupted })
            .await;
        !interrupted
    }

    fn process_update_requests(&self) {
        for request in self.update_requests.drain() {
            match self.get_by_channel_key(request.channel_key()) {
                Some(table) => {
                    tracing::debug!(epg.id = %table.id(), "Forcing update");
                    table.force_update();
                    self.set_has_pending_updates(true);
                }
                None => {
                    tracing::warn!(
                        client.id = %request.client_id,
                        channel.uid = %request.channel_uid,
                        "No table for the channel, drop the update request"
                    );
                }
            }
        }
    }

    /// Delivers queued tag changes until the time slice is used up.
    ///
    /// At least one change is delivered per call so that the queue drains
    /// even with a zero time slice.  Returns the number of popped changes.
    fn process_tag_changes(&self, now: DateTime<Utc>) -> usize {
        let mut deferred = vec![];
        let retries = std::mem::take(&mut *self.deferred.locked());
        for mut entry in retries.into_iter() {
            if self.deliver_tag_change(&entry.change, now) {
                continue;
            }
            entry.attempts += 1;
            if entry.attempts >= DeferredTagChange::MAX_ATTEMPTS {
                tracing::warn!(
                    tag = %entry.change.tag,
                    attempts = entry.attempts,
                    "No table for the tag, drop the change"
                );
            } else {
                deferred.push(entry);
            }
        }

        let time_slice = self.config.epg.tag_change_time_slice;
        let start = Instant::now();
        let mut processed = 0;
        while let Some(change) = self.tag_changes.pop() {
            if !self.deliver_tag_change(&change, now) {
                tracing::debug!(tag = %change.tag, "Deferred");
                deferred.push(DeferredTagChange::new(change));
            }
            processed += 1;
            if start.elapsed() >= time_slice {
                break;
            }
        }

        self.deferred.locked().extend(deferred);
        if processed > 0 {
            tracing::debug!(processed, remaining = self.tag_changes.len(), "Delivered tag changes");
        }
        processed
    }

    fn deliver_tag_change(&self, change: &TagStateChange, now: DateTime<Utc>) -> bool {
        let table = change
            .tag
            .table_id
            .filter(TableId::is_valid)
            .and_then(|id| self.get_by_id(id))
            .or_else(|| self.get_by_channel_key(change.tag.channel_key()));
        match table {
            Some(table) => {
                if table.update_entry(&change.tag, change.state, now) {
                    self.pending_changes.locked().insert(table.id());
                }
                true
            }
            None => false,
        }
    }

    async fn check_playing_events(&self, now: DateTime<Utc>) {
        let table_ids: Vec<_> = self
            .snapshot_tables()
            .iter()
            .filter(|table| table.check_playing_event(now))
            .map(|table| table.id())
            .collect();
        if !table_ids.is_empty() {
            tracing::debug!(tables = table_ids.len(), "Active items changed");
            self.emitters
                .active_item_changed
                .emit(EpgActiveItemChanged { table_ids })
                .await;
        }
    }

    async fn flush_pending_changes(&self) {
        let table_ids: Vec<_> = std::mem::take(&mut *self.pending_changes.locked())
            .into_iter()
            .collect();
        if !table_ids.is_empty() {
            self.emitters
                .tables_changed
                .emit(EpgTablesChanged { table_ids })
                .await;
        }
    }
}

// Reads all persisted tables after removing expired tags.
fn read_tables(
    database: &dyn EpgDatabase,
    before: DateTime<Utc>,
) -> Result<(i32, Vec<Arc<Epg>>), Error> {
    let _lock = DatabaseLock::new(database)?;
    database.delete_epg_entries(before)?;
    let last_epg_id = database.last_epg_id()?;
    let mut tables = vec![];
    for record in database.get_all()? {
        let table = Epg::from_record(record);
        table.load(database)?;
        tables.push(Arc::new(table));
    }
    Ok((last_epg_id, tables))
}
