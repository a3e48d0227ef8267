use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;

use crate::database::EpgDatabase;
use crate::database::EpgRecord;
use crate::datetime_ext::DateTimeExt;
use crate::error::Error;
use crate::models::BroadcastId;
use crate::models::ChannelKey;
use crate::models::EpgChannelData;
use crate::models::EpgEventState;
use crate::models::EpgTag;
use crate::models::TableId;
use crate::provider::EpgProvider;
use crate::sync_ext::MutexExt;

/// Parameters of an update pass.
#[derive(Clone, Debug)]
pub struct UpdateParams {
    pub now: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub refresh_interval: Duration,
    pub past_days: u32,
    /// Only tables with a pending update are updated.
    pub only_pending: bool,
}

/// The schedule of a single channel.
///
/// Tags are ordered by start time and indexed by broadcast id.  All methods
/// take `&self`; the state is guarded by an internal mutex which is never held
/// across an `await`.
pub struct Epg {
    id: TableId,
    scraper_name: String,
    state: Mutex<TableState>,
}

struct TableState {
    name: String,
    channel: Option<EpgChannelData>,
    // Channel key read from the database, used for rebinding after restart.
    persisted_channel: Option<ChannelKey>,
    tags: BTreeMap<(DateTime<Utc>, BroadcastId), Arc<EpgTag>>,
    index: HashMap<BroadcastId, DateTime<Utc>>,
    last_scan: Option<DateTime<Utc>>,
    update_pending: bool,
    valid: bool,
    now_active: Option<BroadcastId>,
    changes: u64,
    saved_changes: u64,
}

impl Epg {
    pub fn new<S: Into<String>>(
        id: TableId,
        scraper_name: S,
        channel: Option<EpgChannelData>,
    ) -> Self {
        let name = channel
            .as_ref()
            .map(|channel| channel.name.clone())
            .unwrap_or_default();
        Epg {
            id,
            scraper_name: scraper_name.into(),
            state: Mutex::new(TableState {
                name,
                channel,
                persisted_channel: None,
                tags: Default::default(),
                index: Default::default(),
                last_scan: None,
                update_pending: false,
                valid: true,
                now_active: None,
                // A new table has never been saved.
                changes: 1,
                saved_changes: 0,
            }),
        }
    }

    /// Rehydrates a table from its persisted record.  Tags are loaded
    /// separately with `load()`.
    pub fn from_record(record: EpgRecord) -> Self {
        Epg {
            id: record.id,
            scraper_name: record.scraper_name,
            state: Mutex::new(TableState {
                name: record.name,
                channel: None,
                persisted_channel: record.channel,
                tags: Default::default(),
                index: Default::default(),
                last_scan: record.last_scan,
                update_pending: false,
                valid: true,
                now_active: None,
                changes: 0,
                saved_changes: 0,
            }),
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> String {
        self.state.locked().name.clone()
    }

    pub fn scraper_name(&self) -> &str {
        &self.scraper_name
    }

    pub fn channel(&self) -> Option<EpgChannelData> {
        self.state.locked().channel.clone()
    }

    /// The key of the bound channel, or the persisted one if not bound yet.
    pub fn channel_key(&self) -> Option<ChannelKey> {
        let state = self.state.locked();
        state
            .channel
            .as_ref()
            .map(EpgChannelData::key)
            .or(state.persisted_channel)
    }

    pub fn is_bound(&self) -> bool {
        self.state.locked().channel.is_some()
    }

    pub fn bind_channel(&self, channel: EpgChannelData) {
        let mut state = self.state.locked();
        if state.channel.as_ref() == Some(&channel) {
            return;
        }
        tracing::debug!(epg.id = %self.id, channel = %channel.key(), "Bound");
        state.name = channel.name.clone();
        state.persisted_channel = Some(channel.key());
        state.channel = Some(channel);
        state.changes += 1;
    }

    pub fn len(&self) -> usize {
        self.state.locked().tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_scan(&self) -> Option<DateTime<Utc>> {
        self.state.locked().last_scan
    }

    /// Pulls tags in the window from `provider`.
    ///
    /// Returns `Ok(true)` if something changed and `Ok(false)` if nothing
    /// changed or the table is not due.  The table is left untouched on
    /// failure.
    pub async fn update(
        &self,
        params: &UpdateParams,
        provider: &dyn EpgProvider,
        force: bool,
    ) -> Result<bool, Error> {
        let channel = {
            let state = self.state.locked();
            if !Self::is_due(&state, params, force) {
                return Ok(false);
            }
            match state.channel {
                Some(ref channel) => channel.clone(),
                None => return Err(Error::ChannelNotBound(self.id)),
            }
        };

        let tags = provider
            .get_epg_for_channel(&channel, params.start, params.end)
            .await?;

        let mut state = self.state.locked();
        let mut changed = false;
        for tag in tags.iter() {
            changed |= Self::upsert(&mut state, self.id, tag);
        }
        let removed = Self::remove_before(&mut state, params.now.sub_days(params.past_days));
        changed |= removed > 0;
        state.last_scan = Some(params.now);
        state.update_pending = false;
        state.changes += 1;
        tracing::debug!(epg.id = %self.id, tags.len = tags.len(), removed, changed, "Updated");
        Ok(changed)
    }

    fn is_due(state: &TableState, params: &UpdateParams, force: bool) -> bool {
        if params.only_pending {
            return state.update_pending;
        }
        if force || state.update_pending {
            return true;
        }
        match state.last_scan {
            None => true,
            Some(last_scan) => last_scan.add_std(params.refresh_interval) <= params.now,
        }
    }

    /// Applies a change pushed by a provider.
    ///
    /// A deleted tag is removed only if it has not started yet.
    pub fn update_entry(&self, tag: &EpgTag, state: EpgEventState, now: DateTime<Utc>) -> bool {
        let mut table = self.state.locked();
        let changed = match state {
            EpgEventState::Created | EpgEventState::Updated => {
                Self::upsert(&mut table, self.id, tag)
            }
            EpgEventState::Deleted => match table.index.get(&tag.broadcast_id).copied() {
                Some(start_at) if start_at > now => {
                    table.tags.remove(&(start_at, tag.broadcast_id));
                    table.index.remove(&tag.broadcast_id);
                    true
                }
                _ => false,
            },
        };
        if changed {
            table.changes += 1;
        }
        changed
    }

    fn upsert(state: &mut TableState, id: TableId, tag: &EpgTag) -> bool {
        let existing = state
            .index
            .get(&tag.broadcast_id)
            .copied()
            .and_then(|start_at| state.tags.remove(&(start_at, tag.broadcast_id)));
        let (entry, changed) = match existing {
            Some(mut entry) => {
                let changed = Arc::make_mut(&mut entry).update(tag);
                (entry, changed)
            }
            None => {
                let mut entry = tag.clone();
                entry.table_id = Some(id);
                (Arc::new(entry), true)
            }
        };
        state.index.insert(entry.broadcast_id, entry.start_at);
        state.tags.insert((entry.start_at, entry.broadcast_id), entry);
        if changed {
            state.changes += 1;
        }
        changed
    }

    /// Removes tags which end before `before`.  Returns the number of removed
    /// tags.
    pub fn cleanup(&self, before: DateTime<Utc>) -> usize {
        let mut state = self.state.locked();
        let removed = Self::remove_before(&mut state, before);
        if removed > 0 {
            tracing::debug!(epg.id = %self.id, removed, "Cleaned up");
        }
        removed
    }

    fn remove_before(state: &mut TableState, before: DateTime<Utc>) -> usize {
        let expired: Vec<_> = state
            .tags
            .iter()
            .filter(|(_, tag)| tag.end_at < before)
            .map(|(&key, _)| key)
            .collect();
        for key in expired.iter() {
            state.tags.remove(key);
            state.index.remove(&key.1);
        }
        if !expired.is_empty() {
            state.changes += 1;
        }
        expired.len()
    }

    /// Returns `true` if the playing tag has changed since the last check.
    pub fn check_playing_event(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.locked();
        let playing = Self::find_playing(&state, now).map(|tag| tag.broadcast_id);
        if playing == state.now_active {
            return false;
        }
        state.now_active = playing;
        true
    }

    pub fn playing_tag(&self, now: DateTime<Utc>) -> Option<Arc<EpgTag>> {
        let state = self.state.locked();
        Self::find_playing(&state, now).cloned()
    }

    fn find_playing(state: &TableState, now: DateTime<Utc>) -> Option<&Arc<EpgTag>> {
        state
            .tags
            .range(..=(now, BroadcastId::from(u32::MAX)))
            .next_back()
            .map(|(_, tag)| tag)
            .filter(|tag| tag.is_active(now))
    }

    pub fn next_tag(&self, now: DateTime<Utc>) -> Option<Arc<EpgTag>> {
        self.state
            .locked()
            .tags
            .values()
            .find(|tag| tag.start_at > now)
            .cloned()
    }

    pub fn first_date(&self) -> Option<DateTime<Utc>> {
        self.state
            .locked()
            .tags
            .values()
            .next()
            .map(|tag| tag.start_at)
    }

    pub fn last_date(&self) -> Option<DateTime<Utc>> {
        self.state
            .locked()
            .tags
            .values()
            .map(|tag| tag.end_at)
            .max()
    }

    pub fn tags(&self) -> Vec<Arc<EpgTag>> {
        self.state.locked().tags.values().cloned().collect()
    }

    pub fn tag_by_broadcast_id(&self, id: BroadcastId) -> Option<Arc<EpgTag>> {
        let state = self.state.locked();
        state
            .index
            .get(&id)
            .and_then(|&start_at| state.tags.get(&(start_at, id)))
            .cloned()
    }

    pub fn force_update(&self) {
        self.state.locked().update_pending = true;
    }

    pub fn update_pending(&self) -> bool {
        self.state.locked().update_pending
    }

    pub fn needs_save(&self) -> bool {
        let state = self.state.locked();
        state.changes != state.saved_changes
    }

    pub fn record(&self) -> EpgRecord {
        let state = self.state.locked();
        Self::make_record(self, &state)
    }

    fn make_record(&self, state: &TableState) -> EpgRecord {
        EpgRecord {
            id: self.id,
            name: state.name.clone(),
            scraper_name: self.scraper_name.clone(),
            channel: state
                .channel
                .as_ref()
                .map(EpgChannelData::key)
                .or(state.persisted_channel),
            last_scan: state.last_scan,
        }
    }

    /// Writes the table into `database`.
    ///
    /// A mutation racing with this call keeps the table dirty.
    pub fn persist(&self, database: &dyn EpgDatabase) -> Result<(), Error> {
        let (record, tags, changes) = {
            let state = self.state.locked();
            let tags: Vec<EpgTag> = state.tags.values().map(|tag| (**tag).clone()).collect();
            (self.make_record(&state), tags, state.changes)
        };
        database.persist(&record, &tags)?;
        let mut state = self.state.locked();
        if state.saved_changes < changes {
            state.saved_changes = changes;
        }
        tracing::debug!(epg.id = %self.id, tags.len = tags.len(), "Persisted");
        Ok(())
    }

    /// Replaces tags with the persisted ones.
    pub fn load(&self, database: &dyn EpgDatabase) -> Result<usize, Error> {
        let tags = database.load_tags(self.id)?;
        let mut state = self.state.locked();
        state.tags.clear();
        state.index.clear();
        for mut tag in tags.into_iter() {
            tag.table_id = Some(self.id);
            state.index.insert(tag.broadcast_id, tag.start_at);
            state.tags.insert((tag.start_at, tag.broadcast_id), Arc::new(tag));
        }
        Ok(state.tags.len())
    }

    pub fn is_valid(&self) -> bool {
        let state = self.state.locked();
        if !state.valid || self.scraper_name.is_empty() {
            return false;
        }
        match state.channel {
            Some(ref channel) => channel.epg_enabled,
            None => true,
        }
    }

    /// Marks the table as invalid.  The container deletes invalid tables after
    /// an update pass.
    pub fn mark_invalid(&self) {
        self.state.locked().valid = false;
    }
}

impl fmt::Debug for Epg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.locked();
        f.debug_struct("Epg")
            .field("id", &self.id)
            .field("name", &state.name)
            .field("scraper_name", &self.scraper_name)
            .field("channel", &state.channel)
            .field("tags", &state.tags.len())
            .finish()
    }
}
