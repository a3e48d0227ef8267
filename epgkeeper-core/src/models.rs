use std::fmt;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct TableId(i32);

impl TableId {
    pub fn value(&self) -> i32 {
        self.0
    }

    // Ids less than or equal to 0 are used for requesting a new allocation.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPG#{}", self.0)
    }
}

impl From<i32> for TableId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct ClientId(i32);

impl ClientId {
    pub fn value(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CLIENT#{}", self.0)
    }
}

impl From<i32> for ClientId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct ChannelUid(i32);

impl ChannelUid {
    pub fn value(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for ChannelUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UID#{}", self.0)
    }
}

impl From<i32> for ChannelUid {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct BroadcastId(u32);

impl BroadcastId {
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BID#{}", self.0)
    }
}

impl From<u32> for BroadcastId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Identifies a channel across providers.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelKey {
    pub client_id: ClientId,
    pub channel_uid: ChannelUid,
}

impl ChannelKey {
    pub fn new(client_id: ClientId, channel_uid: ChannelUid) -> Self {
        ChannelKey {
            client_id,
            channel_uid,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id.0, self.channel_uid.0)
    }
}

impl From<(i32, i32)> for ChannelKey {
    fn from((client_id, channel_uid): (i32, i32)) -> Self {
        ChannelKey::new(client_id.into(), channel_uid.into())
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpgChannelData {
    pub client_id: ClientId,
    pub channel_uid: ChannelUid,
    pub name: String,
    #[serde(default = "EpgChannelData::default_epg_enabled")]
    pub epg_enabled: bool,
}

impl EpgChannelData {
    pub fn new<S: Into<String>>(client_id: ClientId, channel_uid: ChannelUid, name: S) -> Self {
        EpgChannelData {
            client_id,
            channel_uid,
            name: name.into(),
            epg_enabled: true,
        }
    }

    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.client_id, self.channel_uid)
    }

    fn default_epg_enabled() -> bool {
        true
    }
}

/// A single broadcast event in a schedule table.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpgTag {
    pub broadcast_id: BroadcastId,
    // Unset until the tag gets delivered to its owning table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<TableId>,
    pub client_id: ClientId,
    pub channel_uid: ChannelUid,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot_outline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_name: Option<String>,
    #[serde(default)]
    pub genre_type: u8,
    #[serde(default)]
    pub genre_sub_type: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_number: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_number: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_path: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

impl EpgTag {
    pub fn new(
        broadcast_id: BroadcastId,
        channel: ChannelKey,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Self {
        EpgTag {
            broadcast_id,
            table_id: None,
            client_id: channel.client_id,
            channel_uid: channel.channel_uid,
            title: Default::default(),
            plot_outline: None,
            plot: None,
            episode_name: None,
            genre_type: 0,
            genre_sub_type: 0,
            series_number: None,
            episode_number: None,
            icon_path: None,
            start_at,
            end_at,
        }
    }

    pub fn channel_key(&self) -> ChannelKey {
        ChannelKey::new(self.client_id, self.channel_uid)
    }

    pub fn title(&self) -> &str {
        if self.title.is_empty() {
            "NO TITLE"
        } else {
            &self.title
        }
    }

    pub fn duration(&self) -> Duration {
        self.end_at - self.start_at
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start_at <= now && now < self.end_at
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.start_at <= now
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.end_at <= now
    }

    /// Copies the broadcast data of `other` into `self`.
    ///
    /// The identity of `self` (broadcast id, table binding and channel) is
    /// preserved.  Returns `true` if something changed.
    pub fn update(&mut self, other: &EpgTag) -> bool {
        let changed = self.title != other.title
            || self.plot_outline != other.plot_outline
            || self.plot != other.plot
            || self.episode_name != other.episode_name
            || self.genre_type != other.genre_type
            || self.genre_sub_type != other.genre_sub_type
            || self.series_number != other.series_number
            || self.episode_number != other.episode_number
            || self.icon_path != other.icon_path
            || self.start_at != other.start_at
            || self.end_at != other.end_at;
        if changed {
            self.title = other.title.clone();
            self.plot_outline = other.plot_outline.clone();
            self.plot = other.plot.clone();
            self.episode_name = other.episode_name.clone();
            self.genre_type = other.genre_type;
            self.genre_sub_type = other.genre_sub_type;
            self.series_number = other.series_number;
            self.episode_number = other.episode_number;
            self.icon_path = other.icon_path.clone();
            self.start_at = other.start_at;
            self.end_at = other.end_at;
        }
        changed
    }
}

impl fmt::Display for EpgTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({} - {})",
            self.broadcast_id,
            self.channel_key(),
            self.start_at.to_rfc3339(),
            self.end_at.to_rfc3339()
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EpgEventState {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for EpgEventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpgEventState::Created => write!(f, "created"),
            EpgEventState::Updated => write!(f, "updated"),
            EpgEventState::Deleted => write!(f, "deleted"),
        }
    }
}

/// Criteria for searching tags over all tables.
#[derive(Clone, Debug, Default)]
pub struct EpgSearchFilter {
    /// Case-insensitive substring of the title.
    pub keyword: Option<String>,
    pub client_id: Option<ClientId>,
    pub channel_uid: Option<ChannelUid>,
    pub genre_type: Option<u8>,
    /// Tags which end at or before this time are excluded.
    pub start_after: Option<DateTime<Utc>>,
    /// Tags which start at or after this time are excluded.
    pub end_before: Option<DateTime<Utc>>,
    pub include_ended: bool,
}

impl EpgSearchFilter {
    pub fn matches(&self, tag: &EpgTag, now: DateTime<Utc>) -> bool {
        if !self.include_ended && tag.has_ended(now) {
            return false;
        }
        if let Some(ref keyword) = self.keyword {
            if !tag.title.to_lowercase().contains(&keyword.to_lowercase()) {
                return false;
            }
        }
        if matches!(self.client_id, Some(client_id) if client_id != tag.client_id) {
            return false;
        }
        if matches!(self.channel_uid, Some(uid) if uid != tag.channel_uid) {
            return false;
        }
        if matches!(self.genre_type, Some(genre) if genre != tag.genre_type) {
            return false;
        }
        if matches!(self.start_after, Some(time) if tag.end_at <= time) {
            return false;
        }
        if matches!(self.end_before, Some(time) if tag.start_at >= time) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_table_id_is_valid() {
        assert!(!TableId::from(-1).is_valid());
        assert!(!TableId::from(0).is_valid());
        assert!(TableId::from(1).is_valid());
    }

    #[test]
    fn test_channel_key_display() {
        assert_eq!(ChannelKey::from((1, 100)).to_string(), "1/100");
    }

    #[test]
    fn test_epg_tag_is_active() {
        let now = Utc::now();
        let tag = tag!(1, now - Duration::minutes(10), now + Duration::minutes(20));
        assert!(tag.is_active(now));
        assert!(tag.has_started(now));
        assert!(!tag.has_ended(now));
        assert!(!tag.is_active(now + Duration::minutes(20)));
        assert!(tag.has_ended(now + Duration::minutes(20)));
        assert!(!tag.has_started(now - Duration::minutes(11)));
        assert_eq!(tag.duration(), Duration::minutes(30));
    }

    #[test]
    fn test_epg_tag_update() {
        let now = Utc::now();
        let mut tag = tag!(1, now, now + Duration::minutes(30));
        tag.table_id = Some(1.into());

        let mut other = tag!(2, now, now + Duration::minutes(30));
        assert!(!tag.update(&other));

        other.title = "news".to_string();
        other.end_at = now + Duration::minutes(60);
        assert!(tag.update(&other));
        assert_eq!(tag.title, "news");
        assert_eq!(tag.end_at, now + Duration::minutes(60));
        // identity is preserved
        assert_eq!(tag.broadcast_id, 1.into());
        assert_matches!(tag.table_id, Some(id) => assert_eq!(id, 1.into()));

        assert!(!tag.update(&other));
    }

    #[test]
    fn test_epg_tag_title() {
        let now = Utc::now();
        let mut tag = tag!(1, now, now);
        assert_eq!(tag.title(), "NO TITLE");
        tag.title = "movie".to_string();
        assert_eq!(tag.title(), "movie");
    }

    #[test]
    fn test_epg_tag_deserialize() {
        let tag: EpgTag = serde_json::from_str(
            r#"{
                "broadcastId": 42,
                "clientId": 1,
                "channelUid": 100,
                "title": "news",
                "startAt": "2024-01-01T00:00:00Z",
                "endAt": "2024-01-01T00:30:00Z"
            }"#,
        )
        .unwrap();
        assert_eq!(tag.broadcast_id, 42.into());
        assert_eq!(tag.channel_key(), (1, 100).into());
        assert_eq!(tag.table_id, None);
        assert_eq!(tag.duration(), Duration::minutes(30));
    }

    #[test]
    fn test_search_filter_matches() {
        let now = Utc::now();
        let mut tag = tag!(1, now + Duration::hours(1), now + Duration::hours(2));
        tag.title = "Evening News".to_string();
        tag.genre_type = 2;

        assert!(EpgSearchFilter::default().matches(&tag, now));

        let filter = EpgSearchFilter {
            keyword: Some("news".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&tag, now));

        let filter = EpgSearchFilter {
            keyword: Some("movie".to_string()),
            ..Default::default()
        };
        assert!(!filter.matches(&tag, now));

        let filter = EpgSearchFilter {
            client_id: Some(2.into()),
            ..Default::default()
        };
        assert!(!filter.matches(&tag, now));

        let filter = EpgSearchFilter {
            genre_type: Some(2),
            channel_uid: Some(100.into()),
            ..Default::default()
        };
        assert!(filter.matches(&tag, now));

        let filter = EpgSearchFilter {
            end_before: Some(now + Duration::hours(1)),
            ..Default::default()
        };
        assert!(!filter.matches(&tag, now));

        let filter = EpgSearchFilter {
            start_after: Some(now + Duration::hours(2)),
            ..Default::default()
        };
        assert!(!filter.matches(&tag, now));

        let later = now + Duration::hours(3);
        assert!(!EpgSearchFilter::default().matches(&tag, later));
        let filter = EpgSearchFilter {
            include_ended: true,
            ..Default::default()
        };
        assert!(filter.matches(&tag, later));
    }
}
