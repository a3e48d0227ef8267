use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use serde::Deserialize;

use crate::models::ChannelUid;
use crate::models::ClientId;

pub fn load<P: AsRef<Path>>(config_path: P) -> Arc<Config> {
    let config_path = config_path.as_ref();

    let reader = File::open(config_path)
        .unwrap_or_else(|err| panic!("Failed to open {}: {}", config_path.display(), err));
    let config: Config = serde_yaml::from_reader(reader)
        .unwrap_or_else(|err| panic!("Failed to parse {}: {}", config_path.display(), err));

    config.validate();

    tracing::info!(config.path = %config_path.display(), "Loaded");
    Arc::new(config)
}

// result

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub epg: EpgConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Config {
    pub fn validate(&self) {
        self.epg.validate();
        self.database.validate();
        self.providers
            .iter()
            .enumerate()
            .for_each(|(i, config)| config.validate(i));
        assert_eq!(
            self.providers.len(),
            self.providers
                .iter()
                .map(|config| config.client_id)
                .unique()
                .count(),
            "config.providers: `client-id` must be unique"
        );
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EpgConfig {
    #[serde(default)]
    pub ignore_database: bool,
    #[serde(default = "EpgConfig::default_update_interval")]
    #[serde(with = "humantime_serde")]
    pub update_interval: Duration,
    #[serde(default = "EpgConfig::default_past_days_to_display")]
    pub past_days_to_display: u32,
    #[serde(default = "EpgConfig::default_future_days_to_display")]
    pub future_days_to_display: u32,
    #[serde(default)]
    pub prevent_updates_while_playing: bool,
    #[serde(default = "EpgConfig::default_cleanup_interval")]
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    #[serde(default = "EpgConfig::default_active_tag_check_interval")]
    #[serde(with = "humantime_serde")]
    pub active_tag_check_interval: Duration,
    #[serde(default = "EpgConfig::default_retry_interrupted_update_interval")]
    #[serde(with = "humantime_serde")]
    pub retry_interrupted_update_interval: Duration,
    #[serde(default = "EpgConfig::default_tag_change_time_slice")]
    #[serde(with = "humantime_serde")]
    pub tag_change_time_slice: Duration,
    #[serde(default = "EpgConfig::default_persist_interval")]
    #[serde(with = "humantime_serde")]
    pub persist_interval: Duration,
    #[serde(default = "EpgConfig::default_display_update_popup")]
    pub display_update_popup: bool,
    #[serde(default)]
    pub display_incremental_update_popup: bool,
}

impl EpgConfig {
    const MAX_DAYS_TO_DISPLAY: u32 = 14;

    fn default_update_interval() -> Duration {
        Duration::from_secs(120 * 60)
    }

    fn default_past_days_to_display() -> u32 {
        1
    }

    fn default_future_days_to_display() -> u32 {
        3
    }

    fn default_cleanup_interval() -> Duration {
        Duration::from_secs(15 * 60)
    }

    fn default_active_tag_check_interval() -> Duration {
        Duration::from_secs(60)
    }

    fn default_retry_interrupted_update_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_tag_change_time_slice() -> Duration {
        Duration::from_secs(1)
    }

    fn default_persist_interval() -> Duration {
        Duration::from_secs(60)
    }

    fn default_display_update_popup() -> bool {
        true
    }

    fn validate(&self) {
        assert!(
            !self.update_interval.is_zero(),
            "config.epg: `update-interval` must be a non-zero duration"
        );
        assert!(
            !self.cleanup_interval.is_zero(),
            "config.epg: `cleanup-interval` must be a non-zero duration"
        );
        assert!(
            !self.active_tag_check_interval.is_zero(),
            "config.epg: `active-tag-check-interval` must be a non-zero duration"
        );
        assert!(
            !self.persist_interval.is_zero(),
            "config.epg: `persist-interval` must be a non-zero duration"
        );
        assert!(
            self.past_days_to_display <= Self::MAX_DAYS_TO_DISPLAY,
            "config.epg: `past-days-to-display` must be less than or equal to {}",
            Self::MAX_DAYS_TO_DISPLAY
        );
        assert!(
            (1..=Self::MAX_DAYS_TO_DISPLAY).contains(&self.future_days_to_display),
            "config.epg: `future-days-to-display` must be in 1..={}",
            Self::MAX_DAYS_TO_DISPLAY
        );
    }
}

impl Default for EpgConfig {
    fn default() -> Self {
        EpgConfig {
            ignore_database: false,
            update_interval: Self::default_update_interval(),
            past_days_to_display: Self::default_past_days_to_display(),
            future_days_to_display: Self::default_future_days_to_display(),
            prevent_updates_while_playing: false,
            cleanup_interval: Self::default_cleanup_interval(),
            active_tag_check_interval: Self::default_active_tag_check_interval(),
            retry_interrupted_update_interval: Self::default_retry_interrupted_update_interval(),
            tag_change_time_slice: Self::default_tag_change_time_slice(),
            persist_interval: Self::default_persist_interval(),
            display_update_popup: Self::default_display_update_popup(),
            display_incremental_update_popup: false,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    // An in-memory database is used if not specified.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    fn validate(&self) {
        if let Some(ref path) = self.path {
            let dir = path.parent().filter(|dir| !dir.as_os_str().is_empty());
            if let Some(dir) = dir {
                assert!(
                    dir.is_dir(),
                    "config.database: `path` must be in an existing directory"
                );
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub client_id: ClientId,
    pub name: String,
    pub command: String,
    // A long-running command printing pushed changes.
    #[serde(default)]
    pub watch_command: Option<String>,
    #[serde(default = "ProviderConfig::default_time_limit")]
    #[serde(with = "humantime_serde")]
    pub time_limit: Duration,
    #[serde(default)]
    pub channels: Vec<ProviderChannelConfig>,
    #[serde(default)]
    pub disabled: bool,
}

impl ProviderConfig {
    fn default_time_limit() -> Duration {
        Duration::from_secs(30)
    }

    fn validate(&self, index: usize) {
        if self.disabled {
            return;
        }
        assert!(
            !self.name.is_empty(),
            "config.providers[{}]: `name` must be a non-empty string",
            index
        );
        assert!(
            !self.command.is_empty(),
            "config.providers[{}]: `command` must be a non-empty string",
            index
        );
        assert!(
            mustache::compile_str(&self.command).is_ok(),
            "config.providers[{}]: `command` must be a valid mustache template",
            index
        );
        if let Some(ref watch_command) = self.watch_command {
            assert!(
                mustache::compile_str(watch_command).is_ok(),
                "config.providers[{}]: `watch-command` must be a valid mustache template",
                index
            );
        }
        assert!(
            !self.time_limit.is_zero(),
            "config.providers[{}]: `time-limit` must be a non-zero duration",
            index
        );
        assert_eq!(
            self.channels.len(),
            self.channels
                .iter()
                .map(|config| config.uid)
                .unique()
                .count(),
            "config.providers[{}]: `channels[].uid` must be unique",
            index
        );
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProviderChannelConfig {
    pub uid: ChannelUid,
    pub name: String,
    #[serde(default)]
    pub epg_id: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config() {
        assert_eq!(
            serde_yaml::from_str::<Config>("{}").unwrap(),
            Default::default()
        );

        let result = serde_yaml::from_str::<Config>(
            r#"
            unknown:
              property: value
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_config_validate() {
        let config = Config::default();
        config.validate();
    }

    #[test]
    #[should_panic]
    fn test_config_validate_client_ids() {
        let config = serde_yaml::from_str::<Config>(
            r#"
            providers:
              - client-id: 1
                name: a
                command: a
              - client-id: 1
                name: b
                command: b
        "#,
        )
        .unwrap();
        config.validate();
    }

    #[test]
    fn test_epg_config() {
        assert_eq!(
            serde_yaml::from_str::<EpgConfig>("{}").unwrap(),
            Default::default()
        );

        assert_eq!(
            serde_yaml::from_str::<EpgConfig>(
                r#"
                ignore-database: true
                update-interval: 1h
                past-days-to-display: 2
                future-days-to-display: 7
                prevent-updates-while-playing: true
                cleanup-interval: 10m
                active-tag-check-interval: 30s
                retry-interrupted-update-interval: 5s
                tag-change-time-slice: 500ms
                persist-interval: 2m
                display-update-popup: false
                display-incremental-update-popup: true
            "#
            )
            .unwrap(),
            EpgConfig {
                ignore_database: true,
                update_interval: Duration::from_secs(3600),
                past_days_to_display: 2,
                future_days_to_display: 7,
                prevent_updates_while_playing: true,
                cleanup_interval: Duration::from_secs(600),
                active_tag_check_interval: Duration::from_secs(30),
                retry_interrupted_update_interval: Duration::from_secs(5),
                tag_change_time_slice: Duration::from_millis(500),
                persist_interval: Duration::from_secs(120),
                display_update_popup: false,
                display_incremental_update_popup: true,
            }
        );

        let result = serde_yaml::from_str::<EpgConfig>(
            r#"
            update-interval: 1x
        "#,
        );
        assert!(result.is_err());

        let result = serde_yaml::from_str::<EpgConfig>(
            r#"
            unknown:
              property: value
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_epg_config_validate() {
        let config = EpgConfig::default();
        config.validate();
    }

    #[test]
    #[should_panic]
    fn test_epg_config_validate_update_interval() {
        let config = EpgConfig {
            update_interval: Duration::ZERO,
            ..Default::default()
        };
        config.validate();
    }

    #[test]
    #[should_panic]
    fn test_epg_config_validate_future_days() {
        let config = EpgConfig {
            future_days_to_display: 0,
            ..Default::default()
        };
        config.validate();
    }

    #[test]
    fn test_database_config() {
        assert_eq!(
            serde_yaml::from_str::<DatabaseConfig>("{}").unwrap(),
            Default::default()
        );

        assert_eq!(
            serde_yaml::from_str::<DatabaseConfig>(
                r#"
                path: /path/to/epg.sqlite
            "#
            )
            .unwrap(),
            DatabaseConfig {
                path: Some("/path/to/epg.sqlite".into()),
            }
        );
    }

    #[test]
    fn test_database_config_validate() {
        let config = DatabaseConfig {
            path: Some("epg.sqlite".into()),
        };
        config.validate();

        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: Some(dir.path().join("epg.sqlite")),
        };
        config.validate();
    }

    #[test]
    #[should_panic]
    fn test_database_config_validate_path() {
        let config = DatabaseConfig {
            path: Some("/path/to/epg.sqlite".into()),
        };
        config.validate();
    }

    #[test]
    fn test_provider_config() {
        assert_eq!(
            serde_yaml::from_str::<ProviderConfig>(
                r#"
                client-id: 1
                name: local
                command: fetch {{{channel_uid}}}
                watch-command: watch {{{client_id}}}
                channels:
                  - uid: 100
                    name: ch100
                  - uid: 101
                    name: ch101
                    epg-id: 3
            "#
            )
            .unwrap(),
            ProviderConfig {
                client_id: 1.into(),
                name: "local".to_string(),
                command: "fetch {{{channel_uid}}}".to_string(),
                watch_command: Some("watch {{{client_id}}}".to_string()),
                time_limit: ProviderConfig::default_time_limit(),
                channels: vec![
                    ProviderChannelConfig {
                        uid: 100.into(),
                        name: "ch100".to_string(),
                        epg_id: None,
                    },
                    ProviderChannelConfig {
                        uid: 101.into(),
                        name: "ch101".to_string(),
                        epg_id: Some(3),
                    },
                ],
                disabled: false,
            }
        );

        let result = serde_yaml::from_str::<ProviderConfig>(
            r#"
            name: local
            command: fetch
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_provider_config_validate() {
        let config = ProviderConfig {
            client_id: 1.into(),
            name: "".to_string(),
            command: "".to_string(),
            watch_command: None,
            time_limit: Duration::ZERO,
            channels: vec![],
            disabled: true,
        };
        config.validate(0);
    }

    #[test]
    #[should_panic]
    fn test_provider_config_validate_command() {
        let config = ProviderConfig {
            client_id: 1.into(),
            name: "local".to_string(),
            command: "".to_string(),
            watch_command: None,
            time_limit: ProviderConfig::default_time_limit(),
            channels: vec![],
            disabled: false,
        };
        config.validate(0);
    }

    #[test]
    #[should_panic]
    fn test_provider_config_validate_channel_uids() {
        let config = ProviderConfig {
            client_id: 1.into(),
            name: "local".to_string(),
            command: "fetch".to_string(),
            watch_command: None,
            time_limit: ProviderConfig::default_time_limit(),
            channels: vec![
                ProviderChannelConfig {
                    uid: 100.into(),
                    name: "a".to_string(),
                    epg_id: None,
                },
                ProviderChannelConfig {
                    uid: 100.into(),
                    name: "b".to_string(),
                    epg_id: None,
                },
            ],
            disabled: false,
        };
        config.validate(0);
    }
}
