use std::process::Stdio;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;

use super::EpgProvider;
use crate::command_util;
use crate::config::ProviderConfig;
use crate::error::Error;
use crate::models::EpgChannelData;
use crate::models::EpgTag;

/// A provider which runs an external command for each channel.
///
/// The command prints one JSON-encoded tag per line to its stdout.
pub struct CommandProvider {
    config: ProviderConfig,
}

impl CommandProvider {
    pub fn new(config: ProviderConfig) -> Self {
        CommandProvider { config }
    }

    fn render_command(
        &self,
        channel: &EpgChannelData,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<String, Error> {
        let template = mustache::compile_str(&self.config.command)?;
        let data = mustache::MapBuilder::new()
            .insert("client_id", &channel.client_id)?
            .insert("channel_uid", &channel.channel_uid)?
            .insert_str("channel_name", &channel.name)
            .insert_str("start", start.to_rfc3339_opts(SecondsFormat::Secs, true))
            .insert_str("end", end.to_rfc3339_opts(SecondsFormat::Secs, true))
            .build();
        Ok(template.render_data_to_string(&data)?)
    }

    async fn run(&self, command: &str, channel: &EpgChannelData) -> Result<Vec<EpgTag>, Error> {
        let mut child = command_util::spawn_process(command, Stdio::null(), Stdio::piped())?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => return Err(Error::InvalidProviderOutput("no stdout".to_string())),
        };

        let mut tags = vec![];
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let tag: EpgTag = serde_json::from_str(line)?;
            if tag.channel_key() != channel.key() {
                return Err(Error::InvalidProviderOutput(format!(
                    "{} does not belong to {}",
                    tag,
                    channel.key()
                )));
            }
            if tag.end_at < tag.start_at {
                return Err(Error::InvalidProviderOutput(format!(
                    "{} ends before it starts",
                    tag
                )));
            }
            tags.push(tag);
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(command_util::Error::ExitedAbnormally(command.to_string()).into());
        }
        Ok(tags)
    }
}

#[async_trait]
impl EpgProvider for CommandProvider {
    async fn get_epg_for_channel(
        &self,
        channel: &EpgChannelData,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EpgTag>, Error> {
        let command = self.render_command(channel, start, end)?;
        tracing::debug!(
            provider.name = %self.config.name,
            channel.uid = %channel.channel_uid,
            command = %command,
            "Fetching..."
        );
        // The child process is killed when the future gets dropped.
        let tags = tokio::time::timeout(self.config.time_limit, self.run(&command, channel)).await??;
        tracing::debug!(
            provider.name = %self.config.name,
            channel.uid = %channel.channel_uid,
            tags.len = tags.len(),
            "Fetched"
        );
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use std::io::Write;
    use std::time::Duration;
    use test_log::test;

    fn provider_config(command: String, time_limit: Duration) -> ProviderConfig {
        ProviderConfig {
            client_id: 1.into(),
            name: "test".to_string(),
            command,
            watch_command: None,
            time_limit,
            channels: vec![],
            disabled: false,
        }
    }

    fn script(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_render_command() {
        let provider = CommandProvider::new(provider_config(
            "fetch {{{client_id}}} {{{channel_uid}}} {{{start}}} {{{end}}}".to_string(),
            Duration::from_secs(1),
        ));
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap();
        let command = provider
            .render_command(&channel!(1, 100), start, end)
            .unwrap();
        assert_eq!(
            command,
            "fetch 1 100 2024-01-01T00:00:00Z 2024-01-04T00:00:00Z"
        );
    }

    #[test(tokio::test)]
    async fn test_get_epg_for_channel() {
        let file = script(
            r#"
echo '{"broadcastId":1,"clientId":1,"channelUid":'$1',"title":"a","startAt":"2024-01-01T00:00:00Z","endAt":"2024-01-01T00:30:00Z"}'
echo ''
echo '{"broadcastId":2,"clientId":1,"channelUid":'$1',"title":"b","startAt":"2024-01-01T00:30:00Z","endAt":"2024-01-01T01:00:00Z"}'
"#,
        );
        let provider = CommandProvider::new(provider_config(
            format!("sh {} {{{{{{channel_uid}}}}}}", file.path().display()),
            Duration::from_secs(10),
        ));
        let now = Utc::now();
        let tags = provider
            .get_epg_for_channel(&channel!(1, 100), now, now)
            .await
            .unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].broadcast_id, 1.into());
        assert_eq!(tags[0].title, "a");
        assert_eq!(tags[1].broadcast_id, 2.into());
        assert_eq!(tags[1].channel_key(), (1, 100).into());
    }

    #[test(tokio::test)]
    async fn test_get_epg_for_channel_wrong_channel() {
        let file = script(
            r#"
echo '{"broadcastId":1,"clientId":1,"channelUid":999,"startAt":"2024-01-01T00:00:00Z","endAt":"2024-01-01T00:30:00Z"}'
"#,
        );
        let provider = CommandProvider::new(provider_config(
            format!("sh {}", file.path().display()),
            Duration::from_secs(10),
        ));
        let now = Utc::now();
        let result = provider
            .get_epg_for_channel(&channel!(1, 100), now, now)
            .await;
        assert_matches!(result, Err(Error::InvalidProviderOutput(_)));
    }

    #[test(tokio::test)]
    async fn test_get_epg_for_channel_invalid_json() {
        let provider = CommandProvider::new(provider_config(
            "echo not-json".to_string(),
            Duration::from_secs(10),
        ));
        let now = Utc::now();
        let result = provider
            .get_epg_for_channel(&channel!(1, 100), now, now)
            .await;
        assert_matches!(result, Err(Error::JsonError(_)));
    }

    #[test(tokio::test)]
    async fn test_get_epg_for_channel_exit_status() {
        let provider =
            CommandProvider::new(provider_config("false".to_string(), Duration::from_secs(10)));
        let now = Utc::now();
        let result = provider
            .get_epg_for_channel(&channel!(1, 100), now, now)
            .await;
        assert_matches!(
            result,
            Err(Error::CommandFailed(command_util::Error::ExitedAbnormally(_)))
        );
    }

    #[test(tokio::test)]
    async fn test_get_epg_for_channel_timeout() {
        let provider = CommandProvider::new(provider_config(
            "sleep 10".to_string(),
            Duration::from_millis(100),
        ));
        let now = Utc::now();
        let result = provider
            .get_epg_for_channel(&channel!(1, 100), now, now)
            .await;
        assert_matches!(result, Err(Error::Timeout));
    }
}
