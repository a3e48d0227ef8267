use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

use super::EpgSink;
use crate::command_util;
use crate::config::ProviderConfig;
use crate::error::Error;
use crate::models::ChannelUid;
use crate::models::EpgEventState;
use crate::models::EpgTag;

/// A change pushed by a provider through the stdout of its watch command.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProviderMessage {
    #[serde(rename_all = "camelCase")]
    TagChanged { state: EpgEventState, tag: EpgTag },
    #[serde(rename_all = "camelCase")]
    UpdateRequest { channel_uid: ChannelUid },
}

/// Runs the watch command of a provider and forwards its messages to a sink.
///
/// The command is restarted when it exits.
pub struct ProviderWatcher {
    config: ProviderConfig,
    sink: Arc<dyn EpgSink>,
    restart_delay: Duration,
}

impl ProviderWatcher {
    const RESTART_DELAY: Duration = Duration::from_secs(10);

    /// Returns `None` if the provider has no watch command.
    pub fn new(config: ProviderConfig, sink: Arc<dyn EpgSink>) -> Option<Self> {
        config.watch_command.as_ref()?;
        Some(ProviderWatcher {
            config,
            sink,
            restart_delay: Self::RESTART_DELAY,
        })
    }

    pub async fn run(self, token: CancellationToken) {
        tracing::debug!(provider.name = %self.config.name, "Watching...");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                result = self.watch() => match result {
                    Ok(n) => tracing::info!(
                        provider.name = %self.config.name,
                        messages = n,
                        "Watch command exited"
                    ),
                    Err(err) => tracing::error!(
                        provider.name = %self.config.name,
                        %err,
                        "Watch command failed"
                    ),
                },
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.restart_delay) => (),
            }
        }
        tracing::debug!(provider.name = %self.config.name, "Stopped watching");
    }

    fn render_command(&self) -> Result<String, Error> {
        let command = self.config.watch_command.as_deref().unwrap_or_default();
        let template = mustache::compile_str(command)?;
        let data = mustache::MapBuilder::new()
            .insert("client_id", &self.config.client_id)?
            .insert_str("provider_name", &self.config.name)
            .build();
        Ok(template.render_data_to_string(&data)?)
    }

    // Returns the number of forwarded messages when the command exits.
    async fn watch(&self) -> Result<usize, Error> {
        let command = self.render_command()?;
        let mut child = command_util::spawn_process(&command, Stdio::null(), Stdio::piped())?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => return Err(Error::InvalidProviderOutput("no stdout".to_string())),
        };

        let mut n = 0;
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ProviderMessage>(line) {
                Ok(msg) => {
                    if self.forward(msg) {
                        n += 1;
                    }
                }
                Err(err) => {
                    tracing::warn!(provider.name = %self.config.name, %err, "Ignore invalid message");
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(command_util::Error::ExitedAbnormally(command).into());
        }
        Ok(n)
    }

    fn forward(&self, msg: ProviderMessage) -> bool {
        let client_id = self.config.client_id;
        match msg {
            ProviderMessage::TagChanged { tag, .. } if tag.client_id != client_id => {
                tracing::warn!(
                    provider.name = %self.config.name,
                    %tag,
                    "Ignore a tag of another client"
                );
                false
            }
            ProviderMessage::TagChanged { state, tag } => {
                self.sink.update_from_client(tag, state);
                true
            }
            ProviderMessage::UpdateRequest { channel_uid } => {
                self.sink.update_request(client_id, channel_uid);
                true
            }
        }
    }
}
