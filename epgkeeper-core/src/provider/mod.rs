mod command;
#[cfg(test)]
pub(crate) mod stub;
mod watch;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;

use crate::config::Config;
use crate::error::Error;
use crate::models::ChannelUid;
use crate::models::ClientId;
use crate::models::EpgChannelData;
use crate::models::EpgEventState;
use crate::models::EpgTag;

pub use command::CommandProvider;
pub use watch::ProviderMessage;
pub use watch::ProviderWatcher;

/// A backend supplying raw schedule data for its channels.
#[async_trait]
pub trait EpgProvider: Send + Sync {
    /// Returns tags of `channel` overlapping `[start, end]`.
    async fn get_epg_for_channel(
        &self,
        channel: &EpgChannelData,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EpgTag>, Error>;
}

/// Receives changes pushed by providers.
///
/// Implementations must not wait for the background task.
pub trait EpgSink: Send + Sync {
    fn update_from_client(&self, tag: EpgTag, state: EpgEventState);
    fn update_request(&self, client_id: ClientId, channel_uid: ChannelUid);
}

/// Providers keyed by their client id.
#[derive(Clone, Default)]
pub struct Providers {
    providers: HashMap<ClientId, Arc<dyn EpgProvider>>,
}

impl Providers {
    /// Builds `CommandProvider`s for every enabled provider in `config`.
    pub fn from_config(config: &Config) -> Self {
        let mut providers = Providers::default();
        for provider_config in config.providers.iter().filter(|config| !config.disabled) {
            tracing::debug!(
                client.id = %provider_config.client_id,
                provider.name = %provider_config.name,
                "Registered provider"
            );
            providers.insert(
                provider_config.client_id,
                Arc::new(CommandProvider::new(provider_config.clone())),
            );
        }
        providers
    }

    pub fn insert(&mut self, client_id: ClientId, provider: Arc<dyn EpgProvider>) {
        self.providers.insert(client_id, provider);
    }

    pub fn get(&self, client_id: ClientId) -> Result<Arc<dyn EpgProvider>, Error> {
        self.providers
            .get(&client_id)
            .cloned()
            .ok_or(Error::ProviderNotFound(client_id))
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use stub::ProviderStub;

    #[test]
    fn test_providers_from_config() {
        let config = serde_yaml::from_str::<Config>(
            r#"
            providers:
              - client-id: 1
                name: a
                command: a
              - client-id: 2
                name: b
                command: b
                disabled: true
        "#,
        )
        .unwrap();
        let providers = Providers::from_config(&config);
        assert_eq!(providers.len(), 1);
        assert!(providers.get(1.into()).is_ok());
        assert_matches!(providers.get(2.into()).err(), Some(Error::ProviderNotFound(id)) => {
            assert_eq!(id, 2.into());
        });
    }

    #[test]
    fn test_providers_insert() {
        let mut providers = Providers::default();
        assert!(providers.is_empty());
        providers.insert(3.into(), Arc::new(ProviderStub::default()));
        assert!(providers.get(3.into()).is_ok());
    }
}
