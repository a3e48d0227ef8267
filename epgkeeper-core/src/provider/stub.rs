use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio::sync::Semaphore;

use super::*;
use crate::models::ChannelKey;
use crate::sync_ext::MutexExt;

#[derive(Default)]
pub(crate) struct ProviderStub {
    tags: Mutex<HashMap<ChannelKey, Vec<EpgTag>>>,
    calls: Mutex<Vec<ChannelKey>>,
    failing: AtomicBool,
    gate: Option<Gate>,
}

// Blocks calls until permits are added.
struct Gate {
    entered: Arc<Notify>,
    permits: Arc<Semaphore>,
}

impl ProviderStub {
    pub(crate) fn with_tags(key: ChannelKey, tags: Vec<EpgTag>) -> Self {
        let stub = Self::default();
        stub.set_tags(key, tags);
        stub
    }

    pub(crate) fn blocking() -> (Self, Arc<Notify>, Arc<Semaphore>) {
        let entered = Arc::new(Notify::new());
        let permits = Arc::new(Semaphore::new(0));
        let stub = ProviderStub {
            gate: Some(Gate {
                entered: entered.clone(),
                permits: permits.clone(),
            }),
            ..Default::default()
        };
        (stub, entered, permits)
    }

    pub(crate) fn set_tags(&self, key: ChannelKey, tags: Vec<EpgTag>) {
        self.tags.locked().insert(key, tags);
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.locked().len()
    }

    pub(crate) fn call_count_for(&self, key: ChannelKey) -> usize {
        self.calls.locked().iter().filter(|&&k| k == key).count()
    }
}

#[async_trait]
impl EpgProvider for ProviderStub {
    async fn get_epg_for_channel(
        &self,
        channel: &EpgChannelData,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<EpgTag>, Error> {
        self.calls.locked().push(channel.key());
        if let Some(ref gate) = self.gate {
            gate.entered.notify_one();
            let permit = gate.permits.acquire().await;
            if let Ok(permit) = permit {
                permit.forget();
            }
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::InvalidProviderOutput("failing".to_string()));
        }
        Ok(self
            .tags
            .locked()
            .get(&channel.key())
            .cloned()
            .unwrap_or_default())
    }
}
