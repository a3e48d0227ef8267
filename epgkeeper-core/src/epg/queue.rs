use std::collections::VecDeque;
use std::sync::Mutex;

use crate::models::ChannelKey;
use crate::models::ChannelUid;
use crate::models::ClientId;
use crate::models::EpgEventState;
use crate::models::EpgTag;
use crate::sync_ext::MutexExt;

/// A request for refreshing the table of a channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UpdateRequest {
    pub client_id: ClientId,
    pub channel_uid: ChannelUid,
}

impl UpdateRequest {
    pub fn channel_key(&self) -> ChannelKey {
        ChannelKey::new(self.client_id, self.channel_uid)
    }
}

/// A tag change pushed by a provider.
#[derive(Clone, Debug, PartialEq)]
pub struct TagStateChange {
    pub tag: EpgTag,
    pub state: EpgEventState,
}

/// A FIFO queue guarded by its own mutex.
///
/// Pushing never waits for the consumer.
pub struct RequestQueue<T> {
    items: Mutex<VecDeque<T>>,
}

pub type UpdateRequestQueue = RequestQueue<UpdateRequest>;
pub type TagChangeQueue = RequestQueue<TagStateChange>;

impl<T> RequestQueue<T> {
    pub fn push(&self, item: T) {
        self.items.locked().push_back(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.items.locked().pop_front()
    }

    /// Takes all queued items at once.
    pub fn drain(&self) -> Vec<T> {
        self.items.locked().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.locked().is_empty()
    }

    pub fn clear(&self) {
        self.items.locked().clear();
    }
}

impl<T> Default for RequestQueue<T> {
    fn default() -> Self {
        RequestQueue {
            items: Mutex::new(VecDeque::new()),
        }
    }
}

/// A tag change waiting for its table.
#[derive(Debug)]
pub(crate) struct DeferredTagChange {
    pub(crate) change: TagStateChange,
    pub(crate) attempts: usize,
}

impl DeferredTagChange {
    pub(crate) const MAX_ATTEMPTS: usize = 30;

    pub(crate) fn new(change: TagStateChange) -> Self {
        DeferredTagChange { change, attempts: 1 }
    }
}
