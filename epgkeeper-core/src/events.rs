use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::models::TableId;
use crate::sync_ext::MutexExt;

// events

/// Tags in the tables have been created, updated or deleted.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpgTablesChanged {
    pub table_ids: Vec<TableId>,
}

/// The active (playing) tag of the tables has changed.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpgActiveItemChanged {
    pub table_ids: Vec<TableId>,
}

/// All tables have been removed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EpgContainerReset;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpgUpdateProgress {
    pub current: usize,
    pub total: usize,
    pub table_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpgUpdateFinished {
    pub interrupted: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpgPersistFailed {
    pub table_id: TableId,
    pub reason: String,
}

// emit

/// A trait to deliver an event to a subscriber.
#[async_trait]
pub trait Emit<M: Send + 'static> {
    /// Delivers an event.
    ///
    /// The event is lost if the subscriber has gone.
    async fn emit(&self, msg: M);

    /// Delivers an event without awaiting.
    ///
    /// Useful outside `async` contexts such as `Drop::drop()`.
    fn fire(&self, msg: M);
}

/// A type-erased, cloneable [`Emit<M>`].
pub struct Emitter<M> {
    inner: Arc<dyn Emit<M> + Send + Sync>,
}

impl<M> Emitter<M>
where
    M: Send + 'static,
{
    pub fn new<T>(inner: T) -> Self
    where
        T: Emit<M> + Send + Sync + 'static,
    {
        Emitter {
            inner: Arc::new(inner),
        }
    }

    /// Creates an emitter which calls `f` for each event.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(M) + Send + Sync + 'static,
    {
        Self::new(FnEmitter(f))
    }
}

impl<M> Clone for Emitter<M> {
    fn clone(&self) -> Self {
        Emitter {
            inner: self.inner.clone(),
        }
    }
}

#[async_trait]
impl<M> Emit<M> for Emitter<M>
where
    M: Send + 'static,
{
    async fn emit(&self, msg: M) {
        self.inner.emit(msg).await
    }

    fn fire(&self, msg: M) {
        self.inner.fire(msg);
    }
}

impl<M> From<mpsc::Sender<M>> for Emitter<M>
where
    M: Send + 'static,
{
    fn from(sender: mpsc::Sender<M>) -> Self {
        Emitter::new(sender)
    }
}

impl<M> From<mpsc::UnboundedSender<M>> for Emitter<M>
where
    M: Send + 'static,
{
    fn from(sender: mpsc::UnboundedSender<M>) -> Self {
        Emitter::new(sender)
    }
}

#[async_trait]
impl<M> Emit<M> for mpsc::Sender<M>
where
    M: Send + 'static,
{
    async fn emit(&self, msg: M) {
        if self.send(msg).await.is_err() {
            tracing::debug!("Subscriber has gone");
        }
    }

    fn fire(&self, msg: M) {
        if let Err(err) = self.try_send(msg) {
            tracing::warn!(%err, "Failed to fire an event");
        }
    }
}

#[async_trait]
impl<M> Emit<M> for mpsc::UnboundedSender<M>
where
    M: Send + 'static,
{
    async fn emit(&self, msg: M) {
        self.fire(msg);
    }

    fn fire(&self, msg: M) {
        if self.send(msg).is_err() {
            tracing::debug!("Subscriber has gone");
        }
    }
}

struct FnEmitter<F>(F);

#[async_trait]
impl<M, F> Emit<M> for FnEmitter<F>
where
    M: Send + 'static,
    F: Fn(M) + Send + Sync,
{
    async fn emit(&self, msg: M) {
        (self.0)(msg);
    }

    fn fire(&self, msg: M) {
        (self.0)(msg);
    }
}

// registry

/// Subscribers of a particular event type.
///
/// Each registration gets an id used for unregistering it later.
pub struct EmitterRegistry<M> {
    inner: Mutex<RegistryInner<M>>,
}

struct RegistryInner<M> {
    next_id: usize,
    emitters: IndexMap<usize, Emitter<M>>,
}

impl<M> EmitterRegistry<M>
where
    M: Clone + Send + 'static,
{
    pub fn register(&self, emitter: Emitter<M>) -> usize {
        let mut inner = self.inner.locked();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.emitters.insert(id, emitter);
        id
    }

    pub fn unregister(&self, id: usize) -> bool {
        self.inner.locked().emitters.shift_remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.locked().emitters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `msg` to every subscriber in registration order.
    pub async fn emit(&self, msg: M) {
        // Subscribers may register or unregister from inside a callback.
        let emitters = self.snapshot();
        for emitter in emitters.iter() {
            emitter.emit(msg.clone()).await;
        }
    }

    pub fn fire(&self, msg: M) {
        let emitters = self.snapshot();
        for emitter in emitters.iter() {
            emitter.fire(msg.clone());
        }
    }

    fn snapshot(&self) -> Vec<Emitter<M>> {
        self.inner.locked().emitters.values().cloned().collect()
    }
}

impl<M> Default for EmitterRegistry<M> {
    fn default() -> Self {
        EmitterRegistry {
            inner: Mutex::new(RegistryInner {
                next_id: 0,
                emitters: IndexMap::new(),
            }),
        }
    }
}
