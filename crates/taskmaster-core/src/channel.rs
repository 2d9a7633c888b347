//! Collaborator seams between the reconciliation engine and the document store.
//!
//! A channel hands out [`Subscription`]s that redeliver the whole task
//! collection of one identity after every change, and accepts point
//! mutations whose effects are only observed through later snapshots.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ChannelError;
use crate::task::{Identity, Task, TaskId};

pub type Snapshot = Vec<Task>;
pub type SnapshotEvent = Result<Snapshot, ChannelError>;

#[async_trait]
pub trait TaskChannel: Send + Sync {
    /// Opens a standing subscription. The current collection is delivered
    /// first; failures arrive as `Err` events on the stream.
    fn subscribe(&self, identity: &Identity) -> Subscription;

    async fn create(&self, identity: &Identity, text: &str) -> Result<(), ChannelError>;

    async fn set_completed(
        &self,
        identity: &Identity,
        id: &TaskId,
        completed: bool,
    ) -> Result<(), ChannelError>;

    async fn delete(&self, identity: &Identity, id: &TaskId) -> Result<(), ChannelError>;

    /// Asks the channel to look for writes made outside this process.
    fn refresh(&self, _identity: &Identity) {}
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Merge-writes the profile fields of `identity` into `users/<uid>`.
    async fn upsert_profile(&self, identity: &Identity) -> Result<(), ChannelError>;
}

type Release = Box<dyn FnOnce() + Send>;

/// Live snapshot stream. Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    events: mpsc::UnboundedReceiver<SnapshotEvent>,
    release: Option<Release>,
}

impl Subscription {
    pub fn new(
        id: u64,
        events: mpsc::UnboundedReceiver<SnapshotEvent>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            id,
            events,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    /// Next event, or `None` once unsubscribed or the sender is gone.
    /// Events still buffered at unsubscribe time are never yielded.
    pub async fn next(&mut self) -> Option<SnapshotEvent> {
        if !self.is_active() {
            return None;
        }
        self.events.recv().await
    }

    pub fn unsubscribe(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            self.events.close();
            debug!(subscription = self.id, "unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
