//! Client-side task state reconciliation.
//!
//! The engine owns the ordered task sequence of one signed-in identity. The
//! sequence is only ever written by [`ReconciliationEngine::on_snapshot`]:
//! requests go out to the channel untouched and their effects come back as
//! the next snapshot, which replaces the whole view.

use std::future::pending;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{Snapshot, SnapshotEvent, Subscription, TaskChannel};
use crate::task::{Identity, Task, TaskId, is_submittable};

/// Handle to a fire-and-forget mutation. Dropping it leaves the call
/// running.
#[must_use = "drop the ticket to fire and forget, or await `settled`"]
#[derive(Debug)]
pub struct MutationTicket {
    handle: JoinHandle<()>,
}

impl MutationTicket {
    pub fn is_settled(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits until the channel call has finished, successfully or not.
    pub async fn settled(self) {
        if let Err(err) = self.handle.await {
            warn!(error = %err, "mutation task aborted");
        }
    }
}

struct Attachment {
    identity: Identity,
    /// `None` while suspended after a subscription failure.
    subscription: Option<Subscription>,
}

pub struct ReconciliationEngine {
    channel: Arc<dyn TaskChannel>,
    tasks: Vec<Task>,
    attachment: Option<Attachment>,
    last_error: Option<String>,
    snapshots_applied: u64,
}

impl ReconciliationEngine {
    pub fn new(channel: Arc<dyn TaskChannel>) -> Self {
        Self {
            channel,
            tasks: Vec::new(),
            attachment: None,
            last_error: None,
            snapshots_applied: 0,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.attachment.as_ref().map(|attachment| &attachment.identity)
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    /// Error carried by the latest subscription event, cleared by the next
    /// good snapshot.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn snapshots_applied(&self) -> u64 {
        self.snapshots_applied
    }

    /// Task at a 1-based display position.
    pub fn task_at(&self, position: usize) -> Option<&Task> {
        position
            .checked_sub(1)
            .and_then(|index| self.tasks.get(index))
    }

    /// Replaces the whole sequence.
    pub fn on_snapshot(&mut self, snapshot: Snapshot) {
        debug!(
            before = self.tasks.len(),
            after = snapshot.len(),
            "applying snapshot"
        );
        self.tasks = snapshot;
        self.last_error = None;
        self.snapshots_applied += 1;
    }

    pub fn is_subscribed(&self) -> bool {
        self.attachment
            .as_ref()
            .is_some_and(|attachment| attachment.subscription.is_some())
    }

    /// Opens a subscription for `identity`, closing any previous one and
    /// clearing the sequence first. Re-attaching the same identity only
    /// resumes a suspended subscription.
    #[tracing::instrument(skip(self, identity), fields(uid = %identity.uid))]
    pub fn attach(&mut self, identity: Identity) {
        if self.identity() == Some(&identity) {
            self.resume();
            return;
        }
        self.detach();
        let subscription = self.channel.subscribe(&identity);
        info!(subscription = subscription.id(), "engine attached");
        self.attachment = Some(Attachment {
            identity,
            subscription: Some(subscription),
        });
    }

    /// Closes the subscription and clears the sequence before returning.
    pub fn detach(&mut self) {
        if let Some(mut attachment) = self.attachment.take() {
            if let Some(subscription) = attachment.subscription.as_mut() {
                subscription.unsubscribe();
            }
            info!(uid = %attachment.identity.uid, "engine detached");
        }
        self.tasks.clear();
        self.last_error = None;
    }

    /// Closes the subscription but keeps the identity, the sequence and the
    /// last error, so a failed stream can be retried without blanking the
    /// view.
    pub fn suspend(&mut self) {
        if let Some(attachment) = self.attachment.as_mut() {
            if let Some(mut subscription) = attachment.subscription.take() {
                subscription.unsubscribe();
                info!(uid = %attachment.identity.uid, "subscription suspended");
            }
        }
    }

    /// Reopens the subscription of a suspended attachment.
    pub fn resume(&mut self) {
        if let Some(attachment) = self.attachment.as_mut() {
            if attachment.subscription.is_none() {
                let subscription = self.channel.subscribe(&attachment.identity);
                info!(subscription = subscription.id(), "subscription resumed");
                attachment.subscription = Some(subscription);
            }
        }
    }

    /// Next event of the active subscription. Never resolves while
    /// detached or suspended; resolves to `None` once the channel ends the
    /// stream.
    pub async fn next_event(&mut self) -> Option<SnapshotEvent> {
        match self
            .attachment
            .as_mut()
            .and_then(|attachment| attachment.subscription.as_mut())
        {
            Some(subscription) => subscription.next().await,
            None => pending().await,
        }
    }

    /// Applies one subscription event. Returns `false` for an error event,
    /// which leaves the sequence as it was.
    pub fn apply(&mut self, event: SnapshotEvent) -> bool {
        match event {
            Ok(snapshot) => {
                self.on_snapshot(snapshot);
                true
            }
            Err(err) => {
                warn!(error = %err, "subscription error; task list may be stale");
                self.last_error = Some(err.to_string());
                false
            }
        }
    }

    /// Asks the channel to look for writes from other processes.
    pub fn refresh(&self) {
        if let Some(attachment) = self.attachment.as_ref() {
            self.channel.refresh(&attachment.identity);
        }
    }

    #[tracing::instrument(skip(self, text), fields(text_len = text.len()))]
    pub fn request_add(&self, text: &str) -> Option<MutationTicket> {
        if !is_submittable(text) {
            debug!("ignoring blank task text");
            return None;
        }
        let identity = self.identity_for_request()?;
        let channel = self.channel.clone();
        let text = text.to_string();
        Some(spawn_mutation("create", async move {
            channel.create(&identity, &text).await
        }))
    }

    /// Sends the negation of the locally known `completed` flag. Does
    /// nothing when `id` is not in the current sequence.
    #[tracing::instrument(skip(self), fields(id = %id))]
    pub fn request_toggle(&self, id: &TaskId) -> Option<MutationTicket> {
        let Some(task) = self.tasks.iter().find(|task| &task.id == id) else {
            debug!("toggle target not in current snapshot");
            return None;
        };
        let completed = !task.completed;
        let identity = self.identity_for_request()?;
        let channel = self.channel.clone();
        let id = id.clone();
        Some(spawn_mutation("set_completed", async move {
            channel.set_completed(&identity, &id, completed).await
        }))
    }

    #[tracing::instrument(skip(self), fields(id = %id))]
    pub fn request_delete(&self, id: &TaskId) -> Option<MutationTicket> {
        let identity = self.identity_for_request()?;
        let channel = self.channel.clone();
        let id = id.clone();
        Some(spawn_mutation("delete", async move {
            channel.delete(&identity, &id).await
        }))
    }

    fn identity_for_request(&self) -> Option<Identity> {
        let identity = self.identity().cloned();
        if identity.is_none() {
            debug!("no identity attached; request dropped");
        }
        identity
    }
}

impl Drop for ReconciliationEngine {
    fn drop(&mut self) {
        self.detach();
    }
}

fn spawn_mutation<F>(operation: &'static str, call: F) -> MutationTicket
where
    F: std::future::Future<Output = Result<(), crate::error::ChannelError>> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        match call.await {
            Ok(()) => debug!(operation, "mutation accepted"),
            Err(err) => warn!(operation, error = %err, "mutation rejected"),
        }
    });
    MutationTicket { handle }
}
