use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use fd_lock::RwLock;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use taskmaster_shared::{ProfilePatch, TaskCompletionPatch, TaskDocument, TaskRecord, profile_path, tasks_path};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{ProfileStore, Snapshot, SnapshotEvent, Subscription, TaskChannel};
use crate::error::ChannelError;
use crate::task::{Identity, Task, TaskId};

/// One stored document: its key plus an open set of fields, so merge
/// writes keep fields this client does not know about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct StoredDocument {
    id: String,
    fields: Map<String, Value>,
}

struct Listener {
    id: u64,
    sender: mpsc::UnboundedSender<SnapshotEvent>,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_uid: HashMap<String, Vec<Listener>>,
    last_delivered: HashMap<String, Snapshot>,
}

impl Listeners {
    fn deliver(&mut self, uid: &str, snapshot: Snapshot) {
        if let Some(listeners) = self.by_uid.get_mut(uid) {
            listeners.retain(|listener| listener.sender.send(Ok(snapshot.clone())).is_ok());
            debug!(uid, listeners = listeners.len(), tasks = snapshot.len(), "delivered snapshot");
        }
        self.last_delivered.insert(uid.to_string(), snapshot);
    }

    fn deliver_error(&mut self, uid: &str, make: impl Fn() -> ChannelError) {
        if let Some(listeners) = self.by_uid.get_mut(uid) {
            listeners.retain(|listener| listener.sender.send(Err(make())).is_ok());
        }
        self.last_delivered.remove(uid);
    }

    fn remove(&mut self, uid: &str, listener_id: u64) {
        if let Some(listeners) = self.by_uid.get_mut(uid) {
            listeners.retain(|listener| listener.id != listener_id);
            if listeners.is_empty() {
                self.by_uid.remove(uid);
                self.last_delivered.remove(uid);
            }
        }
    }
}

/// File-backed, multi-writer document store with live listeners.
///
/// Layout under `data_dir`: `users.data` holds profile documents and
/// `tasks/<uid>.data` holds each user's task documents, one JSON line per
/// document in insertion order. Every successful write rebroadcasts the
/// affected collection to its listeners.
///
/// Writes take an exclusive advisory lock on `data_dir/.lock` for the whole
/// read-modify-write, so stores in other processes never interleave with
/// them.
pub struct DocumentStore {
    pub data_dir: PathBuf,
    pub users_path: PathBuf,
    pub tasks_dir: PathBuf,
    lock_path: PathBuf,
    io: Mutex<()>,
    listeners: Arc<Mutex<Listeners>>,
}

impl DocumentStore {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        let tasks_dir = data_dir.join("tasks");
        fs::create_dir_all(&tasks_dir)
            .with_context(|| format!("failed to create {}", tasks_dir.display()))?;

        let users_path = data_dir.join("users.data");
        if !users_path.exists() {
            fs::write(&users_path, "")
                .with_context(|| format!("failed to create {}", users_path.display()))?;
        }

        info!(
            data_dir = %data_dir.display(),
            users = %users_path.display(),
            tasks = %tasks_dir.display(),
            "opened document store"
        );

        let lock_path = data_dir.join(".lock");
        open_lock_file(&lock_path)
            .with_context(|| format!("failed to create {}", lock_path.display()))?;

        Ok(Self {
            data_dir,
            users_path,
            tasks_dir,
            lock_path,
            io: Mutex::new(()),
            listeners: Arc::new(Mutex::new(Listeners::default())),
        })
    }

    fn collection_file(&self, uid: &str) -> Result<PathBuf, ChannelError> {
        if !is_valid_uid(uid) {
            return Err(ChannelError::PermissionDenied {
                collection: tasks_path(uid),
            });
        }
        Ok(self.tasks_dir.join(format!("{uid}.data")))
    }

    /// Runs `apply` holding both the in-process and the cross-process lock.
    fn write_locked<T>(
        &self,
        apply: impl FnOnce() -> Result<T, ChannelError>,
    ) -> Result<T, ChannelError> {
        let _guard = self.io.lock();
        let file = open_lock_file(&self.lock_path)
            .map_err(|err| ChannelError::io(&self.lock_path, err))?;
        let mut lock = RwLock::new(file);
        let _held = lock
            .write()
            .map_err(|err| ChannelError::io(&self.lock_path, err))?;
        apply()
    }

    fn load_tasks(&self, uid: &str) -> Result<Vec<StoredDocument>, ChannelError> {
        let path = self.collection_file(uid)?;
        load_jsonl(&path)
    }

    fn save_tasks(&self, uid: &str, docs: &[StoredDocument]) -> Result<(), ChannelError> {
        let path = self.collection_file(uid)?;
        save_jsonl_atomic(&path, docs)
    }

    /// Current collection of `uid`, in stored order.
    #[tracing::instrument(skip(self))]
    pub fn snapshot(&self, uid: &str) -> Result<Snapshot, ChannelError> {
        let _guard = self.io.lock();
        let docs = self.load_tasks(uid)?;
        Ok(decode_snapshot(uid, &docs))
    }

    #[tracing::instrument(skip(self, text), fields(text_len = text.len()))]
    pub fn insert_task(&self, uid: &str, text: &str) -> Result<TaskId, ChannelError> {
        self.write_locked(|| {
            let mut docs = self.load_tasks(uid)?;
            let id = TaskId::generate();
            docs.push(StoredDocument {
                id: id.to_string(),
                fields: to_fields(&TaskDocument::new(text.to_string())),
            });
            self.save_tasks(uid, &docs)?;
            info!(uid, id = %id, "created task");
            self.listeners.lock().deliver(uid, decode_snapshot(uid, &docs));
            Ok(id)
        })
    }

    /// Merges `patch` into an existing task. Returns `false` when the task
    /// does not exist; a merge never resurrects a deleted task.
    #[tracing::instrument(skip(self, patch), fields(id = %id))]
    pub fn merge_task(
        &self,
        uid: &str,
        id: &TaskId,
        patch: Map<String, Value>,
    ) -> Result<bool, ChannelError> {
        self.write_locked(|| {
            let mut docs = self.load_tasks(uid)?;
            let Some(doc) = docs.iter_mut().find(|doc| doc.id == id.as_str()) else {
                debug!(uid, "merge target missing; skipping");
                return Ok(false);
            };
            doc.fields.extend(patch);
            self.save_tasks(uid, &docs)?;
            info!(uid, "merged task fields");
            self.listeners.lock().deliver(uid, decode_snapshot(uid, &docs));
            Ok(true)
        })
    }

    /// Removes a task. Returns `false` when there was nothing to remove.
    #[tracing::instrument(skip(self), fields(id = %id))]
    pub fn remove_task(&self, uid: &str, id: &TaskId) -> Result<bool, ChannelError> {
        self.write_locked(|| {
            let mut docs = self.load_tasks(uid)?;
            let before = docs.len();
            docs.retain(|doc| doc.id != id.as_str());
            if docs.len() == before {
                debug!(uid, "delete target missing; nothing to do");
                return Ok(false);
            }
            self.save_tasks(uid, &docs)?;
            info!(uid, "deleted task");
            self.listeners.lock().deliver(uid, decode_snapshot(uid, &docs));
            Ok(true)
        })
    }

    /// Upserts `users/<uid>`, keeping fields `patch` does not name.
    #[tracing::instrument(skip(self, patch))]
    pub fn merge_profile(&self, uid: &str, patch: Map<String, Value>) -> Result<(), ChannelError> {
        if !is_valid_uid(uid) {
            return Err(ChannelError::PermissionDenied {
                collection: profile_path(uid),
            });
        }
        self.write_locked(|| {
            let mut docs: Vec<StoredDocument> = load_jsonl(&self.users_path)?;
            match docs.iter_mut().find(|doc| doc.id == uid) {
                Some(doc) => doc.fields.extend(patch),
                None => docs.push(StoredDocument {
                    id: uid.to_string(),
                    fields: patch,
                }),
            }
            save_jsonl_atomic(&self.users_path, &docs)?;
            info!(uid, "upserted profile");
            Ok(())
        })
    }

    #[tracing::instrument(skip(self))]
    pub fn load_profile(&self, uid: &str) -> Result<Option<Map<String, Value>>, ChannelError> {
        let _guard = self.io.lock();
        let docs: Vec<StoredDocument> = load_jsonl(&self.users_path)?;
        Ok(docs.into_iter().find(|doc| doc.id == uid).map(|doc| doc.fields))
    }

    /// Rereads the collection of `uid` and rebroadcasts it when it differs
    /// from what listeners last received.
    #[tracing::instrument(skip(self))]
    pub fn refresh_collection(&self, uid: &str) {
        let _guard = self.io.lock();
        let mut listeners = self.listeners.lock();
        if !listeners.by_uid.contains_key(uid) {
            return;
        }
        match self.load_tasks(uid) {
            Ok(docs) => {
                let snapshot = decode_snapshot(uid, &docs);
                if listeners.last_delivered.get(uid) != Some(&snapshot) {
                    debug!(uid, "collection changed on disk");
                    listeners.deliver(uid, snapshot);
                }
            }
            Err(err) => {
                warn!(uid, error = %err, "collection refresh failed");
                let message = err.to_string();
                listeners.deliver_error(uid, || ChannelError::unavailable(message.clone()));
            }
        }
    }

    pub fn listener_count(&self, uid: &str) -> usize {
        self.listeners
            .lock()
            .by_uid
            .get(uid)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn open_subscription(&self, uid: &str) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let _guard = self.io.lock();
        let mut listeners = self.listeners.lock();
        listeners.next_id += 1;
        let listener_id = listeners.next_id;

        match self.load_tasks(uid) {
            Ok(docs) => {
                let snapshot = decode_snapshot(uid, &docs);
                let _ = sender.send(Ok(snapshot.clone()));
                listeners.last_delivered.insert(uid.to_string(), snapshot);
            }
            Err(err) => {
                warn!(uid, error = %err, "initial snapshot failed");
                let _ = sender.send(Err(err));
            }
        }
        listeners
            .by_uid
            .entry(uid.to_string())
            .or_default()
            .push(Listener {
                id: listener_id,
                sender,
            });
        debug!(uid, subscription = listener_id, "subscribed");

        let registry: Weak<Mutex<Listeners>> = Arc::downgrade(&self.listeners);
        let owner = uid.to_string();
        Subscription::new(listener_id, receiver, move || {
            if let Some(registry) = registry.upgrade() {
                registry.lock().remove(&owner, listener_id);
            }
        })
    }
}

#[async_trait]
impl TaskChannel for DocumentStore {
    fn subscribe(&self, identity: &Identity) -> Subscription {
        self.open_subscription(&identity.uid)
    }

    async fn create(&self, identity: &Identity, text: &str) -> Result<(), ChannelError> {
        self.insert_task(&identity.uid, text).map(|_| ())
    }

    async fn set_completed(
        &self,
        identity: &Identity,
        id: &TaskId,
        completed: bool,
    ) -> Result<(), ChannelError> {
        let patch = to_fields(&TaskCompletionPatch { completed });
        self.merge_task(&identity.uid, id, patch).map(|_| ())
    }

    async fn delete(&self, identity: &Identity, id: &TaskId) -> Result<(), ChannelError> {
        self.remove_task(&identity.uid, id).map(|_| ())
    }

    fn refresh(&self, identity: &Identity) {
        self.refresh_collection(&identity.uid);
    }
}

#[async_trait]
impl ProfileStore for DocumentStore {
    async fn upsert_profile(&self, identity: &Identity) -> Result<(), ChannelError> {
        let patch = to_fields(&ProfilePatch {
            name: identity.display_name.clone(),
            email: identity.email.clone(),
        });
        self.merge_profile(&identity.uid, patch)
    }
}

fn is_valid_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
}

fn to_fields<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn decode_snapshot(uid: &str, docs: &[StoredDocument]) -> Snapshot {
    docs.iter()
        .filter_map(|doc| {
            match serde_json::from_value::<TaskDocument>(Value::Object(doc.fields.clone())) {
                Ok(document) => Some(Task::from(TaskRecord {
                    id: doc.id.clone(),
                    document,
                })),
                Err(err) => {
                    warn!(uid, id = %doc.id, error = %err, "skipping undecodable task document");
                    None
                }
            }
        })
        .collect()
}

#[tracing::instrument(skip(path))]
fn load_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, ChannelError> {
    debug!(file = %path.display(), "loading jsonl");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path).map_err(|err| ChannelError::io(path, err))?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| ChannelError::io(path, err))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let item: T = serde_json::from_str(trimmed).map_err(|source| ChannelError::Decode {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        out.push(item);
    }

    debug!(count = out.len(), "loaded documents from jsonl");
    Ok(out)
}

#[tracing::instrument(skip(path, items))]
fn save_jsonl_atomic<T: Serialize>(path: &Path, items: &[T]) -> Result<(), ChannelError> {
    debug!(file = %path.display(), count = items.len(), "saving jsonl atomically");
    write_jsonl(path, items)
        .with_context(|| format!("failed to save {}", path.display()))
        .map_err(|err| ChannelError::unavailable(format!("{err:#}")))
}

fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> anyhow::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    for item in items {
        let serialized = serde_json::to_string(item)?;
        writeln!(temp, "{serialized}")?;
    }
    temp.flush()?;

    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

    Ok(())
}
