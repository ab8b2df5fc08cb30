//! JSON-file persistence for agents and call logs
//!
//! Each store is one JSON array on disk, loaded at open and rewritten
//! atomically on every change. Observers subscribe to a broadcast channel of
//! [`StoreChange`]s instead of polling.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::agent::Agent;
use crate::record::CallRecord;

/// Capacity of the change channel (slow observers see `Lagged`)
const CHANGE_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("Failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize: {0}")]
    Serialize(String),
}

/// Something a [`JsonStore`] can hold
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Name used in change notifications and logs
    const KIND: &'static str;

    fn id(&self) -> &str;
}

impl Entity for Agent {
    const KIND: &'static str = "agent";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for CallRecord {
    const KIND: &'static str = "call_log";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Saved { kind: &'static str, id: String },
    Deleted { kind: &'static str, id: String },
}

/// Write `contents` to `path` via a temp file in the same directory, then rename
pub(crate) fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, contents)?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e);
            }
        }
    }

    std::fs::rename(&tmp_path, path)
}

pub struct JsonStore<T> {
    path: PathBuf,
    items: Mutex<Vec<T>>,
    changes: broadcast::Sender<StoreChange>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> JsonStore<T> {
    /// Open (or lazily create) the store at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let items = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => Vec::new(),
            Ok(contents) => {
                serde_json::from_str::<Vec<T>>(&contents).map_err(|e| StoreError::Parse {
                    path: path.clone(),
                    message: e.to_string(),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        log::info!("Store: opened {:?} ({} {}s)", path, items.len(), T::KIND);

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            path,
            items: Mutex::new(items),
            changes,
            _entity: PhantomData,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// All items in stored order
    pub fn list(&self) -> Vec<T> {
        self.lock().clone()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.lock().iter().find(|item| item.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn persist(&self, items: &[T]) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(items)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;
        write_atomic(&self.path, &contents).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }

    fn notify(&self, change: StoreChange) {
        // No subscribers is fine
        let _ = self.changes.send(change);
    }

    /// Insert or replace by id; new items go to the end
    pub fn save(&self, item: T) -> Result<(), StoreError> {
        let id = item.id().to_string();
        {
            let mut items = self.lock();
            match items.iter_mut().find(|existing| existing.id() == id) {
                Some(existing) => *existing = item,
                None => items.push(item),
            }
            self.persist(&items)?;
        }
        self.notify(StoreChange::Saved { kind: T::KIND, id });
        Ok(())
    }

    /// Insert at the front (newest first), replacing any item with the same id
    pub fn insert_front(&self, item: T) -> Result<(), StoreError> {
        let id = item.id().to_string();
        {
            let mut items = self.lock();
            items.retain(|existing| existing.id() != id);
            items.insert(0, item);
            self.persist(&items)?;
        }
        self.notify(StoreChange::Saved { kind: T::KIND, id });
        Ok(())
    }

    /// Remove by id; returns whether anything was removed
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        {
            let mut items = self.lock();
            let before = items.len();
            items.retain(|item| item.id() != id);
            if items.len() == before {
                return Ok(false);
            }
            self.persist(&items)?;
        }
        self.notify(StoreChange::Deleted {
            kind: T::KIND,
            id: id.to_string(),
        });
        Ok(true)
    }
}

/// Where finished call records go
pub trait CallRecordSink: Send + Sync {
    fn append(&self, record: CallRecord) -> Result<(), StoreError>;
}

impl CallRecordSink for JsonStore<CallRecord> {
    fn append(&self, record: CallRecord) -> Result<(), StoreError> {
        log::info!(
            "Store: saving call {} ({}, {})",
            record.id,
            record.participant_label,
            record.duration_display()
        );
        self.insert_front(record)
    }
}
