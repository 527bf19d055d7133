use std::fmt;
use std::sync::mpsc::{Receiver, TryRecvError};

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::date::week_key;
use crate::error::StoreError;

/// Slash separated address of a document in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath(String);

impl DocPath {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn habit(owner_uid: &str, habit_id: &str) -> Self {
        Self(format!("users/{owner_uid}/habits/{habit_id}"))
    }

    /// Order, visibility buckets and links for a user's habits.
    pub fn habit_details(owner_uid: &str) -> Self {
        Self(format!("users/{owner_uid}/habitData/details"))
    }

    pub fn archived_habits(owner_uid: &str) -> Self {
        Self(format!("users/{owner_uid}/habitData/archived"))
    }

    pub fn week(owner_uid: &str, week_start: NaiveDate) -> Self {
        Self(format!("users/{owner_uid}/weeks/{}", week_key(week_start)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path to a nested field inside a document, e.g. `statuses.2024.100`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self(segments.into_iter().map(|s| s.to_string()).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Builds the minimal nested patch that assigns `value` at this path.
    pub fn patch(&self, value: Value) -> Value {
        self.0.iter().rev().fold(value, |inner, key| {
            let mut map = Map::new();
            map.insert(key.clone(), inner);
            Value::Object(map)
        })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// One push from a realtime subscription.
#[derive(Debug)]
pub enum Snapshot {
    /// Current contents, `None` when the document does not exist.
    Document(Option<Value>),
    /// Terminal failure. No further snapshots follow.
    Error(StoreError),
}

/// Handle to a live document subscription.
///
/// Snapshots queue up until drained. Callers release the subscription with
/// [`Subscription::unsubscribe`].
pub struct Subscription {
    path: DocPath,
    receiver: Receiver<Snapshot>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        path: DocPath,
        receiver: Receiver<Snapshot>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            path,
            receiver,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn path(&self) -> &DocPath {
        &self.path
    }

    /// Every snapshot delivered since the last drain, oldest first.
    pub fn drain(&self) -> Vec<Snapshot> {
        let mut pending = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(snapshot) => pending.push(snapshot),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        pending
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.path)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            tracing::warn!(path = %self.path, "subscription dropped without unsubscribe");
            cancel();
        }
    }
}

/// Contract of the remote document database.
///
/// Writes are deep merges or targeted field deletes; nothing here replaces a
/// whole nested map unless the caller asks for it with [`DocumentStore::set`].
pub trait DocumentStore: Send + Sync {
    fn get(&self, path: &DocPath) -> Result<Option<Value>, StoreError>;
    fn set(&self, path: &DocPath, document: Value) -> Result<(), StoreError>;
    fn merge(&self, path: &DocPath, partial: Value) -> Result<(), StoreError>;
    fn delete_fields(&self, path: &DocPath, fields: &[FieldPath]) -> Result<(), StoreError>;
    fn delete(&self, path: &DocPath) -> Result<(), StoreError>;
    fn subscribe(&self, path: &DocPath) -> Subscription;
}

pub fn read_document<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    path: &DocPath,
) -> Result<Option<T>, StoreError> {
    store
        .get(path)?
        .map(|value| decode(path, value))
        .transpose()
}

pub fn decode<T: DeserializeOwned>(path: &DocPath, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|source| StoreError::Malformed {
        path: path.to_string(),
        source,
    })
}

/// Recursively merges `patch` into `target`. Objects merge key by key, any
/// other value replaces what was there.
pub fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) if slot.is_object() && value.is_object() => deep_merge(slot, value),
                    _ => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Removes the field at `field`, returning whether anything was removed.
pub fn remove_field(document: &mut Value, field: &FieldPath) -> bool {
    let Some((last, parents)) = field.segments().split_last() else {
        return false;
    };
    let mut cursor = document;
    for key in parents {
        match cursor.get_mut(key) {
            Some(next) => cursor = next,
            None => return false,
        }
    }
    cursor
        .as_object_mut()
        .map(|map| map.remove(last).is_some())
        .unwrap_or(false)
}
