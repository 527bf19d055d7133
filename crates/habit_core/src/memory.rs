use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::store::{deep_merge, remove_field, DocPath, DocumentStore, FieldPath, Snapshot, Subscription};

type Listeners = HashMap<DocPath, Vec<(u64, Sender<Snapshot>)>>;

/// In-process [`DocumentStore`] with realtime fan-out.
///
/// Besides serving local sessions it doubles as the test fake: writes and open
/// listeners are counted, paths can be denied, and writes can be rejected.
#[derive(Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    documents: RwLock<HashMap<DocPath, Value>>,
    listeners: Mutex<Listeners>,
    denied: RwLock<HashSet<DocPath>>,
    reject_writes: RwLock<Option<String>>,
    writes: AtomicUsize,
    opened: AtomicUsize,
    next_listener: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds documents without counting writes.
    pub fn with_documents(documents: impl IntoIterator<Item = (DocPath, Value)>) -> Self {
        let store = Self::new();
        store.inner.documents.write().extend(documents);
        store
    }

    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Subscriptions ever opened, including ones that failed or were closed.
    pub fn subscriptions_opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Open subscriptions on `path`.
    pub fn listener_count(&self, path: &DocPath) -> usize {
        self.inner
            .listeners
            .lock()
            .get(path)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn total_listeners(&self) -> usize {
        self.inner.listeners.lock().values().map(Vec::len).sum()
    }

    pub fn document(&self, path: &DocPath) -> Option<Value> {
        self.inner.documents.read().get(path).cloned()
    }

    /// Reads and subscriptions on `path` now fail with permission denied.
    /// Open listeners receive the error and are closed.
    pub fn deny(&self, path: &DocPath) {
        self.inner.denied.write().insert(path.clone());
        let closed = self.inner.listeners.lock().remove(path).unwrap_or_default();
        for (_, sender) in closed {
            let _ = sender.send(Snapshot::Error(StoreError::PermissionDenied(path.to_string())));
        }
    }

    pub fn allow(&self, path: &DocPath) {
        self.inner.denied.write().remove(path);
    }

    /// Every subsequent write fails with `reason` until cleared with `None`.
    pub fn reject_writes(&self, reason: Option<&str>) {
        *self.inner.reject_writes.write() = reason.map(str::to_string);
    }

    fn check_read(&self, path: &DocPath) -> Result<(), StoreError> {
        if self.inner.denied.read().contains(path) {
            return Err(StoreError::PermissionDenied(path.to_string()));
        }
        Ok(())
    }

    fn check_write(&self, path: &DocPath) -> Result<(), StoreError> {
        self.check_read(path)?;
        if let Some(reason) = self.inner.reject_writes.read().as_ref() {
            return Err(StoreError::Rejected {
                path: path.to_string(),
                reason: reason.clone(),
            });
        }
        Ok(())
    }

    fn commit(&self, path: &DocPath, apply: impl FnOnce(&mut HashMap<DocPath, Value>)) {
        let current = {
            let mut documents = self.inner.documents.write();
            apply(&mut documents);
            documents.get(path).cloned()
        };
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.broadcast(path, current);
    }
}

impl Inner {
    fn broadcast(&self, path: &DocPath, current: Option<Value>) {
        let mut listeners = self.listeners.lock();
        if let Some(senders) = listeners.get_mut(path) {
            senders.retain(|(_, sender)| sender.send(Snapshot::Document(current.clone())).is_ok());
        }
    }

    fn remove_listener(&self, path: &DocPath, id: u64) {
        let mut listeners = self.listeners.lock();
        if let Some(senders) = listeners.get_mut(path) {
            senders.retain(|(listener, _)| *listener != id);
            if senders.is_empty() {
                listeners.remove(path);
            }
        }
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, path: &DocPath) -> Result<Option<Value>, StoreError> {
        self.check_read(path)?;
        Ok(self.inner.documents.read().get(path).cloned())
    }

    fn set(&self, path: &DocPath, document: Value) -> Result<(), StoreError> {
        self.check_write(path)?;
        self.commit(path, |documents| {
            documents.insert(path.clone(), document);
        });
        Ok(())
    }

    fn merge(&self, path: &DocPath, partial: Value) -> Result<(), StoreError> {
        self.check_write(path)?;
        self.commit(path, |documents| {
            let slot = documents
                .entry(path.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            deep_merge(slot, partial);
        });
        Ok(())
    }

    fn delete_fields(&self, path: &DocPath, fields: &[FieldPath]) -> Result<(), StoreError> {
        self.check_write(path)?;
        self.commit(path, |documents| {
            if let Some(document) = documents.get_mut(path) {
                for field in fields {
                    remove_field(document, field);
                }
            }
        });
        Ok(())
    }

    fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        self.check_write(path)?;
        self.commit(path, |documents| {
            documents.remove(path);
        });
        Ok(())
    }

    fn subscribe(&self, path: &DocPath) -> Subscription {
        let (sender, receiver) = mpsc::channel();
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        self.inner.opened.fetch_add(1, Ordering::SeqCst);

        if let Err(err) = self.check_read(path) {
            let _ = sender.send(Snapshot::Error(err));
            return Subscription::new(path.clone(), receiver, || {});
        }

        let current = self.inner.documents.read().get(path).cloned();
        let _ = sender.send(Snapshot::Document(current));
        self.inner
            .listeners
            .lock()
            .entry(path.clone())
            .or_default()
            .push((id, sender));

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let cancel_path = path.clone();
        Subscription::new(path.clone(), receiver, move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_listener(&cancel_path, id);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscription_receives_initial_and_later_snapshots() {
        let store = MemoryStore::new();
        let path = DocPath::habit("me", "h1");
        let subscription = store.subscribe(&path);
        store.merge(&path, json!({ "name": "Read" })).unwrap();

        let snapshots = subscription.drain();
        assert_eq!(snapshots.len(), 2);
        assert!(matches!(snapshots[0], Snapshot::Document(None)));
        assert!(matches!(&snapshots[1], Snapshot::Document(Some(doc)) if doc["name"] == "Read"));

        assert_eq!(store.listener_count(&path), 1);
        subscription.unsubscribe();
        assert_eq!(store.listener_count(&path), 0);
    }

    #[test]
    fn denied_path_errors_subscribers() {
        let store = MemoryStore::new();
        let path = DocPath::habit("friend", "h1");
        store.set(&path, json!({ "name": "Run" })).unwrap();
        let subscription = store.subscribe(&path);
        store.deny(&path);

        let snapshots = subscription.drain();
        assert!(matches!(snapshots.last(), Some(Snapshot::Error(StoreError::PermissionDenied(_)))));
        assert_eq!(store.listener_count(&path), 0);
        assert!(store.get(&path).is_err());
    }

    #[test]
    fn rejected_writes_leave_documents_untouched() {
        let store = MemoryStore::new();
        let path = DocPath::habit("me", "h1");
        store.reject_writes(Some("offline"));
        assert!(matches!(
            store.merge(&path, json!({ "a": 1 })),
            Err(StoreError::Rejected { .. })
        ));
        assert_eq!(store.write_count(), 0);
        assert!(store.document(&path).is_none());
    }
}
