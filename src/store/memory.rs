use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::{FutureExt, StreamExt, future::BoxFuture};
use serde_json::{Map, Value};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use super::{
    ChangeEvent, ChangeStream, EntityKind, RemoteStore,
    error::{StoreError, StoreResult},
};

/// Capacity of the change-event fan-out channel.
const EVENT_CAPACITY: usize = 64;

/// In-process [`RemoteStore`] holding a JSON document tree in memory.
///
/// Used by the test suite and for offline development. Change events are
/// emitted on every successful mutation, keyed by the first path segment.
/// [`MemoryStore::set_offline`] simulates the backend dropping off the
/// network so stale-fallback behavior can be exercised.
pub struct MemoryStore {
    root: Arc<RwLock<Value>>,
    events: broadcast::Sender<ChangeEvent>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Arc<Self> {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            root: Arc::new(RwLock::new(Value::Object(Map::new()))),
            events,
            offline: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Toggle the simulated network failure: while offline every operation
    /// fails with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn notify(events: &broadcast::Sender<ChangeEvent>, path: &str) {
        let Some(entity) = EntityKind::from_path(path) else {
            return;
        };
        let record_id = path.split('/').nth(1).map(str::to_string);
        // Nobody listening is fine.
        let _ = events.send(ChangeEvent { entity, record_id });
    }

    fn offline_error(path: &str) -> StoreError {
        StoreError::unavailable(
            format!("memory store offline while accessing `{path}`"),
            io::Error::new(io::ErrorKind::NotConnected, "simulated outage"),
        )
    }
}

/// Walk the document tree down a slash-separated path.
fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('/')
        .try_fold(root, |value, segment| value.as_object()?.get(segment))
}

/// Insert `value` at `path`, creating interior objects along the way.
fn insert_at(root: &mut Value, path: &str, value: Value) {
    let mut segments = path.split('/').peekable();
    let mut cursor = root;
    while let Some(segment) = segments.next() {
        if !matches!(cursor, Value::Object(_)) {
            // Overwrite scalar junk blocking the way.
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(children) = cursor else {
            return;
        };
        if segments.peek().is_none() {
            children.insert(segment.to_string(), value);
            return;
        }
        cursor = children
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Remove the value at `path`, pruning nothing else.
fn remove_at(root: &mut Value, path: &str) {
    let Some((parent_path, leaf)) = path.rsplit_once('/') else {
        if let Some(children) = root.as_object_mut() {
            children.remove(path);
        }
        return;
    };
    let mut cursor = &mut *root;
    for segment in parent_path.split('/') {
        let Some(children) = cursor.as_object_mut() else {
            return;
        };
        let Some(next) = children.get_mut(segment) else {
            return;
        };
        cursor = next;
    }
    if let Some(children) = cursor.as_object_mut() {
        children.remove(leaf);
    }
}

impl RemoteStore for MemoryStore {
    fn get(&self, path: &str) -> BoxFuture<'static, StoreResult<Option<Value>>> {
        let root = Arc::clone(&self.root);
        let offline = Arc::clone(&self.offline);
        let path = path.to_string();
        async move {
            if offline.load(Ordering::SeqCst) {
                return Err(MemoryStore::offline_error(&path));
            }
            let guard = root.read().await;
            Ok(lookup(&guard, &path).cloned())
        }
        .boxed()
    }

    fn set(&self, path: &str, value: Value) -> BoxFuture<'static, StoreResult<()>> {
        let root = Arc::clone(&self.root);
        let offline = Arc::clone(&self.offline);
        let events = self.events.clone();
        let path = path.to_string();
        async move {
            if offline.load(Ordering::SeqCst) {
                return Err(MemoryStore::offline_error(&path));
            }
            {
                let mut guard = root.write().await;
                insert_at(&mut guard, &path, value);
            }
            MemoryStore::notify(&events, &path);
            Ok(())
        }
        .boxed()
    }

    fn update(
        &self,
        path: &str,
        partial: Map<String, Value>,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let root = Arc::clone(&self.root);
        let offline = Arc::clone(&self.offline);
        let events = self.events.clone();
        let path = path.to_string();
        async move {
            if offline.load(Ordering::SeqCst) {
                return Err(MemoryStore::offline_error(&path));
            }
            {
                let mut guard = root.write().await;
                let existing = lookup(&guard, &path).cloned();
                match existing {
                    Some(Value::Object(mut merged)) => {
                        merged.extend(partial);
                        insert_at(&mut guard, &path, Value::Object(merged));
                    }
                    _ => insert_at(&mut guard, &path, Value::Object(partial)),
                }
            }
            MemoryStore::notify(&events, &path);
            Ok(())
        }
        .boxed()
    }

    fn remove(&self, path: &str) -> BoxFuture<'static, StoreResult<()>> {
        let root = Arc::clone(&self.root);
        let offline = Arc::clone(&self.offline);
        let events = self.events.clone();
        let path = path.to_string();
        async move {
            if offline.load(Ordering::SeqCst) {
                return Err(MemoryStore::offline_error(&path));
            }
            {
                let mut guard = root.write().await;
                remove_at(&mut guard, &path);
            }
            MemoryStore::notify(&events, &path);
            Ok(())
        }
        .boxed()
    }

    fn push(&self, path: &str) -> BoxFuture<'static, StoreResult<String>> {
        let offline = Arc::clone(&self.offline);
        let path = path.to_string();
        async move {
            if offline.load(Ordering::SeqCst) {
                return Err(MemoryStore::offline_error(&path));
            }
            Ok(Uuid::new_v4().simple().to_string())
        }
        .boxed()
    }

    fn subscribe(&self, entity: EntityKind, record_id: Option<String>) -> ChangeStream {
        let rx = self.events.subscribe();
        BroadcastStream::new(rx)
            .filter_map(move |event| {
                let wanted = record_id.clone();
                futures::future::ready(match event {
                    Ok(event)
                        if event.entity == entity
                            && wanted.is_none_or(|id| event.record_id.as_deref() == Some(&*id)) =>
                    {
                        Some(event)
                    }
                    _ => None,
                })
            })
            .boxed()
    }
}
